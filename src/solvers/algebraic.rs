//! Newton-Raphson root finding for algebraic systems.

use nalgebra::DMatrix;

use crate::discretisation::DiscretisedSystem;
use crate::parameters::Inputs;
use crate::solvers::{
    Backend, Budget, Capability, CapabilitySet, NewtonRaphson, SolverConfig, SolverError, SolverResult,
    Trajectory,
};

/// Solves the algebraic rows of `system` for its algebraic unknowns at time
/// `t`, holding the differential entries of `y` fixed.
///
/// Returns the full state vector.
pub fn solve_algebraic(
    system: &DiscretisedSystem,
    t: f64,
    y: &[f64],
    inputs: &Inputs,
    newton: &NewtonRaphson,
) -> SolverResult<Vec<f64>> {
    let rows = system.algebraic_rows();
    if rows.is_empty() {
        return Ok(y.to_vec());
    }

    // Each unknown owns the rows matching its state entries
    let mut state = y.to_vec();
    let guess: Vec<f64> = rows.iter().map(|&i| y[i]).collect();
    let algebraic = newton.solve(
        |x| {
            for (&i, &v) in rows.iter().zip(x) {
                state[i] = v;
            }
            let g = system.algebraic(t, &state, inputs)?;
            let jac: DMatrix<f64> = system.jacobian_columns(t, &state, inputs, rows)?.select_rows(rows);
            Ok((g, jac))
        },
        &guess,
    )?;

    let mut solved = y.to_vec();
    for (&i, v) in rows.iter().zip(algebraic) {
        solved[i] = v;
    }
    Ok(solved)
}

/// Root-finding backend for systems without differential unknowns.
///
/// The dispatcher calls [`Backend::root_find`] once per requested time,
/// seeding each solve with the previous root.
#[derive(Debug, Clone)]
pub struct AlgebraicSolver {
    relaxation: f64,
}

impl AlgebraicSolver {
    /// Creates a solver taking full Newton steps.
    pub fn new() -> Self {
        AlgebraicSolver { relaxation: 1.0 }
    }

    /// Damps every Newton step by `relaxation`.
    pub fn with_relaxation(mut self, relaxation: f64) -> Self {
        self.relaxation = relaxation;
        self
    }
}

impl Default for AlgebraicSolver {
    fn default() -> Self {
        Self::new()
    }
}

impl Backend for AlgebraicSolver {
    fn name(&self) -> String {
        "newton".to_string()
    }

    fn capabilities(&self) -> CapabilitySet {
        CapabilitySet::empty().with(Capability::RootFind)
    }

    fn advance(
        &self,
        _system: &DiscretisedSystem,
        _t0: f64,
        _y0: &[f64],
        _t1: f64,
        _inputs: &Inputs,
        _config: &SolverConfig,
        _budget: &mut Budget,
    ) -> SolverResult<Trajectory> {
        Err(SolverError::Unsupported { solver: self.name(), operation: "time integration" })
    }

    fn root_find(
        &self,
        system: &DiscretisedSystem,
        t: f64,
        guess: &[f64],
        inputs: &Inputs,
        config: &SolverConfig,
    ) -> SolverResult<Vec<f64>> {
        let newton =
            NewtonRaphson::with_relaxation(config.root_tolerance, config.max_newton_iterations, self.relaxation);
        solve_algebraic(system, t, guess, inputs, &newton)
    }
}
