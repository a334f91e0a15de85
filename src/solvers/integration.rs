//! Runge-Kutta integration of ODE systems.
//!
//! [`OdeSolver`] wraps the explicit and implicit Runge-Kutta methods of the
//! [`differential-equations`](https://docs.rs/differential-equations/) crate
//! as a [`Backend`]. The state is copied into a fixed-capacity `SVector`, so
//! systems larger than the capacity `N` are rejected.

use std::sync::Mutex;

use differential_equations::methods::{ExplicitRungeKutta, ImplicitRungeKutta};
use differential_equations::ode::{ODE, ODEProblem};
use nalgebra::SVector;

use crate::discretisation::DiscretisedSystem;
use crate::expression::ExpressionError;
use crate::parameters::Inputs;
use crate::solvers::{
    Backend, Budget, Capability, CapabilitySet, SolverConfig, SolverError, SolverResult, Trajectory,
};

/// Runge-Kutta tableau used by [`OdeSolver`].
///
/// Adaptive tableaux control their error with the `rtol`/`atol` of the
/// [`SolverConfig`]. Fixed-step tableaux take steps of
/// [`OdeSolver::with_step_size`] and ignore the tolerances.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IntegrationMethod {
    /// Dormand-Prince 5(4), adaptive
    Dopri5,
    /// Radau IIA of order 5, adaptive and implicit
    Radau5,
    GaussLegendre4,
    GaussLegendre6,
    LobattoIIIC2,
    LobattoIIIC4,
    /// Classic fourth-order tableau, fixed step
    RK4,
    /// Forward Euler, fixed step
    Euler,
    Heun,
    Midpoint,
    Ralston,
}

impl IntegrationMethod {
    /// Name recorded in the method registry.
    pub fn name(&self) -> &'static str {
        match self {
            IntegrationMethod::Dopri5 => "dopri5",
            IntegrationMethod::Radau5 => "radau5",
            IntegrationMethod::GaussLegendre4 => "gauss-legendre-4",
            IntegrationMethod::GaussLegendre6 => "gauss-legendre-6",
            IntegrationMethod::LobattoIIIC2 => "lobatto-iiic-2",
            IntegrationMethod::LobattoIIIC4 => "lobatto-iiic-4",
            IntegrationMethod::RK4 => "rk4",
            IntegrationMethod::Euler => "euler",
            IntegrationMethod::Heun => "heun",
            IntegrationMethod::Midpoint => "midpoint",
            IntegrationMethod::Ralston => "ralston",
        }
    }

    /// Returns true for methods with a user-chosen constant step.
    pub fn is_fixed_step(&self) -> bool {
        matches!(
            self,
            IntegrationMethod::RK4
                | IntegrationMethod::Euler
                | IntegrationMethod::Heun
                | IntegrationMethod::Midpoint
                | IntegrationMethod::Ralston
        )
    }
}

/// ODE wrapper exposing a discretised system to `differential-equations`.
///
/// The trait methods cannot fail, so the first evaluation error is parked
/// and reported after the solve.
struct SystemOde<'a, const N: usize> {
    system: &'a DiscretisedSystem,
    inputs: &'a Inputs,
    n: usize,
    error: Mutex<Option<ExpressionError>>,
}

impl<const N: usize> SystemOde<'_, N> {
    fn park(&self, error: ExpressionError) {
        if let Ok(mut slot) = self.error.lock() {
            slot.get_or_insert(error);
        }
    }

    fn take_error(&self) -> SolverResult<()> {
        match self.error.lock().ok().and_then(|mut slot| slot.take()) {
            Some(e) => Err(SolverError::Expression(e)),
            None => Ok(()),
        }
    }
}

impl<const N: usize> ODE<f64, SVector<f64, N>> for &SystemOde<'_, N> {
    fn diff(&self, t: f64, y: &SVector<f64, N>, dydt: &mut SVector<f64, N>) {
        match self.system.rhs(t, &y.as_slice()[..self.n], self.inputs) {
            Ok(f) => {
                for i in 0..self.n {
                    dydt[i] = f[i];
                }
            }
            Err(e) => {
                self.park(e);
                dydt.fill(0.0);
            }
        }
    }

    fn jacobian(
        &self,
        t: f64,
        y: &SVector<f64, N>,
        dfdy: &mut differential_equations::prelude::Matrix<f64>,
    ) {
        match self.system.jacobian(t, &y.as_slice()[..self.n], self.inputs) {
            Ok(jac) => {
                for i in 0..self.n {
                    for j in 0..self.n {
                        dfdy[(i, j)] = jac[(i, j)];
                    }
                }
            }
            Err(e) => self.park(e),
        }
    }
}

/// Runge-Kutta backend for systems without algebraic unknowns.
///
/// # Type Parameters
///
/// * `N` - Maximum length of the state vector the solver can handle
///
/// # Examples
///
/// ```ignore
/// use symdae::solvers::integration::{IntegrationMethod, OdeSolver};
///
/// // Adaptive Dormand-Prince for up to 32 state entries
/// let dopri = OdeSolver::<32>::new(IntegrationMethod::Dopri5);
///
/// // Classic RK4 with a fixed step of 1 ms
/// let rk4 = OdeSolver::<32>::new(IntegrationMethod::RK4).with_step_size(1e-3);
/// ```
#[derive(Debug, Clone)]
pub struct OdeSolver<const N: usize = 64> {
    method: IntegrationMethod,
    step_size: f64,
}

impl<const N: usize> OdeSolver<N> {
    /// Creates a solver using `method`, with a fixed step of `1e-3` for
    /// fixed-step methods.
    pub fn new(method: IntegrationMethod) -> Self {
        OdeSolver { method, step_size: 1e-3 }
    }

    /// Sets the step of fixed-step methods.
    pub fn with_step_size(mut self, step_size: f64) -> Self {
        self.step_size = step_size;
        self
    }

    pub fn method(&self) -> IntegrationMethod {
        self.method
    }

    /// Largest state vector this solver accepts.
    pub fn capacity(&self) -> usize {
        N
    }

    /// Runs one problem from `t0` to `t1` and returns the accepted steps,
    /// start point included.
    fn solve_problem(
        &self,
        ode: &SystemOde<'_, N>,
        t0: f64,
        y0: SVector<f64, N>,
        t1: f64,
        config: &SolverConfig,
    ) -> SolverResult<Vec<(f64, SVector<f64, N>)>> {
        let problem = ODEProblem::new(ode, t0, t1, y0);
        let (rtol, atol) = (config.rtol, config.atol);
        let h = t1 - t0;

        let solution = match self.method {
            // Adaptive explicit
            IntegrationMethod::Dopri5 => {
                let mut solver = ExplicitRungeKutta::dopri5().rtol(rtol).atol(atol);
                problem.solve(&mut solver)
            }
            // Adaptive implicit
            IntegrationMethod::Radau5 => {
                let mut solver = ImplicitRungeKutta::radau5().rtol(rtol).atol(atol);
                problem.solve(&mut solver)
            }
            IntegrationMethod::GaussLegendre4 => {
                let mut solver = ImplicitRungeKutta::gauss_legendre_4().rtol(rtol).atol(atol);
                problem.solve(&mut solver)
            }
            IntegrationMethod::GaussLegendre6 => {
                let mut solver = ImplicitRungeKutta::gauss_legendre_6().rtol(rtol).atol(atol);
                problem.solve(&mut solver)
            }
            IntegrationMethod::LobattoIIIC2 => {
                let mut solver = ImplicitRungeKutta::lobatto_iiic_2().rtol(rtol).atol(atol);
                problem.solve(&mut solver)
            }
            IntegrationMethod::LobattoIIIC4 => {
                let mut solver = ImplicitRungeKutta::lobatto_iiic_4().rtol(rtol).atol(atol);
                problem.solve(&mut solver)
            }
            // Fixed-step explicit, one step over the whole problem
            IntegrationMethod::RK4 => {
                let mut solver = ExplicitRungeKutta::rk4(h);
                problem.solve(&mut solver)
            }
            IntegrationMethod::Euler => {
                let mut solver = ExplicitRungeKutta::euler(h);
                problem.solve(&mut solver)
            }
            IntegrationMethod::Heun => {
                let mut solver = ExplicitRungeKutta::heun(h);
                problem.solve(&mut solver)
            }
            IntegrationMethod::Midpoint => {
                let mut solver = ExplicitRungeKutta::midpoint(h);
                problem.solve(&mut solver)
            }
            IntegrationMethod::Ralston => {
                let mut solver = ExplicitRungeKutta::ralston(h);
                problem.solve(&mut solver)
            }
        };

        let solution = solution.map_err(|e| SolverError::ODESolverFailed(e.to_string()))?;
        ode.take_error()?;
        Ok(solution.t.iter().copied().zip(solution.y.iter().copied()).collect())
    }
}

impl<const N: usize> Backend for OdeSolver<N> {
    fn name(&self) -> String {
        self.method.name().to_string()
    }

    fn capabilities(&self) -> CapabilitySet {
        CapabilitySet::empty().with(Capability::Ode).with(Capability::Events)
    }

    fn advance(
        &self,
        system: &DiscretisedSystem,
        t0: f64,
        y0: &[f64],
        t1: f64,
        inputs: &Inputs,
        config: &SolverConfig,
        budget: &mut Budget,
    ) -> SolverResult<Trajectory> {
        let n = system.len();
        if n > N {
            return Err(SolverError::CapacityExceeded(n, N));
        }
        if y0.len() != n {
            return Err(SolverError::InvalidInitialConditions(format!(
                "expected {} state entries, found {}",
                n,
                y0.len()
            )));
        }

        let ode = SystemOde::<N> { system, inputs, n, error: Mutex::new(None) };
        let mut y = SVector::<f64, N>::zeros();
        for i in 0..n {
            y[i] = y0[i];
        }

        let mut trajectory = Trajectory::default();
        if t1 <= t0 {
            return Ok(trajectory);
        }

        if self.method.is_fixed_step() {
            let mut t = t0;
            while t < t1 {
                // Fold a sliver of a last step into the current one
                let t_next = if t1 - t <= self.step_size * (1.0 + 1e-9) { t1 } else { t + self.step_size };
                let steps = self.solve_problem(&ode, t, y, t_next, config)?;
                if let Some((_, y_next)) = steps.last() {
                    y = *y_next;
                }
                t = t_next;

                let state = y.as_slice()[..n].to_vec();
                budget.charge(t, &state)?;
                trajectory.push(t, state);
            }
            return Ok(trajectory);
        }

        let steps = self.solve_problem(&ode, t0, y, t1, config)?;
        for (t, y) in steps.into_iter().filter(|(t, _)| *t > t0) {
            let state = y.as_slice()[..n].to_vec();
            budget.charge(t, &state)?;
            trajectory.push(t, state);
        }

        match trajectory.t.last_mut() {
            Some(last) if (*last - t1).abs() <= 1e-9 * (1.0 + t1.abs()) => *last = t1,
            _ => {
                return Err(SolverError::ODESolverFailed(format!(
                    "integration stopped before t = {}",
                    t1
                )));
            }
        }
        Ok(trajectory)
    }
}
