//! Theta-method integration of index-1 DAEs.
//!
//! Each step from `(t, y0)` to `t + h` solves, for `y1`,
//!
//! ```text
//! differential rows:  y1 - y0 - h * (theta * f(t + h, y1) + (1 - theta) * f(t, y0)) = 0
//! algebraic rows:     g(t + h, y1) = 0
//! ```
//!
//! with Newton iterations that reuse the Jacobian evaluated at the start of
//! the step. The local error is estimated by step doubling: one step of `h`
//! against two of `h / 2`.
//!
//! `theta = 1` is backward Euler (L-stable, first order) and `theta = 0.5`
//! Crank-Nicolson (second order).

use nalgebra::DMatrix;

use crate::discretisation::DiscretisedSystem;
use crate::parameters::Inputs;
use crate::solvers::{
    Backend, Budget, Capability, CapabilitySet, SolverConfig, SolverError, SolverResult, Trajectory,
};

/// Adaptive theta-method backend for ODEs and semi-explicit DAEs.
#[derive(Debug, Clone)]
pub struct ImplicitDaeSolver {
    theta: f64,
    min_step: f64,
}

impl ImplicitDaeSolver {
    /// Creates a backward Euler solver.
    pub fn new() -> Self {
        ImplicitDaeSolver { theta: 1.0, min_step: 1e-12 }
    }

    /// Sets the implicitness, between 0.5 and 1.
    pub fn with_theta(mut self, theta: f64) -> Self {
        self.theta = theta.clamp(0.5, 1.0);
        self
    }

    /// Sets the step below which integration gives up.
    pub fn with_min_step(mut self, min_step: f64) -> Self {
        self.min_step = min_step;
        self
    }

    pub fn theta(&self) -> f64 {
        self.theta
    }

    fn order(&self) -> i32 {
        if self.theta == 0.5 {
            2
        } else {
            1
        }
    }

    /// One theta step of size `h`.
    fn step(
        &self,
        system: &DiscretisedSystem,
        t: f64,
        y0: &[f64],
        h: f64,
        inputs: &Inputs,
        config: &SolverConfig,
    ) -> SolverResult<Vec<f64>> {
        let n = system.len();
        let differential = system.differential_mask();
        let theta = self.theta;
        let t1 = t + h;

        let f0 = if theta < 1.0 { system.equations(t, y0, inputs)? } else { vec![0.0; n] };
        // Rows are scaled so the Newton tolerance is relative for large states
        let weights: Vec<f64> = y0.iter().map(|v| 1.0 / (1.0 + v.abs())).collect();

        let mut jacobian: Option<DMatrix<f64>> = None;
        config.newton().solve(
            |y1| {
                let f1 = system.equations(t1, y1, inputs)?;
                let residuals = (0..n)
                    .map(|i| {
                        let r = if differential[i] {
                            y1[i] - y0[i] - h * (theta * f1[i] + (1.0 - theta) * f0[i])
                        } else {
                            f1[i]
                        };
                        r * weights[i]
                    })
                    .collect();

                let jac = match &jacobian {
                    Some(jac) => jac.clone(),
                    None => {
                        let df = system.jacobian(t1, y1, inputs)?;
                        let jac = DMatrix::from_fn(n, n, |i, j| {
                            let entry = if differential[i] {
                                let identity = if i == j { 1.0 } else { 0.0 };
                                identity - h * theta * df[(i, j)]
                            } else {
                                df[(i, j)]
                            };
                            entry * weights[i]
                        });
                        jacobian = Some(jac.clone());
                        jac
                    }
                };
                Ok((residuals, jac))
            },
            y0,
        )
    }

    /// Step-doubling error estimate, scaled so that 1 is the tolerance.
    fn error_norm(&self, y0: &[f64], coarse: &[f64], fine: &[f64], config: &SolverConfig) -> f64 {
        y0.iter()
            .zip(coarse)
            .zip(fine)
            .map(|((a, c), f)| (f - c).abs() / (config.atol + config.rtol * a.abs().max(f.abs())))
            .fold(0.0, f64::max)
    }
}

impl Default for ImplicitDaeSolver {
    fn default() -> Self {
        Self::new()
    }
}

impl Backend for ImplicitDaeSolver {
    fn name(&self) -> String {
        if self.theta == 1.0 {
            "backward-euler".to_string()
        } else if self.theta == 0.5 {
            "crank-nicolson".to_string()
        } else {
            format!("theta-method({})", self.theta)
        }
    }

    fn capabilities(&self) -> CapabilitySet {
        CapabilitySet::empty().with(Capability::Ode).with(Capability::Dae).with(Capability::Events)
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
        if y0.len() != system.len() {
            return Err(SolverError::InvalidInitialConditions(format!(
                "expected {} state entries, found {}",
                system.len(),
                y0.len()
            )));
        }

        let mut trajectory = Trajectory::default();
        let mut t = t0;
        let mut y = y0.to_vec();
        let mut h = config.initial_step.min(config.max_step);
        let exponent = -1.0 / (self.order() + 1) as f64;

        while t < t1 {
            // Fold a sliver of a last step into the current one
            let remaining = t1 - t;
            let last = remaining <= h * (1.0 + 1e-9) || remaining - h < self.min_step;
            let h_try = if last { remaining } else { h };

            if h_try < self.min_step {
                // Too short for error control, take it as a single step
                y = self.step(system, t, &y, h_try, inputs, config)?;
                t = t1;
                budget.charge(t, &y)?;
                trajectory.push(t, y.clone());
                break;
            }

            let attempt = self.step(system, t, &y, h_try, inputs, config).and_then(|coarse| {
                let half = 0.5 * h_try;
                let mid = self.step(system, t, &y, half, inputs, config)?;
                let fine = self.step(system, t + half, &mid, half, inputs, config)?;
                Ok((coarse, fine))
            });

            let (accepted, factor) = match attempt {
                Ok((coarse, fine)) if !self.error_norm(&y, &coarse, &fine, config).is_finite() => {
                    log::debug!("Non-finite error estimate at t = {}", t);
                    (false, 0.5)
                }
                Ok((coarse, fine)) => {
                    let err = self.error_norm(&y, &coarse, &fine, config);
                    let factor = if err == 0.0 { 2.0 } else { (0.9 * err.powf(exponent)).clamp(0.2, 2.0) };
                    if err <= 1.0 {
                        t = if last { t1 } else { t + h_try };
                        y = fine;
                        budget.charge(t, &y)?;
                        trajectory.push(t, y.clone());
                        (true, factor)
                    } else {
                        (false, factor)
                    }
                }
                Err(e @ SolverError::Expression(_)) => return Err(e),
                Err(e) => {
                    log::debug!("Theta step of {:.3e} at t = {} failed: {}", h_try, t, e);
                    (false, 0.5)
                }
            };

            h = (h_try * factor).min(config.max_step);
            if !accepted && h < self.min_step {
                return Err(SolverError::IntegrationFailed {
                    message: format!("step size fell below {:e}", self.min_step),
                    t,
                    y,
                    partial: None,
                });
            }
        }
        Ok(trajectory)
    }
}
