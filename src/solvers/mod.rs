//! Numerical solvers for discretised systems.
//!
//! A [`Dispatcher`] drives one [`Backend`] over a [`DiscretisedSystem`]. Each
//! backend advertises a [`CapabilitySet`]; the dispatcher derives the set a
//! system needs and refuses incompatible pairings before any work is done.
//!
//! | System                         | Required capabilities |
//! |--------------------------------|-----------------------|
//! | differential unknowns only     | `Ode`                 |
//! | differential and algebraic     | `Ode`, `Dae`          |
//! | algebraic unknowns only        | `RootFind`            |
//! | any of the above with events   | adds `Events` when there are differential unknowns |
//!
//! # Backends
//!
//! - [`OdeSolver`](integration::OdeSolver): explicit and implicit Runge-Kutta
//!   methods from the `differential-equations` crate (feature `solvers`)
//! - [`ImplicitDaeSolver`](implicit::ImplicitDaeSolver): theta method with
//!   Newton iterations and step-doubling error control; handles DAEs
//! - [`AlgebraicSolver`](algebraic::AlgebraicSolver): Newton-Raphson at each
//!   requested time
//!
//! # Usage Pattern
//!
//! ```ignore
//! use symdae::solvers::{Dispatcher, SolverConfig};
//! use symdae::solvers::integration::{IntegrationMethod, OdeSolver};
//!
//! let dispatcher = Dispatcher::new(OdeSolver::<8>::new(IntegrationMethod::Dopri5))
//!     .with_config(SolverConfig::default().with_rtol(1e-8));
//! let solution = dispatcher.solve(&system, &t_eval, &Inputs::new())?;
//! let z = solution.variable("z")?.evaluate(0.5)?;
//! ```

pub mod algebraic;
pub mod dispatcher;
pub mod implicit;
#[cfg(feature = "solvers")]
pub mod integration;

use std::fmt;
use std::time::{Duration, Instant};

use nalgebra::{DMatrix, DVector};

use crate::discretisation::DiscretisedSystem;
use crate::expression::ExpressionError;
use crate::parameters::Inputs;
use crate::solution::{Solution, SolutionError};

pub use algebraic::AlgebraicSolver;
pub use dispatcher::Dispatcher;
pub use implicit::ImplicitDaeSolver;
#[cfg(feature = "solvers")]
pub use integration::{IntegrationMethod, OdeSolver};

/// Result type for solver operations.
pub type SolverResult<T> = Result<T, SolverError>;

/// Errors that can occur during solving.
#[derive(Debug, thiserror::Error)]
pub enum SolverError {
    /// The backend lacks a capability the system needs
    #[error("Solver '{solver}' provides {provided} but the system requires {required}")]
    IncompatibleSolver {
        /// Backend name
        solver: String,
        /// Capabilities the system needs
        required: CapabilitySet,
        /// Capabilities the backend offers
        provided: CapabilitySet,
    },
    /// Integration stopped before the final time
    #[error("Integration failed at t = {t}: {message}")]
    IntegrationFailed {
        /// Backend message
        message: String,
        /// Last successfully reached time
        t: f64,
        /// State at `t`
        y: Vec<f64>,
        /// Samples reached before the failure
        partial: Option<Box<Solution>>,
    },
    /// A step-count or wall-clock limit was hit
    #[error("Solve timed out at t = {t}: {reason}")]
    Timeout {
        /// Which limit was hit
        reason: String,
        /// Last successfully reached time
        t: f64,
        /// State at `t`
        y: Vec<f64>,
        /// Samples reached before the limit
        partial: Option<Box<Solution>>,
    },
    /// Maximum iterations exceeded without convergence
    #[error("Maximum iterations exceeded")]
    MaxIterationsExceeded,
    /// Singular Jacobian matrix encountered
    #[error("Singular Jacobian matrix")]
    SingularJacobian,
    /// Solution diverged
    #[error("Solution diverged")]
    Diverged,
    /// The initial state does not fit the system
    #[error("Invalid initial conditions: {0}")]
    InvalidInitialConditions(String),
    /// ODE solver failed
    #[error("ODE solver failed: {0}")]
    ODESolverFailed(String),
    /// Too many differential variables for integrator capacity
    #[error("Problem has {0} state entries but integrator capacity is {1}")]
    CapacityExceeded(usize, usize),
    /// Output times are empty, unsorted or not finite
    #[error("Invalid time points: {0}")]
    InvalidTimePoints(String),
    /// An input parameter the system reads was not supplied
    #[error("Input parameter '{0}' was not supplied")]
    MissingInput(String),
    /// Stepping past a terminating event
    #[error("The previous solution ended at terminating event '{0}'")]
    AlreadyTerminated(String),
    /// The backend does not implement the requested operation
    #[error("Solver '{solver}' does not support {operation}")]
    Unsupported {
        /// Backend name
        solver: String,
        /// Requested operation
        operation: &'static str,
    },
    /// Expression evaluation failed
    #[error(transparent)]
    Expression(#[from] ExpressionError),
    /// Joining solution segments failed
    #[error(transparent)]
    Solution(#[from] SolutionError),
}

impl SolverError {
    /// Partial solution attached to a failed or timed out solve.
    pub fn partial(&self) -> Option<&Solution> {
        match self {
            SolverError::IntegrationFailed { partial, .. } | SolverError::Timeout { partial, .. } => {
                partial.as_deref()
            }
            _ => None,
        }
    }

    /// Last reached time and state of a failed or timed out solve.
    pub fn last_state(&self) -> Option<(f64, &[f64])> {
        match self {
            SolverError::IntegrationFailed { t, y, .. } | SolverError::Timeout { t, y, .. } => {
                Some((*t, y))
            }
            _ => None,
        }
    }
}

/// Something a backend can do.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Capability {
    /// Integrate `dy/dt = f(t, y)`
    Ode,
    /// Integrate systems with algebraic constraints (singular mass matrix)
    Dae,
    /// Solve purely algebraic systems
    RootFind,
    /// Report accepted steps for event detection
    Events,
}

impl Capability {
    const ALL: [Capability; 4] =
        [Capability::Ode, Capability::Dae, Capability::RootFind, Capability::Events];

    fn bit(self) -> u8 {
        match self {
            Capability::Ode => 1,
            Capability::Dae => 2,
            Capability::RootFind => 4,
            Capability::Events => 8,
        }
    }
}

impl fmt::Display for Capability {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Capability::Ode => write!(f, "ode"),
            Capability::Dae => write!(f, "dae"),
            Capability::RootFind => write!(f, "root-find"),
            Capability::Events => write!(f, "events"),
        }
    }
}

/// A set of [`Capability`] values.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct CapabilitySet(u8);

impl CapabilitySet {
    /// The empty set.
    pub const fn empty() -> Self {
        CapabilitySet(0)
    }

    /// Adds a capability.
    pub fn with(self, capability: Capability) -> Self {
        CapabilitySet(self.0 | capability.bit())
    }

    pub fn contains(self, capability: Capability) -> bool {
        self.0 & capability.bit() != 0
    }

    /// Returns true if every capability of `other` is in `self`.
    pub fn is_superset_of(self, other: CapabilitySet) -> bool {
        self.0 & other.0 == other.0
    }

    /// Capabilities of `required` missing from `self`.
    pub fn missing(self, required: CapabilitySet) -> CapabilitySet {
        CapabilitySet(required.0 & !self.0)
    }

    pub fn is_empty(self) -> bool {
        self.0 == 0
    }

    pub fn iter(self) -> impl Iterator<Item = Capability> {
        Capability::ALL.into_iter().filter(move |c| self.contains(*c))
    }
}

impl FromIterator<Capability> for CapabilitySet {
    fn from_iter<I: IntoIterator<Item = Capability>>(iter: I) -> Self {
        iter.into_iter().fold(CapabilitySet::empty(), CapabilitySet::with)
    }
}

impl fmt::Display for CapabilitySet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{{")?;
        for (i, c) in self.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{}", c)?;
        }
        write!(f, "}}")
    }
}

/// Capabilities a backend needs to solve `system`.
pub fn required_capabilities(system: &DiscretisedSystem) -> CapabilitySet {
    let mut required = CapabilitySet::empty();
    if system.n_differential() == 0 {
        return required.with(Capability::RootFind);
    }
    required = required.with(Capability::Ode);
    if system.n_algebraic() > 0 {
        required = required.with(Capability::Dae);
    }
    if !system.events().is_empty() {
        required = required.with(Capability::Events);
    }
    required
}

/// Tolerances and limits shared by all backends.
#[derive(Debug, Clone)]
pub struct SolverConfig {
    /// Relative tolerance
    pub rtol: f64,
    /// Absolute tolerance
    pub atol: f64,
    /// Residual norm accepted by Newton iterations
    pub root_tolerance: f64,
    /// Newton iteration limit
    pub max_newton_iterations: usize,
    /// Accepted-step limit for a whole solve
    pub max_steps: usize,
    /// Wall-clock limit for a whole solve
    pub timeout: Option<Duration>,
    /// First step tried by adaptive implicit steppers
    pub initial_step: f64,
    /// Largest step taken by adaptive implicit steppers
    pub max_step: f64,
    /// Width below which event bisection stops
    pub event_tolerance: f64,
    /// Number of output points produced by each [`Dispatcher::step`]
    pub step_points: usize,
}

impl Default for SolverConfig {
    fn default() -> Self {
        SolverConfig {
            rtol: 1e-6,
            atol: 1e-8,
            root_tolerance: 1e-8,
            max_newton_iterations: 50,
            max_steps: 500_000,
            timeout: None,
            initial_step: 1e-4,
            max_step: f64::INFINITY,
            event_tolerance: 1e-10,
            step_points: 2,
        }
    }
}

impl SolverConfig {
    pub fn with_rtol(mut self, rtol: f64) -> Self {
        self.rtol = rtol;
        self
    }

    pub fn with_atol(mut self, atol: f64) -> Self {
        self.atol = atol;
        self
    }

    pub fn with_root_tolerance(mut self, tolerance: f64) -> Self {
        self.root_tolerance = tolerance;
        self
    }

    pub fn with_max_newton_iterations(mut self, iterations: usize) -> Self {
        self.max_newton_iterations = iterations;
        self
    }

    pub fn with_max_steps(mut self, steps: usize) -> Self {
        self.max_steps = steps;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn with_initial_step(mut self, step: f64) -> Self {
        self.initial_step = step;
        self
    }

    pub fn with_max_step(mut self, step: f64) -> Self {
        self.max_step = step;
        self
    }

    pub fn with_event_tolerance(mut self, tolerance: f64) -> Self {
        self.event_tolerance = tolerance;
        self
    }

    pub fn with_step_points(mut self, points: usize) -> Self {
        self.step_points = points;
        self
    }

    /// Newton solver with this configuration's tolerance and iteration limit.
    pub fn newton(&self) -> NewtonRaphson {
        NewtonRaphson::new(self.root_tolerance, self.max_newton_iterations)
    }
}

/// Step and wall-clock allowance of one solve.
#[derive(Debug, Clone)]
pub struct Budget {
    max_steps: usize,
    steps: usize,
    started: Instant,
    timeout: Option<Duration>,
}

impl Budget {
    /// Starts the clock.
    pub fn new(config: &SolverConfig) -> Self {
        Budget { max_steps: config.max_steps, steps: 0, started: Instant::now(), timeout: config.timeout }
    }

    /// Accounts for one accepted step ending at `(t, y)`.
    pub fn charge(&mut self, t: f64, y: &[f64]) -> SolverResult<()> {
        self.steps += 1;
        let reason = if self.steps > self.max_steps {
            format!("step limit of {} reached", self.max_steps)
        } else if let Some(limit) = self.timeout.filter(|l| self.started.elapsed() > *l) {
            format!("wall-clock limit of {:?} reached", limit)
        } else {
            return Ok(());
        };
        Err(SolverError::Timeout { reason, t, y: y.to_vec(), partial: None })
    }

    /// Steps charged so far.
    pub fn steps(&self) -> usize {
        self.steps
    }
}

/// Accepted steps of one call to [`Backend::advance`], excluding the start point.
#[derive(Debug, Clone, Default)]
pub struct Trajectory {
    /// Step end times, increasing, the last equal to the target time
    pub t: Vec<f64>,
    /// State at each step end
    pub y: Vec<Vec<f64>>,
}

impl Trajectory {
    pub fn push(&mut self, t: f64, y: Vec<f64>) {
        self.t.push(t);
        self.y.push(y);
    }

    pub fn len(&self) -> usize {
        self.t.len()
    }

    pub fn is_empty(&self) -> bool {
        self.t.is_empty()
    }
}

/// A numerical integrator or root finder the dispatcher can drive.
pub trait Backend {
    /// Name recorded in the method registry.
    fn name(&self) -> String;

    /// What the backend can do.
    fn capabilities(&self) -> CapabilitySet;

    /// Integrates from `(t0, y0)` to `t1`, returning every accepted step.
    ///
    /// `y0` is expected to be consistent with the algebraic rows.
    #[allow(clippy::too_many_arguments)]
    fn advance(
        &self,
        system: &DiscretisedSystem,
        t0: f64,
        y0: &[f64],
        t1: f64,
        inputs: &Inputs,
        config: &SolverConfig,
        budget: &mut Budget,
    ) -> SolverResult<Trajectory>;

    /// Solves the algebraic system at time `t`, starting from `guess`.
    fn root_find(
        &self,
        _system: &DiscretisedSystem,
        _t: f64,
        _guess: &[f64],
        _inputs: &Inputs,
        _config: &SolverConfig,
    ) -> SolverResult<Vec<f64>> {
        Err(SolverError::Unsupported { solver: self.name(), operation: "root finding" })
    }
}

/// Newton-Raphson solver for nonlinear algebraic equations.
///
/// Solves systems of the form F(x) = 0 using the Newton-Raphson method:
/// x_{k+1} = x_k - J^{-1} F(x_k)
///
/// where J is the Jacobian matrix dF/dx.
#[derive(Debug, Clone)]
pub struct NewtonRaphson {
    /// Convergence tolerance on the residual norm
    pub tolerance: f64,
    /// Maximum number of iterations
    pub max_iterations: usize,
    /// Relaxation factor (1.0 = full Newton step)
    pub relaxation: f64,
}

impl NewtonRaphson {
    /// Creates a new Newton-Raphson solver with default settings.
    pub fn new(tolerance: f64, max_iterations: usize) -> Self {
        NewtonRaphson { tolerance, max_iterations, relaxation: 1.0 }
    }

    /// Creates a solver with relaxation (damped Newton method).
    pub fn with_relaxation(tolerance: f64, max_iterations: usize, relaxation: f64) -> Self {
        NewtonRaphson { tolerance, max_iterations, relaxation }
    }

    /// Solves the nonlinear system F(x) = 0.
    ///
    /// `f` returns the residuals and the Jacobian at `x`. It may return a
    /// stale Jacobian (modified Newton), at the cost of slower convergence.
    pub fn solve<F>(&self, mut f: F, x0: &[f64]) -> SolverResult<Vec<f64>>
    where
        F: FnMut(&[f64]) -> SolverResult<(Vec<f64>, DMatrix<f64>)>,
    {
        let mut x = x0.to_vec();

        for iteration in 0..self.max_iterations {
            let (residuals, jacobian) = f(&x)?;

            let norm = residuals.iter().map(|r| r * r).sum::<f64>().sqrt();
            if !norm.is_finite() {
                return Err(SolverError::Diverged);
            }
            if norm < self.tolerance {
                log::debug!("Newton converged in {} iterations (|F| = {:.3e})", iteration, norm);
                return Ok(x);
            }

            // Solve J * dx = -F
            let r_vec = DVector::from_vec(residuals);
            let dx = match jacobian.lu().solve(&(-r_vec)) {
                Some(sol) => sol,
                None => return Err(SolverError::SingularJacobian),
            };
            if dx.iter().any(|v| !v.is_finite()) {
                return Err(SolverError::SingularJacobian);
            }

            for (xi, dxi) in x.iter_mut().zip(dx.iter()) {
                *xi += self.relaxation * dxi;
            }

            if iteration > 10 && norm > 1e10 {
                return Err(SolverError::Diverged);
            }
        }

        Err(SolverError::MaxIterationsExceeded)
    }
}
