//! # Symdae: Symbolic Models Discretised into DAE Systems
//!
//! Build a model as symbolic expression trees, bind it to a mesh, and solve
//! the resulting `M * dy/dt = F(t, y, inputs)` system with a pluggable
//! backend. Outputs of the model are post-processed from the solution by
//! name and can be evaluated at arbitrary times and positions.
//!
//! The pipeline:
//!
//! 1. [`model::Model`]: unknowns, equations, initial and boundary conditions,
//!    outputs and events, written with [`expression::Expr`] operators
//! 2. [`parameters::ParameterValues`]: replaces named parameters with values,
//!    expressions, functions or run-time inputs
//! 3. [`discretisation::Discretiser`]: lays out the state vector, replaces
//!    spatial operators with mesh matrices and compiles the equations
//! 4. [`solvers::Dispatcher`]: checks the backend fits the system, makes the
//!    initial state consistent, integrates and handles events
//! 5. [`solution::Solution`]: interpolates named outputs
//!
//! ## Example
//!
//! ```
//! use symdae::discretisation::Discretiser;
//! use symdae::model::Model;
//! use symdae::parameters::Inputs;
//! use symdae::solvers::{Dispatcher, ImplicitDaeSolver};
//!
//! // dx/dt = -x, 0 = z - 2x
//! let mut model = Model::new("decay");
//! let x = model.create_differential("x", None).unwrap();
//! let z = model.create_algebraic("z", None).unwrap();
//! model.set_rhs(&x, -x.expr()).unwrap();
//! model.set_algebraic(&z, z.expr() - 2.0 * x.expr()).unwrap();
//! model.set_initial_condition(&x, 1.0).unwrap();
//! model.set_initial_condition(&z, 0.0).unwrap(); // corrected to 2 before integrating
//!
//! let system = Discretiser::default().process(&model).unwrap();
//! let solution = Dispatcher::new(ImplicitDaeSolver::new())
//!     .solve(&system, &[0.0, 0.5, 1.0], &Inputs::new())
//!     .unwrap();
//!
//! let z = solution.variable("z").unwrap();
//! assert!((z.evaluate(0.0).unwrap() - 2.0).abs() < 1e-8);
//! ```
//!
//! ## Optional Features
//!
//! - **`solvers`** (default): Runge-Kutta backends using `differential-equations`
//!
//! The implicit DAE backend and the algebraic backend are always available.

pub mod autodiff;
pub mod discretisation;
pub mod expression;
pub mod mesh;
pub mod model;
pub mod parameters;
pub mod registry;
pub mod solution;
pub mod solvers;
pub mod spatial;
pub mod symbols;

pub use discretisation::{DiscretisationError, DiscretisedSystem, Discretiser};
pub use expression::{Expr, ExpressionError, Shape, Side};
pub use mesh::{Mesh, Submesh1D};
pub use model::{Algebraic, BoundaryCondition, Differential, Event, Model, ModelError, Unknown};
pub use parameters::{Inputs, ParameterValues};
pub use registry::MethodRegistry;
pub use solution::{ProcessedVariable, Solution, SolutionError};
pub use solvers::{Dispatcher, SolverConfig, SolverError};
