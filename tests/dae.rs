//! Index-1 DAEs with the implicit backend: consistent initialisation,
//! stepping with changing inputs and partial results.

mod common;

use approx::assert_relative_eq;
use symdae::model::Model;
use symdae::parameters::Inputs;
use symdae::registry::MethodRegistry;
use symdae::solution::Termination;
use symdae::solvers::{Dispatcher, ImplicitDaeSolver, SolverConfig, SolverError};

use common::*;

fn rate(k: f64) -> Inputs {
    let mut inputs = Inputs::new();
    inputs.insert("k".to_string(), k);
    inputs
}

fn backward_euler() -> Dispatcher {
    Dispatcher::new(ImplicitDaeSolver::new()).with_config(SolverConfig::default().with_rtol(1e-6).with_atol(1e-8))
}

#[test]
fn test_inconsistent_initial_state_is_corrected() {
    let system = lumped(&decay_dae_model());
    let registry = MethodRegistry::new();
    let solution =
        backward_euler().with_registry(registry.clone()).solve(&system, &[0.0, 1.0], &rate(1.0)).unwrap();
    assert_eq!(registry.entries(), vec!["backward-euler".to_string(), "newton".to_string()]);

    // v starts at 0.5 in the model but must equal x^2 = 1
    let v = solution.variable("v").unwrap();
    assert_relative_eq!(v.evaluate(0.0).unwrap(), 1.0, epsilon = 1e-8);

    let x = solution.variable("x").unwrap();
    let x_end = x.evaluate(1.0).unwrap();
    assert_relative_eq!(x_end, (-1.0f64).exp(), epsilon = 1e-3);
    assert_relative_eq!(v.evaluate(1.0).unwrap(), x_end * x_end, epsilon = 1e-8);
}

#[test]
fn test_algebraic_unknown_declared_first() {
    // 0 = v - x^2, dx/dt = -x, with v declared before x
    let mut model = Model::new("algebraic first");
    let v = model.create_algebraic("v", None).unwrap();
    let x = model.create_differential("x", None).unwrap();
    model.set_algebraic(&v, v.expr() - x.expr() * x.expr()).unwrap();
    model.set_rhs(&x, -x.expr()).unwrap();
    model.set_initial_condition(&v, 0.0).unwrap();
    model.set_initial_condition(&x, 1.0).unwrap();

    let system = lumped(&model);
    assert_eq!(system.mapping().slice_of("v"), Some(0..1));
    assert_eq!(system.mapping().slice_of("x"), Some(1..2));

    let solution = backward_euler().solve(&system, &linspace(0.0, 1.0, 5), &Inputs::new()).unwrap();
    assert_relative_eq!(solution.y()[0][0], 1.0, epsilon = 1e-8);

    let x = solution.variable("x").unwrap();
    let v = solution.variable("v").unwrap();
    assert_relative_eq!(x.evaluate(1.0).unwrap(), (-1.0f64).exp(), epsilon = 1e-3);
    for &t in solution.t() {
        let xt = x.evaluate(t).unwrap();
        assert_relative_eq!(v.evaluate(t).unwrap(), xt * xt, epsilon = 1e-7);
    }
}

#[test]
fn test_consistent_initialisation_is_idempotent() {
    let system = lumped(&decay_dae_model());
    let dispatcher = backward_euler();
    let inputs = rate(1.0);

    let y0 = system.initial_state(&inputs).unwrap();
    let once = dispatcher.consistent_initial_conditions(&system, 0.0, &y0, &inputs).unwrap();
    let twice = dispatcher.consistent_initial_conditions(&system, 0.0, &once, &inputs).unwrap();

    assert_eq!(once[0], y0[0]);
    assert_eq!(once, twice);
}

#[test]
fn test_stepping_with_changing_inputs() {
    let system = lumped(&decay_dae_model());
    let dispatcher = backward_euler();

    let first = dispatcher.step(&system, None, 0.5, &rate(1.0)).unwrap();
    let both = dispatcher.step(&system, Some(&first), 0.5, &rate(2.0)).unwrap();

    assert_eq!(first.t(), &[0.0, 0.5]);
    assert_eq!(both.t(), &[0.0, 0.5, 0.5, 1.0]);
    assert_eq!(both.inputs_at(0)["k"], 1.0);
    assert_eq!(both.inputs_at(both.len() - 1)["k"], 2.0);

    // Times never decrease and only the junction repeats
    let repeats = both.t().windows(2).filter(|w| w[1] == w[0]).count();
    assert!(both.t().windows(2).all(|w| w[1] >= w[0]));
    assert_eq!(repeats, 1);

    // exp(-0.5 * 1) * exp(-0.5 * 2)
    let x = both.variable("x").unwrap();
    assert_relative_eq!(x.evaluate(1.0).unwrap(), (-1.5f64).exp(), epsilon = 1e-3);
    assert_relative_eq!(x.evaluate(0.5).unwrap(), (-0.5f64).exp(), epsilon = 1e-3);
}

#[test]
fn test_missing_input_is_rejected_before_solving() {
    let system = lumped(&decay_dae_model());
    let result = backward_euler().solve(&system, &[0.0, 1.0], &Inputs::new());
    assert!(matches!(result, Err(SolverError::MissingInput(name)) if name == "k"));
}

#[test]
fn test_step_budget_returns_partial_solution() {
    let system = lumped(&decay_dae_model());
    let dispatcher = Dispatcher::new(ImplicitDaeSolver::new()).with_config(SolverConfig::default().with_max_steps(10));

    let err = backward_euler_with(dispatcher, &system);
    assert!(matches!(err, SolverError::Timeout { .. }), "unexpected error {:?}", err);

    let (t, y) = err.last_state().unwrap();
    assert!(t > 0.0 && t < 10.0);
    assert_eq!(y.len(), 2);

    let partial = err.partial().unwrap();
    assert_eq!(partial.termination(), &Termination::Incomplete);
    assert_eq!(partial.t()[0], 0.0);
    assert_eq!(partial.last_time(), Some(t));
    assert_eq!(partial.last_state(), Some(y));
}

fn backward_euler_with(dispatcher: Dispatcher, system: &symdae::DiscretisedSystem) -> SolverError {
    match dispatcher.solve(system, &linspace(0.0, 10.0, 11), &rate(1.0)) {
        Ok(_) => panic!("expected the step budget to run out"),
        Err(e) => e,
    }
}
