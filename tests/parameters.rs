//! Parameter resolution feeding a full solve.

mod common;

use approx::assert_relative_eq;
use symdae::expression::Expr;
use symdae::model::Model;
use symdae::parameters::{Inputs, ParameterError, ParameterValues};
use symdae::solvers::{Dispatcher, ImplicitDaeSolver, SolverConfig};

use common::*;

/// dx/dt = -rate * x + source(x), reported as gain * x
fn parameterised_model() -> Model {
    let mut model = Model::new("parameterised decay");
    let x = model.create_differential("x", None).unwrap();
    let source = Expr::function_parameter("source", vec![x.expr().clone()]);
    model.set_rhs(&x, -Expr::parameter("rate") * x.expr() + source).unwrap();
    model.set_initial_condition(&x, 1.0).unwrap();
    model.add_output("scaled", Expr::parameter("gain") * x.expr()).unwrap();
    model
}

fn values() -> ParameterValues {
    ParameterValues::new()
        .with_constant("base", 1.0)
        .with_expression("rate", Expr::parameter("base") * 2.0)
        .with_function("source", |args| 0.5 * &args[0])
        .with_input("gain")
}

#[test]
fn test_resolved_model_solves() {
    let model = values().process_model(&parameterised_model()).unwrap();
    let system = lumped(&model);

    let mut inputs = Inputs::new();
    inputs.insert("gain".to_string(), 3.0);
    let dispatcher = Dispatcher::new(ImplicitDaeSolver::new().with_theta(0.5))
        .with_config(SolverConfig::default().with_rtol(1e-8).with_atol(1e-10));
    let solution = dispatcher.solve(&system, &linspace(0.0, 1.0, 5), &inputs).unwrap();

    // dx/dt = -1.5 x
    let scaled = solution.variable("scaled").unwrap();
    for &t in solution.t() {
        assert_relative_eq!(scaled.evaluate(t).unwrap(), 3.0 * (-1.5 * t).exp(), epsilon = 1e-5);
    }
}

#[test]
fn test_one_model_many_parameter_sets() {
    let model = parameterised_model();
    let slow = values().with_constant("base", 0.25).process_model(&model).unwrap();
    let fast = values().process_model(&model).unwrap();

    let mut inputs = Inputs::new();
    inputs.insert("gain".to_string(), 1.0);
    let dispatcher = Dispatcher::new(ImplicitDaeSolver::new());
    let end = |m: &Model| {
        let solution = dispatcher.solve(&lumped(m), &[0.0, 1.0], &inputs).unwrap();
        solution.last_state().unwrap()[0]
    };

    // dx/dt = 0 for the slow set
    assert_relative_eq!(end(&slow), 1.0, epsilon = 1e-12);
    assert!(end(&fast) < 0.5);
}

#[test]
fn test_missing_parameter_is_reported() {
    let incomplete = ParameterValues::new().with_constant("rate", 1.0).with_input("gain");
    let result = incomplete.process_model(&parameterised_model());
    assert!(matches!(result, Err(ParameterError::Missing(name)) if name == "source"));
}
