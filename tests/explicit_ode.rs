//! Runge-Kutta solves of lumped and spatial models.

#![cfg(feature = "solvers")]

mod common;

use approx::assert_relative_eq;
use nalgebra::DMatrix;
use symdae::parameters::Inputs;
use symdae::solution::Termination;
use symdae::solvers::integration::{IntegrationMethod, OdeSolver};
use symdae::solvers::{Dispatcher, SolverConfig};

use common::*;

fn dopri5() -> Dispatcher {
    Dispatcher::new(OdeSolver::<64>::new(IntegrationMethod::Dopri5))
        .with_config(SolverConfig::default().with_rtol(1e-9).with_atol(1e-11))
}

#[test]
fn test_coupled_system_matches_closed_form() {
    let system = lumped(&coupled_model());
    let t_eval = linspace(0.0, 1.0, 20);
    let solution = dopri5().solve(&system, &t_eval, &Inputs::new()).unwrap();

    assert_eq!(solution.t(), t_eval.as_slice());
    assert_eq!(solution.termination(), &Termination::FinalTime);

    let x = solution.variable("x").unwrap();
    let y = solution.variable("y").unwrap();
    let z = solution.variable("z").unwrap();
    for &t in &t_eval {
        let (xe, ye, ze) = coupled_exact(t);
        assert_relative_eq!(x.evaluate(t).unwrap(), xe, epsilon = 1e-6);
        assert_relative_eq!(y.evaluate(t).unwrap(), ye, epsilon = 1e-6);
        assert_relative_eq!(z.evaluate(t).unwrap(), ze, epsilon = 1e-6);
    }
}

#[test]
fn test_pure_ode_has_identity_mass_matrix() {
    let system = lumped(&coupled_model());
    assert_eq!(DMatrix::from(system.mass_matrix()), DMatrix::identity(2, 2));

    let heat = on_rod(&heat_model(), 10);
    assert_eq!(DMatrix::from(heat.mass_matrix()), DMatrix::identity(10, 10));
}

#[test]
fn test_repeated_solves_are_identical() {
    let system = lumped(&coupled_model());
    let t_eval = linspace(0.0, 0.5, 6);
    let first = dopri5().solve(&system, &t_eval, &Inputs::new()).unwrap();
    let second = dopri5().solve(&system, &t_eval, &Inputs::new()).unwrap();
    assert_eq!(first.y(), second.y());
}

#[test]
fn test_fixed_step_rk4() {
    let system = lumped(&coupled_model());
    let dispatcher = Dispatcher::new(OdeSolver::<8>::new(IntegrationMethod::RK4).with_step_size(1e-3));
    let solution = dispatcher.solve(&system, &[0.0, 0.5], &Inputs::new()).unwrap();

    let (xe, ..) = coupled_exact(0.5);
    assert_relative_eq!(solution.last_state().unwrap()[0], xe, epsilon = 1e-8);
}

#[test]
fn test_heat_equation_converges_with_resolution() {
    let model = heat_model();
    let t_end = 0.05;
    let dispatcher = dopri5();

    let errors: Vec<f64> = [8, 16, 32]
        .iter()
        .map(|&cells| {
            // The same symbolic model is discretised against each mesh
            let system = on_rod(&model, cells);
            let solution = dispatcher.solve(&system, &[0.0, t_end], &Inputs::new()).unwrap();
            let c = solution.variable("c").unwrap();
            let values = c.evaluate_field(t_end).unwrap();
            let positions = c.positions().unwrap();
            positions
                .iter()
                .zip(&values)
                .map(|(&x, &v)| (v - heat_exact(t_end, x)).abs())
                .fold(0.0, f64::max)
        })
        .collect();

    assert!(errors[1] < errors[0], "errors {:?}", errors);
    assert!(errors[2] < errors[1], "errors {:?}", errors);
    // Second order in space
    assert!(errors[2] < 0.4 * errors[1], "errors {:?}", errors);
    assert!(errors[2] < 1e-3, "errors {:?}", errors);
}

#[test]
fn test_heat_profile_between_cells() {
    let system = on_rod(&heat_model(), 32);
    let solution = dopri5().solve(&system, &linspace(0.0, 0.02, 5), &Inputs::new()).unwrap();
    let c = solution.variable("c").unwrap();

    assert_relative_eq!(c.evaluate_at(0.02, 0.5).unwrap(), heat_exact(0.02, 0.5), epsilon = 2e-3);
    assert_relative_eq!(c.evaluate_at(0.01, 0.25).unwrap(), heat_exact(0.01, 0.25), epsilon = 2e-3);
}
