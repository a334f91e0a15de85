//! Model builders shared by the integration tests.

#![allow(dead_code)]

use std::f64::consts::PI;

use symdae::discretisation::{DiscretisedSystem, Discretiser};
use symdae::expression::{div, grad, Expr, Side};
use symdae::mesh::{Mesh, Submesh1D};
use symdae::model::{BoundaryCondition, Model};
use symdae::spatial::FiniteVolume;

/// `n` evenly spaced times from `start` to `end` inclusive.
pub fn linspace(start: f64, end: f64, n: usize) -> Vec<f64> {
    (0..n).map(|i| start + (end - start) * i as f64 / (n - 1) as f64).collect()
}

/// dx/dt = 4x - 2y, dy/dt = 3x - y, x(0) = 1, y(0) = 2, z = x + 4y
pub fn coupled_model() -> Model {
    let mut model = Model::new("coupled");
    let x = model.create_differential("x", None).unwrap();
    let y = model.create_differential("y", None).unwrap();
    model.set_rhs(&x, 4.0 * x.expr() - 2.0 * y.expr()).unwrap();
    model.set_rhs(&y, 3.0 * x.expr() - y.expr()).unwrap();
    model.set_initial_condition(&x, 1.0).unwrap();
    model.set_initial_condition(&y, 2.0).unwrap();
    model.add_output("z", x.expr() + 4.0 * y.expr()).unwrap();
    model
}

pub fn coupled_exact(t: f64) -> (f64, f64, f64) {
    let x = 2.0 * t.exp() - (2.0 * t).exp();
    let y = 3.0 * t.exp() - (2.0 * t).exp();
    (x, y, x + 4.0 * y)
}

/// 0 = x - 5
pub fn constant_root_model() -> Model {
    let mut model = Model::new("root");
    let x = model.create_algebraic("x", None).unwrap();
    model.set_algebraic(&x, x.expr() - 5.0).unwrap();
    model.set_initial_condition(&x, 1.0).unwrap();
    model
}

/// dx/dt = -k x, 0 = v - x^2, with `k` an input parameter
pub fn decay_dae_model() -> Model {
    let mut model = Model::new("decay dae");
    let x = model.create_differential("x", None).unwrap();
    let v = model.create_algebraic("v", None).unwrap();
    model.set_rhs(&x, -Expr::input("k") * x.expr()).unwrap();
    model.set_algebraic(&v, v.expr() - x.expr() * x.expr()).unwrap();
    model.set_initial_condition(&x, 1.0).unwrap();
    model.set_initial_condition(&v, 0.5).unwrap();
    model
}

/// dc/dt = d2c/dx2 on [0, 1], c = 0 at both ends, c(0, x) = sin(pi x)
pub fn heat_model() -> Model {
    let mut model = Model::new("heat");
    let c = model.create_differential("c", Some("rod")).unwrap();
    model.set_rhs(&c, div(&grad(&c))).unwrap();
    model.set_initial_condition(&c, (Expr::spatial_coordinate("rod") * PI).sin()).unwrap();
    model.set_boundary_condition(&c, Side::Left, BoundaryCondition::dirichlet(0.0)).unwrap();
    model.set_boundary_condition(&c, Side::Right, BoundaryCondition::dirichlet(0.0)).unwrap();
    model
}

pub fn heat_exact(t: f64, x: f64) -> f64 {
    (-PI * PI * t).exp() * (PI * x).sin()
}

/// Discretises `model` on a rod of `cells` uniform cells.
pub fn on_rod(model: &Model, cells: usize) -> DiscretisedSystem {
    let mesh = Mesh::new().with_submesh("rod", Submesh1D::uniform(0.0, 1.0, cells).unwrap());
    Discretiser::new(mesh).with_spatial_method("rod", FiniteVolume::new()).process(model).unwrap()
}

pub fn lumped(model: &Model) -> DiscretisedSystem {
    Discretiser::default().process(model).unwrap()
}
