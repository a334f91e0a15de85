//! Spatial discretisation schemes.
//!
//! A [`SpatialMethod`] turns each mesh-independent spatial operator into a
//! concrete expression over discretised vectors, typically a constant sparse
//! matrix applied to the state. [`FiniteVolume`] is the cell-centred scheme:
//! unknowns live at cell centres, gradients and fluxes on cell edges.
//!
//! Boundary conditions enter through ghost cells mirrored across the boundary.
//! For a Robin condition `alpha * u + beta * du/dn = gamma` the ghost value is
//!
//! ```text
//! u_ghost = (2 gamma - (alpha - beta / delta) u_i) / (alpha + beta / delta)
//! ```
//!
//! where `u_i` is the adjacent cell value and `delta` the distance from its
//! centre to the boundary. Dirichlet and Neumann conditions are the special
//! cases `beta = 0` and `alpha = 0`.

use std::collections::BTreeMap;

use nalgebra_sparse::{CooMatrix, CsrMatrix};

use crate::expression::{Expr, ExpressionError, Side};
use crate::mesh::{CoordinateSystem, Submesh1D};
use crate::model::BoundaryCondition;

/// Result type for spatial operators.
pub type SpatialResult<T> = Result<T, SpatialError>;

/// Errors raised while building discrete operators.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum SpatialError {
    /// A Robin condition whose ghost value is undefined on this mesh
    #[error("Robin condition on the {side} boundary is degenerate: alpha + beta / delta = 0")]
    DegenerateRobin {
        /// Boundary
        side: Side,
    },
    /// The operand does not have one value per cell or per edge
    #[error("Operand of '{op}' has length {found}, expected {expected}")]
    Length {
        /// Operator name
        op: &'static str,
        /// Expected length
        expected: usize,
        /// Actual length
        found: usize,
    },
    /// Malformed expression
    #[error(transparent)]
    Expression(#[from] ExpressionError),
}

/// Boundary conditions of one unknown, keyed by side.
pub type BoundaryConditions = BTreeMap<Side, BoundaryCondition>;

/// Builds discrete versions of the spatial operators on a submesh.
///
/// Operands are discretised vectors: one value per cell for cell fields and
/// one per edge for edge fields.
pub trait SpatialMethod {
    /// Name recorded in the method registry.
    fn name(&self) -> &str;

    /// Gradient of a cell vector, on edges.
    ///
    /// `bcs` are the conditions of the unknown being differentiated, if the
    /// operand is an unknown.
    fn gradient(
        &self,
        submesh: &Submesh1D,
        u: &Expr,
        bcs: Option<&BoundaryConditions>,
    ) -> SpatialResult<Expr>;

    /// Divergence of an edge vector, on cells.
    fn divergence(&self, submesh: &Submesh1D, flux: &Expr) -> SpatialResult<Expr>;

    /// Integral of a cell vector over the domain.
    fn integral(&self, submesh: &Submesh1D, u: &Expr) -> SpatialResult<Expr>;

    /// Value of a cell vector at one end of the domain.
    fn boundary_value(
        &self,
        submesh: &Submesh1D,
        u: &Expr,
        side: Side,
        bcs: Option<&BoundaryConditions>,
    ) -> SpatialResult<Expr>;

    /// Copies a scalar onto every cell.
    fn broadcast(&self, submesh: &Submesh1D, value: &Expr) -> SpatialResult<Expr>;

    /// Average of a cell vector onto edges.
    fn face_average(&self, submesh: &Submesh1D, u: &Expr) -> SpatialResult<Expr>;

    /// Positions of the cell centres.
    fn spatial_coordinate(&self, submesh: &Submesh1D) -> Expr {
        Expr::vector(submesh.nodes().to_vec())
    }
}

/// Cell-centred finite volumes with ghost-cell boundary conditions.
#[derive(Debug, Clone, Copy, Default)]
pub struct FiniteVolume;

impl FiniteVolume {
    pub fn new() -> Self {
        FiniteVolume
    }
}

fn check_len(op: &'static str, expr: &Expr, expected: usize) -> SpatialResult<()> {
    let found = expr.shape()?.len().unwrap_or(0);
    if found != expected {
        return Err(SpatialError::Length { op, expected, found });
    }
    Ok(())
}

fn sparse(nrows: usize, ncols: usize, entries: &[(usize, usize, f64)]) -> Expr {
    let mut coo = CooMatrix::new(nrows, ncols);
    for &(i, j, v) in entries {
        coo.push(i, j, v);
    }
    Expr::matrix(CsrMatrix::from(&coo))
}

/// Picks entry `index` out of a vector of length `n`.
fn select(u: &Expr, n: usize, index: usize) -> Expr {
    Expr::matmul(&sparse(1, n, &[(0, index, 1.0)]), u)
}

/// Distance from the boundary cell centre to the boundary.
fn half_cell(submesh: &Submesh1D, side: Side) -> f64 {
    let (nodes, edges) = (submesh.nodes(), submesh.edges());
    match side {
        Side::Left => nodes[0] - edges[0],
        Side::Right => edges[edges.len() - 1] - nodes[nodes.len() - 1],
    }
}

/// Ghost value outside `side`, given the adjacent cell value.
fn ghost_value(
    u_i: &Expr,
    condition: &BoundaryCondition,
    delta: f64,
    side: Side,
) -> SpatialResult<Expr> {
    let (alpha, beta, gamma) = match condition {
        BoundaryCondition::Dirichlet(v) => (1.0, 0.0, v.clone()),
        BoundaryCondition::Neumann(q) => {
            // du/dn = -du/dx on the left
            let outward = match side {
                Side::Left => -q,
                Side::Right => q.clone(),
            };
            (0.0, 1.0, outward)
        }
        BoundaryCondition::Robin { alpha, beta, gamma } => (*alpha, *beta, gamma.clone()),
    };
    if beta == 0.0 {
        if alpha == 0.0 {
            return Err(SpatialError::DegenerateRobin { side });
        }
        return Ok(2.0 * (gamma / alpha) - u_i);
    }
    let denom = alpha + beta / delta;
    if denom == 0.0 {
        return Err(SpatialError::DegenerateRobin { side });
    }
    Ok((2.0 * gamma - (alpha - beta / delta) * u_i) / denom)
}

impl SpatialMethod for FiniteVolume {
    fn name(&self) -> &str {
        "finite volume"
    }

    fn gradient(
        &self,
        submesh: &Submesh1D,
        u: &Expr,
        bcs: Option<&BoundaryConditions>,
    ) -> SpatialResult<Expr> {
        let n = submesh.npts();
        check_len("grad", u, n)?;
        let nodes = submesh.nodes();

        let mut parts = Vec::with_capacity(3);
        for side in [Side::Left, Side::Right] {
            let condition = bcs.and_then(|b| b.get(&side));
            let cell = match side {
                Side::Left => 0,
                Side::Right => n - 1,
            };
            let face = match condition {
                Some(c) => {
                    let delta = half_cell(submesh, side);
                    let u_i = select(u, n, cell);
                    let ghost = ghost_value(&u_i, c, delta, side)?;
                    match side {
                        Side::Left => (&u_i - ghost) / (2.0 * delta),
                        Side::Right => (ghost - &u_i) / (2.0 * delta),
                    }
                }
                None => {
                    log::debug!("No {} boundary condition for grad({}), using zero flux", side, u);
                    Expr::scalar(0.0)
                }
            };
            parts.push(face);
            if side == Side::Left && n > 1 {
                let entries: Vec<(usize, usize, f64)> = (0..n - 1)
                    .flat_map(|i| {
                        let h = 1.0 / (nodes[i + 1] - nodes[i]);
                        [(i, i, -h), (i, i + 1, h)]
                    })
                    .collect();
                parts.push(Expr::matmul(&sparse(n - 1, n, &entries), u));
            }
        }
        Ok(Expr::concatenate(parts))
    }

    fn divergence(&self, submesh: &Submesh1D, flux: &Expr) -> SpatialResult<Expr> {
        let n = submesh.npts();
        check_len("div", flux, n + 1)?;
        let e = submesh.edges();
        let mut entries = Vec::with_capacity(2 * n);
        for i in 0..n {
            let (a, b) = (e[i], e[i + 1]);
            let (wl, wr, volume) = match submesh.coord_sys() {
                CoordinateSystem::Cartesian => (1.0, 1.0, b - a),
                CoordinateSystem::Cylindrical => (a, b, 0.5 * (b * b - a * a)),
                CoordinateSystem::Spherical => (a * a, b * b, (b.powi(3) - a.powi(3)) / 3.0),
            };
            entries.push((i, i, -wl / volume));
            entries.push((i, i + 1, wr / volume));
        }
        Ok(Expr::matmul(&sparse(n, n + 1, &entries), flux))
    }

    fn integral(&self, submesh: &Submesh1D, u: &Expr) -> SpatialResult<Expr> {
        let n = submesh.npts();
        check_len("integral", u, n)?;
        let e = submesh.edges();
        let pi = std::f64::consts::PI;
        let entries: Vec<(usize, usize, f64)> = (0..n)
            .map(|i| {
                let (a, b) = (e[i], e[i + 1]);
                let weight = match submesh.coord_sys() {
                    CoordinateSystem::Cartesian => b - a,
                    CoordinateSystem::Cylindrical => pi * (b * b - a * a),
                    CoordinateSystem::Spherical => 4.0 * pi / 3.0 * (b.powi(3) - a.powi(3)),
                };
                (0, i, weight)
            })
            .collect();
        Ok(Expr::matmul(&sparse(1, n, &entries), u))
    }

    fn boundary_value(
        &self,
        submesh: &Submesh1D,
        u: &Expr,
        side: Side,
        bcs: Option<&BoundaryConditions>,
    ) -> SpatialResult<Expr> {
        let n = submesh.npts();
        check_len("boundary_value", u, n)?;
        let cell = match side {
            Side::Left => 0,
            Side::Right => n - 1,
        };
        match bcs.and_then(|b| b.get(&side)) {
            Some(BoundaryCondition::Dirichlet(v)) => Ok(v.clone()),
            Some(condition) => {
                let u_i = select(u, n, cell);
                let ghost = ghost_value(&u_i, condition, half_cell(submesh, side), side)?;
                Ok(0.5 * (u_i + ghost))
            }
            None if n == 1 => Ok(select(u, n, 0)),
            None => {
                // Linear extrapolation from the two nearest centres
                let (nodes, edges) = (submesh.nodes(), submesh.edges());
                let (i, j, x_b) = match side {
                    Side::Left => (0, 1, edges[0]),
                    Side::Right => (n - 1, n - 2, edges[n]),
                };
                let s = (x_b - nodes[i]) / (nodes[j] - nodes[i]);
                Ok(Expr::matmul(&sparse(1, n, &[(0, i, 1.0 - s), (0, j, s)]), u))
            }
        }
    }

    fn broadcast(&self, submesh: &Submesh1D, value: &Expr) -> SpatialResult<Expr> {
        if !value.shape()?.is_scalar() {
            return Err(SpatialError::Length {
                op: "broadcast",
                expected: 1,
                found: value.shape()?.len().unwrap_or(0),
            });
        }
        Ok(Expr::vector(vec![1.0; submesh.npts()]) * value)
    }

    fn face_average(&self, submesh: &Submesh1D, u: &Expr) -> SpatialResult<Expr> {
        let n = submesh.npts();
        check_len("face_average", u, n)?;
        let (nodes, edges) = (submesh.nodes(), submesh.edges());
        let weights =
            (0..n - 1).map(|i| (edges[i + 1] - nodes[i]) / (nodes[i + 1] - nodes[i])).collect();
        Ok(Expr::face_harmonic_mean(u, weights))
    }
}
