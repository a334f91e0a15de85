//! Forward-mode Jacobians using `num-dual`.
//!
//! Residuals are written once, generically over [`DualNum<f64>`](num_dual::DualNum), and
//! differentiated column by column: each pass seeds one variable with a unit
//! derivative and reads the `eps` part of every residual.
//!
//! # Example
//!
//! ```ignore
//! use symdae::autodiff::*;
//! use num_dual::Dual64;
//!
//! // f(x, y) = [x^2, xy]
//! let f = |v: &[Dual64]| Ok::<_, ()>(vec![v[0] * v[0], v[0] * v[1]]);
//! let jac = compute_jacobian(f, &[2.0, 3.0])?;
//! ```

use nalgebra::DMatrix;
use nalgebra_sparse::{CooMatrix, CsrMatrix};
use num_dual::Dual64;

/// Jacobian `dF/dx`, stored column by column as it is computed.
#[derive(Debug, Clone, PartialEq)]
pub struct Jacobian {
    rows: usize,
    columns: Vec<Vec<f64>>,
}

impl Jacobian {
    pub fn nrows(&self) -> usize {
        self.rows
    }

    pub fn ncols(&self) -> usize {
        self.columns.len()
    }

    /// Derivative of residual `i` with respect to the `j`-th differentiated variable.
    pub fn entry(&self, i: usize, j: usize) -> f64 {
        self.columns[j][i]
    }

    pub fn to_dmatrix(&self) -> DMatrix<f64> {
        DMatrix::from_fn(self.rows, self.ncols(), |i, j| self.columns[j][i])
    }

    /// Sparse copy holding only the structurally non-zero entries.
    pub fn to_csr(&self) -> CsrMatrix<f64> {
        let mut coo = CooMatrix::new(self.rows, self.ncols());
        for (j, column) in self.columns.iter().enumerate() {
            for (i, &v) in column.iter().enumerate().filter(|(_, v)| **v != 0.0) {
                coo.push(i, j, v);
            }
        }
        CsrMatrix::from(&coo)
    }
}

/// Computes the full Jacobian of `f` at `x`.
pub fn compute_jacobian<F, E>(f: F, x: &[f64]) -> Result<Jacobian, E>
where
    F: Fn(&[Dual64]) -> Result<Vec<Dual64>, E>,
{
    let all: Vec<usize> = (0..x.len()).collect();
    compute_jacobian_columns(f, x, &all)
}

/// Computes the columns `columns` of the Jacobian of `f` at `x`.
///
/// Column `k` of the result is the derivative with respect to `x[columns[k]]`.
pub fn compute_jacobian_columns<F, E>(f: F, x: &[f64], columns: &[usize]) -> Result<Jacobian, E>
where
    F: Fn(&[Dual64]) -> Result<Vec<Dual64>, E>,
{
    let mut seeded: Vec<Dual64> = x.iter().copied().map(Dual64::from).collect();

    let derivatives = columns
        .iter()
        .map(|&j| {
            seeded[j].eps = 1.0;
            let residuals = f(&seeded);
            seeded[j].eps = 0.0;
            residuals.map(|r| r.iter().map(|v| v.eps).collect::<Vec<f64>>())
        })
        .collect::<Result<Vec<_>, E>>()?;

    let rows = match derivatives.first() {
        Some(column) => column.len(),
        // Nothing to differentiate; evaluate once for the residual count
        None => f(&seeded)?.len(),
    };
    Ok(Jacobian { rows, columns: derivatives })
}
