//! Kronecker-diagonal helpers for variance propagation.
//!
//! The sampling covariance of a bilinear coefficient estimate factors as a
//! Kronecker product of a row-side and a column-side covariance. Only its
//! diagonal is ever needed, so these helpers compute it directly instead of
//! materializing the full product.
use ndarray::{Array1, Array2, Axis};

/// Diagonal of the Kronecker product `A (x) B`, reshaped to an
/// `a x b` matrix: entry `[i, j] = A[i, i] * B[j, j]`.
///
/// Computed as the outer product of the two diagonals, which is exactly the
/// diagonal of the materialized product (the same scalar multiplications,
/// no reassociation), in O(a*b) instead of O(a^2 * b^2).
pub fn kron_diag(a: &Array2<f64>, b: &Array2<f64>) -> Array2<f64> {
    debug_assert_eq!(a.nrows(), a.ncols());
    debug_assert_eq!(b.nrows(), b.ncols());
    Array2::from_shape_fn((a.nrows(), b.nrows()), |(i, j)| a[[i, i]] * b[[j, j]])
}

/// Diagonal of the quadratic form `C M C'` without forming the full
/// product: entry `i` is `row_i(C) . M . row_i(C)`.
pub fn quad_diag(c: &Array2<f64>, m: &Array2<f64>) -> Array1<f64> {
    debug_assert_eq!(m.nrows(), m.ncols());
    debug_assert_eq!(c.ncols(), m.nrows());
    let cm = c.dot(m);
    (&cm * c).sum_axis(Axis(1))
}
