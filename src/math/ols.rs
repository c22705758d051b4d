//! Ordinary least squares solver.
//!
//! Used to linearize the curves for self-starting values: once the asymptote is
//! pinned, `logit(y / Asym)` (or `atanh(y / b1)`) is a straight line in `x`, so
//! the remaining two parameters come from a tiny regression.
//!
//! Implementation choices:
//! - SVD, so the tall (more rows than columns) case is handled directly.
//!   (Nalgebra's `QR::solve` is intended for square systems and will panic for
//!   non-square matrices.)
//! - Progressively looser tolerances before giving up on a near-singular design.

use nalgebra::{DMatrix, DVector};

/// Solve a least squares problem using SVD.
///
/// Returns `None` if the system is too ill-conditioned to solve robustly.
pub fn solve_least_squares(x: &DMatrix<f64>, y: &DVector<f64>) -> Option<DVector<f64>> {
    let svd = x.clone().svd(true, true);

    for &tol in &[1e-10, 1e-8, 1e-6] {
        if let Ok(beta) = svd.solve(y, tol) {
            if beta.iter().all(|v| v.is_finite()) {
                return Some(beta);
            }
        }
    }

    None
}

/// Fit `y = a + b·x`; returns `(a, b)`.
///
/// `None` with fewer than two points or when all `x` coincide.
pub fn fit_line(x: &[f64], y: &[f64]) -> Option<(f64, f64)> {
    let n = x.len().min(y.len());
    if n < 2 {
        return None;
    }
    let spread = x[..n].iter().fold(f64::NEG_INFINITY, |m, &v| m.max(v))
        - x[..n].iter().fold(f64::INFINITY, |m, &v| m.min(v));
    if !(spread > 1e-12) {
        return None;
    }
    let design = DMatrix::from_fn(n, 2, |i, j| if j == 0 { 1.0 } else { x[i] });
    let rhs = DVector::from_column_slice(&y[..n]);
    let beta = solve_least_squares(&design, &rhs)?;
    Some((beta[0], beta[1]))
}
