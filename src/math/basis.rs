//! Numerically stable building blocks for the saturating curves.
//!
//! - `logistic(t) = 1 / (1 + exp(-t))`
//! - `logit(p) = ln(p / (1 - p))`
//! - `sech2(z) = 1 - tanh(z)^2`
//!
//! Numerical notes:
//! - `logistic` branches on the sign of `t` so `exp` never overflows; the
//!   complementary value `1 - logistic(t)` is available as `logistic(-t)`
//!   without cancellation.
//! - `sech2` is computed from `exp(-2|z|)` rather than `1 - tanh^2`, which loses
//!   all precision once `tanh(z)` rounds to 1.

/// Standard logistic function.
pub fn logistic(t: f64) -> f64 {
    if t >= 0.0 {
        1.0 / (1.0 + (-t).exp())
    } else {
        let e = t.exp();
        e / (1.0 + e)
    }
}

/// Inverse of [`logistic`] for `p ∈ (0, 1)`.
pub fn logit(p: f64) -> f64 {
    (p / (1.0 - p)).ln()
}

/// `1 - tanh(z)^2`.
pub fn sech2(z: f64) -> f64 {
    let e = (-2.0 * z.abs()).exp();
    4.0 * e / ((1.0 + e) * (1.0 + e))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn logistic_is_symmetric_and_saturates() {
        for &t in &[-3.0, -0.5, 0.0, 0.7, 4.0] {
            assert!((logistic(t) + logistic(-t) - 1.0).abs() < 1e-15);
        }
        assert_eq!(logistic(-1000.0), 0.0);
        assert_eq!(logistic(1000.0), 1.0);
    }

    #[test]
    fn logit_inverts_logistic() {
        for &t in &[-5.0, -1.0, 0.0, 2.5] {
            assert!((logit(logistic(t)) - t).abs() < 1e-10);
        }
    }

    #[test]
    fn sech2_matches_tanh_identity() {
        for &z in &[-2.0_f64, -0.3, 0.0, 0.9, 3.0] {
            let direct = 1.0 - z.tanh().powi(2);
            assert!((sech2(z) - direct).abs() < 1e-12);
        }
        assert!(sech2(400.0) >= 0.0);
    }
}
