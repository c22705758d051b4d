//! Gauss–Hermite quadrature rules.
//!
//! Nodes and weights for `∫ f(z) exp(-z²) dz ≈ Σ w_k f(z_k)`, taken from
//! `gauss_quad::GaussHermite`. That crate starts at two nodes; the one-node
//! rule (the Laplace point `z = 0`, `w = √π`) is written out here.

use gauss_quad::GaussHermite;

use crate::error::FitError;

/// A quadrature rule, nodes in ascending order.
#[derive(Debug, Clone, PartialEq)]
pub struct HermiteRule {
    pub nodes: Vec<f64>,
    pub weights: Vec<f64>,
}

impl HermiteRule {
    /// Rule with `n` nodes; `n = 0` yields an empty rule.
    pub fn new(n: usize) -> Result<Self, FitError> {
        let mut pairs = match n {
            0 => Vec::new(),
            1 => vec![(0.0, std::f64::consts::PI.sqrt())],
            _ => GaussHermite::new(n)
                .map_err(|e| {
                    FitError::InvalidInput(format!("Gauss-Hermite rule with {n} nodes: {e:?}"))
                })?
                .into_node_weight_pairs(),
        };
        pairs.sort_by(|a, b| a.0.total_cmp(&b.0));

        Ok(Self {
            nodes: pairs.iter().map(|p| p.0).collect(),
            weights: pairs.iter().map(|p| p.1).collect(),
        })
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SQRT_PI: f64 = 1.772_453_850_905_516;

    fn integrate(rule: &HermiteRule, f: impl Fn(f64) -> f64) -> f64 {
        rule.nodes
            .iter()
            .zip(rule.weights.iter())
            .map(|(&z, &w)| w * f(z))
            .sum()
    }

    #[test]
    fn single_node_is_the_laplace_point() {
        let rule = HermiteRule::new(1).unwrap();
        assert_eq!(rule.len(), 1);
        assert!(rule.nodes[0].abs() < 1e-14);
        assert!((rule.weights[0] - SQRT_PI).abs() < 1e-12);
    }

    #[test]
    fn two_node_rule_matches_closed_form() {
        let rule = HermiteRule::new(2).unwrap();
        let z = std::f64::consts::FRAC_1_SQRT_2;
        assert!((rule.nodes[0] + z).abs() < 1e-12);
        assert!((rule.nodes[1] - z).abs() < 1e-12);
        assert!((rule.weights[0] - SQRT_PI / 2.0).abs() < 1e-12);
        assert!((rule.weights[1] - SQRT_PI / 2.0).abs() < 1e-12);
    }

    #[test]
    fn integrates_polynomials_up_to_degree_2n_minus_1() {
        // ∫ z^4 exp(-z²) dz = 3√π/4 ; ∫ z^5 exp(-z²) dz = 0
        let rule = HermiteRule::new(3).unwrap();
        assert!((integrate(&rule, |z| z.powi(4)) - 3.0 * SQRT_PI / 4.0).abs() < 1e-10);
        assert!(integrate(&rule, |z| z.powi(5)).abs() < 1e-10);

        // ∫ z^10 exp(-z²) dz = 945√π/32
        let rule = HermiteRule::new(7).unwrap();
        assert!((integrate(&rule, |z| z.powi(10)) - 945.0 * SQRT_PI / 32.0).abs() < 1e-8);
        assert!((rule.weights.iter().sum::<f64>() - SQRT_PI).abs() < 1e-12);
    }

    #[test]
    fn nodes_are_ascending_and_symmetric() {
        let rule = HermiteRule::new(6).unwrap();
        assert!(rule.nodes.windows(2).all(|w| w[0] < w[1]));
        for (lo, hi) in rule.nodes.iter().zip(rule.nodes.iter().rev()) {
            assert!((lo + hi).abs() < 1e-12);
        }
    }

    #[test]
    fn empty_rule_for_order_zero() {
        assert!(HermiteRule::new(0).unwrap().is_empty());
    }
}
