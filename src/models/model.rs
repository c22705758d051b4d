//! Curve evaluation for the tanh and logistic forms.
//!
//! The fitters rely on three primitive operations:
//! - evaluate `y(x)` given parameters (residuals, predictions)
//! - the closed-form parameter gradient `∂y/∂θ` (Jacobian rows)
//! - a self-starting guess from raw data
//!
//! These are implemented here for each curve form.

use crate::domain::{CurveModel, CurveParameters, N_PARAMS};
use crate::math::{fit_line, logistic, logit, sech2};

/// Inflation applied to the observed extreme when guessing the asymptote, so
/// every observation stays strictly inside the linearizable range.
const ASYMPTOTE_INFLATION: f64 = 1.05;

impl CurveModel {
    /// Evaluate `y(x)`.
    pub fn evaluate(self, params: &[f64; N_PARAMS], x: f64) -> f64 {
        match self {
            CurveModel::Tanh => {
                let [b1, b2, b3] = *params;
                b1 * (b2 * x + b3).tanh()
            }
            CurveModel::Logistic => {
                let [asym, xmid, scal] = *params;
                asym * logistic((x - xmid) / scal)
            }
        }
    }

    pub fn evaluate_many(self, params: &[f64; N_PARAMS], xs: &[f64]) -> Vec<f64> {
        xs.iter().map(|&x| self.evaluate(params, x)).collect()
    }

    /// Partial derivatives `∂y/∂θ_k` at `x`.
    pub fn gradient(self, params: &[f64; N_PARAMS], x: f64) -> [f64; N_PARAMS] {
        match self {
            CurveModel::Tanh => {
                let [b1, b2, b3] = *params;
                let z = b2 * x + b3;
                let d = b1 * sech2(z);
                [z.tanh(), d * x, d]
            }
            CurveModel::Logistic => {
                let [asym, xmid, scal] = *params;
                let t = (x - xmid) / scal;
                let s = logistic(t);
                // s·(1 − s) with the complement taken without cancellation.
                let slope = asym * s * logistic(-t);
                [s, -slope / scal, -slope * t / scal]
            }
        }
    }

    /// Limit of `y(x)` as `x → ∞`.
    pub fn asymptote(self, params: &[f64; N_PARAMS]) -> f64 {
        match self {
            CurveModel::Tanh => {
                let [b1, b2, _] = *params;
                if b2 > 0.0 {
                    b1
                } else if b2 < 0.0 {
                    -b1
                } else {
                    b1 * params[2].tanh()
                }
            }
            CurveModel::Logistic => {
                let [asym, _, scal] = *params;
                if scal > 0.0 { asym } else { 0.0 }
            }
        }
    }

    /// Self-starting parameter guess.
    ///
    /// The asymptote is pinned just beyond the most extreme response; the two
    /// remaining parameters come from a straight-line fit of the linearized
    /// curve (`logit(y/Asym)` or `atanh(y/b1)` against `x`). When fewer than
    /// two points survive the linearization a shape-only fallback is used.
    pub fn initial_guess(self, xs: &[f64], ys: &[f64]) -> CurveParameters {
        let pts: Vec<(f64, f64)> = xs
            .iter()
            .zip(ys.iter())
            .filter(|(x, y)| x.is_finite() && y.is_finite())
            .map(|(&x, &y)| (x, y))
            .collect();

        let (x_lo, x_hi) = pts
            .iter()
            .fold((f64::INFINITY, f64::NEG_INFINITY), |(lo, hi), &(x, _)| {
                (lo.min(x), hi.max(x))
            });
        let span = if x_hi > x_lo { x_hi - x_lo } else { 1.0 };
        let centre = if x_hi >= x_lo { 0.5 * (x_lo + x_hi) } else { 0.0 };

        match self {
            CurveModel::Logistic => {
                let y_max = pts.iter().fold(f64::NEG_INFINITY, |m, &(_, y)| m.max(y));
                let asym = if y_max > 0.0 { ASYMPTOTE_INFLATION * y_max } else { 1.0 };

                let (lx, lz): (Vec<f64>, Vec<f64>) = pts
                    .iter()
                    .filter(|&&(_, y)| y > 0.0 && y < asym)
                    .map(|&(x, y)| (x, logit(y / asym)))
                    .unzip();

                match fit_line(&lx, &lz) {
                    Some((a, b)) if b > 0.0 && (a / b).is_finite() => {
                        CurveParameters::logistic(asym, -a / b, 1.0 / b)
                    }
                    _ => CurveParameters::logistic(asym, centre, span / 4.0),
                }
            }
            CurveModel::Tanh => {
                let extreme = pts
                    .iter()
                    .map(|&(_, y)| y)
                    .fold(0.0_f64, |m, y| if y.abs() > m.abs() { y } else { m });
                let b1 = if extreme != 0.0 { ASYMPTOTE_INFLATION * extreme } else { 1.0 };

                let (lx, lz): (Vec<f64>, Vec<f64>) = pts
                    .iter()
                    .map(|&(x, y)| (x, y / b1))
                    .filter(|&(_, r)| r.abs() < 1.0)
                    .map(|(x, r)| (x, r.atanh()))
                    .unzip();

                match fit_line(&lx, &lz) {
                    Some((b3, b2)) if b2 > 0.0 => CurveParameters::tanh(b1, b2, b3),
                    _ => CurveParameters::tanh(b1, 2.0 / span, 0.0),
                }
            }
        }
    }
}

impl CurveParameters {
    pub fn evaluate(&self, x: f64) -> f64 {
        self.model.evaluate(&self.values, x)
    }

    pub fn evaluate_many(&self, xs: &[f64]) -> Vec<f64> {
        self.model.evaluate_many(&self.values, xs)
    }

    pub fn asymptote(&self) -> f64 {
        self.model.asymptote(&self.values)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn numeric_gradient(model: CurveModel, p: &[f64; N_PARAMS], x: f64) -> [f64; N_PARAMS] {
        let mut out = [0.0; N_PARAMS];
        for k in 0..N_PARAMS {
            let h = 1e-6 * p[k].abs().max(1.0);
            let mut hi = *p;
            let mut lo = *p;
            hi[k] += h;
            lo[k] -= h;
            out[k] = (model.evaluate(&hi, x) - model.evaluate(&lo, x)) / (2.0 * h);
        }
        out
    }

    #[test]
    fn logistic_is_strictly_increasing() {
        let p = [2.0, 2.0, 1.0];
        let mut prev = CurveModel::Logistic.evaluate(&p, 0.0);
        for i in 1..200 {
            let y = CurveModel::Logistic.evaluate(&p, i as f64 * 0.05);
            assert!(y > prev, "not increasing at step {i}");
            prev = y;
        }
    }

    #[test]
    fn logistic_saturates_at_asymptote() {
        let p = CurveParameters::logistic(2.0, 2.0, 1.0);
        assert!((p.evaluate(12.0) - 2.0).abs() < 1e-3);
        assert!(p.evaluate(-40.0).abs() < 1e-12);
        assert!((p.evaluate(2.0) - 1.0).abs() < 1e-12);
        assert_eq!(p.asymptote(), 2.0);
    }

    #[test]
    fn tanh_is_bounded_by_scale() {
        let p = CurveParameters::tanh(1.8, 0.6, 0.1);
        for i in 0..100 {
            assert!(p.evaluate(i as f64).abs() <= 1.8);
        }
        assert!((p.evaluate(50.0) - 1.8).abs() < 1e-9);
    }

    #[test]
    fn gradients_match_finite_differences() {
        let cases = [
            (CurveModel::Logistic, [2.3, 1.4, 0.9]),
            (CurveModel::Tanh, [2.1, 0.35, 0.05]),
        ];
        for (model, p) in cases {
            for &x in &[0.0, 0.5, 1.7, 4.0, 11.0] {
                let analytic = model.gradient(&p, x);
                let numeric = numeric_gradient(model, &p, x);
                for k in 0..N_PARAMS {
                    assert!(
                        (analytic[k] - numeric[k]).abs() < 1e-6,
                        "{} d/d{} at x={x}: {} vs {}",
                        model.display_name(),
                        model.param_names()[k],
                        analytic[k],
                        numeric[k]
                    );
                }
            }
        }
    }

    #[test]
    fn gradient_stays_finite_far_from_the_midpoint() {
        let g = CurveModel::Logistic.gradient(&[2.0, 1.0, 0.01], 500.0);
        assert!(g.iter().all(|v| v.is_finite()));
    }

    #[test]
    fn initial_guess_lands_near_truth_on_clean_data() {
        let truth = CurveParameters::logistic(3.0, 1.5, 0.8);
        let xs = [0.0, 0.5, 1.0, 1.5, 2.0, 3.0, 4.0, 8.0];
        let ys = truth.evaluate_many(&xs);
        let guess = CurveModel::Logistic.initial_guess(&xs, &ys);
        assert!((guess.values[0] - 3.0).abs() < 0.3);
        assert!(guess.values[2] > 0.0);
        assert!((guess.values[1] - 1.5).abs() < 1.0);
    }

    #[test]
    fn both_forms_agree_qualitatively() {
        let xs = [0.1, 0.5, 1.0, 2.0, 4.0, 8.0, 12.0];
        let ys = CurveParameters::logistic(2.0, 2.0, 1.0).evaluate_many(&xs);
        let tanh = CurveModel::Tanh.initial_guess(&xs, &ys);
        let logi = CurveModel::Logistic.initial_guess(&xs, &ys);
        assert!(tanh.asymptote() > 0.0 && logi.asymptote() > 0.0);
        assert!(tanh.evaluate(8.0) > tanh.evaluate(1.0));
        assert!(logi.evaluate(8.0) > logi.evaluate(1.0));
    }

    #[test]
    fn initial_guess_falls_back_without_usable_points() {
        let guess = CurveModel::Logistic.initial_guess(&[1.0], &[-2.0]);
        assert!(guess.is_finite());
        let guess = CurveModel::Tanh.initial_guess(&[], &[]);
        assert!(guess.is_finite());
    }
}
