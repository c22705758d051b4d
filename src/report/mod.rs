//! Reporting utilities: test-set evaluation, prediction grids, and rendered output.
//!
//! We keep this in one place so:
//! - the fitting code stays clean and testable
//! - output changes are localized

use log::warn;
use serde::Serialize;

use crate::domain::{CurveParameters, Dataset, FitResult, MixedFitResult};

pub mod format;
pub mod json;

pub use format::*;
pub use json::*;

/// Predictive accuracy of a fitted curve on held-out rows.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct Evaluation {
    pub n: usize,
    pub sse: f64,
    pub rmse: f64,
    pub mae: f64,
    /// `1 − SSE/SST`; `NaN` when the held-out densities have no spread.
    pub r_squared: f64,
    /// Held-out rows whose concentration lies outside the training range.
    pub extrapolated: usize,
}

/// Evaluate a single-curve fit on `test`, flagging points outside the range
/// of the data it was fitted on.
pub fn evaluate(fit: &FitResult, test: &Dataset) -> Evaluation {
    let range = fit.data.conc_range();
    score(test, range, |_| fit.params)
}

/// Evaluate a mixed fit on `test` using each row's group-level curve.
///
/// Rows from groups the model has not seen fall back to the population curve.
pub fn evaluate_mixed(fit: &MixedFitResult, train: &Dataset, test: &Dataset) -> Evaluation {
    score(test, train.conc_range(), |run| {
        fit.group_parameters(run).unwrap_or(fit.fixed)
    })
}

fn score<F>(test: &Dataset, range: Option<(f64, f64)>, curve_for: F) -> Evaluation
where
    F: Fn(&str) -> CurveParameters,
{
    let n = test.len();
    let mut sse = 0.0;
    let mut abs = 0.0;
    let mut extrapolated = 0usize;
    for obs in test {
        let r = obs.density - curve_for(&obs.run).evaluate(obs.conc);
        sse += r * r;
        abs += r.abs();
        if range.is_some_and(|(lo, hi)| obs.conc < lo || obs.conc > hi) {
            extrapolated += 1;
        }
    }

    if extrapolated > 0 {
        warn!("{extrapolated} of {n} evaluation points lie outside the training concentration range");
    }

    let mean = if n > 0 {
        test.iter().map(|o| o.density).sum::<f64>() / n as f64
    } else {
        f64::NAN
    };
    let sst: f64 = test.iter().map(|o| (o.density - mean).powi(2)).sum();
    let denom = n.max(1) as f64;

    Evaluation {
        n,
        sse,
        rmse: (sse / denom).sqrt(),
        mae: abs / denom,
        r_squared: if sst > 0.0 { 1.0 - sse / sst } else { f64::NAN },
        extrapolated,
    }
}

/// `points` evenly spaced concentrations spanning `range` (inclusive).
pub fn prediction_grid(range: (f64, f64), points: usize) -> Vec<f64> {
    let (lo, hi) = range;
    match points {
        0 => Vec::new(),
        1 => vec![lo],
        _ => {
            let step = (hi - lo) / (points - 1) as f64;
            (0..points).map(|i| lo + step * i as f64).collect()
        }
    }
}
