//! Shared domain types.
//!
//! These types are kept lightweight and serializable so they can be:
//!
//! - used in-memory during fitting
//! - handed to the reporting layer read-only
//! - rendered to JSON for an external plotting tool

use std::collections::HashMap;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// Number of free parameters in every supported curve form.
pub const N_PARAMS: usize = 3;

/// One optical-density reading.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Observation {
    /// Experimental run (categorical group label).
    pub run: String,
    /// Protein concentration (`>= 0`).
    pub conc: f64,
    /// Measured optical density.
    pub density: f64,
}

impl Observation {
    pub fn new(run: impl Into<String>, conc: f64, density: f64) -> Self {
        Self {
            run: run.into(),
            conc,
            density,
        }
    }
}

/// Group key used throughout the pipeline: the experimental run.
pub fn by_run(obs: &Observation) -> &str {
    &obs.run
}

/// Ordered, immutable sequence of observations.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Dataset {
    rows: Vec<Observation>,
}

impl Dataset {
    pub fn new(rows: Vec<Observation>) -> Self {
        Self { rows }
    }

    pub fn rows(&self) -> &[Observation] {
        &self.rows
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn iter(&self) -> std::slice::Iter<'_, Observation> {
        self.rows.iter()
    }

    pub fn concentrations(&self) -> Vec<f64> {
        self.rows.iter().map(|o| o.conc).collect()
    }

    pub fn densities(&self) -> Vec<f64> {
        self.rows.iter().map(|o| o.density).collect()
    }

    /// `(min, max)` concentration, or `None` for an empty dataset.
    pub fn conc_range(&self) -> Option<(f64, f64)> {
        let mut it = self.rows.iter().map(|o| o.conc);
        let first = it.next()?;
        Some(it.fold((first, first), |(lo, hi), c| (lo.min(c), hi.max(c))))
    }

    /// Census of `(run, conc)` group sizes.
    ///
    /// A well-formed assay table has every concentration measured twice per run,
    /// with at most one unpaired row overall.
    pub fn pairing(&self) -> PairingCensus {
        let mut counts: HashMap<(&str, u64), usize> = HashMap::new();
        for o in &self.rows {
            *counts.entry((o.run.as_str(), o.conc.to_bits())).or_default() += 1;
        }
        let mut census = PairingCensus::default();
        for n in counts.into_values() {
            match n {
                1 => census.singles += 1,
                2 => census.pairs += 1,
                _ => census.oversized += 1,
            }
        }
        census
    }
}

impl<'a> IntoIterator for &'a Dataset {
    type Item = &'a Observation;
    type IntoIter = std::slice::Iter<'a, Observation>;

    fn into_iter(self) -> Self::IntoIter {
        self.rows.iter()
    }
}

impl FromIterator<Observation> for Dataset {
    fn from_iter<T: IntoIterator<Item = Observation>>(iter: T) -> Self {
        Self::new(iter.into_iter().collect())
    }
}

/// Group-size census produced by [`Dataset::pairing`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PairingCensus {
    pub pairs: usize,
    pub singles: usize,
    pub oversized: usize,
}

impl PairingCensus {
    pub fn is_well_formed(&self) -> bool {
        self.oversized == 0 && self.singles <= 1
    }
}

/// Train/test partition of a dataset.
#[derive(Debug, Clone, PartialEq)]
pub struct Split {
    pub train: Dataset,
    pub test: Dataset,
}

/// Curve parametrization.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CurveModel {
    /// `b1 · tanh(b2·x + b3)`
    Tanh,
    /// `Asym / (1 + exp((xmid − x)/scal))`
    Logistic,
}

impl CurveModel {
    pub fn display_name(self) -> &'static str {
        match self {
            CurveModel::Tanh => "tanh",
            CurveModel::Logistic => "logistic",
        }
    }

    pub fn param_names(self) -> [&'static str; N_PARAMS] {
        match self {
            CurveModel::Tanh => ["b1", "b2", "b3"],
            CurveModel::Logistic => ["Asym", "xmid", "scal"],
        }
    }

    /// Position of a parameter by name.
    pub fn param_index(self, name: &str) -> Option<usize> {
        self.param_names().iter().position(|n| *n == name)
    }

    /// Position of the parameter that sets the saturation level.
    pub fn asymptote_index(self) -> usize {
        0
    }
}

/// Named parameter triple tagged with its curve form.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CurveParameters {
    pub model: CurveModel,
    pub values: [f64; N_PARAMS],
}

impl CurveParameters {
    pub fn new(model: CurveModel, values: [f64; N_PARAMS]) -> Self {
        Self { model, values }
    }

    pub fn tanh(b1: f64, b2: f64, b3: f64) -> Self {
        Self::new(CurveModel::Tanh, [b1, b2, b3])
    }

    pub fn logistic(asym: f64, xmid: f64, scal: f64) -> Self {
        Self::new(CurveModel::Logistic, [asym, xmid, scal])
    }

    /// Build from a slice; `None` if the length is not [`N_PARAMS`].
    pub fn from_slice(model: CurveModel, values: &[f64]) -> Option<Self> {
        let values: [f64; N_PARAMS] = values.try_into().ok()?;
        Some(Self::new(model, values))
    }

    pub fn get(&self, name: &str) -> Option<f64> {
        self.model.param_index(name).map(|i| self.values[i])
    }

    pub fn named(&self) -> [(&'static str, f64); N_PARAMS] {
        let names = self.model.param_names();
        [
            (names[0], self.values[0]),
            (names[1], self.values[1]),
            (names[2], self.values[2]),
        ]
    }

    pub fn is_finite(&self) -> bool {
        self.values.iter().all(|v| v.is_finite())
    }
}

/// Output of a single nonlinear least-squares fit.
#[derive(Debug, Clone, Serialize)]
pub struct FitResult {
    pub params: CurveParameters,
    /// Asymptotic standard errors, `NaN` when there are no residual degrees of freedom.
    pub std_errors: [f64; N_PARAMS],
    /// Residual standard error `sqrt(SSE / df)`.
    pub sigma: f64,
    pub df: usize,
    pub sse: f64,
    pub n_obs: usize,
    pub evaluations: usize,
    /// The subset the curve was fitted on.
    #[serde(skip)]
    pub data: Dataset,
}

/// Per-group offset on the random-effect parameter.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RandomEffectEstimate {
    pub group: String,
    /// Stable index assigned by the group mapping of the fit call.
    pub index: usize,
    pub value: f64,
    /// Shared residual scale used as the error bar (same for every group).
    pub band: f64,
}

/// Output of a nonlinear mixed-effects fit.
#[derive(Debug, Clone, Serialize)]
pub struct MixedFitResult {
    pub fixed: CurveParameters,
    pub fixed_std_errors: [f64; N_PARAMS],
    /// Name of the parameter carrying the random effect.
    pub effect_on: &'static str,
    pub random_effects: Vec<RandomEffectEstimate>,
    /// Standard deviation of the random effect.
    pub tau: f64,
    /// Residual standard deviation.
    pub sigma: f64,
    pub log_likelihood: f64,
    pub aic: f64,
    pub bic: f64,
    pub quadrature: QuadratureOrder,
    pub converged: bool,
    pub message: String,
    /// `true` when `tau` collapsed to (numerically) zero.
    pub boundary: bool,
    pub iterations: u64,
    pub n_obs: usize,
}

/// Accuracy/speed knob for the marginal-likelihood approximation.
///
/// - `0`: fast mode, fixed and random effects solved jointly by penalized least squares
/// - `1`: Laplace approximation
/// - `n > 1`: adaptive Gauss–Hermite quadrature with `n` nodes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct QuadratureOrder(pub usize);

impl QuadratureOrder {
    pub const FAST: QuadratureOrder = QuadratureOrder(0);
    pub const LAPLACE: QuadratureOrder = QuadratureOrder(1);

    pub fn nodes(self) -> usize {
        self.0
    }

    pub fn label(self) -> String {
        match self.0 {
            0 => "penalized least squares (order 0)".to_string(),
            1 => "Laplace (order 1)".to_string(),
            n => format!("adaptive Gauss-Hermite (order {n})"),
        }
    }
}

impl Default for QuadratureOrder {
    fn default() -> Self {
        QuadratureOrder::LAPLACE
    }
}

/// Parameters of the synthetic assay generator.
#[derive(Debug, Clone)]
pub struct SimulationSpec {
    pub runs: usize,
    pub concentrations: Vec<f64>,
    /// Replicates per `(run, conc)` cell.
    pub replicates: usize,
    /// Population curve.
    pub truth: CurveParameters,
    /// Standard deviation of the per-run offset on the asymptote.
    pub effect_sd: f64,
    pub noise_sd: f64,
    /// Shift the drawn run offsets so they sum to exactly zero.
    pub center_effects: bool,
    pub seed: u64,
}

impl Default for SimulationSpec {
    fn default() -> Self {
        Self {
            runs: 11,
            concentrations: vec![
                0.048_828_12,
                0.195_312_5,
                0.390_625,
                0.781_25,
                1.562_5,
                3.125,
                6.25,
                12.5,
            ],
            replicates: 2,
            truth: CurveParameters::logistic(2.0, 3.0, 2.0),
            effect_sd: 0.1,
            noise_sd: 0.02,
            center_effects: false,
            seed: 42,
        }
    }
}

/// Where the analysis reads its table from.
#[derive(Debug, Clone)]
pub enum DataSource {
    Csv(PathBuf),
    Simulated(SimulationSpec),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputFormat {
    Text,
    Json,
}

/// A full run's configuration as understood by the pipeline.
///
/// Derived from environment variables (plus defaults).
#[derive(Debug, Clone)]
pub struct AnalysisConfig {
    pub source: DataSource,
    /// Starting values for the tanh fit; `None` means self-start from the training data.
    pub tanh_start: Option<CurveParameters>,
    /// Starting values for the logistic fits; `None` means self-start.
    pub logistic_start: Option<CurveParameters>,
    pub quadrature: QuadratureOrder,
    /// Number of points in the prediction grids handed to the reporting layer.
    pub grid_points: usize,
    pub output: OutputFormat,
}

impl Default for AnalysisConfig {
    fn default() -> Self {
        Self {
            source: DataSource::Simulated(SimulationSpec::default()),
            tanh_start: None,
            logistic_start: None,
            quadrature: QuadratureOrder::default(),
            grid_points: 50,
            output: OutputFormat::Text,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pairing_census_counts_duplicates() {
        let data: Dataset = vec![
            Observation::new("1", 0.5, 0.1),
            Observation::new("1", 0.5, 0.11),
            Observation::new("1", 1.0, 0.2),
            Observation::new("1", 1.0, 0.21),
            Observation::new("2", 0.5, 0.12),
        ]
        .into_iter()
        .collect();
        let census = data.pairing();
        assert_eq!(census.pairs, 2);
        assert_eq!(census.singles, 1);
        assert!(census.is_well_formed());
    }

    #[test]
    fn parameters_are_addressable_by_name() {
        let p = CurveParameters::logistic(2.0, 1.5, 0.8);
        assert_eq!(p.get("xmid"), Some(1.5));
        assert_eq!(p.get("b1"), None);
        assert_eq!(CurveModel::Tanh.param_index("b3"), Some(2));
        assert!(CurveParameters::from_slice(CurveModel::Tanh, &[1.0, 2.0]).is_none());
    }

    #[test]
    fn conc_range_covers_all_rows() {
        let data: Dataset = [0.4, 0.1, 3.0]
            .iter()
            .map(|&c| Observation::new("a", c, 1.0))
            .collect();
        assert_eq!(data.conc_range(), Some((0.1, 3.0)));
        assert_eq!(Dataset::default().conc_range(), None);
    }
}
