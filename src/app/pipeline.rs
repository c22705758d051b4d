//! The analysis pipeline shared by the text and JSON front-ends.
//!
//! load/simulate -> split -> single-curve fits -> held-out evaluation
//! -> per-run fits -> mixed model -> mixed evaluation
//!
//! Rendering is left to `report`; this module only computes.

use chrono::{DateTime, Utc};
use log::info;

use crate::data::{generate_sample, split};
use crate::domain::{
    AnalysisConfig, CurveModel, CurveParameters, DataSource, Dataset, FitResult, MixedFitResult,
    Split, by_run,
};
use crate::error::AppError;
use crate::fit::{GroupFits, MixedOptions, fit, fit_mixed, fit_per_group};
use crate::io::load_dataset;
use crate::report::{Evaluation, evaluate, evaluate_mixed, prediction_grid};

/// All computed outputs of a single analysis run.
#[derive(Debug, Clone)]
pub struct AnalysisRun {
    /// Human-readable description of where the data came from.
    pub source: String,
    pub dataset: Dataset,
    pub skipped_rows: usize,
    /// Simulated per-run offsets, when the data is synthetic.
    pub true_effects: Option<Vec<f64>>,
    pub split: Split,
    pub tanh: FitResult,
    pub logistic: FitResult,
    pub tanh_eval: Evaluation,
    pub logistic_eval: Evaluation,
    /// Logistic fits per run on the training half.
    pub group_fits: GroupFits,
    pub mixed: MixedFitResult,
    pub mixed_eval: Evaluation,
    /// Concentrations spanning the data, for plotting the fitted curves.
    pub grid: Vec<f64>,
    pub generated_at: DateTime<Utc>,
}

/// Execute the full pipeline and return the computed outputs.
pub fn run_analysis(config: &AnalysisConfig) -> Result<AnalysisRun, AppError> {
    // 1) Load or simulate the assay table.
    let (source, dataset, skipped_rows, true_effects) = match &config.source {
        DataSource::Csv(path) => {
            let ingest = load_dataset(path)?;
            (
                format!("csv {}", path.display()),
                ingest.dataset,
                ingest.row_errors.len(),
                None,
            )
        }
        DataSource::Simulated(spec) => {
            let sample = generate_sample(spec)?;
            (
                format!(
                    "simulated ({} runs, seed {}, effect sd {}, noise sd {})",
                    spec.runs, spec.seed, spec.effect_sd, spec.noise_sd
                ),
                sample.dataset,
                0,
                Some(sample.effects),
            )
        }
    };
    info!("dataset: {} rows from {source}", dataset.len());

    // 2) Alternate rows into training and held-out halves.
    let split = split(&dataset);
    info!("split: {} train / {} test", split.train.len(), split.test.len());

    // 3) Population curves on the training half.
    let xs = split.train.concentrations();
    let ys = split.train.densities();
    let tanh_start = start_or_guess(config.tanh_start, CurveModel::Tanh, &xs, &ys);
    let logistic_start = start_or_guess(config.logistic_start, CurveModel::Logistic, &xs, &ys);

    let tanh = fit(CurveModel::Tanh, &tanh_start, &split.train)?;
    let logistic = fit(CurveModel::Logistic, &logistic_start, &split.train)?;

    // 4) Held-out accuracy.
    let tanh_eval = evaluate(&tanh, &split.test);
    let logistic_eval = evaluate(&logistic, &split.test);

    // 5) Independent logistic curve per run, started from the population fit.
    let group_fits = fit_per_group(CurveModel::Logistic, &logistic.params, &split.train, by_run);
    info!(
        "per-run fits: {} succeeded, {} failed",
        group_fits.succeeded(),
        group_fits.failed()
    );

    // 6) Mixed model with a per-run asymptote offset.
    let options = MixedOptions::default().with_quadrature(config.quadrature);
    let mixed = fit_mixed(
        CurveModel::Logistic,
        &logistic.params,
        &split.train,
        by_run,
        &options,
    )?;
    let mixed_eval = evaluate_mixed(&mixed, &split.train, &split.test);

    // 7) Prediction grid for downstream plotting.
    let grid = dataset
        .conc_range()
        .map(|range| prediction_grid(range, config.grid_points))
        .unwrap_or_default();

    Ok(AnalysisRun {
        source,
        dataset,
        skipped_rows,
        true_effects,
        split,
        tanh,
        logistic,
        tanh_eval,
        logistic_eval,
        group_fits,
        mixed,
        mixed_eval,
        grid,
        generated_at: Utc::now(),
    })
}

fn start_or_guess(
    start: Option<CurveParameters>,
    model: CurveModel,
    xs: &[f64],
    ys: &[f64],
) -> CurveParameters {
    start.unwrap_or_else(|| {
        let guess = model.initial_guess(xs, ys);
        info!("self-starting {} fit from {:?}", model.display_name(), guess.values);
        guess
    })
}
