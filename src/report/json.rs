//! JSON rendering of an analysis run for external plotting tools.
//!
//! Non-finite numbers (e.g. missing standard errors) serialize as `null`.

use serde::Serialize;

use crate::app::pipeline::AnalysisRun;
use crate::domain::{CurveParameters, FitResult, MixedFitResult};
use crate::error::AppError;
use crate::report::Evaluation;

#[derive(Debug, Serialize)]
pub struct RunExport<'a> {
    pub generated_at: String,
    pub source: &'a str,
    pub n_obs: usize,
    pub n_train: usize,
    pub n_test: usize,
    pub fits: Vec<FitExport<'a>>,
    pub group_fits: Vec<GroupFitExport<'a>>,
    pub mixed: MixedExport<'a>,
    pub grid: &'a [f64],
}

#[derive(Debug, Serialize)]
pub struct FitExport<'a> {
    pub label: &'static str,
    pub fit: &'a FitResult,
    pub evaluation: Evaluation,
    pub curve: Vec<f64>,
}

#[derive(Debug, Serialize)]
pub struct GroupFitExport<'a> {
    pub group: &'a str,
    pub params: Option<&'a CurveParameters>,
    pub sigma: Option<f64>,
    pub error: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct MixedExport<'a> {
    pub fit: &'a MixedFitResult,
    pub evaluation: Evaluation,
    pub mean_random_effect: f64,
    pub population_curve: Vec<f64>,
    pub group_curves: Vec<GroupCurve<'a>>,
}

#[derive(Debug, Serialize)]
pub struct GroupCurve<'a> {
    pub group: &'a str,
    pub y: Vec<f64>,
}

/// Build the serializable view of a run.
pub fn build_export(run: &AnalysisRun) -> RunExport<'_> {
    let grid = run.grid.as_slice();

    let fits = vec![
        FitExport {
            label: "tanh",
            fit: &run.tanh,
            evaluation: run.tanh_eval,
            curve: run.tanh.predict(grid),
        },
        FitExport {
            label: "logistic",
            fit: &run.logistic,
            evaluation: run.logistic_eval,
            curve: run.logistic.predict(grid),
        },
    ];

    let group_fits = run
        .group_fits
        .iter()
        .map(|(group, result)| match result {
            Ok(fit) => GroupFitExport {
                group,
                params: Some(&fit.params),
                sigma: Some(fit.sigma),
                error: None,
            },
            Err(e) => GroupFitExport {
                group,
                params: None,
                sigma: None,
                error: Some(e.to_string()),
            },
        })
        .collect();

    let group_curves = run
        .mixed
        .random_effects
        .iter()
        .filter_map(|re| {
            run.mixed.predict_group(&re.group, grid).map(|y| GroupCurve {
                group: &re.group,
                y,
            })
        })
        .collect();

    RunExport {
        generated_at: run.generated_at.to_rfc3339(),
        source: &run.source,
        n_obs: run.dataset.len(),
        n_train: run.split.train.len(),
        n_test: run.split.test.len(),
        fits,
        group_fits,
        mixed: MixedExport {
            fit: &run.mixed,
            evaluation: run.mixed_eval,
            mean_random_effect: run.mixed.mean_random_effect(),
            population_curve: run.mixed.predict_population(grid),
            group_curves,
        },
        grid,
    }
}

/// Pretty-printed JSON for a run.
pub fn render_json(run: &AnalysisRun) -> Result<String, AppError> {
    serde_json::to_string_pretty(&build_export(run))
        .map_err(|e| AppError::new(4, format!("Failed to serialize results: {e}")))
}
