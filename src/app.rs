//! Top-level application orchestration.
//!
//! `src/main.rs` is intentionally tiny; this module is the "real main" that:
//! - reads configuration from the environment (and `.env`)
//! - runs the analysis pipeline
//! - prints the text or JSON report

use std::path::PathBuf;
use std::str::FromStr;

use log::info;

use crate::domain::{
    AnalysisConfig, CurveModel, CurveParameters, DataSource, OutputFormat, QuadratureOrder,
    SimulationSpec,
};
use crate::error::AppError;

pub mod pipeline;

/// Entry point for the `assay` binary.
pub fn run() -> Result<(), AppError> {
    let config = AnalysisConfig::from_env()?;
    let run = pipeline::run_analysis(&config)?;

    match config.output {
        OutputFormat::Text => println!("{}", crate::report::format_report(&run)),
        OutputFormat::Json => println!("{}", crate::report::render_json(&run)?),
    }

    info!("done");
    Ok(())
}

impl AnalysisConfig {
    /// Build the run configuration from `ASSAY_*` environment variables,
    /// loading a `.env` file first when one exists.
    pub fn from_env() -> Result<Self, AppError> {
        dotenvy::dotenv().ok();
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Same as [`AnalysisConfig::from_env`] over an arbitrary key lookup.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, AppError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| {
            lookup(key)
                .map(|v| v.trim().to_string())
                .filter(|v| !v.is_empty())
        };

        let source = match get("ASSAY_DATA") {
            Some(path) => DataSource::Csv(PathBuf::from(path)),
            None => {
                let defaults = SimulationSpec::default();
                DataSource::Simulated(SimulationSpec {
                    seed: parse_or(get("ASSAY_SEED"), "ASSAY_SEED", defaults.seed)?,
                    runs: parse_or(get("ASSAY_RUNS"), "ASSAY_RUNS", defaults.runs)?,
                    noise_sd: parse_or(get("ASSAY_NOISE_SD"), "ASSAY_NOISE_SD", defaults.noise_sd)?,
                    effect_sd: parse_or(get("ASSAY_EFFECT_SD"), "ASSAY_EFFECT_SD", defaults.effect_sd)?,
                    ..defaults
                })
            }
        };

        let defaults = AnalysisConfig::default();
        let output = match get("ASSAY_OUTPUT").map(|v| v.to_ascii_lowercase()) {
            None => defaults.output,
            Some(v) if v == "text" => OutputFormat::Text,
            Some(v) if v == "json" => OutputFormat::Json,
            Some(v) => {
                return Err(AppError::new(
                    2,
                    format!("ASSAY_OUTPUT must be 'text' or 'json', got '{v}'."),
                ));
            }
        };

        let config = AnalysisConfig {
            source,
            tanh_start: parse_start(get("ASSAY_TANH_START"), "ASSAY_TANH_START", CurveModel::Tanh)?,
            logistic_start: parse_start(
                get("ASSAY_LOGISTIC_START"),
                "ASSAY_LOGISTIC_START",
                CurveModel::Logistic,
            )?,
            quadrature: QuadratureOrder(parse_or(
                get("ASSAY_QUADRATURE"),
                "ASSAY_QUADRATURE",
                defaults.quadrature.nodes(),
            )?),
            grid_points: parse_or(get("ASSAY_GRID"), "ASSAY_GRID", defaults.grid_points)?,
            output,
        };

        if let DataSource::Simulated(spec) = &config.source {
            if !(spec.noise_sd >= 0.0 && spec.effect_sd >= 0.0) {
                return Err(AppError::new(2, "Simulation standard deviations must be >= 0."));
            }
        }

        Ok(config)
    }
}

fn parse_or<T: FromStr>(raw: Option<String>, key: &str, default: T) -> Result<T, AppError> {
    match raw {
        None => Ok(default),
        Some(v) => v
            .parse()
            .map_err(|_| AppError::new(2, format!("Invalid value for {key}: '{v}'."))),
    }
}

/// Parse `"a,b,c"` into starting values for `model`.
fn parse_start(
    raw: Option<String>,
    key: &str,
    model: CurveModel,
) -> Result<Option<CurveParameters>, AppError> {
    let Some(raw) = raw else {
        return Ok(None);
    };
    let values = raw
        .split(',')
        .map(|s| s.trim().parse::<f64>())
        .collect::<Result<Vec<f64>, _>>()
        .map_err(|_| AppError::new(2, format!("Invalid number in {key}: '{raw}'.")))?;
    let params = CurveParameters::from_slice(model, &values).ok_or_else(|| {
        AppError::new(
            2,
            format!(
                "{key} needs {} comma-separated values ({}), got {}.",
                model.param_names().len(),
                model.param_names().join(", "),
                values.len()
            ),
        )
    })?;
    if !params.is_finite() {
        return Err(AppError::new(2, format!("{key} values must be finite.")));
    }
    Ok(Some(params))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn config(pairs: &[(&str, &str)]) -> Result<AnalysisConfig, AppError> {
        let env: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        AnalysisConfig::from_lookup(|key| env.get(key).cloned())
    }

    #[test]
    fn empty_environment_uses_defaults() {
        let c = config(&[]).unwrap();
        assert!(matches!(c.source, DataSource::Simulated(ref s) if s.runs == 11 && s.seed == 42));
        assert_eq!(c.quadrature, QuadratureOrder::LAPLACE);
        assert_eq!(c.output, OutputFormat::Text);
        assert!(c.tanh_start.is_none());
        assert_eq!(c.grid_points, 50);
    }

    #[test]
    fn reads_every_key() {
        let c = config(&[
            ("ASSAY_SEED", "7"),
            ("ASSAY_RUNS", "5"),
            ("ASSAY_NOISE_SD", "0.05"),
            ("ASSAY_EFFECT_SD", "0.2"),
            ("ASSAY_QUADRATURE", "0"),
            ("ASSAY_TANH_START", "2, 0.3, 0"),
            ("ASSAY_LOGISTIC_START", "2,3,2"),
            ("ASSAY_GRID", "10"),
            ("ASSAY_OUTPUT", "JSON"),
        ])
        .unwrap();
        let DataSource::Simulated(spec) = &c.source else {
            panic!("expected simulated source");
        };
        assert_eq!((spec.seed, spec.runs), (7, 5));
        assert_eq!(spec.noise_sd, 0.05);
        assert_eq!(c.quadrature, QuadratureOrder::FAST);
        assert_eq!(c.tanh_start, Some(CurveParameters::tanh(2.0, 0.3, 0.0)));
        assert_eq!(c.logistic_start, Some(CurveParameters::logistic(2.0, 3.0, 2.0)));
        assert_eq!(c.grid_points, 10);
        assert_eq!(c.output, OutputFormat::Json);
    }

    #[test]
    fn csv_path_selects_file_source() {
        let c = config(&[("ASSAY_DATA", "data/DNase.csv")]).unwrap();
        assert!(matches!(c.source, DataSource::Csv(ref p) if p == &PathBuf::from("data/DNase.csv")));
    }

    #[test]
    fn invalid_values_exit_with_code_two() {
        for pairs in [
            [("ASSAY_RUNS", "many")],
            [("ASSAY_OUTPUT", "xml")],
            [("ASSAY_LOGISTIC_START", "1,2")],
            [("ASSAY_TANH_START", "1,x,3")],
            [("ASSAY_NOISE_SD", "-1")],
        ] {
            let err = config(&pairs).unwrap_err();
            assert_eq!(err.exit_code(), 2, "{pairs:?}");
        }
    }
}
