//! Plain-text rendering of an analysis run.

use crate::app::pipeline::AnalysisRun;
use crate::domain::{FitResult, MixedFitResult};
use crate::fit::GroupFits;
use crate::report::Evaluation;

/// Format the full run report (dataset, population fits, per-run fits, mixed model).
pub fn format_report(run: &AnalysisRun) -> String {
    let mut out = String::new();
    out.push_str(&format_run_summary(run));
    out.push('\n');
    out.push_str(&format_fit("Tanh fit (training half)", &run.tanh));
    out.push_str(&format_evaluation("held-out", &run.tanh_eval));
    out.push('\n');
    out.push_str(&format_fit("Logistic fit (training half)", &run.logistic));
    out.push_str(&format_evaluation("held-out", &run.logistic_eval));
    out.push('\n');
    out.push_str(&format_group_fits(&run.group_fits));
    out.push('\n');
    out.push_str(&format_mixed(&run.mixed, run.true_effects.as_deref()));
    out.push_str(&format_evaluation("held-out", &run.mixed_eval));
    out
}

/// Header: provenance and dataset stats.
pub fn format_run_summary(run: &AnalysisRun) -> String {
    let mut out = String::new();

    out.push_str("=== assay - nonlinear curve and mixed-model fit ===\n");
    out.push_str(&format!(
        "Generated: {}\n",
        run.generated_at.format("%Y-%m-%d %H:%M:%S UTC")
    ));
    out.push_str(&format!("Source: {}\n", run.source));

    let census = run.dataset.pairing();
    out.push_str(&format!(
        "Rows: n={} | skipped={} | pairs={} singles={}{}\n",
        run.dataset.len(),
        run.skipped_rows,
        census.pairs,
        census.singles,
        if census.is_well_formed() { "" } else { " (irregular)" },
    ));
    if let Some((lo, hi)) = run.dataset.conc_range() {
        out.push_str(&format!("Concentration: [{lo:.4}, {hi:.4}]\n"));
    }
    out.push_str(&format!(
        "Split: train={} test={}\n",
        run.split.train.len(),
        run.split.test.len()
    ));

    out
}

/// Parameter table with standard errors and t-values.
pub fn format_fit(title: &str, fit: &FitResult) -> String {
    let mut out = String::new();
    out.push_str(&format!("{title}:\n"));
    out.push_str(&param_table(
        &fit.params.named(),
        &fit.std_errors,
        Some(fit.t_values().as_slice()),
    ));
    out.push_str(&format!(
        "Residual standard error: {:.5} on {} degrees of freedom (SSE={:.6}, {} evaluations)\n",
        fit.sigma, fit.df, fit.sse, fit.evaluations
    ));
    out
}

pub fn format_evaluation(label: &str, eval: &Evaluation) -> String {
    let mut out = format!(
        "  {label}: n={} RMSE={:.5} MAE={:.5} R²={}",
        eval.n,
        eval.rmse,
        eval.mae,
        fmt_num(eval.r_squared, 4)
    );
    if eval.extrapolated > 0 {
        out.push_str(&format!(" ({} extrapolated)", eval.extrapolated));
    }
    out.push('\n');
    out
}

/// One row per group: estimates or the failure reason.
pub fn format_group_fits(fits: &GroupFits) -> String {
    let mut out = String::new();
    out.push_str(&format!(
        "Per-run fits: {} succeeded, {} failed\n",
        fits.succeeded(),
        fits.failed()
    ));

    let names = fits
        .fits
        .iter()
        .find_map(|f| f.as_ref().ok())
        .map(|f| f.params.model.param_names());
    if let Some(names) = names {
        out.push_str(
            format!(
                "{:<8} {:>10} {:>10} {:>10} {:>10}\n",
                "run", names[0], names[1], names[2], "sigma"
            )
            .trim_end(),
        );
        out.push('\n');
    }

    for (label, result) in fits.iter() {
        let line = match result {
            Ok(fit) => format!(
                "{:<8} {:>10.4} {:>10.4} {:>10.4} {:>10.5}",
                truncate(label, 8),
                fit.params.values[0],
                fit.params.values[1],
                fit.params.values[2],
                fit.sigma
            ),
            Err(e) => format!("{:<8} failed: {e}", truncate(label, 8)),
        };
        out.push_str(line.trim_end());
        out.push('\n');
    }
    out
}

/// Mixed-model summary: fixed effects, variance components, random effects.
pub fn format_mixed(fit: &MixedFitResult, true_effects: Option<&[f64]>) -> String {
    let mut out = String::new();
    out.push_str(&format!(
        "Mixed {} fit, random effect on {} ({}):\n",
        fit.fixed.model.display_name(),
        fit.effect_on,
        fit.quadrature.label()
    ));
    out.push_str(&param_table(&fit.fixed.named(), &fit.fixed_std_errors, None));
    out.push_str(&format!(
        "tau={:.5} sigma={:.5} | logLik={:.3} AIC={:.3} BIC={:.3}\n",
        fit.tau, fit.sigma, fit.log_likelihood, fit.aic, fit.bic
    ));
    out.push_str(&format!(
        "converged={} ({}) iterations={}{}\n",
        fit.converged,
        fit.message,
        fit.iterations,
        if fit.boundary { " | boundary: tau ~ 0" } else { "" }
    ));

    out.push_str(
        format!("{:<8} {:>10} {:>10}", "run", "effect", "truth").trim_end(),
    );
    out.push('\n');
    for re in &fit.random_effects {
        let truth = true_effects
            .and_then(|t| t.get(re.index))
            .map(|v| format!("{v:>10.4}"))
            .unwrap_or_default();
        out.push_str(
            format!("{:<8} {:>10.4} {truth}", truncate(&re.group, 8), re.value).trim_end(),
        );
        out.push('\n');
    }
    out.push_str(&format!(
        "mean random effect: {:.3e} (band ±{:.5})\n",
        fit.mean_random_effect(),
        fit.sigma
    ));
    out
}

fn param_table(named: &[(&str, f64)], std_errors: &[f64], t_values: Option<&[f64]>) -> String {
    let mut out = String::new();
    let header = if t_values.is_some() {
        format!("  {:<6} {:>12} {:>12} {:>10}", "", "estimate", "std.error", "t")
    } else {
        format!("  {:<6} {:>12} {:>12}", "", "estimate", "std.error")
    };
    out.push_str(header.trim_end());
    out.push('\n');

    for (k, (name, value)) in named.iter().enumerate() {
        let mut line = format!(
            "  {:<6} {:>12.6} {:>12}",
            name,
            value,
            fmt_num(std_errors[k], 6)
        );
        if let Some(t) = t_values {
            line.push_str(&format!(" {:>10}", fmt_num(t[k], 3)));
        }
        out.push_str(line.trim_end());
        out.push('\n');
    }
    out
}

fn fmt_num(v: f64, decimals: usize) -> String {
    if v.is_finite() {
        format!("{v:.decimals$}")
    } else {
        "NA".to_string()
    }
}

fn truncate(s: &str, max: usize) -> String {
    if s.chars().count() <= max {
        return s.to_string();
    }
    let mut out: String = s.chars().take(max.saturating_sub(1)).collect();
    out.push('.');
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{CurveModel, CurveParameters, Dataset, Observation};
    use crate::error::FitError;
    use crate::fit::{fit, fit_per_group};

    fn exact(run: &str, p: &CurveParameters) -> Vec<Observation> {
        [0.0, 0.5, 1.0, 2.0, 4.0, 8.0]
            .iter()
            .map(|&x| Observation::new(run, x, p.evaluate(x)))
            .collect()
    }

    #[test]
    fn fit_table_lists_every_parameter() {
        let p = CurveParameters::logistic(2.0, 1.0, 0.7);
        let data = Dataset::new(exact("1", &p));
        let fitted = fit(CurveModel::Logistic, &p, &data).unwrap();
        let text = format_fit("Logistic", &fitted);
        for name in ["Asym", "xmid", "scal"] {
            assert!(text.contains(name), "missing {name} in\n{text}");
        }
        assert!(text.contains("on 3 degrees of freedom"));
    }

    #[test]
    fn group_table_reports_failures_inline() {
        let p = CurveParameters::logistic(2.0, 1.0, 0.7);
        let mut rows = exact("good", &p);
        rows.push(Observation::new("bad", 1.0, 1.0));
        let fits = fit_per_group(CurveModel::Logistic, &p, &Dataset::new(rows), crate::domain::by_run);
        let text = format_group_fits(&fits);
        assert!(text.contains("1 succeeded, 1 failed"));
        let expected = FitError::InsufficientData {
            observations: 1,
            parameters: 3,
        };
        assert!(text.contains(&format!("{:<8} failed: {expected}", "bad")));
    }

    #[test]
    fn evaluation_line_marks_extrapolation_and_missing_r_squared() {
        let eval = Evaluation {
            n: 4,
            sse: 0.1,
            rmse: 0.158,
            mae: 0.12,
            r_squared: f64::NAN,
            extrapolated: 2,
        };
        let line = format_evaluation("test", &eval);
        assert!(line.contains("R²=NA"));
        assert!(line.contains("(2 extrapolated)"));
    }

    #[test]
    fn truncate_marks_cut_labels() {
        assert_eq!(truncate("short", 8), "short");
        assert_eq!(truncate("averylonglabel", 8), "averylo.");
    }
}
