//! Nonlinear least-squares curve fitting.
//!
//! Given:
//! - a curve form (`tanh` or logistic)
//! - caller-supplied starting values
//! - a data subset `(conc_i, density_i)`
//!
//! we minimize `Σ (density_i − f(conc_i; θ))²` with Levenberg–Marquardt using the
//! closed-form Jacobian from `models`, then derive asymptotic standard errors
//! from `σ² (JᵀJ)⁻¹` at the solution.
//!
//! There is no multi-start or global search: poor starting values surface as
//! `FitError::Divergence`, non-identifiable parameters as
//! `FitError::SingularGradient`.

use levenberg_marquardt::{LeastSquaresProblem, LevenbergMarquardt, TerminationReason};
use log::{debug, warn};
use nalgebra::storage::Owned;
use nalgebra::{DMatrix, DVector, Dyn};
use rayon::prelude::*;

use crate::domain::{CurveModel, CurveParameters, Dataset, FitResult, N_PARAMS, Observation};
use crate::error::FitError;
use crate::fit::groups::GroupIndex;

/// Solver settings for a single curve fit.
#[derive(Debug, Clone, Copy)]
pub struct FitOptions {
    /// Evaluation budget multiplier (`patience · (params + 1)` evaluations).
    pub patience: usize,
    pub ftol: f64,
    pub xtol: f64,
    pub gtol: f64,
    /// Smallest accepted ratio of extreme Jacobian singular values.
    pub rank_tol: f64,
}

impl Default for FitOptions {
    fn default() -> Self {
        Self {
            patience: 200,
            ftol: 1e-12,
            xtol: 1e-12,
            gtol: 1e-14,
            rank_tol: 1e-10,
        }
    }
}

impl FitOptions {
    pub(crate) fn solver(&self) -> LevenbergMarquardt<f64> {
        LevenbergMarquardt::new()
            .with_patience(self.patience)
            .with_ftol(self.ftol)
            .with_xtol(self.xtol)
            .with_gtol(self.gtol)
    }
}

/// Whether a Levenberg–Marquardt run ended at an acceptable solution.
///
/// `NoImprovementPossible` means the tolerances hit machine precision, which is
/// as converged as the solver can get.
pub(crate) fn termination_ok(reason: &TerminationReason) -> bool {
    reason.was_successful() || matches!(reason, TerminationReason::NoImprovementPossible(_))
}

#[derive(Debug, Clone)]
struct CurveProblem<'a> {
    model: CurveModel,
    x: &'a [f64],
    y: &'a [f64],
    params: [f64; N_PARAMS],
}

impl LeastSquaresProblem<f64, Dyn, Dyn> for CurveProblem<'_> {
    type ResidualStorage = Owned<f64, Dyn>;
    type JacobianStorage = Owned<f64, Dyn, Dyn>;
    type ParameterStorage = Owned<f64, Dyn>;

    fn set_params(&mut self, p: &DVector<f64>) {
        self.params.copy_from_slice(p.as_slice());
    }

    fn params(&self) -> DVector<f64> {
        DVector::from_column_slice(&self.params)
    }

    fn residuals(&self) -> Option<DVector<f64>> {
        let r = DVector::from_iterator(
            self.x.len(),
            self.x
                .iter()
                .zip(self.y.iter())
                .map(|(&x, &y)| self.model.evaluate(&self.params, x) - y),
        );
        r.iter().all(|v| v.is_finite()).then_some(r)
    }

    fn jacobian(&self) -> Option<DMatrix<f64>> {
        let mut jac = DMatrix::<f64>::zeros(self.x.len(), N_PARAMS);
        for (i, &x) in self.x.iter().enumerate() {
            let g = self.model.gradient(&self.params, x);
            for (k, v) in g.into_iter().enumerate() {
                jac[(i, k)] = v;
            }
        }
        jac.iter().all(|v| v.is_finite()).then_some(jac)
    }
}

/// Fit `model` to `data` starting from `initial`.
pub fn fit(
    model: CurveModel,
    initial: &CurveParameters,
    data: &Dataset,
) -> Result<FitResult, FitError> {
    fit_with_options(model, initial, data, &FitOptions::default())
}

pub fn fit_with_options(
    model: CurveModel,
    initial: &CurveParameters,
    data: &Dataset,
    opts: &FitOptions,
) -> Result<FitResult, FitError> {
    if initial.model != model {
        return Err(FitError::InvalidInput(format!(
            "starting values are for the {} form, fitting {}",
            initial.model.display_name(),
            model.display_name()
        )));
    }
    if !initial.is_finite() {
        return Err(FitError::InvalidInput("starting values must be finite".to_string()));
    }
    let n = data.len();
    if n < N_PARAMS {
        return Err(FitError::InsufficientData {
            observations: n,
            parameters: N_PARAMS,
        });
    }

    let x = data.concentrations();
    let y = data.densities();
    if x.iter().chain(y.iter()).any(|v| !v.is_finite()) {
        return Err(FitError::InvalidInput("observations must be finite".to_string()));
    }

    let problem = CurveProblem {
        model,
        x: &x,
        y: &y,
        params: initial.values,
    };
    let (solved, report) = opts.solver().minimize(problem);
    let evaluations = report.number_of_evaluations;

    if !termination_ok(&report.termination) {
        warn!(
            "{} fit stopped after {evaluations} evaluations: {:?}",
            model.display_name(),
            report.termination
        );
        return Err(FitError::Divergence {
            evaluations,
            reason: format!("{:?}", report.termination),
        });
    }

    let params = CurveParameters::new(model, solved.params);
    let (Some(residuals), Some(jac)) = (solved.residuals(), solved.jacobian()) else {
        return Err(FitError::Divergence {
            evaluations,
            reason: "non-finite residuals at the solution".to_string(),
        });
    };

    let inv_diag = inverse_normal_diagonal(&jac, opts.rank_tol)?;

    let sse = residuals.norm_squared();
    let df = n - N_PARAMS;
    let sigma = if df > 0 { (sse / df as f64).sqrt() } else { f64::NAN };
    let std_errors = inv_diag.map(|d| sigma * d.sqrt());

    debug!(
        "{} fit: n={n} sse={sse:.6} sigma={sigma:.6} params={:?} ({evaluations} evaluations)",
        model.display_name(),
        params.values
    );

    Ok(FitResult {
        params,
        std_errors,
        sigma,
        df,
        sse,
        n_obs: n,
        evaluations,
        data: data.clone(),
    })
}

/// Diagonal of `(JᵀJ)⁻¹` via SVD, rejecting rank-deficient Jacobians.
pub(crate) fn inverse_normal_diagonal(
    jac: &DMatrix<f64>,
    rank_tol: f64,
) -> Result<[f64; N_PARAMS], FitError> {
    let diag = inverse_normal_diagonal_dyn(jac, rank_tol)?;
    let mut out = [0.0; N_PARAMS];
    for (k, v) in out.iter_mut().enumerate() {
        *v = diag[k];
    }
    Ok(out)
}

/// Dynamic-width variant of [`inverse_normal_diagonal`].
pub(crate) fn inverse_normal_diagonal_dyn(
    jac: &DMatrix<f64>,
    rank_tol: f64,
) -> Result<Vec<f64>, FitError> {
    let p = jac.ncols();
    let svd = jac.clone().svd(false, true);
    let s = &svd.singular_values;
    let s_max = s.iter().fold(0.0_f64, |m, &v| m.max(v));
    let s_min = s.iter().fold(f64::INFINITY, |m, &v| m.min(v));
    if s.len() < p || !(s_max > 0.0) || s_min / s_max < rank_tol {
        return Err(FitError::SingularGradient(format!(
            "Jacobian condition ratio {:.3e} below {rank_tol:.1e}",
            if s_max > 0.0 { s_min / s_max } else { 0.0 }
        )));
    }
    let Some(v_t) = svd.v_t else {
        return Err(FitError::SingularGradient("SVD did not produce V".to_string()));
    };

    // (JᵀJ)⁻¹ = V Σ⁻² Vᵀ, so the k-th diagonal entry is Σ_j V[k,j]² / s_j².
    Ok((0..p)
        .map(|k| (0..s.len()).map(|j| (v_t[(j, k)] / s[j]).powi(2)).sum())
        .collect())
}

/// Evaluate the fitted curve at arbitrary concentrations.
///
/// Inputs outside the training range are allowed; judging extrapolation risk
/// is left to the caller (see `report::evaluate`).
pub fn predict(fit: &FitResult, xs: &[f64]) -> Vec<f64> {
    fit.params.evaluate_many(xs)
}

impl FitResult {
    pub fn predict(&self, xs: &[f64]) -> Vec<f64> {
        predict(self, xs)
    }

    /// Observed minus fitted, in data order.
    pub fn residuals(&self) -> Vec<f64> {
        self.data
            .iter()
            .map(|o| o.density - self.params.evaluate(o.conc))
            .collect()
    }

    /// Estimate / standard error per parameter.
    pub fn t_values(&self) -> [f64; N_PARAMS] {
        let mut out = [0.0; N_PARAMS];
        for (k, v) in out.iter_mut().enumerate() {
            *v = self.params.values[k] / self.std_errors[k];
        }
        out
    }
}

/// Independent per-group fits, in stable group order.
#[derive(Debug, Clone)]
pub struct GroupFits {
    pub index: GroupIndex,
    pub fits: Vec<Result<FitResult, FitError>>,
}

impl GroupFits {
    pub fn get(&self, label: &str) -> Option<&Result<FitResult, FitError>> {
        self.index.index_of(label).and_then(|i| self.fits.get(i))
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &Result<FitResult, FitError>)> {
        self.index
            .labels()
            .iter()
            .map(String::as_str)
            .zip(self.fits.iter())
    }

    pub fn len(&self) -> usize {
        self.fits.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fits.is_empty()
    }

    pub fn succeeded(&self) -> usize {
        self.fits.iter().filter(|f| f.is_ok()).count()
    }

    pub fn failed(&self) -> usize {
        self.fits.len() - self.succeeded()
    }
}

/// Fit every group separately from the same starting values.
///
/// Groups share nothing: each optimization starts from `initial` and sees only
/// its own rows. Failures stay attached to their group and never abort the
/// batch. Groups run in parallel; the output order comes from the
/// [`GroupIndex`], so results do not depend on scheduling.
pub fn fit_per_group<F>(
    model: CurveModel,
    initial: &CurveParameters,
    data: &Dataset,
    group_of: F,
) -> GroupFits
where
    F: Fn(&Observation) -> &str,
{
    fit_per_group_with_options(model, initial, data, group_of, &FitOptions::default())
}

pub fn fit_per_group_with_options<F>(
    model: CurveModel,
    initial: &CurveParameters,
    data: &Dataset,
    group_of: F,
    opts: &FitOptions,
) -> GroupFits
where
    F: Fn(&Observation) -> &str,
{
    let index = GroupIndex::build(data.rows(), &group_of);
    let subsets: Vec<Dataset> = index
        .partition(data.rows(), &group_of)
        .into_iter()
        .map(|rows| rows.into_iter().map(|i| data.rows()[i].clone()).collect())
        .collect();

    let fits: Vec<Result<FitResult, FitError>> = subsets
        .par_iter()
        .map(|subset| fit_with_options(model, initial, subset, opts))
        .collect();

    for (label, result) in index.labels().iter().zip(fits.iter()) {
        if let Err(e) = result {
            warn!("group {label}: {e}");
        }
    }

    GroupFits { index, fits }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::by_run;
    use rand::SeedableRng;
    use rand::rngs::StdRng;
    use rand_distr::{Distribution, Normal};

    fn synthetic(run: &str, truth: &CurveParameters, xs: &[f64], sd: f64, seed: u64) -> Vec<Observation> {
        let mut rng = StdRng::seed_from_u64(seed);
        let noise = Normal::new(0.0, sd).unwrap();
        xs.iter()
            .map(|&x| Observation::new(run, x, truth.evaluate(x) + noise.sample(&mut rng)))
            .collect()
    }

    fn rel_err(a: f64, b: f64) -> f64 {
        ((a - b) / b).abs()
    }

    #[test]
    fn recovers_logistic_parameters_from_noisy_data() {
        let truth = CurveParameters::logistic(3.0, 1.5, 0.8);
        let xs = [0.0, 0.0, 1.0, 1.0, 2.0, 2.0, 4.0, 4.0, 8.0, 8.0];
        let data = Dataset::new(synthetic("1", &truth, &xs, 0.01, 11));

        let start = CurveParameters::logistic(2.5, 1.0, 1.0);
        let fit = fit(CurveModel::Logistic, &start, &data).unwrap();

        for k in 0..N_PARAMS {
            assert!(
                rel_err(fit.params.values[k], truth.values[k]) < 0.05,
                "{}: {} vs {}",
                truth.model.param_names()[k],
                fit.params.values[k],
                truth.values[k]
            );
        }
        assert_eq!(fit.df, 7);
        assert!(fit.sigma > 0.0 && fit.sigma < 0.05);
        assert!(fit.std_errors.iter().all(|s| s.is_finite() && *s > 0.0));
        assert_eq!(fit.residuals().len(), 10);
    }

    #[test]
    fn tanh_fit_reaches_the_same_plateau() {
        let truth = CurveParameters::logistic(2.0, 2.0, 1.0);
        let xs: Vec<f64> = (0..16).map(|i| i as f64 * 0.8).collect();
        let data = Dataset::new(synthetic("1", &truth, &xs, 0.005, 5));

        let start = CurveModel::Tanh.initial_guess(&data.concentrations(), &data.densities());
        let tanh = fit(CurveModel::Tanh, &start, &data).unwrap();
        assert!((tanh.params.asymptote() - 2.0).abs() < 0.15);
        let p = tanh.predict(&[1.0, 6.0]);
        assert!(p[1] > p[0]);
    }

    #[test]
    fn exact_data_gives_zero_residuals() {
        let truth = CurveParameters::logistic(2.0, 1.0, 0.5);
        let data: Dataset = [0.0, 0.5, 1.0, 1.5, 2.0, 3.0]
            .iter()
            .map(|&x| Observation::new("1", x, truth.evaluate(x)))
            .collect();
        let fit = fit(CurveModel::Logistic, &CurveParameters::logistic(1.5, 0.8, 0.7), &data).unwrap();
        assert!(fit.sse < 1e-16);
        let p = predict(&fit, &[0.25, 10.0]);
        assert!((p[0] - truth.evaluate(0.25)).abs() < 1e-6);
        assert!((p[1] - truth.evaluate(10.0)).abs() < 1e-6);
    }

    #[test]
    fn per_group_fits_are_independent_and_order_invariant() {
        let xs = [0.0, 0.5, 1.0, 2.0, 3.0, 4.0, 6.0, 8.0];
        let a = synthetic("a", &CurveParameters::logistic(2.0, 1.5, 0.8), &xs, 0.005, 1);
        let b = synthetic("b", &CurveParameters::logistic(3.0, 2.5, 1.0), &xs, 0.005, 2);

        let ab: Dataset = a.iter().chain(b.iter()).cloned().collect();
        let ba: Dataset = b.iter().chain(a.iter()).cloned().collect();
        let start = CurveParameters::logistic(2.5, 2.0, 1.0);

        let fits_ab = fit_per_group(CurveModel::Logistic, &start, &ab, by_run);
        let fits_ba = fit_per_group(CurveModel::Logistic, &start, &ba, by_run);
        assert_eq!(fits_ab.index.labels(), &["a", "b"]);
        assert_eq!(fits_ba.index.labels(), &["b", "a"]);

        for label in ["a", "b"] {
            let x = fits_ab.get(label).unwrap().as_ref().unwrap();
            let y = fits_ba.get(label).unwrap().as_ref().unwrap();
            assert_eq!(x.params, y.params);
        }

        let fa = fits_ab.get("a").unwrap().as_ref().unwrap();
        let fb = fits_ab.get("b").unwrap().as_ref().unwrap();
        assert!((fa.params.values[0] - 2.0).abs() < 0.05);
        assert!((fb.params.values[0] - 3.0).abs() < 0.05);
        assert!(fb.params.values[1] > fa.params.values[1]);
    }

    #[test]
    fn insufficient_group_fails_without_aborting_the_batch() {
        let xs = [0.0, 0.5, 1.0, 2.0, 4.0, 8.0];
        let mut rows = synthetic("ok", &CurveParameters::logistic(2.0, 1.5, 0.8), &xs, 0.005, 9);
        rows.push(Observation::new("tiny", 1.0, 0.5));
        rows.push(Observation::new("tiny", 2.0, 0.9));
        let data = Dataset::new(rows);

        let fits = fit_per_group(
            CurveModel::Logistic,
            &CurveParameters::logistic(2.0, 1.0, 1.0),
            &data,
            by_run,
        );
        assert_eq!(fits.succeeded(), 1);
        assert_eq!(fits.failed(), 1);
        assert!(fits.get("ok").unwrap().is_ok());
        assert_eq!(
            fits.get("tiny").unwrap().as_ref().unwrap_err(),
            &FitError::InsufficientData {
                observations: 2,
                parameters: 3
            }
        );
    }

    #[test]
    fn exhausted_budget_is_a_divergence() {
        let truth = CurveParameters::logistic(3.0, 1.5, 0.8);
        let xs = [0.0, 0.5, 1.0, 2.0, 3.0, 4.0, 8.0];
        let data = Dataset::new(synthetic("1", &truth, &xs, 0.01, 4));
        let opts = FitOptions {
            patience: 1,
            ..FitOptions::default()
        };
        let err = fit_with_options(
            CurveModel::Logistic,
            &CurveParameters::logistic(0.1, 5.0, 3.0),
            &data,
            &opts,
        )
        .unwrap_err();
        assert!(matches!(err, FitError::Divergence { .. }), "{err:?}");
    }

    #[test]
    fn single_concentration_is_not_identifiable() {
        let data: Dataset = [0.9, 1.0, 1.1, 1.05, 0.95]
            .iter()
            .map(|&y| Observation::new("1", 2.0, y))
            .collect();
        let err = fit(CurveModel::Logistic, &CurveParameters::logistic(2.0, 1.0, 1.0), &data)
            .unwrap_err();
        assert!(
            matches!(err, FitError::SingularGradient(_) | FitError::Divergence { .. }),
            "{err:?}"
        );
    }

    #[test]
    fn rank_check_rejects_collinear_columns() {
        let jac = DMatrix::from_row_slice(4, 3, &[
            1.0, 2.0, 0.5, //
            1.0, 2.0, 0.1, //
            1.0, 2.0, 0.7, //
            1.0, 2.0, 0.2,
        ]);
        assert!(matches!(
            inverse_normal_diagonal(&jac, 1e-10),
            Err(FitError::SingularGradient(_))
        ));

        let identity = DMatrix::<f64>::identity(3, 3) * 2.0;
        let diag = inverse_normal_diagonal(&identity, 1e-10).unwrap();
        for d in diag {
            assert!((d - 0.25).abs() < 1e-12);
        }
    }

    #[test]
    fn mismatched_start_is_rejected() {
        let data: Dataset = (0..5).map(|i| Observation::new("1", i as f64, i as f64)).collect();
        let err = fit(CurveModel::Logistic, &CurveParameters::tanh(1.0, 1.0, 0.0), &data).unwrap_err();
        assert!(matches!(err, FitError::InvalidInput(_)));
    }
}
