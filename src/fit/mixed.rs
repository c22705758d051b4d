//! Nonlinear mixed-effects fitting with one scalar random effect per group.
//!
//! Model, for observation `j` of group `i`:
//!
//! ```text
//! y_ij = f(x_ij; θ + b_i·e_k) + ε_ij,   b_i ~ N(0, τ²),   ε_ij ~ N(0, σ²)
//! ```
//!
//! where `e_k` selects the parameter carrying the random effect (the asymptote
//! by default). The random effects are integrated out of the likelihood
//! approximately; `QuadratureOrder` picks the approximation:
//!
//! - **order 0**: for a relative scale `λ = τ/σ`, the fixed effects and the
//!   spherical effects `u_i = b_i/λ` are solved jointly by penalized least
//!   squares (`Σ r² + Σ u²`). σ² is profiled out as `PRSS/N` and the Laplace
//!   deviance
//!   `Σ_i ln(1 + λ² Σ_j g_ij²) + N·(1 + ln(2π·PRSS/N))`
//!   is minimized over `ln λ` with Brent's method. `λ = 0` is always evaluated
//!   as well, so boundary solutions are found exactly.
//! - **order ≥ 1**: the marginal negative log-likelihood over
//!   `(θ, ln σ, ln τ)` is minimized with Nelder–Mead, warm-started from the
//!   order-0 estimate. Each group integral is centred at the conditional mode
//!   `b̂_i` and scaled by the conditional curvature (adaptive Gauss–Hermite);
//!   order 1 is the Laplace approximation. The simplex optimum is then
//!   polished by Newton steps on the effect parameter.
//!
//! A collapsed `τ` is a legitimate conclusion (no detectable group
//! variation) and is reported through `MixedFitResult::boundary`, as is
//! non-convergence of the outer optimizer.

use std::f64::consts::{PI, SQRT_2};

use argmin::core::{
    CostFunction, Executor, State, TerminationReason as ArgminReason, TerminationStatus,
};
use argmin::solver::brent::BrentOpt;
use argmin::solver::neldermead::NelderMead;
use levenberg_marquardt::LeastSquaresProblem;
use log::{debug, info, warn};
use nalgebra::linalg::Cholesky;
use nalgebra::storage::Owned;
use nalgebra::{DMatrix, DVector, Dyn};

use crate::domain::{
    CurveModel, CurveParameters, Dataset, MixedFitResult, N_PARAMS, Observation, QuadratureOrder,
    RandomEffectEstimate,
};
use crate::error::FitError;
use crate::fit::fitter::{FitOptions, inverse_normal_diagonal_dyn, termination_ok};
use crate::fit::groups::GroupIndex;
use crate::math::HermiteRule;

/// Search interval for `ln(τ/σ)` in fast mode.
const LOG_LAMBDA_BOUNDS: (f64, f64) = (-10.0, 8.0);
/// Clamp for `ln σ` / `ln τ` during the marginal-likelihood search.
const LOG_SCALE_BOUNDS: (f64, f64) = (-30.0, 30.0);
const MODE_MAX_ITERS: usize = 50;
const MODE_TOL: f64 = 1e-10;
const POLISH_MAX_STEPS: usize = 8;
/// Free parameters beyond the curve: σ and τ.
const VARIANCE_PARAMS: usize = 2;

/// Settings for [`fit_mixed`].
#[derive(Debug, Clone)]
pub struct MixedOptions {
    pub quadrature: QuadratureOrder,
    /// Parameter receiving the random effect; `None` means the asymptote.
    pub effect_on: Option<String>,
    /// Iteration cap for each outer optimizer (Brent, Nelder–Mead).
    pub max_iterations: u64,
    /// `τ/σ` below this is reported as a boundary solution.
    pub boundary_tol: f64,
    /// Levenberg–Marquardt settings for the penalized least-squares solves.
    pub inner: FitOptions,
}

impl Default for MixedOptions {
    fn default() -> Self {
        Self {
            quadrature: QuadratureOrder::default(),
            effect_on: None,
            max_iterations: 2000,
            boundary_tol: 1e-3,
            inner: FitOptions::default(),
        }
    }
}

impl MixedOptions {
    pub fn with_quadrature(mut self, quadrature: QuadratureOrder) -> Self {
        self.quadrature = quadrature;
        self
    }

    pub fn with_effect_on(mut self, name: impl Into<String>) -> Self {
        self.effect_on = Some(name.into());
        self
    }
}

/// Observations flattened once per fit, with group membership by row index.
#[derive(Debug, Clone)]
struct GroupedData {
    model: CurveModel,
    effect: usize,
    x: Vec<f64>,
    y: Vec<f64>,
    members: Vec<Vec<usize>>,
}

impl GroupedData {
    fn n(&self) -> usize {
        self.x.len()
    }

    fn groups(&self) -> usize {
        self.members.len()
    }

    fn params_for(&self, beta: &[f64; N_PARAMS], b: f64) -> [f64; N_PARAMS] {
        let mut p = *beta;
        p[self.effect] += b;
        p
    }
}

// ---------------------------------------------------------------------------
// Order 0: penalized least squares + profiled Laplace deviance
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
struct PenalizedProblem<'a> {
    data: &'a GroupedData,
    lambda: f64,
    /// `[θ (N_PARAMS); u (groups)]`
    params: DVector<f64>,
}

impl PenalizedProblem<'_> {
    fn beta(&self) -> [f64; N_PARAMS] {
        [self.params[0], self.params[1], self.params[2]]
    }

    fn u(&self, g: usize) -> f64 {
        self.params[N_PARAMS + g]
    }

    /// Move the mean of `u` into the effect parameter.
    ///
    /// Every group curve depends only on `θ_k + λ·u_g`, so the data residuals
    /// are unchanged while `Σ u²` can only drop. At the exact optimum the mean
    /// is already zero; this removes what the solver tolerance leaves behind.
    fn recentre(&mut self) {
        let groups = self.data.groups();
        if self.lambda == 0.0 || groups == 0 {
            return;
        }
        let mean = self.params.rows(N_PARAMS, groups).sum() / groups as f64;
        self.params[self.data.effect] += self.lambda * mean;
        for u in self.params.rows_mut(N_PARAMS, groups).iter_mut() {
            *u -= mean;
        }
    }
}

impl LeastSquaresProblem<f64, Dyn, Dyn> for PenalizedProblem<'_> {
    type ResidualStorage = Owned<f64, Dyn>;
    type JacobianStorage = Owned<f64, Dyn, Dyn>;
    type ParameterStorage = Owned<f64, Dyn>;

    fn set_params(&mut self, p: &DVector<f64>) {
        self.params.copy_from(p);
    }

    fn params(&self) -> DVector<f64> {
        self.params.clone()
    }

    fn residuals(&self) -> Option<DVector<f64>> {
        let d = self.data;
        let n = d.n();
        let beta = self.beta();
        let mut r = DVector::<f64>::zeros(n + d.groups());
        for (g, rows) in d.members.iter().enumerate() {
            let p = d.params_for(&beta, self.lambda * self.u(g));
            for &i in rows {
                r[i] = d.model.evaluate(&p, d.x[i]) - d.y[i];
            }
            r[n + g] = self.u(g);
        }
        r.iter().all(|v| v.is_finite()).then_some(r)
    }

    fn jacobian(&self) -> Option<DMatrix<f64>> {
        let d = self.data;
        let n = d.n();
        let beta = self.beta();
        let mut jac = DMatrix::<f64>::zeros(n + d.groups(), N_PARAMS + d.groups());
        for (g, rows) in d.members.iter().enumerate() {
            let p = d.params_for(&beta, self.lambda * self.u(g));
            for &i in rows {
                let grad = d.model.gradient(&p, d.x[i]);
                for (k, v) in grad.iter().enumerate() {
                    jac[(i, k)] = *v;
                }
                jac[(i, N_PARAMS + g)] = grad[d.effect] * self.lambda;
            }
            jac[(n + g, N_PARAMS + g)] = 1.0;
        }
        jac.iter().all(|v| v.is_finite()).then_some(jac)
    }
}

#[derive(Debug, Clone)]
struct PenalizedFit {
    lambda: f64,
    params: DVector<f64>,
    jacobian: DMatrix<f64>,
    prss: f64,
    deviance: f64,
    evaluations: usize,
}

impl PenalizedFit {
    fn beta(&self) -> [f64; N_PARAMS] {
        [self.params[0], self.params[1], self.params[2]]
    }

    fn effects(&self) -> Vec<f64> {
        self.params
            .iter()
            .skip(N_PARAMS)
            .map(|u| self.lambda * u)
            .collect()
    }

    fn sigma(&self, n: usize) -> f64 {
        (self.prss / n as f64).sqrt()
    }
}

fn penalized_fit(
    data: &GroupedData,
    lambda: f64,
    start: &DVector<f64>,
    opts: &FitOptions,
) -> Result<PenalizedFit, FitError> {
    let problem = PenalizedProblem {
        data,
        lambda,
        params: start.clone(),
    };
    let (mut solved, report) = opts.solver().minimize(problem);
    let evaluations = report.number_of_evaluations;
    if !termination_ok(&report.termination) {
        return Err(FitError::Divergence {
            evaluations,
            reason: format!("{:?}", report.termination),
        });
    }
    solved.recentre();
    let (Some(r), Some(jacobian)) = (solved.residuals(), solved.jacobian()) else {
        return Err(FitError::Divergence {
            evaluations,
            reason: "non-finite penalized residuals".to_string(),
        });
    };

    let n = data.n();
    let prss = r.norm_squared().max(f64::MIN_POSITIVE);
    let log_det: f64 = data
        .members
        .iter()
        .enumerate()
        .map(|(g, rows)| {
            let zz: f64 = rows
                .iter()
                .map(|&i| jacobian[(i, N_PARAMS + g)].powi(2))
                .sum();
            zz.ln_1p()
        })
        .sum();
    let deviance = log_det + n as f64 * (1.0 + (2.0 * PI * prss / n as f64).ln());

    Ok(PenalizedFit {
        lambda,
        params: solved.params,
        jacobian,
        prss,
        deviance,
        evaluations,
    })
}

/// Profiled deviance as a function of `ln λ`.
struct ProfiledDeviance<'a> {
    data: &'a GroupedData,
    start: &'a DVector<f64>,
    opts: &'a FitOptions,
}

impl CostFunction for ProfiledDeviance<'_> {
    type Param = f64;
    type Output = f64;

    fn cost(&self, log_lambda: &Self::Param) -> Result<Self::Output, argmin::core::Error> {
        Ok(penalized_fit(self.data, log_lambda.exp(), self.start, self.opts)
            .map(|f| f.deviance)
            .unwrap_or(f64::INFINITY))
    }
}

#[derive(Debug, Clone)]
struct FastFit {
    fit: PenalizedFit,
    converged: bool,
    message: String,
    iterations: u64,
}

fn fit_fast(
    data: &GroupedData,
    initial: &CurveParameters,
    options: &MixedOptions,
) -> Result<FastFit, FitError> {
    let start = DVector::from_iterator(
        N_PARAMS + data.groups(),
        initial
            .values
            .iter()
            .copied()
            .chain(std::iter::repeat_n(0.0, data.groups())),
    );

    let cost = ProfiledDeviance {
        data,
        start: &start,
        opts: &options.inner,
    };
    let solver = BrentOpt::new(LOG_LAMBDA_BOUNDS.0, LOG_LAMBDA_BOUNDS.1);
    let res = Executor::new(cost, solver)
        .configure(|state| state.max_iters(options.max_iterations))
        .run()
        .map_err(|e| FitError::Divergence {
            evaluations: 0,
            reason: format!("profiled deviance search failed: {e}"),
        })?;

    let state = res.state();
    let log_lambda = state
        .get_best_param()
        .copied()
        .unwrap_or(LOG_LAMBDA_BOUNDS.0);
    let status = state.get_termination_status();
    let converged = matches!(
        status,
        TerminationStatus::Terminated(ArgminReason::SolverConverged)
    );
    let message = status.to_string();
    let iterations = state.get_iter();

    let interior = penalized_fit(data, log_lambda.exp(), &start, &options.inner);
    let zero = penalized_fit(data, 0.0, &start, &options.inner);
    let fit = match (interior, zero) {
        (Ok(a), Ok(z)) => {
            if z.deviance <= a.deviance {
                z
            } else {
                a
            }
        }
        (Ok(a), Err(_)) => a,
        (Err(_), Ok(z)) => z,
        (Err(e), Err(_)) => return Err(e),
    };

    debug!(
        "fast mode: lambda={:.4e} deviance={:.6} ({} LM evaluations at optimum)",
        fit.lambda, fit.deviance, fit.evaluations
    );

    Ok(FastFit {
        fit,
        converged,
        message,
        iterations,
    })
}

// ---------------------------------------------------------------------------
// Order >= 1: Laplace / adaptive Gauss-Hermite marginal likelihood
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
struct MarginalEval {
    nll: f64,
    modes: Vec<f64>,
}

/// Negative log of one group's integral contribution, and its conditional mode.
fn group_term(
    data: &GroupedData,
    rule: &HermiteRule,
    rows: &[usize],
    beta: &[f64; N_PARAMS],
    sigma: f64,
    tau: f64,
) -> Option<(f64, f64)> {
    let s2 = sigma * sigma;
    let t2 = tau * tau;

    // h(b) = Σ r²/(2σ²) + b²/(2τ²)
    let h = |b: f64| -> f64 {
        let p = data.params_for(beta, b);
        let rss: f64 = rows
            .iter()
            .map(|&i| (data.y[i] - data.model.evaluate(&p, data.x[i])).powi(2))
            .sum();
        rss / (2.0 * s2) + b * b / (2.0 * t2)
    };
    // Gradient and Gauss-Newton curvature of h.
    let derivs = |b: f64| -> (f64, f64) {
        let p = data.params_for(beta, b);
        let mut grad = b / t2;
        let mut curv = 1.0 / t2;
        for &i in rows {
            let g = data.model.gradient(&p, data.x[i])[data.effect];
            let r = data.y[i] - data.model.evaluate(&p, data.x[i]);
            grad -= r * g / s2;
            curv += g * g / s2;
        }
        (grad, curv)
    };

    let mut b = 0.0;
    let mut hb = h(b);
    for _ in 0..MODE_MAX_ITERS {
        let (grad, curv) = derivs(b);
        let mut step = -grad / curv;
        let mut accepted = false;
        for _ in 0..30 {
            let candidate = b + step;
            let hc = h(candidate);
            if hc <= hb {
                b = candidate;
                hb = hc;
                accepted = true;
                break;
            }
            step *= 0.5;
        }
        if !accepted || step.abs() < MODE_TOL * (1.0 + b.abs()) {
            break;
        }
    }

    let (_, curv) = derivs(b);
    let scale = SQRT_2 / curv.sqrt();
    let terms: Vec<f64> = rule
        .nodes
        .iter()
        .zip(rule.weights.iter())
        .map(|(&z, &w)| w.ln() + z * z - h(b + scale * z))
        .collect();
    let top = terms.iter().fold(f64::NEG_INFINITY, |m, &t| m.max(t));
    let log_integral = scale.ln() + top + terms.iter().map(|t| (t - top).exp()).sum::<f64>().ln();

    let n_g = rows.len() as f64;
    let nll = 0.5 * n_g * (2.0 * PI * s2).ln() + 0.5 * (2.0 * PI * t2).ln() - log_integral;
    nll.is_finite().then_some((nll, b))
}

fn marginal_nll(
    data: &GroupedData,
    rule: &HermiteRule,
    beta: &[f64; N_PARAMS],
    sigma: f64,
    tau: f64,
) -> Option<MarginalEval> {
    if !(sigma > 0.0 && tau > 0.0) || beta.iter().any(|v| !v.is_finite()) {
        return None;
    }
    let mut nll = 0.0;
    let mut modes = Vec::with_capacity(data.groups());
    for rows in &data.members {
        let (term, mode) = group_term(data, rule, rows, beta, sigma, tau)?;
        nll += term;
        modes.push(mode);
    }
    Some(MarginalEval { nll, modes })
}

/// Marginal NLL over `φ = [θ, ln σ, ln τ]`.
struct MarginalObjective<'a> {
    data: &'a GroupedData,
    rule: &'a HermiteRule,
}

impl MarginalObjective<'_> {
    fn unpack(phi: &[f64]) -> ([f64; N_PARAMS], f64, f64) {
        let clamp = |v: f64| v.clamp(LOG_SCALE_BOUNDS.0, LOG_SCALE_BOUNDS.1);
        (
            [phi[0], phi[1], phi[2]],
            clamp(phi[N_PARAMS]).exp(),
            clamp(phi[N_PARAMS + 1]).exp(),
        )
    }

    fn evaluate(&self, phi: &[f64]) -> Option<MarginalEval> {
        let (beta, sigma, tau) = Self::unpack(phi);
        marginal_nll(self.data, self.rule, &beta, sigma, tau)
    }

    fn value(&self, phi: &[f64]) -> f64 {
        self.evaluate(phi).map(|e| e.nll).unwrap_or(f64::INFINITY)
    }
}

impl CostFunction for MarginalObjective<'_> {
    type Param = Vec<f64>;
    type Output = f64;

    fn cost(&self, phi: &Self::Param) -> Result<Self::Output, argmin::core::Error> {
        Ok(self.value(phi))
    }
}

fn initial_simplex(phi0: &[f64]) -> Vec<Vec<f64>> {
    let mut simplex = vec![phi0.to_vec()];
    for k in 0..phi0.len() {
        let mut v = phi0.to_vec();
        let step = if k < N_PARAMS {
            0.05 * phi0[k].abs().max(0.1)
        } else {
            0.1
        };
        v[k] += step;
        simplex.push(v);
    }
    simplex
}

/// Newton steps on the effect parameter of `φ`, everything else held.
///
/// The slope of the marginal NLL in that coordinate is `-Σ b̂_i / τ²` when
/// the effect enters the curve linearly, so the polished point has modes that
/// average to zero. Returns the number of accepted steps.
fn polish_effect(objective: &MarginalObjective<'_>, phi: &mut [f64]) -> usize {
    let k = objective.data.effect;
    let value_at = |phi: &[f64], v: f64| {
        let mut p = phi.to_vec();
        p[k] = v;
        objective.value(&p)
    };

    let mut current = objective.value(phi);
    let mut accepted = 0;
    for _ in 0..POLISH_MAX_STEPS {
        let x = phi[k];
        let h = 1e-4 * x.abs().max(1.0);
        let fp = value_at(&*phi, x + h);
        let fm = value_at(&*phi, x - h);
        let slope = (fp - fm) / (2.0 * h);
        let curv = (fp - 2.0 * current + fm) / (h * h);
        if !(curv > 0.0 && slope.is_finite()) {
            break;
        }

        let candidate = x - slope / curv;
        let value = value_at(&*phi, candidate);
        // Slack for rounding in the NLL sum once the step is at the noise floor.
        if !(value <= current + 1e-12 * current.abs().max(1.0)) {
            break;
        }
        phi[k] = candidate;
        current = value.min(current);
        accepted += 1;
        if (candidate - x).abs() <= 1e-12 * x.abs().max(1.0) {
            break;
        }
    }
    accepted
}

/// Central-difference Hessian of `f` at `x`.
fn numeric_hessian(f: impl Fn(&[f64]) -> f64, x: &[f64]) -> DMatrix<f64> {
    let n = x.len();
    let h: Vec<f64> = x.iter().map(|v| 1e-4 * v.abs().max(1.0)).collect();
    let at = |dk: (usize, f64), dl: (usize, f64)| {
        let mut p = x.to_vec();
        p[dk.0] += dk.1;
        p[dl.0] += dl.1;
        f(&p)
    };
    let f0 = f(x);
    let mut hess = DMatrix::<f64>::zeros(n, n);
    for k in 0..n {
        let fp = at((k, h[k]), (k, 0.0));
        let fm = at((k, -h[k]), (k, 0.0));
        hess[(k, k)] = (fp - 2.0 * f0 + fm) / (h[k] * h[k]);
        for l in 0..k {
            let fpp = at((k, h[k]), (l, h[l]));
            let fpm = at((k, h[k]), (l, -h[l]));
            let fmp = at((k, -h[k]), (l, h[l]));
            let fmm = at((k, -h[k]), (l, -h[l]));
            let v = (fpp - fpm - fmp + fmm) / (4.0 * h[k] * h[l]);
            hess[(k, l)] = v;
            hess[(l, k)] = v;
        }
    }
    hess
}

/// Standard errors of the curve parameters from an NLL Hessian over `φ`.
///
/// Uses the full inverse when the Hessian is positive definite, otherwise the
/// curve-parameter block alone (typical when `τ` sits on the boundary).
fn fixed_std_errors(hess: &DMatrix<f64>) -> Option<[f64; N_PARAMS]> {
    let from = |m: DMatrix<f64>| -> Option<[f64; N_PARAMS]> {
        let inv = Cholesky::new(m)?.inverse();
        let mut out = [0.0; N_PARAMS];
        for (k, v) in out.iter_mut().enumerate() {
            let d = inv[(k, k)];
            if !(d > 0.0 && d.is_finite()) {
                return None;
            }
            *v = d.sqrt();
        }
        Some(out)
    };
    from(hess.clone()).or_else(|| from(hess.view((0, 0), (N_PARAMS, N_PARAMS)).into_owned()))
}

// ---------------------------------------------------------------------------
// Entry point
// ---------------------------------------------------------------------------

/// Fit a nonlinear mixed model with a random effect on one curve parameter.
///
/// Group labels are mapped through a [`GroupIndex`] built once for this call;
/// `random_effects` in the result follow that order.
pub fn fit_mixed<F>(
    model: CurveModel,
    initial: &CurveParameters,
    data: &Dataset,
    group_of: F,
    options: &MixedOptions,
) -> Result<MixedFitResult, FitError>
where
    F: Fn(&Observation) -> &str,
{
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
    let effect = match &options.effect_on {
        None => model.asymptote_index(),
        Some(name) => model.param_index(name).ok_or_else(|| {
            FitError::InvalidInput(format!(
                "{} curve has no parameter '{name}'",
                model.display_name()
            ))
        })?,
    };

    let n = data.len();
    let free = N_PARAMS + VARIANCE_PARAMS;
    if n < free {
        return Err(FitError::InsufficientData {
            observations: n,
            parameters: free,
        });
    }
    let index = GroupIndex::build(data.rows(), &group_of);
    if index.len() < 2 {
        return Err(FitError::InvalidInput(
            "a random effect needs at least two groups".to_string(),
        ));
    }
    let x = data.concentrations();
    let y = data.densities();
    if x.iter().chain(y.iter()).any(|v| !v.is_finite()) {
        return Err(FitError::InvalidInput("observations must be finite".to_string()));
    }

    let grouped = GroupedData {
        model,
        effect,
        x,
        y,
        members: index.partition(data.rows(), &group_of),
    };

    let fast = fit_fast(&grouped, initial, options)?;

    let estimate = match options.quadrature.nodes() {
        0 => fast_estimate(&grouped, &fast)?,
        nodes => marginal_estimate(&grouped, &fast, nodes, options)?,
    };

    let effect_on = model.param_names()[effect];
    let random_effects = index
        .labels()
        .iter()
        .zip(estimate.effects.iter())
        .enumerate()
        .map(|(g, (label, &value))| RandomEffectEstimate {
            group: label.clone(),
            index: g,
            value,
            band: estimate.sigma,
        })
        .collect();

    let k = free as f64;
    let boundary = !(estimate.tau > options.boundary_tol * estimate.sigma);
    let result = MixedFitResult {
        fixed: CurveParameters::new(model, estimate.beta),
        fixed_std_errors: estimate.std_errors,
        effect_on,
        random_effects,
        tau: estimate.tau,
        sigma: estimate.sigma,
        log_likelihood: estimate.log_likelihood,
        aic: -2.0 * estimate.log_likelihood + 2.0 * k,
        bic: -2.0 * estimate.log_likelihood + k * (n as f64).ln(),
        quadrature: options.quadrature,
        converged: estimate.converged,
        message: estimate.message,
        boundary,
        iterations: estimate.iterations,
        n_obs: n,
    };

    info!(
        "mixed {} fit ({}): {}={:.4} tau={:.4e} sigma={:.4e} logLik={:.3}",
        model.display_name(),
        options.quadrature.label(),
        effect_on,
        result.fixed.values[effect],
        result.tau,
        result.sigma,
        result.log_likelihood
    );
    if result.boundary {
        warn!("random-effect variance on {effect_on} collapsed to the boundary (tau ~ 0)");
    }
    if !result.converged {
        warn!("mixed model optimizer did not report convergence: {}", result.message);
    }

    Ok(result)
}

#[derive(Debug, Clone)]
struct Estimate {
    beta: [f64; N_PARAMS],
    std_errors: [f64; N_PARAMS],
    effects: Vec<f64>,
    sigma: f64,
    tau: f64,
    log_likelihood: f64,
    converged: bool,
    message: String,
    iterations: u64,
}

fn fast_estimate(data: &GroupedData, fast: &FastFit) -> Result<Estimate, FitError> {
    let fit = &fast.fit;
    let n = data.n();
    let sigma = fit.sigma(n);
    let diag = inverse_normal_diagonal_dyn(&fit.jacobian, 1e-12)?;
    let mut std_errors = [0.0; N_PARAMS];
    for (k, v) in std_errors.iter_mut().enumerate() {
        *v = sigma * diag[k].sqrt();
    }
    Ok(Estimate {
        beta: fit.beta(),
        std_errors,
        effects: fit.effects(),
        sigma,
        tau: fit.lambda * sigma,
        log_likelihood: -0.5 * fit.deviance,
        converged: fast.converged,
        message: fast.message.clone(),
        iterations: fast.iterations,
    })
}

fn marginal_estimate(
    data: &GroupedData,
    fast: &FastFit,
    nodes: usize,
    options: &MixedOptions,
) -> Result<Estimate, FitError> {
    let rule = HermiteRule::new(nodes)?;
    let sigma0 = fast.fit.sigma(data.n()).max(1e-12);
    let tau0 = (fast.fit.lambda * sigma0).max(1e-2 * sigma0);
    let mut phi0 = fast.fit.beta().to_vec();
    phi0.push(sigma0.ln());
    phi0.push(tau0.ln());

    let solver = NelderMead::new(initial_simplex(&phi0))
        .with_sd_tolerance(1e-10)
        .map_err(|e| FitError::InvalidInput(format!("Nelder-Mead setup: {e}")))?;
    let res = Executor::new(
        MarginalObjective {
            data,
            rule: &rule,
        },
        solver,
    )
    .configure(|state| state.max_iters(options.max_iterations))
    .run()
    .map_err(|e| FitError::Divergence {
        evaluations: 0,
        reason: format!("marginal likelihood search failed: {e}"),
    })?;

    let state = res.state();
    let status = state.get_termination_status();
    let converged = matches!(
        status,
        TerminationStatus::Terminated(ArgminReason::SolverConverged)
    );
    let message = status.to_string();
    let iterations = fast.iterations + state.get_iter();
    let mut phi = state.get_best_param().cloned().unwrap_or(phi0);

    let objective = MarginalObjective {
        data,
        rule: &rule,
    };
    let polished = polish_effect(&objective, &mut phi);
    debug!("marginal search: {iterations} iterations, {polished} polishing steps on the effect parameter");
    let eval = objective.evaluate(&phi).ok_or_else(|| FitError::Divergence {
        evaluations: iterations as usize,
        reason: "non-finite marginal likelihood at the optimum".to_string(),
    })?;
    let (beta, sigma, tau) = MarginalObjective::unpack(&phi);

    let hess = numeric_hessian(|p| objective.value(p), &phi);
    let std_errors = fixed_std_errors(&hess).unwrap_or_else(|| {
        warn!("marginal Hessian is not positive definite; fixed-effect standard errors unavailable");
        [f64::NAN; N_PARAMS]
    });

    Ok(Estimate {
        beta,
        std_errors,
        effects: eval.modes,
        sigma,
        tau,
        log_likelihood: -eval.nll,
        converged,
        message,
        iterations,
    })
}

impl MixedFitResult {
    /// Average of the per-group random-effect estimates (≈ 0 under the
    /// zero-mean prior).
    pub fn mean_random_effect(&self) -> f64 {
        if self.random_effects.is_empty() {
            return 0.0;
        }
        self.random_effects.iter().map(|r| r.value).sum::<f64>() / self.random_effects.len() as f64
    }

    pub fn random_effect(&self, group: &str) -> Option<&RandomEffectEstimate> {
        self.random_effects.iter().find(|r| r.group == group)
    }

    /// Curve for one group: fixed effects plus that group's offset.
    pub fn group_parameters(&self, group: &str) -> Option<CurveParameters> {
        let re = self.random_effect(group)?;
        let k = self.fixed.model.param_index(self.effect_on)?;
        let mut params = self.fixed;
        params.values[k] += re.value;
        Some(params)
    }

    /// Population-level curve (all random effects at zero).
    pub fn predict_population(&self, xs: &[f64]) -> Vec<f64> {
        self.fixed.evaluate_many(xs)
    }

    pub fn predict_group(&self, group: &str, xs: &[f64]) -> Option<Vec<f64>> {
        self.group_parameters(group).map(|p| p.evaluate_many(xs))
    }
}
