//! Per-gene negative-binomial log-linear models.
//!
//! Fitting runs in two passes over the genes, both parallel. A Poisson
//! pass produces fitted means for conditional method-of-moments
//! dispersions, which are shrunk toward an abundance trend; the second
//! pass refits each gene at its shrunk dispersion. Residual deviances are
//! then moment-matched against a scaled chi-square on the log scale to
//! moderate the quasi-likelihood variances used by the contrast tests.

use crate::design::DesignMatrix;
use crate::error::{GlmError, Result};
use crate::norm::{average_log_cpm, FilteredCounts};
use crate::stat::{trigamma, trigamma_inverse, Statistics};
use log::warn;
use ndarray::{Array1, Array2, ArrayView1, Axis};
use ndarray_linalg::{InverseH, SolveH};
use rayon::prelude::*;
use statrs::function::gamma::digamma;
use std::cmp::Ordering;

/// Floor on fitted means, keeping working weights finite for zero counts.
const MIN_MU: f64 = 1e-5;
/// Cap on the linear predictor before exponentiation.
const MAX_ETA: f64 = 50.0;
/// Floor for residual variances entering the log-scale moment match.
const MIN_S2: f64 = 1e-10;

/// Tuning knobs for the fitter and the dispersion trend.
#[derive(Clone, Debug)]
pub struct FitOptions {
    /// Iteration cap per gene.
    pub max_iterations: usize,
    /// Relative deviance change below which iteration stops.
    pub tolerance: f64,
    /// Ridge added to the working normal equations so separable count
    /// patterns stay solvable.
    pub ridge: f64,
    /// Upper bound on abundance bins for the dispersion and variance
    /// trends.
    pub n_trend_bins: usize,
}

impl Default for FitOptions {
    fn default() -> FitOptions {
        FitOptions {
            max_iterations: 50,
            tolerance: 1e-8,
            ridge: 1e-6,
            n_trend_bins: 20,
        }
    }
}

/// Fitted per-gene models plus the shared moderation state the contrast
/// machinery consumes.
#[derive(Clone, Debug)]
pub struct GlmFit {
    /// Gene identifiers, aligned with every per-gene array below.
    pub genes: Vec<String>,
    /// Design the models were fitted against.
    pub design: DesignMatrix,
    /// Coefficients on the natural-log scale, genes x p. NaN rows mark
    /// genes whose fit did not reach finite estimates.
    pub coef: Array2<f64>,
    /// Unscaled coefficient covariance `(X' W X)^-1`, one per gene.
    pub cov: Vec<Array2<f64>>,
    /// Residual deviance per gene.
    pub deviance: Array1<f64>,
    /// Trend-shrunk negative-binomial dispersion per gene.
    pub dispersion: Array1<f64>,
    /// Moderated quasi-likelihood variance per gene.
    pub s2_post: Array1<f64>,
    /// Prior degrees of freedom from the variance moment match; infinite
    /// when the observed variances show no excess spread.
    pub prior_df: f64,
    /// Residual degrees of freedom, samples minus coefficients.
    pub df_residual: f64,
    /// Average log2 CPM per gene.
    pub avg_log_cpm: Array1<f64>,
}

impl GlmFit {
    /// Number of fitted genes.
    pub fn n_genes(&self) -> usize {
        self.genes.len()
    }
}

/// Fits one negative-binomial GLM per retained gene against `design`,
/// with natural-log effective library sizes as offsets.
pub fn fit_glm(
    filtered: &FilteredCounts,
    design: &DesignMatrix,
    opts: &FitOptions,
) -> Result<GlmFit> {
    let n = filtered.n_samples();
    let g = filtered.n_genes();
    let p = design.n_coefficients();
    if design.n_samples() != n {
        return Err(GlmError::Dimension {
            detail: format!(
                "design over {} samples against {} count columns",
                design.n_samples(),
                n
            ),
        });
    }
    let eff = filtered.effective_lib_sizes();
    if eff.iter().any(|&l| !(l > 0.0)) {
        return Err(GlmError::Dimension {
            detail: "sample with zero effective library size".into(),
        });
    }

    let offsets = eff.mapv(f64::ln);
    let avg_log_cpm = average_log_cpm(&filtered.counts, &eff);
    let avg_vec = avg_log_cpm.to_vec();
    let x = design.matrix();
    let df_residual = n as f64 - p as f64;
    if df_residual <= 0.0 {
        warn!("saturated design ({n} samples, {p} coefficients); test statistics will be undefined");
    }

    // Poisson pass for conditional method-of-moments dispersions.
    let poisson: Vec<GeneFit> = (0..g)
        .into_par_iter()
        .map(|i| fit_gene(&filtered.counts.row(i), x, &offsets, 0.0, opts))
        .collect();
    let phi_mom: Vec<f64> = poisson
        .iter()
        .enumerate()
        .map(|(i, pf)| mom_dispersion(&filtered.counts.row(i), &pf.mu, df_residual))
        .collect();
    let phi_trend = binned_trend(&avg_vec, &phi_mom, opts.n_trend_bins);
    let dispersion = shrink_to_trend(&phi_mom, &phi_trend);

    // Refit at the shrunk dispersions.
    let fits: Vec<GeneFit> = (0..g)
        .into_par_iter()
        .map(|i| fit_gene(&filtered.counts.row(i), x, &offsets, dispersion[i], opts))
        .collect();

    let mut coef = Array2::from_elem((g, p), f64::NAN);
    let mut cov = Vec::with_capacity(g);
    let mut deviance = Array1::from_elem(g, f64::NAN);
    for (i, fit) in fits.into_iter().enumerate() {
        coef.row_mut(i).assign(&fit.beta);
        cov.push(fit.cov);
        deviance[i] = fit.deviance;
    }

    let s2: Vec<f64> = deviance
        .iter()
        .map(|&d| if df_residual > 0.0 { d / df_residual } else { f64::NAN })
        .collect();
    let (s2_post, prior_df) = squeeze_variances(&s2, &avg_vec, df_residual, opts.n_trend_bins);

    Ok(GlmFit {
        genes: filtered.genes.clone(),
        design: design.clone(),
        coef,
        cov,
        deviance,
        dispersion: Array1::from(dispersion),
        s2_post: Array1::from(s2_post),
        prior_df,
        df_residual,
        avg_log_cpm,
    })
}

struct GeneFit {
    beta: Array1<f64>,
    cov: Array2<f64>,
    deviance: f64,
    mu: Array1<f64>,
}

fn fit_gene(
    y: &ArrayView1<f64>,
    x: &Array2<f64>,
    offsets: &Array1<f64>,
    phi: f64,
    opts: &FitOptions,
) -> GeneFit {
    let n = y.len();
    let p = x.ncols();
    let failed = || GeneFit {
        beta: Array1::from_elem(p, f64::NAN),
        cov: Array2::from_elem((p, p), f64::NAN),
        deviance: f64::NAN,
        mu: Array1::from_elem(n, f64::NAN),
    };

    let ridge = Array2::<f64>::eye(p) * opts.ridge;

    // Working-scale start from shifted log counts.
    let z0: Array1<f64> = y
        .iter()
        .zip(offsets)
        .map(|(&yi, &o)| (yi + 0.5).ln() - o)
        .collect();
    let xtx = x.t().dot(x) + &ridge;
    let mut beta = match xtx.solveh(&x.t().dot(&z0)) {
        Ok(b) => b,
        Err(_) => return failed(),
    };

    let mut deviance = f64::INFINITY;
    for _ in 0..opts.max_iterations {
        let eta = x.dot(&beta) + offsets;
        let mu = eta.mapv(|e| e.min(MAX_ETA).exp().max(MIN_MU));
        let dev = nb_deviance(y, &mu, phi);
        if !dev.is_finite() {
            return failed();
        }
        let done = (dev - deviance).abs() / (dev.abs() + 0.1) < opts.tolerance;
        deviance = dev;
        if done {
            break;
        }

        let weights = mu.mapv(|m| m / (1.0 + phi * m));
        let z: Array1<f64> = (0..n)
            .map(|i| (eta[i] - offsets[i]) + (y[i] - mu[i]) / mu[i])
            .collect();
        let mut xw = x.to_owned();
        for (i, mut row) in xw.axis_iter_mut(Axis(0)).enumerate() {
            row *= weights[i];
        }
        let xtwx = x.t().dot(&xw) + &ridge;
        let rhs = x.t().dot(&(&weights * &z));
        beta = match xtwx.solveh(&rhs) {
            Ok(b) => b,
            Err(_) => return failed(),
        };
        if !beta.iter().all(|v| v.is_finite()) {
            return failed();
        }
    }

    // Deviance and covariance at the final coefficients.
    let eta = x.dot(&beta) + offsets;
    let mu = eta.mapv(|e| e.min(MAX_ETA).exp().max(MIN_MU));
    let deviance = nb_deviance(y, &mu, phi);
    let weights = mu.mapv(|m| m / (1.0 + phi * m));
    let mut xw = x.to_owned();
    for (i, mut row) in xw.axis_iter_mut(Axis(0)).enumerate() {
        row *= weights[i];
    }
    let xtwx = x.t().dot(&xw) + &ridge;
    let cov = match xtwx.invh() {
        Ok(c) => c,
        Err(_) => return failed(),
    };
    GeneFit {
        beta,
        cov,
        deviance,
        mu,
    }
}

/// Residual deviance of a negative-binomial fit; `phi == 0` degenerates to
/// the Poisson deviance.
fn nb_deviance(y: &ArrayView1<f64>, mu: &Array1<f64>, phi: f64) -> f64 {
    let mut dev = 0.0;
    for (&yi, &m) in y.iter().zip(mu) {
        let a = if yi > 0.0 { yi * (yi / m).ln() } else { 0.0 };
        let b = if phi > 0.0 {
            let r = 1.0 / phi;
            (yi + r) * ((yi + r) / (m + r)).ln()
        } else {
            yi - m
        };
        dev += 2.0 * (a - b);
    }
    dev
}

/// Conditional method-of-moments dispersion given fitted means.
fn mom_dispersion(y: &ArrayView1<f64>, mu: &Array1<f64>, df_residual: f64) -> f64 {
    if df_residual <= 0.0 {
        return 0.0;
    }
    let mut acc = 0.0;
    for (&yi, &m) in y.iter().zip(mu) {
        if !m.is_finite() || m <= 0.0 {
            return f64::NAN;
        }
        let d = yi - m;
        acc += (d * d - m) / (m * m);
    }
    (acc / df_residual).max(0.0)
}

/// Binned-median trend of `y` over `x`, evaluated back at every `x` by
/// linear interpolation between bin medians and held flat past the ends.
/// NaN responses are left out of the bin statistics.
fn binned_trend(x: &[f64], y: &[f64], max_bins: usize) -> Vec<f64> {
    let g = x.len();
    if g == 0 {
        return Vec::new();
    }
    let finite: Vec<f64> = y.iter().copied().filter(|v| v.is_finite()).collect();
    let fallback = if finite.is_empty() {
        f64::NAN
    } else {
        finite.median()
    };

    let n_bins = max_bins.max(1).min((g / 10).max(1));
    if n_bins < 2 {
        return vec![fallback; g];
    }

    let mut order: Vec<usize> = (0..g).collect();
    order.sort_by(|&i, &j| x[i].partial_cmp(&x[j]).unwrap_or(Ordering::Equal));

    let mut centers = Vec::with_capacity(n_bins);
    let mut medians = Vec::with_capacity(n_bins);
    for b in 0..n_bins {
        let lo = b * g / n_bins;
        let hi = (b + 1) * g / n_bins;
        if lo >= hi {
            continue;
        }
        let xs: Vec<f64> = order[lo..hi].iter().map(|&i| x[i]).collect();
        let ys: Vec<f64> = order[lo..hi]
            .iter()
            .map(|&i| y[i])
            .filter(|v| v.is_finite())
            .collect();
        centers.push(xs.median());
        medians.push(if ys.is_empty() { fallback } else { ys.median() });
    }
    if centers.len() < 2 {
        return vec![fallback; g];
    }

    x.iter()
        .map(|&xi| interpolate(&centers, &medians, xi))
        .collect()
}

fn interpolate(cx: &[f64], cy: &[f64], x: f64) -> f64 {
    if !x.is_finite() {
        return cy[cy.len() / 2];
    }
    if x <= cx[0] {
        return cy[0];
    }
    let last = cx.len() - 1;
    if x >= cx[last] {
        return cy[last];
    }
    for j in 0..last {
        if x <= cx[j + 1] {
            let dx = cx[j + 1] - cx[j];
            if dx <= 0.0 {
                return cy[j + 1];
            }
            return cy[j] + (cy[j + 1] - cy[j]) * (x - cx[j]) / dx;
        }
    }
    cy[last]
}

/// Squeezes raw dispersions toward the abundance trend. The pooling weight
/// is the ratio of total spread to residual spread around the trend,
/// clamped to the unit interval.
fn shrink_to_trend(phi: &[f64], trend: &[f64]) -> Vec<f64> {
    let pairs: Vec<(f64, f64)> = phi
        .iter()
        .zip(trend)
        .filter(|(p, t)| p.is_finite() && t.is_finite())
        .map(|(&p, &t)| (p, t))
        .collect();
    let g = pairs.len() as f64;
    let delta = if g > 2.0 {
        let mean_phi = pairs.iter().map(|&(p, _)| p).sum::<f64>() / g;
        let total = pairs
            .iter()
            .map(|&(p, _)| (p - mean_phi) * (p - mean_phi))
            .sum::<f64>()
            / (g - 1.0);
        let resid = pairs
            .iter()
            .map(|&(p, t)| (p - t) * (p - t))
            .sum::<f64>()
            / (g - 2.0);
        if resid > 0.0 {
            (total / resid).clamp(0.0, 1.0)
        } else {
            1.0
        }
    } else {
        1.0
    };

    phi.iter()
        .zip(trend)
        .map(|(&p, &t)| {
            if p.is_finite() && t.is_finite() {
                ((1.0 - delta) * p + delta * t).max(0.0)
            } else if t.is_finite() {
                t.max(0.0)
            } else {
                0.0
            }
        })
        .collect()
}

/// Log-scale moment match of residual variances against a scaled
/// chi-square, returning moderated variances and the prior degrees of
/// freedom.
fn squeeze_variances(s2: &[f64], avg: &[f64], df: f64, max_bins: usize) -> (Vec<f64>, f64) {
    let g = s2.len();
    if df <= 0.0 {
        return (vec![f64::NAN; g], f64::NAN);
    }
    let s2_trend: Vec<f64> = binned_trend(avg, s2, max_bins)
        .iter()
        .map(|&v| if v.is_finite() { v.max(MIN_S2) } else { MIN_S2 })
        .collect();

    let half = df / 2.0;
    let e: Vec<f64> = s2
        .iter()
        .filter(|v| v.is_finite())
        .map(|&v| v.max(MIN_S2).ln() - digamma(half) + half.ln())
        .collect();
    let prior_df = if e.len() > 1 {
        let excess = e.var(1.0) - trigamma(half);
        if excess > 0.0 {
            2.0 * trigamma_inverse(excess)
        } else {
            f64::INFINITY
        }
    } else {
        f64::INFINITY
    };

    let s2_post = s2
        .iter()
        .zip(&s2_trend)
        .map(|(&v, &t)| {
            if !v.is_finite() {
                f64::NAN
            } else if prior_df.is_finite() {
                (prior_df * t + df * v.max(MIN_S2)) / (prior_df + df)
            } else {
                t
            }
        })
        .collect();
    (s2_post, prior_df)
}
