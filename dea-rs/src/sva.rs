//! Surrogate-variable estimation in the spirit of iteratively re-weighted
//! SVA: hidden structure is read off the residuals of the null model, genes
//! are re-weighted by how much they track that structure rather than the
//! biology, and the decomposition is repeated on the weighted matrix.

use anyhow::{bail, format_err, Error};
use dea_glm::design::{ols_coefficients, ols_residuals, DesignMatrix, Formula};
use dea_glm::stat::{adjusted_pvalue_bh, f_tail};
use dea_types::CovariateTable;
use log::warn;
use ndarray::{concatenate, s, Array1, Array2, Axis};
use ndarray_linalg::svddc::JobSvd;
use ndarray_linalg::SVDDCInto;

/// Cap on the re-weighting rounds.
const MAX_ROUNDS: usize = 5;

/// Largest per-gene weight change below which the loop stops early.
const WEIGHT_TOL: f64 = 1e-8;

/// Estimates up to `n_sv` surrogate variables from a genes x samples matrix
/// of log-scale expression.
///
/// `full` is the model with the biology of interest, `null` the model
/// without it; both get an implicit intercept. The request is clamped to
/// the residual degrees of freedom left by the null model (and to the
/// matrix rank), so asking for more components than the data can identify
/// quietly returns fewer. The result is samples x k with orthonormal
/// columns; `k == 0` means nothing was identifiable.
pub fn estimate_surrogate_variables(
    log_expr: &Array2<f64>,
    covariates: &CovariateTable,
    full: &Formula,
    null: &Formula,
    n_sv: usize,
) -> Result<Array2<f64>, Error> {
    let n = log_expr.ncols();
    if covariates.len() != n {
        bail!(
            "expression over {n} samples against a covariate table of {}",
            covariates.len()
        );
    }
    if n_sv == 0 {
        return Ok(Array2::zeros((n, 0)));
    }

    let x_full = DesignMatrix::build(covariates, full)?;
    let x_null = DesignMatrix::build(covariates, null)?;
    let p_full = x_full.n_coefficients();
    let p_null = x_null.n_coefficients();
    if p_full <= p_null {
        bail!("the full model must extend the null model");
    }

    let k = n_sv
        .min(n.saturating_sub(p_null))
        .min(log_expr.nrows())
        .min(n);
    if k < n_sv {
        warn!("requested {n_sv} surrogate variables but only {k} are identifiable");
    }
    if k == 0 {
        return Ok(Array2::zeros((n, 0)));
    }

    let rss_null = residual_sumsq(log_expr, x_null.matrix())?;
    let resid = ols_residuals(log_expr, x_null.matrix())?;
    let mut sv = right_singular_vectors(resid, k)?;

    let mut prev: Option<Array1<f64>> = None;
    for _ in 0..MAX_ROUNDS {
        let full_sv = concatenate(Axis(1), &[x_full.matrix().view(), sv.view()])?;
        let null_sv = concatenate(Axis(1), &[x_null.matrix().view(), sv.view()])?;
        let rss_full_sv = residual_sumsq(log_expr, &full_sv)?;
        let rss_null_sv = residual_sumsq(log_expr, &null_sv)?;

        let p_primary = nested_f_pvalues(
            &rss_null_sv,
            &rss_full_sv,
            (p_full - p_null) as f64,
            n as f64 - (p_full + k) as f64,
        );
        let p_sv = nested_f_pvalues(
            &rss_null,
            &rss_null_sv,
            k as f64,
            n as f64 - (p_null + k) as f64,
        );
        let q_primary = qvalues(&p_primary);
        let q_sv = qvalues(&p_sv);

        // High weight: tracks the surrogate structure, not the biology.
        let weights: Array1<f64> = q_primary
            .iter()
            .zip(&q_sv)
            .map(|(&qp, &qs)| {
                if qp.is_nan() || qs.is_nan() {
                    0.0
                } else {
                    ((1.0 - qs) * qp).clamp(0.0, 1.0)
                }
            })
            .collect();

        let mut weighted = log_expr.to_owned();
        for (mut row, &w) in weighted.rows_mut().into_iter().zip(weights.iter()) {
            row *= w;
            let center = row.mean().unwrap_or(0.0);
            row -= center;
        }
        sv = right_singular_vectors(weighted, k)?;

        let converged = prev.as_ref().map_or(false, |p| {
            weights
                .iter()
                .zip(p.iter())
                .map(|(a, b)| (a - b).abs())
                .fold(0.0, f64::max)
                < WEIGHT_TOL
        });
        if converged {
            break;
        }
        prev = Some(weights);
    }
    Ok(sv)
}

/// Removes the surrogate-variable component from a genes x samples count
/// matrix.
///
/// Each gene's `log2(count + 0.5)` profile is regressed on the null design
/// augmented with the surrogate variables; the surrogate part of the fit is
/// subtracted, values return to the count scale (clamped at zero), and each
/// sample column is rescaled to its original total so the correction never
/// masquerades as a depth change. Zero surrogate variables make this the
/// identity.
pub fn correct_counts(
    counts: &Array2<f64>,
    covariates: &CovariateTable,
    null: &Formula,
    sv: &Array2<f64>,
) -> Result<Array2<f64>, Error> {
    if sv.nrows() != counts.ncols() {
        bail!(
            "surrogate variables cover {} samples but the counts have {}",
            sv.nrows(),
            counts.ncols()
        );
    }
    if sv.ncols() == 0 {
        return Ok(counts.clone());
    }

    let x_null = DesignMatrix::build(covariates, null)?;
    let design = concatenate(Axis(1), &[x_null.matrix().view(), sv.view()])?;
    let log_counts = counts.mapv(|v| (v + 0.5).log2());
    let beta = ols_coefficients(&log_counts, &design)?;
    let p_null = x_null.n_coefficients();
    let sv_effect = beta.slice(s![.., p_null..]).dot(&sv.t());

    let mut corrected = (&log_counts - &sv_effect).mapv(|v| (v.exp2() - 0.5).max(0.0));
    for (mut col, orig) in corrected.columns_mut().into_iter().zip(counts.columns()) {
        let total = col.sum();
        if total > 0.0 {
            col *= orig.sum() / total;
        }
    }
    Ok(corrected)
}

/// First `k` right singular vectors, as a samples x k matrix.
fn right_singular_vectors(mat: Array2<f64>, k: usize) -> Result<Array2<f64>, Error> {
    let svd = mat.svddc_into(JobSvd::Some)?;
    let vt = svd
        .2
        .ok_or_else(|| format_err!("SVD returned no right singular vectors"))?;
    Ok(vt.slice(s![..k, ..]).t().to_owned())
}

fn residual_sumsq(responses: &Array2<f64>, design: &Array2<f64>) -> Result<Array1<f64>, Error> {
    let resid = ols_residuals(responses, design)?;
    Ok(resid.map_axis(Axis(1), |row| row.dot(&row)))
}

/// Per-gene F-test of a nested model pair from residual sums of squares.
/// Degenerate degrees of freedom or a saturated fit give NaN.
fn nested_f_pvalues(
    rss_reduced: &Array1<f64>,
    rss_full: &Array1<f64>,
    df1: f64,
    df2: f64,
) -> Vec<f64> {
    rss_reduced
        .iter()
        .zip(rss_full.iter())
        .map(|(&r0, &r1)| {
            if df1 <= 0.0 || df2 <= 0.0 || !(r1 > 0.0) {
                return f64::NAN;
            }
            let f = ((r0 - r1).max(0.0) / df1) / (r1 / df2);
            f_tail(f, df1, df2)
        })
        .collect()
}

/// Storey-style q-values: the BH adjustment scaled by the estimated null
/// proportion `pi0 = min(1, #{p > 0.5} / (0.5 m))`. NaN passes through.
fn qvalues(pvalues: &[f64]) -> Vec<f64> {
    let tested: Vec<f64> = pvalues.iter().copied().filter(|p| !p.is_nan()).collect();
    if tested.is_empty() {
        return vec![f64::NAN; pvalues.len()];
    }
    let m = tested.len() as f64;
    let above = tested.iter().filter(|&&p| p > 0.5).count() as f64;
    let pi0 = (above / (0.5 * m)).min(1.0);

    let pairs: Vec<(usize, f64)> = pvalues.iter().copied().enumerate().collect();
    let mut q = vec![f64::NAN; pvalues.len()];
    for (idx, adj) in adjusted_pvalue_bh(&pairs) {
        if !adj.is_nan() {
            q[idx] = (pi0 * adj).min(1.0);
        }
    }
    q
}
