//! Baseline-relative fold changes on the log2 scale, plus the row-centered
//! clipped variant used for display scaling.

use crate::run::strata;
use anyhow::Error;
use dea_glm::stat::{percentile_of_sorted, Statistics};
use dea_types::matrix::{LOG2FC, SCALED_LFC};
use dea_types::{AnnotatedMatrix, SampleInfo};
use log::warn;
use ndarray::Array2;
use noisy_float::prelude::*;

/// Percentile of the absolute centered values at which display scaling
/// clips.
const CLIP_PERCENTILE: f64 = 99.0;

/// Per-gene log2 fold changes of `assay` against the mean of the baseline
/// samples, computed as `log2(x + 1)` differences.
///
/// With `group_by` set, every level of that factor forms its own stratum
/// with its own baseline mean; a stratum without a single baseline sample
/// keeps NaN in all of its columns and is reported in the log. The result
/// is a pure function of the inputs, so recomputing it can never drift.
pub fn log_fold_change(
    matrix: &AnnotatedMatrix,
    assay: &str,
    group_by: Option<&str>,
    baseline: impl Fn(&SampleInfo) -> bool,
) -> Result<Array2<f64>, Error> {
    let values = matrix.assay(assay)?;
    let log = values.mapv(|v| (v + 1.0).log2());
    let mut out = Array2::from_elem(log.dim(), f64::NAN);

    for (label, cols) in strata(matrix.covariates(), group_by)? {
        let base: Vec<usize> = cols
            .iter()
            .copied()
            .filter(|&j| baseline(matrix.covariates().info(j)))
            .collect();
        if base.is_empty() {
            warn!(
                "stratum `{}` has no baseline samples; its fold changes are NaN",
                label.as_deref().unwrap_or("all")
            );
            continue;
        }
        for g in 0..log.nrows() {
            let mean = base.iter().map(|&j| log[[g, j]]).sum::<f64>() / base.len() as f64;
            for &j in &cols {
                out[[g, j]] = log[[g, j]] - mean;
            }
        }
    }
    Ok(out)
}

/// Display scaling of a fold-change matrix: rows are centered on their
/// finite mean, then everything is clipped at a symmetric percentile of
/// the absolute centered values. NaN entries pass through untouched.
pub fn scaled_lfc(log_fc: &Array2<f64>) -> Array2<f64> {
    let mut out = log_fc.to_owned();
    for mut row in out.rows_mut() {
        let finite: Vec<f64> = row.iter().copied().filter(|v| v.is_finite()).collect();
        if finite.is_empty() {
            continue;
        }
        let center = finite.mean();
        row -= center;
    }

    let mut magnitudes: Vec<f64> = out
        .iter()
        .copied()
        .filter(|v| v.is_finite())
        .map(f64::abs)
        .collect();
    if magnitudes.is_empty() {
        return out;
    }
    magnitudes.sort_by_key(|&v| n64(v));
    let clip = percentile_of_sorted(&magnitudes, CLIP_PERCENTILE);
    out.mapv_inplace(|v| if v.is_finite() { v.clamp(-clip, clip) } else { v });
    out
}

/// Computes both fold-change assays from `assay` and attaches them under
/// `log2FC` and `scaledLFC`.
pub fn attach_fold_change_assays(
    matrix: &mut AnnotatedMatrix,
    assay: &str,
    group_by: Option<&str>,
    baseline: impl Fn(&SampleInfo) -> bool,
) -> Result<(), Error> {
    let lfc = log_fold_change(matrix, assay, group_by, baseline)?;
    matrix.add_assay(SCALED_LFC, scaled_lfc(&lfc))?;
    matrix.add_assay(LOG2FC, lfc)?;
    Ok(())
}
