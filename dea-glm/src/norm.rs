//! Composition-aware library normalization and independent expression
//! filtering, following the trimmed mean of M-values recipe: pick the
//! sample whose upper-quartile CPM is closest to the average as reference,
//! trim extreme log-ratios and log-abundances against it, and average the
//! surviving log-ratios with inverse asymptotic-variance weights.

use crate::design::DesignMatrix;
use crate::error::{GlmError, Result};
use crate::stat::Statistics;
use itertools::izip;
use log::debug;
use ndarray::{Array1, Array2, ArrayView1, Axis};
use noisy_float::prelude::*;
use std::cmp::Ordering;

const LOGRATIO_TRIM: f64 = 0.3;
const SUM_TRIM: f64 = 0.05;
const TOL: f64 = 1e-14;

/// Tuning knobs for the expression filter.
#[derive(Clone, Debug)]
pub struct FilterOptions {
    /// Count a gene must reach, on the scale of the median library, to be
    /// considered expressed in a sample.
    pub min_count: f64,
    /// Minimum total count across all samples.
    pub min_total_count: f64,
    /// Group-size threshold beyond which the required sample count is
    /// damped toward a proportion.
    pub large_n: f64,
    /// Proportion applied past `large_n`.
    pub min_prop: f64,
}

impl Default for FilterOptions {
    fn default() -> FilterOptions {
        FilterOptions {
            min_count: 10.0,
            min_total_count: 15.0,
            large_n: 10.0,
            min_prop: 0.7,
        }
    }
}

/// Count rows retained by the expression filter together with their
/// normalization state, ready for GLM fitting.
#[derive(Clone, Debug)]
pub struct FilteredCounts {
    /// Retained rows, genes x samples.
    pub counts: Array2<f64>,
    /// Gene identifiers of the retained rows.
    pub genes: Vec<String>,
    /// Row positions of the retained genes in the source matrix.
    pub kept: Vec<usize>,
    /// Library sizes recomputed over the retained rows.
    pub lib_sizes: Array1<f64>,
    /// TMM scaling factors, geometric mean one.
    pub norm_factors: Array1<f64>,
}

impl FilteredCounts {
    /// Number of retained genes.
    pub fn n_genes(&self) -> usize {
        self.counts.nrows()
    }

    /// Number of samples.
    pub fn n_samples(&self) -> usize {
        self.counts.ncols()
    }

    /// Library sizes scaled by their normalization factors.
    pub fn effective_lib_sizes(&self) -> Array1<f64> {
        &self.lib_sizes * &self.norm_factors
    }

    /// Natural-log GLM offsets, one per sample.
    pub fn offsets(&self) -> Array1<f64> {
        self.effective_lib_sizes().mapv(f64::ln)
    }
}

/// Runs the expression filter against `design`, subsets the count matrix,
/// and computes TMM factors over the retained rows.
pub fn filter_and_normalize(
    counts: &Array2<f64>,
    genes: &[String],
    design: &DesignMatrix,
    opts: &FilterOptions,
) -> Result<FilteredCounts> {
    if genes.len() != counts.nrows() {
        return Err(GlmError::Dimension {
            detail: format!("{} gene ids for {} count rows", genes.len(), counts.nrows()),
        });
    }
    let kept = filter_by_expression(counts, design, opts)?;
    debug!("expression filter retained {}/{} genes", kept.len(), counts.nrows());

    let sub = counts.select(Axis(0), &kept);
    let lib_sizes = sub.sum_axis(Axis(0));
    let norm_factors = tmm_norm_factors(&sub);
    let genes = kept.iter().map(|&i| genes[i].clone()).collect();
    Ok(FilteredCounts {
        counts: sub,
        genes,
        kept,
        lib_sizes,
        norm_factors,
    })
}

/// Indices of rows worth modelling: expressed above a median-library CPM
/// cutoff in at least as many samples as the smallest design cell, with a
/// floor on the total count.
pub fn filter_by_expression(
    counts: &Array2<f64>,
    design: &DesignMatrix,
    opts: &FilterOptions,
) -> Result<Vec<usize>> {
    if design.n_samples() != counts.ncols() {
        return Err(GlmError::Dimension {
            detail: format!(
                "design over {} samples against {} count columns",
                design.n_samples(),
                counts.ncols()
            ),
        });
    }

    let lib: Vec<f64> = counts.sum_axis(Axis(0)).to_vec();
    let median_lib = lib.median();
    if !(median_lib > 0.0) {
        return Ok(Vec::new());
    }
    let cpm_cutoff = opts.min_count / median_lib * 1e6;

    // Smallest design cell via the hat diagonal, damped for large cells.
    let hat = design.hat_diagonal()?;
    let hmax = hat.iter().cloned().fold(0.0f64, f64::max);
    let mut min_samples = if hmax > 0.0 { 1.0 / hmax } else { 1.0 };
    if min_samples > opts.large_n {
        min_samples = opts.large_n + (min_samples - opts.large_n) * opts.min_prop;
    }

    let mut kept = Vec::new();
    for (i, row) in counts.axis_iter(Axis(0)).enumerate() {
        let expressed = row
            .iter()
            .zip(&lib)
            .filter(|&(&y, &l)| l > 0.0 && y / l * 1e6 >= cpm_cutoff)
            .count() as f64;
        let total: f64 = row.sum();
        if expressed >= min_samples - TOL && total >= opts.min_total_count - TOL {
            kept.push(i);
        }
    }
    Ok(kept)
}

/// Trimmed mean of M-values scaling factor for every sample, normalized to
/// geometric mean one. Degenerate columns (no genes shared with the
/// reference) get factor 1.
pub fn tmm_norm_factors(counts: &Array2<f64>) -> Array1<f64> {
    let n_samples = counts.ncols();
    if n_samples == 0 {
        return Array1::zeros(0);
    }
    let lib: Vec<f64> = counts.sum_axis(Axis(0)).to_vec();

    // Upper-quartile CPM per sample; the reference sits closest to the mean.
    let uq: Vec<f64> = (0..n_samples)
        .map(|s| {
            if lib[s] > 0.0 {
                let profile: Vec<f64> = counts.column(s).iter().map(|&y| y / lib[s]).collect();
                profile.percentile(75.0)
            } else {
                0.0
            }
        })
        .collect();
    let mean_uq = uq.mean();
    let reference = (0..n_samples)
        .min_by_key(|&s| n64((uq[s] - mean_uq).abs()))
        .unwrap_or(0);

    let ref_col = counts.column(reference);
    let mut factors = Array1::from_elem(n_samples, 1.0);
    for s in 0..n_samples {
        factors[s] = tmm_pair(&counts.column(s), &ref_col, lib[s], lib[reference]);
    }

    // Renormalize so the factors multiply to one.
    let log_mean = factors.mapv(f64::ln).mean().unwrap_or(0.0);
    factors / log_mean.exp()
}

fn tmm_pair(obs: &ArrayView1<f64>, reference: &ArrayView1<f64>, lib_obs: f64, lib_ref: f64) -> f64 {
    if !(lib_obs > 0.0) || !(lib_ref > 0.0) {
        return 1.0;
    }

    let mut m = Vec::new();
    let mut a = Vec::new();
    let mut asy_var = Vec::new();
    for (&y, &r) in izip!(obs.iter(), reference.iter()) {
        if y > 0.0 && r > 0.0 {
            let p = y / lib_obs;
            let q = r / lib_ref;
            m.push((p / q).log2());
            a.push(0.5 * (p * q).log2());
            asy_var.push((lib_obs - y) / (lib_obs * y) + (lib_ref - r) / (lib_ref * r));
        }
    }
    if m.is_empty() {
        return 1.0;
    }
    let max_abs = m.iter().fold(0.0f64, |acc, &x| acc.max(x.abs()));
    if max_abs < 1e-6 {
        return 1.0;
    }

    // Double trim by rank: 30% of the log-ratios off each end, 5% of the
    // log-abundances.
    let n = m.len() as f64;
    let rank_m = ordinal_ranks(&m);
    let rank_a = ordinal_ranks(&a);
    let lo_m = (n * LOGRATIO_TRIM).floor() + 1.0;
    let hi_m = n + 1.0 - lo_m;
    let lo_a = (n * SUM_TRIM).floor() + 1.0;
    let hi_a = n + 1.0 - lo_a;

    let mut num = 0.0;
    let mut den = 0.0;
    for i in 0..m.len() {
        let keep = rank_m[i] >= lo_m && rank_m[i] <= hi_m && rank_a[i] >= lo_a && rank_a[i] <= hi_a;
        if keep && asy_var[i] > 0.0 {
            num += m[i] / asy_var[i];
            den += 1.0 / asy_var[i];
        }
    }
    if den <= 0.0 {
        return 1.0;
    }
    let factor = (num / den).exp2();
    if factor.is_finite() && factor > 0.0 {
        factor
    } else {
        1.0
    }
}

fn ordinal_ranks(values: &[f64]) -> Vec<f64> {
    let mut order: Vec<usize> = (0..values.len()).collect();
    order.sort_by(|&i, &j| values[i].partial_cmp(&values[j]).unwrap_or(Ordering::Equal));
    let mut ranks = vec![0.0; values.len()];
    for (r, &i) in order.iter().enumerate() {
        ranks[i] = (r + 1) as f64;
    }
    ranks
}

/// Average log2 CPM per gene with a half-count prior, shared across every
/// downstream table as the `avgExpr` column.
pub fn average_log_cpm(counts: &Array2<f64>, effective_lib: &Array1<f64>) -> Array1<f64> {
    let total: f64 = effective_lib.sum();
    counts
        .axis_iter(Axis(0))
        .map(|row| ((row.sum() + 0.5) / (total + 1.0) * 1e6).log2())
        .collect()
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::design::{DesignMatrix, Formula};
    use assert_approx_eq::assert_approx_eq;
    use dea_types::{Condition, CovariateTable, Day, Processing, SampleInfo, Sex};
    use ndarray::array;

    fn two_group_design(n_a: usize, n_b: usize) -> DesignMatrix {
        let mut infos = Vec::new();
        for _ in 0..n_a {
            infos.push(SampleInfo::new("TdT", Sex::F, Condition::Naive, Day::Seven, Processing::Ip).unwrap());
        }
        for _ in 0..n_b {
            infos.push(SampleInfo::new("TdT", Sex::M, Condition::Sni, Day::Two, Processing::Ip).unwrap());
        }
        let parent = CovariateTable::new(infos);
        let idx: Vec<usize> = (0..n_a + n_b).collect();
        let t = parent.subset(&idx);
        DesignMatrix::build(&t, &Formula::of_mains(&["cond_day"])).unwrap()
    }

    #[test]
    fn test_tmm_equal_composition() {
        // Sample two is a straight 3x scaling of sample one.
        let counts = array![[10.0, 30.0], [20.0, 60.0], [5.0, 15.0]];
        let factors = tmm_norm_factors(&counts);
        assert_approx_eq!(factors[0], 1.0, 1e-12);
        assert_approx_eq!(factors[1], 1.0, 1e-12);
    }

    #[test]
    fn test_tmm_composition_shift() {
        // One gene swallows half of the third sample's library; its factor
        // must drop below one to compensate.
        let n_genes = 101;
        let mut counts = Array2::from_elem((n_genes, 3), 100.0);
        counts[[0, 2]] = 10_000.0;

        let factors = tmm_norm_factors(&counts);
        let product: f64 = factors.iter().product();
        assert_approx_eq!(product, 1.0, 1e-9);
        assert!(factors[2] < 1.0);
        assert!(factors[0] > 1.0);
        // All surviving log-ratios equal log2(10100/20000), so the
        // unscaled third factor is exactly that ratio.
        assert_approx_eq!(factors[2] / factors[0], 10_100.0 / 20_000.0, 1e-9);
        assert_approx_eq!(factors[0], factors[1], 1e-12);
    }

    #[test]
    fn test_tmm_empty_library_keeps_unit_factor() {
        // A sample with no counts shares nothing with the reference and
        // keeps factor one.
        let counts = array![[10.0, 30.0, 0.0], [20.0, 60.0, 0.0], [5.0, 15.0, 0.0]];
        let factors = tmm_norm_factors(&counts);
        for s in 0..3 {
            assert_approx_eq!(factors[s], 1.0, 1e-12);
        }
    }

    #[test]
    fn test_filter_by_expression() {
        let design = two_group_design(3, 2);
        // Columns sum to 100, so the CPM cutoff corresponds to a count of 10.
        let counts = array![
            [30.0, 30.0, 30.0, 0.0, 0.0],
            [5.0, 5.0, 5.0, 5.0, 5.0],
            [0.0, 0.0, 0.0, 60.0, 0.0],
            [12.0, 12.0, 12.0, 0.0, 0.0],
            [53.0, 53.0, 53.0, 35.0, 95.0],
        ];
        let kept = filter_by_expression(&counts, &design, &FilterOptions::default()).unwrap();
        assert_eq!(kept, vec![0, 3, 4]);

        let strict = FilterOptions {
            min_total_count: 100.0,
            ..FilterOptions::default()
        };
        let kept = filter_by_expression(&counts, &design, &strict).unwrap();
        assert_eq!(kept, vec![4]);
    }

    #[test]
    fn test_filter_damps_large_groups() {
        let design = two_group_design(20, 20);
        // Required samples: 10 + (20 - 10) * 0.7 = 17.
        let n = 40;
        let mut counts = Array2::zeros((3, n));
        for s in 0..16 {
            counts[[0, s]] = 20.0;
        }
        for s in 0..17 {
            counts[[1, s]] = 20.0;
        }
        for s in 0..n {
            let used = counts[[0, s]] + counts[[1, s]];
            counts[[2, s]] = 100.0 - used;
        }
        let kept = filter_by_expression(&counts, &design, &FilterOptions::default()).unwrap();
        assert_eq!(kept, vec![1, 2]);
    }

    #[test]
    fn test_filter_and_normalize_recomputes_libs() {
        let design = two_group_design(3, 2);
        let counts = array![
            [30.0, 30.0, 30.0, 0.0, 0.0],
            [5.0, 5.0, 5.0, 5.0, 5.0],
            [0.0, 0.0, 0.0, 60.0, 0.0],
            [12.0, 12.0, 12.0, 0.0, 0.0],
            [53.0, 53.0, 53.0, 35.0, 95.0],
        ];
        let genes: Vec<String> = (0..5).map(|i| format!("g{i}")).collect();
        let filtered =
            filter_and_normalize(&counts, &genes, &design, &FilterOptions::default()).unwrap();

        assert_eq!(filtered.genes, vec!["g0", "g3", "g4"]);
        assert_eq!(filtered.kept, vec![0, 3, 4]);
        assert_approx_eq!(filtered.lib_sizes[0], 95.0, 1e-12);
        assert_approx_eq!(filtered.lib_sizes[3], 35.0, 1e-12);
        let product: f64 = filtered.norm_factors.iter().product();
        assert_approx_eq!(product, 1.0, 1e-9);
    }

    #[test]
    fn test_average_log_cpm() {
        let counts = array![[10.0, 30.0]];
        let lib = array![1000.0, 3000.0];
        let avg = average_log_cpm(&counts, &lib);
        assert_approx_eq!(avg[0], (40.5 / 4001.0 * 1e6).log2(), 1e-12);
    }
}
