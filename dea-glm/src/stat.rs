//! Scalar statistics shared across the crate: slice summaries, the
//! Benjamini-Hochberg adjustment, F-distribution tails, and the polygamma
//! helpers needed for moderated variance estimation.

use dea_types::result::cmp_pvalue;
use num_traits::ToPrimitive;
use statrs::distribution::{ChiSquared, ContinuousCDF, FisherSnedecor};
use std::cmp::Ordering;

/// Summary statistics over a numeric slice.
pub trait Statistics {
    /// Scalar type of the results.
    type Value;

    /// Compensated sum of all values.
    fn sum(&self) -> Self::Value;

    /// Arithmetic mean, 0.0 for an empty slice.
    fn mean(&self) -> Self::Value;

    /// Variance with `ddof` delta degrees of freedom, 0.0 when fewer
    /// values than `ddof + 1` are present.
    fn var(&self, ddof: f64) -> Self::Value;

    /// Value below which `pct` percent of the values fall, interpolating
    /// linearly between order statistics. Panics on an empty slice.
    fn percentile(&self, pct: f64) -> Self::Value;

    /// 50th percentile.
    fn median(&self) -> Self::Value;
}

impl<T: ToPrimitive + PartialOrd + Copy> Statistics for [T] {
    type Value = f64;

    fn sum(&self) -> f64 {
        // Neumaier variant of compensated summation; count slices mix
        // magnitudes aggressively once CPM scaling is involved.
        let mut total = 0.0f64;
        let mut comp = 0.0f64;
        for v in self {
            let x = v.to_f64().unwrap_or(f64::NAN);
            let t = total + x;
            if total.abs() >= x.abs() {
                comp += (total - t) + x;
            } else {
                comp += (x - t) + total;
            }
            total = t;
        }
        total + comp
    }

    fn mean(&self) -> f64 {
        if self.is_empty() {
            return 0.0;
        }
        self.sum() / self.len() as f64
    }

    fn var(&self, ddof: f64) -> f64 {
        let denom = self.len() as f64 - ddof;
        if denom <= 0.0 {
            return 0.0;
        }
        let mean = self.mean();
        let ss: f64 = self
            .iter()
            .map(|v| {
                let d = v.to_f64().unwrap_or(f64::NAN) - mean;
                d * d
            })
            .sum();
        ss / denom
    }

    fn percentile(&self, pct: f64) -> f64 {
        assert!(!self.is_empty());
        let mut sorted: Vec<f64> = self
            .iter()
            .map(|v| v.to_f64().unwrap_or(f64::NAN))
            .collect();
        sorted.sort_by(|a, b| a.partial_cmp(b).unwrap_or(Ordering::Equal));
        percentile_of_sorted(&sorted, pct)
    }

    fn median(&self) -> f64 {
        self.percentile(50.0)
    }
}

/// Linear interpolation between the order statistics of an already
/// sorted slice. `pct` is on the 0-100 scale.
pub fn percentile_of_sorted(sorted: &[f64], pct: f64) -> f64 {
    assert!(!sorted.is_empty());
    debug_assert!((0.0..=100.0).contains(&pct));
    if sorted.len() == 1 || pct >= 100.0 {
        return sorted[sorted.len() - 1];
    }
    let rank = (pct / 100.0) * (sorted.len() - 1) as f64;
    let lo = rank.floor();
    let i = lo as usize;
    sorted[i] + (sorted[i + 1] - sorted[i]) * (rank - lo)
}

/// Benjamini-Hochberg adjustment over `(index, p-value)` pairs.
///
/// NaN p-values pass through unchanged and do not count toward the number
/// of tests. The result is ordered by ascending p-value (NaN last); callers
/// scatter it back through the carried indices.
pub fn adjusted_pvalue_bh(pvalues: &[(usize, f64)]) -> Vec<(usize, f64)> {
    let mut arr = pvalues.to_vec();
    arr.sort_by(|&(_, a), &(_, b)| cmp_pvalue(a, b));

    let tested = arr.iter().take_while(|(_, p)| !p.is_nan()).count();
    let m = tested as f64;
    let mut running = 1.0f64;
    for rank in (0..tested).rev() {
        let scaled = arr[rank].1 * m / (rank + 1) as f64;
        if scaled < running {
            running = scaled;
        }
        arr[rank].1 = running.min(1.0);
    }
    arr
}

/// Upper tail of the F distribution; an infinite `df2` uses the
/// chi-square limit `df1 * F ~ chi2(df1)`.
pub fn f_tail(f_stat: f64, df1: f64, df2: f64) -> f64 {
    if !f_stat.is_finite() || f_stat < 0.0 || df1 <= 0.0 {
        return f64::NAN;
    }
    let p = if df2.is_finite() {
        if df2 <= 0.0 {
            return f64::NAN;
        }
        match FisherSnedecor::new(df1, df2) {
            Ok(dist) => 1.0 - dist.cdf(f_stat),
            Err(_) => return f64::NAN,
        }
    } else if df2 == f64::INFINITY {
        match ChiSquared::new(df1) {
            Ok(dist) => 1.0 - dist.cdf(df1 * f_stat),
            Err(_) => return f64::NAN,
        }
    } else {
        return f64::NAN;
    };
    p.clamp(0.0, 1.0)
}

/// Derivative of the digamma function, positive reals only.
///
/// Small arguments are shifted up by the recurrence
/// `psi'(x) = psi'(x + 1) + 1 / x^2` until the asymptotic expansion holds.
pub fn trigamma(x: f64) -> f64 {
    if !(x > 0.0) {
        return f64::NAN;
    }
    let mut x = x;
    let mut acc = 0.0;
    while x < 6.0 {
        acc += 1.0 / (x * x);
        x += 1.0;
    }
    let inv = 1.0 / (x * x);
    let tail = (((-1.0 / 30.0 * inv + 1.0 / 42.0) * inv - 1.0 / 30.0) * inv + 1.0 / 6.0) * inv;
    acc + 1.0 / x + 0.5 * inv + tail / x
}

/// Second derivative of the digamma function, positive reals only.
fn tetragamma(x: f64) -> f64 {
    if !(x > 0.0) {
        return f64::NAN;
    }
    let mut x = x;
    let mut acc = 0.0;
    while x < 6.0 {
        acc -= 2.0 / (x * x * x);
        x += 1.0;
    }
    let inv = 1.0 / x;
    let inv2 = inv * inv;
    let inv4 = inv2 * inv2;
    acc - inv2 - inv2 * inv - 0.5 * inv4 + inv4 * inv2 / 6.0 - inv4 * inv4 / 6.0
}

/// Inverse of [`trigamma`] by Newton iteration, used to moment-match the
/// prior degrees of freedom of the quasi-likelihood squeeze.
pub fn trigamma_inverse(x: f64) -> f64 {
    if !(x > 0.0) {
        return f64::NAN;
    }
    // Closed forms from the limits trigamma(y) ~ 1/y^2 (y -> 0) and
    // trigamma(y) ~ 1/y (y -> inf).
    if x > 1e7 {
        return 1.0 / x.sqrt();
    }
    if x < 1e-6 {
        return 1.0 / x;
    }
    let mut y = 0.5 + 1.0 / x;
    for _ in 0..50 {
        let tri = trigamma(y);
        let dif = tri * (1.0 - tri / x) / tetragamma(y);
        y += dif;
        if (dif / y).abs() < 1e-8 {
            break;
        }
    }
    y
}
