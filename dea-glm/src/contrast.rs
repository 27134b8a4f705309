//! Symbolic contrasts over fitted models and their quasi-likelihood
//! F-tests.
//!
//! Contrast expressions are resolved against design column names at the
//! point of use, so the same contrast catalog can be thrown at every
//! stratum; a subset that lacks a level surfaces [`GlmError::UnknownTerm`]
//! rather than silently testing the wrong column.

use crate::design::DesignMatrix;
use crate::error::{GlmError, Result};
use crate::fit::GlmFit;
use crate::stat::{adjusted_pvalue_bh, f_tail};
use dea_types::{DeaRow, DeaTable};
use ndarray::{Array1, Array2};
use ndarray_linalg::SolveH;
use std::f64::consts::LN_2;

/// A named linear combination of design coefficients.
#[derive(Clone, Debug)]
pub struct Contrast {
    name: String,
    coefficients: Array1<f64>,
}

impl Contrast {
    /// Parses an expression like `cond_daySNI_2 - cond_daySham_2` or
    /// `0.5*sexM + cond_daySNI_7/2` against the design's column names.
    ///
    /// The grammar is a sum of signed terms; each term is an optional
    /// `<number>*` scale, a column name, and an optional `/<number>`
    /// divisor. A symbol matching no design column fails with
    /// [`GlmError::UnknownTerm`].
    pub fn parse(name: impl Into<String>, expression: &str, design: &DesignMatrix) -> Result<Contrast> {
        let name = name.into();
        let chars: Vec<char> = expression.chars().collect();
        let mut pos = 0;
        let mut coefficients = Array1::zeros(design.n_coefficients());
        let mut first = true;

        loop {
            skip_ws(&chars, &mut pos);
            if pos >= chars.len() {
                break;
            }
            if !first && chars[pos] != '+' && chars[pos] != '-' {
                return Err(syntax(&name, "expected `+` or `-` between terms"));
            }
            let mut sign = 1.0;
            if chars[pos] == '+' {
                pos += 1;
            } else if chars[pos] == '-' {
                sign = -1.0;
                pos += 1;
            }
            skip_ws(&chars, &mut pos);

            let mut scale = 1.0;
            if pos < chars.len() && chars[pos].is_ascii_digit() {
                scale = take_number(&chars, &mut pos)
                    .ok_or_else(|| syntax(&name, "malformed numeric scale"))?;
                skip_ws(&chars, &mut pos);
                if pos >= chars.len() || chars[pos] != '*' {
                    return Err(syntax(&name, "expected `*` after a numeric scale"));
                }
                pos += 1;
                skip_ws(&chars, &mut pos);
            }

            let ident = take_ident(&chars, &mut pos);
            if ident.is_empty() {
                return Err(syntax(&name, "expected a design column name"));
            }
            skip_ws(&chars, &mut pos);

            if pos < chars.len() && chars[pos] == '/' {
                pos += 1;
                skip_ws(&chars, &mut pos);
                let divisor = take_number(&chars, &mut pos)
                    .ok_or_else(|| syntax(&name, "expected a numeric divisor"))?;
                if divisor == 0.0 {
                    return Err(syntax(&name, "division by zero"));
                }
                scale /= divisor;
            }

            let column = design
                .column_index(&ident)
                .ok_or_else(|| GlmError::UnknownTerm {
                    contrast: name.clone(),
                    term: ident,
                })?;
            coefficients[column] += sign * scale;
            first = false;
        }
        if first {
            return Err(syntax(&name, "empty expression"));
        }
        Ok(Contrast { name, coefficients })
    }

    /// Wraps explicit coefficients, already aligned with the design.
    pub fn from_coefficients(name: impl Into<String>, coefficients: Array1<f64>) -> Contrast {
        Contrast {
            name: name.into(),
            coefficients,
        }
    }

    /// Contrast name, doubling as the result-table key.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Coefficient vector, aligned with the design columns.
    pub fn coefficients(&self) -> &Array1<f64> {
        &self.coefficients
    }
}

fn syntax(name: &str, detail: &str) -> GlmError {
    GlmError::ContrastSyntax {
        contrast: name.to_string(),
        detail: detail.to_string(),
    }
}

fn skip_ws(chars: &[char], pos: &mut usize) {
    while *pos < chars.len() && chars[*pos].is_whitespace() {
        *pos += 1;
    }
}

fn take_number(chars: &[char], pos: &mut usize) -> Option<f64> {
    let start = *pos;
    while *pos < chars.len() && (chars[*pos].is_ascii_digit() || chars[*pos] == '.') {
        *pos += 1;
    }
    if *pos == start {
        return None;
    }
    chars[start..*pos].iter().collect::<String>().parse().ok()
}

fn take_ident(chars: &[char], pos: &mut usize) -> String {
    let start = *pos;
    while *pos < chars.len() {
        let c = chars[*pos];
        if c.is_ascii_alphanumeric() || c == '_' || c == '.' || c == '(' || c == ')' {
            *pos += 1;
        } else {
            break;
        }
    }
    chars[start..*pos].iter().collect()
}

/// Tests one contrast per gene. The returned table carries log2 fold
/// changes alongside p-values and BH-adjusted FDRs, sorted by ascending
/// p-value with untestable genes last.
pub fn ql_f_test(fit: &GlmFit, contrast: &Contrast) -> Result<DeaTable> {
    let c = contrast.coefficients();
    if c.len() != fit.design.n_coefficients() {
        return Err(GlmError::Dimension {
            detail: format!(
                "contrast of length {} against {} coefficients",
                c.len(),
                fit.design.n_coefficients()
            ),
        });
    }
    let df2 = fit.df_residual + fit.prior_df;

    let n = fit.n_genes();
    let mut log_fc = vec![f64::NAN; n];
    let mut pvals = vec![f64::NAN; n];
    for g in 0..n {
        let est: f64 = c.dot(&fit.coef.row(g));
        log_fc[g] = est / LN_2;
        let unit_var = c.dot(&fit.cov[g].dot(c));
        let s2 = fit.s2_post[g];
        if est.is_finite() && unit_var > 0.0 && s2.is_finite() && s2 > 0.0 {
            pvals[g] = f_tail(est * est / (unit_var * s2), 1.0, df2);
        }
    }
    Ok(build_table(fit, contrast.name(), Some(log_fc), pvals))
}

/// Joint F-test of several contrasts at once, for any-effect questions
/// such as "does cond_day matter at all". The resulting table carries no
/// fold-change column, so selection falls back to its strict FDR rule.
pub fn ql_f_test_joint(
    fit: &GlmFit,
    name: impl Into<String>,
    contrasts: &[Contrast],
) -> Result<DeaTable> {
    let name = name.into();
    if contrasts.is_empty() {
        return Err(GlmError::EmptyJointTest { name });
    }
    let p = fit.design.n_coefficients();
    let k = contrasts.len();
    let mut cmat = Array2::zeros((p, k));
    for (j, contrast) in contrasts.iter().enumerate() {
        if contrast.coefficients().len() != p {
            return Err(GlmError::Dimension {
                detail: format!(
                    "contrast `{}` of length {} against {p} coefficients",
                    contrast.name(),
                    contrast.coefficients().len()
                ),
            });
        }
        cmat.column_mut(j).assign(contrast.coefficients());
    }
    let df2 = fit.df_residual + fit.prior_df;
    let kf = k as f64;

    let mut pvals = vec![f64::NAN; fit.n_genes()];
    for g in 0..fit.n_genes() {
        let q = cmat.t().dot(&fit.coef.row(g));
        if !q.iter().all(|v| v.is_finite()) {
            continue;
        }
        let s2 = fit.s2_post[g];
        if !(s2.is_finite() && s2 > 0.0) {
            continue;
        }
        let m = cmat.t().dot(&fit.cov[g].dot(&cmat));
        if let Ok(z) = m.solveh(&q) {
            let quad = q.dot(&z);
            if quad.is_finite() && quad >= 0.0 {
                pvals[g] = f_tail(quad / (kf * s2), kf, df2);
            }
        }
    }
    Ok(build_table(fit, &name, None, pvals))
}

fn build_table(fit: &GlmFit, name: &str, log_fc: Option<Vec<f64>>, pvals: Vec<f64>) -> DeaTable {
    let pairs: Vec<(usize, f64)> = pvals.iter().copied().enumerate().collect();
    let mut fdr = vec![f64::NAN; pvals.len()];
    for (idx, adj) in adjusted_pvalue_bh(&pairs) {
        fdr[idx] = adj;
    }
    let rows = (0..pvals.len())
        .map(|g| DeaRow {
            gene: fit.genes[g].clone(),
            log_fc: log_fc.as_ref().map(|v| v[g]),
            p_value: pvals[g],
            fdr: fdr[g],
            avg_expr: fit.avg_log_cpm[g],
        })
        .collect();
    DeaTable::new(name, log_fc.is_some(), rows)
}
