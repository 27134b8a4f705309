//! Treatment-coded design matrices expanded from covariate tables.
//!
//! Factors expand against their first declared level: a factor with levels
//! `[a, b, c]` contributes indicator columns `<name>b` and `<name>c`, and
//! the intercept carries the reference. Column names are deterministic so
//! contrasts can be written symbolically against them.

use crate::error::{GlmError, Result};
use dea_types::CovariateTable;
use ndarray::{Array1, Array2, Axis};
use ndarray_linalg::{InverseH, SVD};

/// One additive term of a model formula.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Term {
    /// Main effect of one covariate column, factor or numeric.
    Main(String),
    /// Pairwise interaction between two covariate columns.
    Interaction(String, String),
}

impl Term {
    /// Main effect of `name`.
    pub fn main(name: impl Into<String>) -> Term {
        Term::Main(name.into())
    }

    /// Interaction of `a` and `b`.
    pub fn interaction(a: impl Into<String>, b: impl Into<String>) -> Term {
        Term::Interaction(a.into(), b.into())
    }
}

/// An ordered additive formula with an implicit intercept.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Formula {
    terms: Vec<Term>,
}

impl Formula {
    /// Formula over the given terms, in order.
    pub fn new(terms: Vec<Term>) -> Formula {
        Formula { terms }
    }

    /// Formula of main effects only.
    pub fn of_mains(names: &[&str]) -> Formula {
        Formula {
            terms: names.iter().map(|n| Term::main(*n)).collect(),
        }
    }

    /// Appends a term after the existing ones.
    pub fn push(&mut self, term: Term) {
        self.terms.push(term);
    }

    /// Terms in declaration order.
    pub fn terms(&self) -> &[Term] {
        &self.terms
    }
}

/// A fully expanded, full-rank design matrix with named columns.
#[derive(Clone, Debug)]
pub struct DesignMatrix {
    cols: Array2<f64>,
    names: Vec<String>,
}

impl DesignMatrix {
    /// Expands `formula` against `table` into an `n x p` matrix with an
    /// `(Intercept)` column first.
    ///
    /// Fails with [`GlmError::RankDeficientDesign`] when a factor level in
    /// the declared domain has no samples (its indicator would be all
    /// zeros) or when the expanded columns are numerically collinear.
    /// Callers working on subsets are expected to drop empty levels before
    /// building.
    pub fn build(table: &CovariateTable, formula: &Formula) -> Result<DesignMatrix> {
        let n = table.len();
        if n == 0 {
            return Err(GlmError::Dimension {
                detail: "design over an empty covariate table".into(),
            });
        }

        let mut names = vec!["(Intercept)".to_string()];
        let mut cols: Vec<Vec<f64>> = vec![vec![1.0; n]];
        for term in formula.terms() {
            match term {
                Term::Main(name) => {
                    for (cname, values) in expand_column(table, name)? {
                        names.push(cname);
                        cols.push(values);
                    }
                }
                Term::Interaction(a, b) => {
                    let left = expand_column(table, a)?;
                    let right = expand_column(table, b)?;
                    for (an, av) in &left {
                        for (bn, bv) in &right {
                            names.push(format!("{an}.{bn}"));
                            cols.push(av.iter().zip(bv).map(|(x, y)| x * y).collect());
                        }
                    }
                }
            }
        }

        for (name, col) in names.iter().zip(&cols) {
            if col.iter().all(|&v| v == 0.0) {
                return Err(GlmError::RankDeficientDesign {
                    detail: format!("column `{name}` is identically zero (factor level with no samples)"),
                });
            }
        }

        let p = names.len();
        let mut x = Array2::zeros((n, p));
        for (j, col) in cols.iter().enumerate() {
            for (i, &v) in col.iter().enumerate() {
                x[[i, j]] = v;
            }
        }
        check_full_rank(&x)?;

        Ok(DesignMatrix { cols: x, names })
    }

    /// The expanded `n x p` matrix.
    pub fn matrix(&self) -> &Array2<f64> {
        &self.cols
    }

    /// Column names, `(Intercept)` first.
    pub fn names(&self) -> &[String] {
        &self.names
    }

    /// Number of samples (rows).
    pub fn n_samples(&self) -> usize {
        self.cols.nrows()
    }

    /// Number of coefficients (columns).
    pub fn n_coefficients(&self) -> usize {
        self.cols.ncols()
    }

    /// Position of a named column, if present.
    pub fn column_index(&self, name: &str) -> Option<usize> {
        self.names.iter().position(|n| n == name)
    }

    /// Diagonal of the hat matrix `X (X'X)^-1 X'`. For a purely factorial
    /// design the reciprocal of its maximum is the smallest group size.
    pub fn hat_diagonal(&self) -> Result<Array1<f64>> {
        let xtx = self.cols.t().dot(&self.cols);
        let g = xtx.invh()?;
        let prod = self.cols.dot(&g) * &self.cols;
        Ok(prod.sum_axis(Axis(1)))
    }
}

fn expand_column(table: &CovariateTable, name: &str) -> Result<Vec<(String, Vec<f64>)>> {
    if let Ok(factor) = table.factor(name) {
        let mut cols = Vec::with_capacity(factor.levels.len().saturating_sub(1));
        for (code, level) in factor.levels.iter().enumerate().skip(1) {
            let values = factor
                .codes
                .iter()
                .map(|&c| if c == code { 1.0 } else { 0.0 })
                .collect();
            cols.push((format!("{name}{level}"), values));
        }
        return Ok(cols);
    }
    let values = table.numeric(name)?;
    Ok(vec![(name.to_string(), values.to_vec())])
}

fn check_full_rank(x: &Array2<f64>) -> Result<()> {
    let (_, sigma, _) = x.svd(false, false)?;
    let smax = sigma.iter().cloned().fold(0.0f64, f64::max);
    let tol = smax * x.nrows().max(x.ncols()) as f64 * f64::EPSILON;
    let rank = sigma.iter().filter(|&&s| s > tol).count();
    if rank < x.ncols() {
        return Err(GlmError::RankDeficientDesign {
            detail: format!(
                "{} columns with numerical rank {rank} (collinear terms)",
                x.ncols()
            ),
        });
    }
    Ok(())
}

/// Ordinary least-squares coefficients for many response rows against one
/// design. `responses` is genes x samples, `design` is samples x p; the
/// result is genes x p.
pub fn ols_coefficients(responses: &Array2<f64>, design: &Array2<f64>) -> Result<Array2<f64>> {
    if responses.ncols() != design.nrows() {
        return Err(GlmError::Dimension {
            detail: format!(
                "{} response columns against {} design rows",
                responses.ncols(),
                design.nrows()
            ),
        });
    }
    let xtx = design.t().dot(design);
    let g = xtx.invh()?;
    Ok(responses.dot(design).dot(&g))
}

/// Row-wise least-squares residuals, same shape as `responses`.
pub fn ols_residuals(responses: &Array2<f64>, design: &Array2<f64>) -> Result<Array2<f64>> {
    let beta = ols_coefficients(responses, design)?;
    Ok(responses - &beta.dot(&design.t()))
}

#[cfg(test)]
mod test {
    use super::*;
    use assert_approx_eq::assert_approx_eq;
    use dea_types::{Condition, CovariateTable, Day, Processing, SampleInfo, Sex};
    use ndarray::array;

    fn table(samples: &[(Sex, Condition, Day)]) -> CovariateTable {
        let infos = samples
            .iter()
            .map(|&(sex, condition, day)| {
                SampleInfo::new("TdT", sex, condition, day, Processing::Ip).unwrap()
            })
            .collect();
        CovariateTable::new(infos)
    }

    fn five_level_table() -> CovariateTable {
        table(&[
            (Sex::F, Condition::Naive, Day::Seven),
            (Sex::M, Condition::Sham, Day::Two),
            (Sex::F, Condition::Sham, Day::Seven),
            (Sex::M, Condition::Sni, Day::Two),
            (Sex::F, Condition::Sni, Day::Seven),
        ])
    }

    /// Both sexes in every cond_day cell, ten samples.
    fn balanced_table() -> CovariateTable {
        let pairs: Vec<(Sex, Condition, Day)> = [
            (Condition::Naive, Day::Seven),
            (Condition::Sham, Day::Two),
            (Condition::Sham, Day::Seven),
            (Condition::Sni, Day::Two),
            (Condition::Sni, Day::Seven),
        ]
        .iter()
        .flat_map(|&(c, d)| [(Sex::F, c, d), (Sex::M, c, d)])
        .collect();
        table(&pairs)
    }

    #[test]
    fn test_reference_level_coding() {
        let t = five_level_table();
        let design = DesignMatrix::build(&t, &Formula::of_mains(&["cond_day"])).unwrap();

        assert_eq!(
            design.names(),
            &[
                "(Intercept)",
                "cond_daySham_2",
                "cond_daySham_7",
                "cond_daySNI_2",
                "cond_daySNI_7"
            ]
        );
        // Reference sample rides on the intercept alone.
        assert_eq!(design.matrix().row(0).to_vec(), vec![1.0, 0.0, 0.0, 0.0, 0.0]);
        assert_eq!(design.matrix().row(3).to_vec(), vec![1.0, 0.0, 0.0, 1.0, 0.0]);
    }

    #[test]
    fn test_interaction_names_and_values() {
        let parent = table(&[
            (Sex::F, Condition::Naive, Day::Seven),
            (Sex::M, Condition::Naive, Day::Seven),
            (Sex::F, Condition::Sni, Day::Two),
            (Sex::M, Condition::Sni, Day::Two),
        ]);
        // Identity subset drops the three unused cond_day levels.
        let t = parent.subset(&[0, 1, 2, 3]);

        let mut formula = Formula::of_mains(&["sex", "cond_day"]);
        formula.push(Term::interaction("sex", "cond_day"));
        let design = DesignMatrix::build(&t, &formula).unwrap();

        assert_eq!(
            design.names(),
            &["(Intercept)", "sexM", "cond_daySNI_2", "sexM.cond_daySNI_2"]
        );
        assert_eq!(design.matrix().row(3).to_vec(), vec![1.0, 1.0, 1.0, 1.0]);
        assert_eq!(design.matrix().row(2).to_vec(), vec![1.0, 0.0, 1.0, 0.0]);
    }

    #[test]
    fn test_empty_level_is_rank_deficient() {
        let t = table(&[
            (Sex::F, Condition::Naive, Day::Seven),
            (Sex::M, Condition::Sni, Day::Two),
        ]);
        let err = DesignMatrix::build(&t, &Formula::of_mains(&["cond_day"])).unwrap_err();
        match err {
            GlmError::RankDeficientDesign { detail } => {
                assert!(detail.contains("identically zero"), "{detail}");
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_collinear_columns_are_rank_deficient() {
        let mut t = table(&[
            (Sex::F, Condition::Naive, Day::Seven),
            (Sex::M, Condition::Naive, Day::Seven),
            (Sex::F, Condition::Naive, Day::Seven),
            (Sex::M, Condition::Naive, Day::Seven),
        ]);
        // Numeric copy of the sexM indicator.
        t.append_numeric("dup", vec![0.0, 1.0, 0.0, 1.0]).unwrap();
        let err = DesignMatrix::build(&t, &Formula::of_mains(&["sex", "dup"])).unwrap_err();
        match err {
            GlmError::RankDeficientDesign { detail } => {
                assert!(detail.contains("rank"), "{detail}");
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_unknown_column() {
        let t = five_level_table();
        let err = DesignMatrix::build(&t, &Formula::of_mains(&["phase"])).unwrap_err();
        assert!(matches!(err, GlmError::Covariate(_)));
    }

    #[test]
    fn test_numeric_columns_pass_through() {
        let mut t = balanced_table();
        t.append_numeric(
            "SV1",
            vec![0.1, -0.2, 0.3, -0.4, 0.2, 0.05, -0.15, 0.25, -0.3, 0.1],
        )
        .unwrap();
        let design = DesignMatrix::build(&t, &Formula::of_mains(&["cond_day", "SV1"])).unwrap();
        assert_eq!(design.names().last().map(String::as_str), Some("SV1"));
        assert_approx_eq!(design.matrix()[[2, 5]], 0.3);
    }

    #[test]
    fn test_build_is_deterministic() {
        let t = balanced_table();
        let formula = Formula::of_mains(&["sex", "cond_day"]);
        let a = DesignMatrix::build(&t, &formula).unwrap();
        let b = DesignMatrix::build(&t, &formula).unwrap();
        assert_eq!(a.names(), b.names());
        assert_eq!(a.matrix(), b.matrix());
    }

    #[test]
    fn test_hat_diagonal_matches_group_sizes() {
        let parent = table(&[
            (Sex::F, Condition::Naive, Day::Seven),
            (Sex::F, Condition::Naive, Day::Seven),
            (Sex::M, Condition::Naive, Day::Seven),
            (Sex::F, Condition::Sni, Day::Two),
            (Sex::M, Condition::Sni, Day::Two),
        ]);
        let t = parent.subset(&[0, 1, 2, 3, 4]);
        let design = DesignMatrix::build(&t, &Formula::of_mains(&["cond_day"])).unwrap();
        let h = design.hat_diagonal().unwrap();
        for i in 0..3 {
            assert_approx_eq!(h[i], 1.0 / 3.0, 1e-10);
        }
        for i in 3..5 {
            assert_approx_eq!(h[i], 0.5, 1e-10);
        }
    }

    #[test]
    fn test_ols_recovers_line() {
        let x = array![[1.0, 0.0], [1.0, 1.0], [1.0, 2.0], [1.0, 3.0]];
        let y = array![[1.0, 3.0, 5.0, 7.0], [2.0, 2.0, 2.0, 2.0]];
        let beta = ols_coefficients(&y, &x).unwrap();
        assert_approx_eq!(beta[[0, 0]], 1.0, 1e-10);
        assert_approx_eq!(beta[[0, 1]], 2.0, 1e-10);
        assert_approx_eq!(beta[[1, 0]], 2.0, 1e-10);
        assert_approx_eq!(beta[[1, 1]], 0.0, 1e-10);

        let resid = ols_residuals(&y, &x).unwrap();
        for v in resid.iter() {
            assert_approx_eq!(v, 0.0, 1e-10);
        }
    }
}
