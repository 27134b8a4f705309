//! Stratified differential-expression runs.
//!
//! Every level of the stratifying factor is analyzed as an independent
//! group: subset, filter, normalize, estimate surrogate variables, fit,
//! and test, all in parallel across groups. A single-threaded merge then
//! attaches the per-group result tables and the corrected assay onto the
//! parent matrix. Failures stay local: a group whose design cannot be
//! built is skipped and reported, a contrast naming a term a group never
//! saw is skipped for that group only.

use crate::sva::{correct_counts, estimate_surrogate_variables};
use anyhow::{format_err, Error};
use dea_glm::contrast::{ql_f_test, ql_f_test_joint, Contrast};
use dea_glm::design::{DesignMatrix, Formula, Term};
use dea_glm::error::GlmError;
use dea_glm::fit::{fit_glm, FitOptions, GlmFit};
use dea_glm::norm::{filter_and_normalize, FilterOptions, FilteredCounts};
use dea_glm::select::{select_degs, DegThresholds};
use dea_types::matrix::{CORRECTED, COUNTS};
use dea_types::{AnnotatedMatrix, CovariateTable, DeaTable};
use itertools::Itertools;
use log::warn;
use ndarray::Array2;
use rayon::prelude::*;
use std::collections::{BTreeMap, BTreeSet};

/// One named comparison of the contrast catalog.
#[derive(Clone, Debug)]
pub enum ComparisonSpec {
    /// A single contrast expression, tested with its fold change.
    Single {
        /// Result-table name.
        name: String,
        /// Contrast expression over design column names.
        expression: String,
    },
    /// A joint any-effect F-test over several expressions.
    Joint {
        /// Result-table name.
        name: String,
        /// Contrast expressions tested together.
        expressions: Vec<String>,
    },
}

impl ComparisonSpec {
    /// Result-table name of the comparison.
    pub fn name(&self) -> &str {
        match self {
            ComparisonSpec::Single { name, .. } | ComparisonSpec::Joint { name, .. } => name,
        }
    }
}

/// Configuration of a stratified analysis run.
#[derive(Clone, Debug)]
pub struct GroupRunConfig {
    /// Factor whose levels become independently analyzed strata; `None`
    /// runs a single global group.
    pub stratify_by: Option<String>,
    /// Model formula fit within every stratum.
    pub formula: Formula,
    /// Surrogate variables to request per stratum.
    pub n_sv: usize,
    /// Contrast catalog applied to every stratum.
    pub comparisons: Vec<ComparisonSpec>,
    /// Expression-filter tuning.
    pub filter: FilterOptions,
    /// Dispersion and fitting tuning.
    pub fit: FitOptions,
    /// Selection cutoffs.
    pub thresholds: DegThresholds,
}

impl GroupRunConfig {
    /// A run of `formula` with default tuning: unstratified, no surrogate
    /// variables, and an empty contrast catalog.
    pub fn new(formula: Formula) -> GroupRunConfig {
        GroupRunConfig {
            stratify_by: None,
            formula,
            n_sv: 0,
            comparisons: Vec::new(),
            filter: FilterOptions::default(),
            fit: FitOptions::default(),
            thresholds: DegThresholds::default(),
        }
    }
}

/// What a finished run reports beyond the tables it attaches.
#[derive(Debug, Default)]
pub struct RunSummary {
    /// Selected genes per comparison name, unioned across strata.
    pub selections: BTreeMap<String, BTreeSet<String>>,
    /// `(group, reason)` for strata skipped wholesale.
    pub skipped_groups: Vec<(String, String)>,
    /// `(group, comparison)` pairs skipped because the comparison names a
    /// term absent from that group's design.
    pub skipped_contrasts: Vec<(String, String)>,
}

impl RunSummary {
    /// Union of the selections across every comparison.
    pub fn selected_union(&self) -> BTreeSet<String> {
        self.selections.values().flatten().cloned().collect()
    }
}

/// Sample strata of one factor: level label and column indices, in level
/// order, with unobserved levels left out. `None` yields a single
/// unstratified group.
pub fn strata(
    table: &CovariateTable,
    by: Option<&str>,
) -> Result<Vec<(Option<String>, Vec<usize>)>, Error> {
    let name = match by {
        Some(name) => name,
        None => return Ok(vec![(None, (0..table.len()).collect())]),
    };
    let factor = table.factor(name)?;
    let mut out = Vec::new();
    for (code, level) in factor.levels.iter().enumerate() {
        let idx: Vec<usize> = factor.codes.iter().positions(|&c| c == code).collect();
        if !idx.is_empty() {
            out.push((Some(level.clone()), idx));
        }
    }
    Ok(out)
}

/// Runs the configured analysis per stratum and merges everything onto
/// `matrix`.
///
/// Result tables land under `DEA.<group>.<name>`, or `DEA.<name>` for an
/// unstratified run. The `corrected` assay is assembled on the parent
/// grid from the per-group corrected blocks; columns outside every
/// stratum and genes a stratum filtered away keep the raw counts.
pub fn run_groups(
    matrix: &mut AnnotatedMatrix,
    config: &GroupRunConfig,
) -> Result<RunSummary, Error> {
    let groups = strata(matrix.covariates(), config.stratify_by.as_deref())?;

    let parent = &*matrix;
    let outcomes: Vec<Result<GroupResult, (String, String)>> = groups
        .par_iter()
        .map(|(label, cols)| {
            run_one_group(parent, label.as_deref(), cols, config).map_err(|e| {
                (
                    label.clone().unwrap_or_else(|| "all".to_string()),
                    format!("{e:#}"),
                )
            })
        })
        .collect();

    let mut summary = RunSummary::default();
    let mut corrected = matrix.assay(COUNTS)?.clone();
    let mut tables_out = Vec::new();

    for outcome in outcomes {
        let result = match outcome {
            Ok(result) => result,
            Err((group, reason)) => {
                warn!("skipping group `{group}`: {reason}");
                summary.skipped_groups.push((group, reason));
                continue;
            }
        };
        let GroupResult {
            label,
            columns,
            kept_genes,
            corrected: block,
            tables,
            selections,
            skipped_contrasts,
        } = result;

        for (bi, &g) in kept_genes.iter().enumerate() {
            for (bj, &j) in columns.iter().enumerate() {
                corrected[[g, j]] = block[[bi, bj]];
            }
        }
        let group = label.clone().unwrap_or_else(|| "all".to_string());
        let prefix = label.map(|l| format!("{l}.")).unwrap_or_default();
        for table in tables {
            let name = format!("{prefix}{}", table.name());
            tables_out.push(table.with_name(name));
        }
        for (name, genes) in selections {
            summary.selections.entry(name).or_default().extend(genes);
        }
        for name in skipped_contrasts {
            summary.skipped_contrasts.push((group.clone(), name));
        }
    }

    for table in tables_out {
        matrix.attach_dea(table)?;
    }
    matrix.add_assay(CORRECTED, corrected)?;
    Ok(summary)
}

struct GroupResult {
    label: Option<String>,
    columns: Vec<usize>,
    kept_genes: Vec<usize>,
    corrected: Array2<f64>,
    tables: Vec<DeaTable>,
    selections: Vec<(String, BTreeSet<String>)>,
    skipped_contrasts: Vec<String>,
}

fn run_one_group(
    parent: &AnnotatedMatrix,
    label: Option<&str>,
    columns: &[usize],
    config: &GroupRunConfig,
) -> Result<GroupResult, Error> {
    let group = label.unwrap_or("all");
    let mut sub = parent.subset_samples(columns)?;
    let design = DesignMatrix::build(sub.covariates(), &config.formula)?;

    let filtered = filter_and_normalize(sub.assay(COUNTS)?, sub.genes(), &design, &config.filter)?;
    if filtered.n_genes() == 0 {
        return Err(format_err!("no gene passed the expression filter"));
    }

    // Hidden structure is estimated against an intercept-only null and
    // then enters the model as ordinary numeric covariates.
    let null = Formula::default();
    let sv = if config.n_sv == 0 {
        Array2::zeros((sub.n_samples(), 0))
    } else {
        let log_expr = log_cpm(&filtered);
        estimate_surrogate_variables(
            &log_expr,
            sub.covariates(),
            &config.formula,
            &null,
            config.n_sv,
        )?
    };
    let corrected = correct_counts(&filtered.counts, sub.covariates(), &null, &sv)?;

    let mut formula = config.formula.clone();
    for (i, col) in sv.columns().into_iter().enumerate() {
        let name = format!("SV{}", i + 1);
        sub.append_numeric_covariate(name.clone(), col.to_vec())?;
        formula.push(Term::main(name));
    }
    let design = DesignMatrix::build(sub.covariates(), &formula)?;
    let fit = fit_glm(&filtered, &design, &config.fit)?;

    let mut tables = Vec::new();
    let mut selections = Vec::new();
    let mut skipped = Vec::new();
    for spec in &config.comparisons {
        match test_comparison(&fit, spec) {
            Ok(table) => {
                selections.push((
                    spec.name().to_string(),
                    select_degs(&table, &config.thresholds),
                ));
                tables.push(table);
            }
            Err(err) => match err.downcast_ref::<GlmError>() {
                Some(GlmError::UnknownTerm { term, .. }) => {
                    warn!(
                        "group `{group}`: comparison `{}` names unknown term `{term}`; skipped",
                        spec.name()
                    );
                    skipped.push(spec.name().to_string());
                }
                _ => return Err(err),
            },
        }
    }

    Ok(GroupResult {
        label: label.map(str::to_string),
        columns: columns.to_vec(),
        kept_genes: filtered.kept.clone(),
        corrected,
        tables,
        selections,
        skipped_contrasts: skipped,
    })
}

fn test_comparison(fit: &GlmFit, spec: &ComparisonSpec) -> Result<DeaTable, Error> {
    match spec {
        ComparisonSpec::Single { name, expression } => {
            let contrast = Contrast::parse(name.clone(), expression, &fit.design)?;
            Ok(ql_f_test(fit, &contrast)?)
        }
        ComparisonSpec::Joint { name, expressions } => {
            let contrasts = expressions
                .iter()
                .map(|e| Contrast::parse(e.clone(), e, &fit.design))
                .collect::<Result<Vec<_>, _>>()?;
            Ok(ql_f_test_joint(fit, name.clone(), &contrasts)?)
        }
    }
}

/// Log2 CPM with the same pseudocounts the average-abundance summary uses.
fn log_cpm(filtered: &FilteredCounts) -> Array2<f64> {
    let eff = filtered.effective_lib_sizes();
    let mut out = filtered.counts.clone();
    for (mut col, &lib) in out.columns_mut().into_iter().zip(eff.iter()) {
        col.mapv_inplace(|v| ((v + 0.5) / (lib + 1.0) * 1e6).log2());
    }
    out
}
