//! Hit selection over result tables.

use dea_types::DeaTable;
use std::collections::BTreeSet;

/// Cutoffs deciding which genes count as differentially expressed.
#[derive(Clone, Debug)]
pub struct DegThresholds {
    /// FDR ceiling for tables that carry fold changes.
    pub fdr: f64,
    /// Fold-change floor on the linear scale, applied to |log2FC| after
    /// a log2 transform.
    pub fold: f64,
    /// Tighter FDR ceiling for tables without fold changes, where no
    /// effect-size gate is available.
    pub strict_fdr: f64,
}

impl Default for DegThresholds {
    fn default() -> DegThresholds {
        DegThresholds {
            fdr: 0.05,
            fold: 2.0,
            strict_fdr: 0.01,
        }
    }
}

/// Genes in `table` passing the thresholds. Tables with fold changes
/// require both the FDR and the fold gate; tables without fall back to
/// the strict FDR alone. Rows with NaN statistics never qualify.
pub fn select_degs(table: &DeaTable, thresholds: &DegThresholds) -> BTreeSet<String> {
    let min_lfc = thresholds.fold.log2();
    table
        .rows()
        .iter()
        .filter(|row| {
            if !row.fdr.is_finite() {
                return false;
            }
            if table.has_log_fc() {
                match row.log_fc {
                    Some(lfc) if lfc.is_finite() => {
                        row.fdr < thresholds.fdr && lfc.abs() > min_lfc
                    }
                    _ => false,
                }
            } else {
                row.fdr < thresholds.strict_fdr
            }
        })
        .map(|row| row.gene.clone())
        .collect()
}

/// Union of [`select_degs`] across several tables.
pub fn union_degs<'a, I>(tables: I, thresholds: &DegThresholds) -> BTreeSet<String>
where
    I: IntoIterator<Item = &'a DeaTable>,
{
    let mut out = BTreeSet::new();
    for table in tables {
        out.extend(select_degs(table, thresholds));
    }
    out
}
