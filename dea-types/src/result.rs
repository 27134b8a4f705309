//! Per-contrast result tables attached to the gene axis.

use std::cmp::Ordering;

/// Statistics for one gene under one contrast.
#[derive(Clone, Debug, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct DeaRow {
    /// Gene identifier.
    pub gene: String,
    /// Signed log2 fold-change; `None` for joint multi-coefficient tests,
    /// which have no single direction.
    pub log_fc: Option<f64>,
    /// Raw test p-value. NaN marks a gene whose fit was unidentifiable.
    pub p_value: f64,
    /// Benjamini-Hochberg adjusted p-value.
    pub fdr: f64,
    /// Average log2 CPM of the gene over the tested samples.
    pub avg_expr: f64,
}

/// One contrast's result table, ranked ascending by p-value with NaN rows
/// last. Immutable once built.
#[derive(Clone, Debug, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct DeaTable {
    name: String,
    has_log_fc: bool,
    rows: Vec<DeaRow>,
}

/// p-value order with NaN sorting last.
pub fn cmp_pvalue(a: f64, b: f64) -> Ordering {
    match (a.is_nan(), b.is_nan()) {
        (true, true) => Ordering::Equal,
        (true, false) => Ordering::Greater,
        (false, true) => Ordering::Less,
        (false, false) => a.partial_cmp(&b).unwrap_or(Ordering::Equal),
    }
}

impl DeaTable {
    /// Build a table, sorting rows ascending by p-value (NaN last). Tables
    /// from joint tests set `has_log_fc = false` and leave every row's
    /// `log_fc` as `None`.
    pub fn new(name: impl Into<String>, has_log_fc: bool, mut rows: Vec<DeaRow>) -> DeaTable {
        rows.sort_by(|a, b| cmp_pvalue(a.p_value, b.p_value));
        DeaTable {
            name: name.into(),
            has_log_fc,
            rows,
        }
    }

    /// Contrast name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Whether rows carry a signed log2 fold-change.
    pub fn has_log_fc(&self) -> bool {
        self.has_log_fc
    }

    /// Rows in ranked order.
    pub fn rows(&self) -> &[DeaRow] {
        &self.rows
    }

    /// Number of tested genes.
    pub fn len(&self) -> usize {
        self.rows.len()
    }

    /// True when no genes were tested.
    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    /// Row for a given gene, if it was tested.
    pub fn row_for(&self, gene: &str) -> Option<&DeaRow> {
        self.rows.iter().find(|r| r.gene == gene)
    }

    /// Rename the table (used when merged tables are namespaced per group).
    pub fn with_name(self, name: impl Into<String>) -> DeaTable {
        DeaTable {
            name: name.into(),
            ..self
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn row(gene: &str, p: f64) -> DeaRow {
        DeaRow {
            gene: gene.to_string(),
            log_fc: Some(0.0),
            p_value: p,
            fdr: p,
            avg_expr: 1.0,
        }
    }

    #[test]
    fn rows_ranked_by_pvalue_nan_last() {
        let table = DeaTable::new(
            "SNI_2_vs_Sham_2",
            true,
            vec![row("b", 0.2), row("d", f64::NAN), row("a", 0.001), row("c", 0.2)],
        );
        let order: Vec<&str> = table.rows().iter().map(|r| r.gene.as_str()).collect();
        assert_eq!(&order[..3], &["a", "b", "c"]);
        assert_eq!(order[3], "d");
        assert!(table.rows()[3].p_value.is_nan());
    }

    #[test]
    fn row_lookup_by_gene() {
        let table = DeaTable::new("t", true, vec![row("a", 0.5), row("b", 0.1)]);
        assert_eq!(table.row_for("a").map(|r| r.p_value), Some(0.5));
        assert!(table.row_for("zz").is_none());
    }
}
