//! The annotated gene x sample matrix passed between pipeline stages.

use crate::covariates::CovariateTable;
use crate::error::MatrixError;
use crate::result::{DeaRow, DeaTable};
use ndarray::{Array2, Axis};
use std::collections::{BTreeMap, HashMap};

/// Name of the raw counts assay.
pub const COUNTS: &str = "counts";
/// Name of the surrogate-variable corrected assay.
pub const CORRECTED: &str = "corrected";
/// Name of the baseline-relative log2 fold-change assay.
pub const LOG2FC: &str = "log2FC";
/// Name of the display-scaled fold-change assay.
pub const SCALED_LFC: &str = "scaledLFC";

/// Key prefix under which result tables attach to the gene axis.
pub const DEA_PREFIX: &str = "DEA.";

/// A collection of named gene x sample assays sharing one row and column
/// identity, plus sample covariates and per-contrast result tables keyed on
/// the gene axis. Stages grow the object additively: new assays, new numeric
/// covariates, new `DEA.<name>` tables; attaching one never perturbs the
/// others.
#[derive(Clone, Debug)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct AnnotatedMatrix {
    genes: Vec<String>,
    samples: Vec<String>,
    gene_lookup: HashMap<String, usize>,
    assays: BTreeMap<String, Array2<f64>>,
    covariates: CovariateTable,
    dea: BTreeMap<String, DeaTable>,
}

impl AnnotatedMatrix {
    /// Assemble a matrix from raw counts, validating identifier uniqueness,
    /// assay shape, covariate alignment, and that counts are finite and
    /// non-negative.
    pub fn new(
        genes: Vec<String>,
        samples: Vec<String>,
        counts: Array2<f64>,
        covariates: CovariateTable,
    ) -> Result<AnnotatedMatrix, MatrixError> {
        let mut gene_lookup = HashMap::with_capacity(genes.len());
        for (i, g) in genes.iter().enumerate() {
            if gene_lookup.insert(g.clone(), i).is_some() {
                return Err(MatrixError::DuplicateGene { id: g.clone() });
            }
        }
        let mut seen = HashMap::with_capacity(samples.len());
        for s in &samples {
            if seen.insert(s.as_str(), ()).is_some() {
                return Err(MatrixError::DuplicateSample { id: s.clone() });
            }
        }
        if covariates.len() != samples.len() {
            return Err(MatrixError::CovariateLength {
                covariates: covariates.len(),
                samples: samples.len(),
            });
        }
        if counts.nrows() != genes.len() || counts.ncols() != samples.len() {
            return Err(MatrixError::AssayShape {
                name: COUNTS.to_string(),
                rows: counts.nrows(),
                cols: counts.ncols(),
                expect_rows: genes.len(),
                expect_cols: samples.len(),
            });
        }
        for ((r, c), &v) in counts.indexed_iter() {
            if !v.is_finite() || v < 0.0 {
                return Err(MatrixError::InvalidCount { row: r, col: c });
            }
        }

        let mut assays = BTreeMap::new();
        assays.insert(COUNTS.to_string(), counts);
        Ok(AnnotatedMatrix {
            genes,
            samples,
            gene_lookup,
            assays,
            covariates,
            dea: BTreeMap::new(),
        })
    }

    /// Number of genes (rows).
    pub fn n_genes(&self) -> usize {
        self.genes.len()
    }

    /// Number of samples (columns).
    pub fn n_samples(&self) -> usize {
        self.samples.len()
    }

    /// Gene identifiers, in row order.
    pub fn genes(&self) -> &[String] {
        &self.genes
    }

    /// Sample identifiers, in column order.
    pub fn samples(&self) -> &[String] {
        &self.samples
    }

    /// Row index of a gene identifier.
    pub fn gene_index(&self, gene: &str) -> Option<usize> {
        self.gene_lookup.get(gene).copied()
    }

    /// Sample covariates.
    pub fn covariates(&self) -> &CovariateTable {
        &self.covariates
    }

    /// Append a numeric covariate column (e.g. `SV1`) for all samples.
    pub fn append_numeric_covariate(
        &mut self,
        name: impl Into<String>,
        values: Vec<f64>,
    ) -> Result<(), MatrixError> {
        self.covariates.append_numeric(name, values)?;
        Ok(())
    }

    /// Look up an assay by name.
    pub fn assay(&self, name: &str) -> Result<&Array2<f64>, MatrixError> {
        self.assays.get(name).ok_or_else(|| MatrixError::UnknownAssay {
            name: name.to_string(),
        })
    }

    /// Mutable assay access, for assembling derived assays block by block.
    pub fn assay_mut(&mut self, name: &str) -> Result<&mut Array2<f64>, MatrixError> {
        self.assays.get_mut(name).ok_or_else(|| MatrixError::UnknownAssay {
            name: name.to_string(),
        })
    }

    /// Whether an assay is attached.
    pub fn has_assay(&self, name: &str) -> bool {
        self.assays.contains_key(name)
    }

    /// Attached assay names, sorted.
    pub fn assay_names(&self) -> impl Iterator<Item = &str> {
        self.assays.keys().map(String::as_str)
    }

    /// Attach an assay on the shared grid, replacing any previous assay of
    /// the same name. Other assays are never perturbed.
    pub fn add_assay(&mut self, name: impl Into<String>, values: Array2<f64>) -> Result<(), MatrixError> {
        let name = name.into();
        if values.nrows() != self.n_genes() || values.ncols() != self.n_samples() {
            return Err(MatrixError::AssayShape {
                name,
                rows: values.nrows(),
                cols: values.ncols(),
                expect_rows: self.n_genes(),
                expect_cols: self.n_samples(),
            });
        }
        self.assays.insert(name, values);
        Ok(())
    }

    /// Attach a result table under `DEA.<name>`, replacing any previous
    /// table of the same name. Every row must name a gene on the row index;
    /// genes of the matrix absent from the table are simply untested.
    pub fn attach_dea(&mut self, table: DeaTable) -> Result<(), MatrixError> {
        for row in table.rows() {
            if !self.gene_lookup.contains_key(&row.gene) {
                return Err(MatrixError::ForeignGene {
                    table: table.name().to_string(),
                    gene: row.gene.clone(),
                });
            }
        }
        self.dea.insert(format!("{DEA_PREFIX}{}", table.name()), table);
        Ok(())
    }

    /// Result table for a contrast name (without the `DEA.` prefix).
    pub fn dea_table(&self, name: &str) -> Option<&DeaTable> {
        self.dea.get(&format!("{DEA_PREFIX}{name}"))
    }

    /// Attached result keys (`DEA.<name>`), sorted.
    pub fn dea_keys(&self) -> impl Iterator<Item = &str> {
        self.dea.keys().map(String::as_str)
    }

    /// Statistics of one gene under one contrast, if that gene was tested.
    pub fn gene_stats(&self, gene: &str, contrast: &str) -> Option<&DeaRow> {
        self.dea_table(contrast).and_then(|t| t.row_for(gene))
    }

    /// Materialize an independent matrix for a sample subset: assays are
    /// copied column-wise, covariates subset with empty factor levels
    /// dropped, and result tables left behind (a subset starts a fresh
    /// analysis lifecycle). Mutating the subset never touches the parent.
    pub fn subset_samples(&self, idx: &[usize]) -> Result<AnnotatedMatrix, MatrixError> {
        let mut seen = vec![false; self.n_samples()];
        for &i in idx {
            if i >= self.n_samples() {
                return Err(MatrixError::SampleIndex {
                    index: i,
                    n: self.n_samples(),
                });
            }
            if seen[i] {
                return Err(MatrixError::DuplicateIndex { index: i });
            }
            seen[i] = true;
        }

        let samples = idx.iter().map(|&i| self.samples[i].clone()).collect();
        let assays = self
            .assays
            .iter()
            .map(|(name, a)| (name.clone(), a.select(Axis(1), idx)))
            .collect();
        Ok(AnnotatedMatrix {
            genes: self.genes.clone(),
            samples,
            gene_lookup: self.gene_lookup.clone(),
            assays,
            covariates: self.covariates.subset(idx),
            dea: BTreeMap::new(),
        })
    }

    /// Subset helper: materialize the samples matching a covariate predicate.
    pub fn subset_where(
        &self,
        pred: impl Fn(&crate::covariates::SampleInfo) -> bool,
    ) -> Result<AnnotatedMatrix, MatrixError> {
        let idx = self.covariates.indices_where(pred);
        self.subset_samples(&idx)
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::covariates::{Condition, CovariateTable, Day, Processing, SampleInfo, Sex};
    use ndarray::array;

    fn toy() -> AnnotatedMatrix {
        let infos = vec![
            SampleInfo::new("TdT", Sex::F, Condition::Naive, Day::Seven, Processing::Ip).unwrap(),
            SampleInfo::new("TdT", Sex::M, Condition::Sni, Day::Two, Processing::Ip).unwrap(),
            SampleInfo::new("Gad2", Sex::F, Condition::Sni, Day::Seven, Processing::Ip).unwrap(),
        ];
        AnnotatedMatrix::new(
            vec!["g1".into(), "g2".into()],
            vec!["s1".into(), "s2".into(), "s3".into()],
            array![[1., 2., 3.], [4., 5., 6.]],
            CovariateTable::new(infos),
        )
        .unwrap()
    }

    #[test]
    fn construction_validates() {
        let infos = vec![
            SampleInfo::new("TdT", Sex::F, Condition::Naive, Day::Seven, Processing::Ip).unwrap(),
        ];
        let dup = AnnotatedMatrix::new(
            vec!["g1".into(), "g1".into()],
            vec!["s1".into()],
            array![[1.], [2.]],
            CovariateTable::new(infos.clone()),
        );
        assert!(matches!(dup, Err(MatrixError::DuplicateGene { .. })));

        let neg = AnnotatedMatrix::new(
            vec!["g1".into()],
            vec!["s1".into()],
            array![[-1.]],
            CovariateTable::new(infos.clone()),
        );
        assert!(matches!(neg, Err(MatrixError::InvalidCount { row: 0, col: 0 })));

        let shape = AnnotatedMatrix::new(
            vec!["g1".into()],
            vec!["s1".into()],
            array![[1., 2.]],
            CovariateTable::new(infos),
        );
        assert!(matches!(shape, Err(MatrixError::AssayShape { .. })));
    }

    #[test]
    fn add_assay_guards_shape_and_leaves_others_alone() {
        let mut em = toy();
        let bad = em.add_assay(LOG2FC, array![[0.0_f64]]);
        assert!(matches!(bad, Err(MatrixError::AssayShape { .. })));

        em.add_assay(LOG2FC, array![[0., 1., 0.], [0., 0., 0.]]).unwrap();
        assert!(em.has_assay(LOG2FC));
        assert_eq!(em.assay(COUNTS).unwrap(), &array![[1., 2., 3.], [4., 5., 6.]]);
        let names: Vec<&str> = em.assay_names().collect();
        assert_eq!(names, vec![COUNTS, LOG2FC]);
    }

    #[test]
    fn subset_is_independent_of_parent() {
        let em = toy();
        let mut sub = em.subset_samples(&[0, 2]).unwrap();
        assert_eq!(sub.samples(), &["s1".to_string(), "s3".to_string()]);
        assert_eq!(sub.assay(COUNTS).unwrap(), &array![[1., 3.], [4., 6.]]);

        // droplevels on the subset covariates
        assert_eq!(
            sub.covariates().factor("cond_day").unwrap().levels,
            vec!["Naive_7", "SNI_7"]
        );

        sub.assay_mut(COUNTS).unwrap()[[0, 0]] = 99.0;
        assert_eq!(em.assay(COUNTS).unwrap()[[0, 0]], 1.0);
    }

    #[test]
    fn subset_rejects_bad_indices() {
        let em = toy();
        assert!(matches!(
            em.subset_samples(&[0, 3]),
            Err(MatrixError::SampleIndex { index: 3, .. })
        ));
        assert!(matches!(
            em.subset_samples(&[1, 1]),
            Err(MatrixError::DuplicateIndex { index: 1 })
        ));
    }

    #[test]
    fn dea_tables_attach_and_resolve() {
        let mut em = toy();
        let table = DeaTable::new(
            "TdT.SNI_7_vs_Naive_7",
            true,
            vec![DeaRow {
                gene: "g2".into(),
                log_fc: Some(1.5),
                p_value: 0.01,
                fdr: 0.02,
                avg_expr: 5.0,
            }],
        );
        em.attach_dea(table).unwrap();

        let keys: Vec<&str> = em.dea_keys().collect();
        assert_eq!(keys, vec!["DEA.TdT.SNI_7_vs_Naive_7"]);
        let row = em.gene_stats("g2", "TdT.SNI_7_vs_Naive_7").unwrap();
        assert_eq!(row.log_fc, Some(1.5));
        // g1 was filtered out of this group's table: absent, not NaN.
        assert!(em.gene_stats("g1", "TdT.SNI_7_vs_Naive_7").is_none());

        let foreign = DeaTable::new(
            "x",
            true,
            vec![DeaRow {
                gene: "nope".into(),
                log_fc: None,
                p_value: 0.5,
                fdr: 0.5,
                avg_expr: 0.0,
            }],
        );
        assert!(matches!(em.attach_dea(foreign), Err(MatrixError::ForeignGene { .. })));
    }
}
