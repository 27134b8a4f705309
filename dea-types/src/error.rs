use thiserror::Error;

/// Violations of the covariate schema's enumerated domains.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CovariateError {
    /// A string did not parse as a member of an enumerated domain.
    #[error("`{value}` is not a valid {domain}")]
    UnknownLevel {
        /// Name of the enumerated domain.
        domain: &'static str,
        /// The offending input.
        value: String,
    },

    /// Naive animals are only collected at day 7.
    #[error("naive samples exist only at day 7, day {day} is outside the domain")]
    NaiveDay {
        /// The rejected day label.
        day: String,
    },

    /// Lookup of a covariate column that does not exist.
    #[error("unknown covariate column `{name}`")]
    UnknownColumn {
        /// Requested column name.
        name: String,
    },

    /// Attempt to append a column under a name that is already taken.
    #[error("covariate column `{name}` already exists")]
    DuplicateColumn {
        /// The colliding column name.
        name: String,
    },

    /// A column whose length disagrees with the number of samples.
    #[error("column `{name}` has {len} values for {n} samples")]
    ColumnLength {
        /// Column being appended.
        name: String,
        /// Number of values supplied.
        len: usize,
        /// Number of samples in the table.
        n: usize,
    },
}

/// Integrity violations of the annotated matrix.
#[derive(Error, Debug)]
pub enum MatrixError {
    /// An assay whose shape disagrees with the gene x sample grid.
    #[error("assay `{name}` has shape {rows}x{cols}, expected {expect_rows}x{expect_cols}")]
    AssayShape {
        /// Assay being added.
        name: String,
        /// Supplied row count.
        rows: usize,
        /// Supplied column count.
        cols: usize,
        /// Expected row count.
        expect_rows: usize,
        /// Expected column count.
        expect_cols: usize,
    },

    /// Gene identifiers must be unique after aggregation upstream.
    #[error("duplicate gene identifier `{id}`")]
    DuplicateGene {
        /// The repeated identifier.
        id: String,
    },

    /// Sample identifiers must be unique.
    #[error("duplicate sample identifier `{id}`")]
    DuplicateSample {
        /// The repeated identifier.
        id: String,
    },

    /// Lookup of an assay that has not been attached.
    #[error("unknown assay `{name}`")]
    UnknownAssay {
        /// Requested assay name.
        name: String,
    },

    /// Counts must be finite and non-negative.
    #[error("count matrix has a negative or non-finite value at ({row}, {col})")]
    InvalidCount {
        /// Gene row of the offending entry.
        row: usize,
        /// Sample column of the offending entry.
        col: usize,
    },

    /// Covariate table rows must match the sample axis.
    #[error("covariate table has {covariates} rows for {samples} samples")]
    CovariateLength {
        /// Rows in the covariate table.
        covariates: usize,
        /// Samples in the matrix.
        samples: usize,
    },

    /// A result table naming a gene outside the matrix row index.
    #[error("result table `{table}` references unknown gene `{gene}`")]
    ForeignGene {
        /// Table being attached.
        table: String,
        /// The unmatched gene identifier.
        gene: String,
    },

    /// Sample subset index out of range.
    #[error("sample index {index} out of range for {n} samples")]
    SampleIndex {
        /// The offending index.
        index: usize,
        /// Number of samples available.
        n: usize,
    },

    /// Sample subset indices must be distinct.
    #[error("duplicate sample index {index} in subset")]
    DuplicateIndex {
        /// The repeated index.
        index: usize,
    },

    /// Schema violation raised while manipulating column metadata.
    #[error(transparent)]
    Covariate(#[from] CovariateError),
}
