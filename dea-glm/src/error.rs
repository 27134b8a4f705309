use thiserror::Error;

/// Failures of the statistical core. `RankDeficientDesign` and `UnknownTerm`
/// are part of the calling contract: the first marks a misconfigured
/// analysis and is always fatal to the requesting caller, the second is a
/// legitimate outcome for stratified subsets missing a factor level and is
/// meant to be matched on and recovered from.
#[derive(Error, Debug)]
pub enum GlmError {
    /// The expanded design matrix does not have full column rank.
    #[error("design matrix is rank deficient: {detail}")]
    RankDeficientDesign {
        /// Which column or columns are at fault, and why.
        detail: String,
    },

    /// A contrast symbol that matches no design column.
    #[error("contrast `{contrast}` references unknown design column `{term}`")]
    UnknownTerm {
        /// Name of the contrast being resolved.
        contrast: String,
        /// The unmatched symbol.
        term: String,
    },

    /// A contrast expression that does not lex as a linear combination.
    #[error("could not parse contrast `{contrast}`: {detail}")]
    ContrastSyntax {
        /// Name of the contrast being parsed.
        contrast: String,
        /// What went wrong.
        detail: String,
    },

    /// Mismatched dimensions between counts, design, or contrast inputs.
    #[error("dimension mismatch: {detail}")]
    Dimension {
        /// Description of the mismatch.
        detail: String,
    },

    /// A joint test needs at least one contrast.
    #[error("joint test `{name}` has no contrasts")]
    EmptyJointTest {
        /// Name of the offending test.
        name: String,
    },

    /// Covariate schema violation bubbled up from the data model.
    #[error(transparent)]
    Covariate(#[from] dea_types::CovariateError),

    /// LAPACK failure during decomposition or solve.
    #[error(transparent)]
    Linalg(#[from] ndarray_linalg::error::LinalgError),
}

/// Convenience alias used throughout the crate.
pub type Result<T> = std::result::Result<T, GlmError>;
