//! Statistical core for bulk count matrices: design expansion, TMM
//! normalization, negative-binomial fitting, and quasi-likelihood
//! contrast tests with BH-adjusted results.

#[allow(unused_extern_crates)]
extern crate blas_src;

pub use crate::contrast::{ql_f_test, ql_f_test_joint, Contrast};
pub use crate::design::{DesignMatrix, Formula, Term};
pub use crate::error::GlmError;
pub use crate::fit::{fit_glm, FitOptions, GlmFit};
pub use crate::norm::{filter_and_normalize, FilterOptions, FilteredCounts};

/// Symbolic contrasts and their F-tests.
pub mod contrast;
/// Model formulas and design matrices.
pub mod design;
/// Error types of the statistical core.
pub mod error;
/// Per-gene negative-binomial GLMs.
pub mod fit;
/// Library normalization and expression filtering.
pub mod norm;
/// Hit selection over result tables.
pub mod select;
/// Shared scalar statistics.
pub mod stat;
