//! # dea-types: shared data model for the differential-expression pipeline
//!
//! The pipeline's stages communicate through one annotated gene x sample
//! matrix: named assays over a shared row/column identity, a typed covariate
//! table on the sample axis, and per-contrast result tables on the gene axis.

#![deny(missing_docs)]

/// Typed covariate schema for the sample axis.
pub mod covariates;

/// Data-model error types.
pub mod error;

/// The annotated matrix passed between stages.
pub mod matrix;

/// Per-contrast result rows and tables.
pub mod result;

pub use crate::covariates::{CondDay, Condition, CovariateTable, Day, FactorColumn, Processing, SampleInfo, Sex};
pub use crate::error::{CovariateError, MatrixError};
pub use crate::matrix::AnnotatedMatrix;
pub use crate::result::{DeaRow, DeaTable};
