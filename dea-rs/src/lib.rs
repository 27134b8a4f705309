//! # dea-rs: Differential Expression Analysis in Rust

#![deny(missing_docs)]

#[allow(unused_extern_crates)]
extern crate blas_src;

/// Baseline-relative fold changes
pub mod fold;

/// Stratified analysis runs
pub mod run;

/// Surrogate-variable estimation
pub mod sva;
