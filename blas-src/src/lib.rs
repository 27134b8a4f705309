//! Links a BLAS/LAPACK provider for the workspace: Accelerate on macOS,
//! a statically built OpenBLAS everywhere else. Crates that call into
//! `ndarray-linalg` declare `extern crate blas_src` to pull the symbols in.

#[cfg(target_os = "macos")]
extern crate accelerate_src;

#[cfg(not(target_os = "macos"))]
extern crate openblas_src;
