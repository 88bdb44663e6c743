//! # vole-core
//!
//! Device-independent foundations for the vole GPU matrix engine.
//!
//! This crate provides:
//! - [`Matrix`] — dense row-major f32 matrix living in host memory
//! - [`UnaryOp`] / [`BinaryOp`] — the element-wise operator families
//! - [`Error`] / [`Result`] — the error taxonomy shared by all crates
//! - [`reference`] — scalar CPU implementations of every engine operation,
//!   used as the correctness oracle by the GPU test suite (never on the
//!   runtime path)

pub mod error;
pub mod matrix;
pub mod ops;
pub mod reference;

pub use error::{Error, Result};
pub use matrix::Matrix;
pub use ops::{BinaryOp, UnaryOp};
