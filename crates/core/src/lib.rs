//! Core types for batchgemm.
//!
//! - [`Matrix`]: column-major host matrix, the value every operation takes and returns
//! - [`Shapes`], [`Strides`], [`GemmScalars`]: batch descriptor pieces
//! - [`GemmError`]: error taxonomy shared by all crates
//! - [`SessionConfig`]: device session configuration

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod config;
pub mod element;
pub mod error;
pub mod matrix;
pub mod reference;
pub mod shape;

pub use config::{BackendKind, SessionConfig, DEFAULT_HOST_MEMORY_BYTES};
pub use element::{Element, ElementKind};
pub use error::{GemmError, Result};
pub use matrix::Matrix;
pub use shape::{BlasDims, GemmScalars, RawScalars, Shapes, Strides};

/// A sequence of same-shaped matrices.
pub type Tensor<T> = Vec<Matrix<T>>;
