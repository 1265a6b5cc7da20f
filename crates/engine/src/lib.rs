//! Batched GEMM engine.
//!
//! - [`GemmEngine`]: `dot`, `gemm`, matrix-tensor products and the triple
//!   tensor product over one device session
//! - [`TensorMatrix`]: pre-allocated pipeline for repeated tensor-times-matrix
//!   products of a fixed size
//! - [`stack`]: vertical concatenation of a tensor

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod engine;
pub mod stack;
pub mod tensor_matrix;

pub use engine::GemmEngine;
pub use stack::stack;
pub use tensor_matrix::{TensorMatrix, TensorMatrixDims};
