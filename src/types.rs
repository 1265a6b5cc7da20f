//! Public types for the batchgemm API.
//!
//! This module re-exports types from internal crates with a clean public interface.

// ============================================================================
// Public API types - these are what users should use
// ============================================================================

// Host matrices and element types
pub use batchgemm_core::{Element, ElementKind, Matrix, Tensor};

// Batch descriptor pieces
pub use batchgemm_core::{GemmScalars, Shapes, Strides};

// Errors
pub use batchgemm_core::{GemmError, Result};

// Session configuration
pub use batchgemm_core::{BackendKind, SessionConfig};

// Facade
pub use batchgemm_engine::{stack, GemmEngine, TensorMatrix, TensorMatrixDims};

// Device session, for sharing one device between engines and pipelines
pub use batchgemm_runtime::{available_gpus, AllocatorStats, DeviceSession, MemInfo};
