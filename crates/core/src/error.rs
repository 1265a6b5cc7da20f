//! Error taxonomy shared by every batchgemm crate.

use std::path::PathBuf;

use thiserror::Error;

/// Result alias used across the workspace.
pub type Result<T> = std::result::Result<T, GemmError>;

/// Errors raised by allocation, transfer and dispatch.
///
/// Allocation and shape errors are detected synchronously at the offending
/// call and carry enough context (requested size, free/total memory,
/// expected vs. actual shape) to diagnose without re-running.
#[derive(Debug, Error)]
pub enum GemmError {
    /// The free-memory pre-check rejected the request. No allocation was
    /// attempted, so device usage is unchanged.
    #[error(
        "not enough device memory: requested {requested} bytes, \
         device reports {free} bytes free of {total} bytes total"
    )]
    OutOfDeviceMemory {
        /// Requested size in bytes.
        requested: usize,
        /// Free device memory reported before the request.
        free: usize,
        /// Total device memory.
        total: usize,
    },

    /// The runtime allocator failed although the pre-check passed
    /// (fragmentation, or a concurrent allocation raced us).
    #[error("device allocation of {requested} bytes failed with runtime code {code}")]
    DeviceAllocationFailed {
        /// Requested size in bytes.
        requested: usize,
        /// Diagnostic code returned by the runtime.
        code: i32,
    },

    /// Operand dimensions violate the operation's precondition.
    #[error("shape mismatch in {op}: expected {expected}, got {actual}")]
    ShapeMismatch {
        /// Operation that rejected its operands.
        op: &'static str,
        /// What the operation required.
        expected: String,
        /// What it was given.
        actual: String,
    },

    /// A free targeted a handle that is not a live allocation.
    #[error("device handle {handle:#x} is not a live allocation (double free or invalid handle)")]
    DoubleFreeOrInvalidHandle {
        /// The offending device address.
        handle: u64,
    },

    /// A runtime or BLAS call returned a non-success status.
    #[error("{call} failed with status {code}")]
    Runtime {
        /// Name of the failing entry point.
        call: &'static str,
        /// Status code it returned.
        code: i32,
    },

    /// The requested compute backend could not be initialised.
    #[error("compute backend unavailable: {0}")]
    BackendUnavailable(String),

    /// A dimension or batch count does not fit the 32-bit BLAS integer.
    #[error("{what} = {value} exceeds the 32-bit range accepted by BLAS")]
    DimensionOverflow {
        /// Which quantity overflowed.
        what: &'static str,
        /// Its value.
        value: usize,
    },

    /// A batch was declared with an unusable size.
    #[error("invalid batch: {0}")]
    InvalidBatch(String),

    /// Configuration could not be parsed or is inconsistent.
    #[error("invalid configuration: {0}")]
    Config(String),

    /// Configuration file could not be read.
    #[error("failed to read configuration file {path}: {source}")]
    ConfigIo {
        /// File that failed to load.
        path: PathBuf,
        /// Underlying I/O error.
        #[source]
        source: std::io::Error,
    },
}

impl GemmError {
    /// Build a [`GemmError::ShapeMismatch`].
    pub fn shape(op: &'static str, expected: impl Into<String>, actual: impl Into<String>) -> Self {
        GemmError::ShapeMismatch {
            op,
            expected: expected.into(),
            actual: actual.into(),
        }
    }

    /// Whether the caller can reasonably retry (smaller batch, other
    /// operands, freed memory). Lifecycle violations are programming errors
    /// and are never recoverable.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            GemmError::OutOfDeviceMemory { .. }
                | GemmError::DeviceAllocationFailed { .. }
                | GemmError::ShapeMismatch { .. }
                | GemmError::DimensionOverflow { .. }
                | GemmError::InvalidBatch(_)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_out_of_memory_message_carries_sizes() {
        let err = GemmError::OutOfDeviceMemory {
            requested: 2048,
            free: 1024,
            total: 4096,
        };
        let msg = err.to_string();
        assert!(msg.contains("2048"));
        assert!(msg.contains("1024"));
        assert!(msg.contains("4096"));
        assert!(err.is_recoverable());
    }

    #[test]
    fn test_shape_helper() {
        let err = GemmError::shape("dot", "A.cols == B.rows (3)", "B.rows = 2");
        assert!(matches!(err, GemmError::ShapeMismatch { op: "dot", .. }));
        assert_eq!(
            err.to_string(),
            "shape mismatch in dot: expected A.cols == B.rows (3), got B.rows = 2"
        );
    }

    #[test]
    fn test_double_free_is_not_recoverable() {
        let err = GemmError::DoubleFreeOrInvalidHandle { handle: 0x1000 };
        assert!(!err.is_recoverable());
        assert!(err.to_string().contains("0x1000"));
    }
}
