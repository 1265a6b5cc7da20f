//! batchgemm: batched dense matrix multiplication through a device BLAS.
//!
//! ```no_run
//! use batchgemm::{GemmEngine, Matrix, SessionConfig};
//!
//! let engine = GemmEngine::<f32>::new(SessionConfig::new())?;
//! let a = Matrix::<f32>::random(64, 32);
//! let tensor: Vec<_> = (0..8).map(|_| Matrix::<f32>::random(32, 16)).collect();
//! let stacked = engine.matrix_tensor(&a, &tensor)?;
//! assert_eq!(stacked.shape(), (64 * 8, 16));
//! # Ok::<(), batchgemm::GemmError>(())
//! ```
//!
//! The device layer (sessions, allocator, batch packing, dispatch) is
//! available as [`runtime`]; the facade crate as [`engine`].

#![warn(missing_docs)]
#![warn(clippy::all)]

mod types;

pub use types::*;

pub use batchgemm_engine as engine;
pub use batchgemm_runtime as runtime;
