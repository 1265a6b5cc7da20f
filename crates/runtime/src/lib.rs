//! Device runtime for batchgemm.
//!
//! - [`DeviceBackend`]: the vendor primitives (allocation, copies, BLAS)
//! - [`DeviceSession`]: one backend, one stream, one allocator
//! - [`DeviceAllocator`] / [`DeviceBuffer`]: checked, RAII device memory
//! - transfers, batch packing ([`PointerBatch`], [`StridedBatch`]) and
//!   GEMM dispatch ([`multiply`])
//!
//! Backends: CUDA + cuBLAS loaded at runtime (feature `cuda`), and a
//! host-emulated device used when no GPU is present and in tests.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod allocator;
pub mod backend;
#[cfg(feature = "cuda")]
pub mod cuda;
pub mod dispatch;
pub mod host;
pub mod packing;
pub mod session;
pub mod transfer;

pub use allocator::{AllocatorStats, DeviceAllocator, DeviceBuffer};
pub use backend::{available_gpus, select_backend, DeviceBackend, DevicePtr, MemInfo};
pub use dispatch::{multiply, GemmOperands, PackingStrategy};
pub use host::HostBackend;
pub use packing::{
    pack_pointer_batch, pack_strided_batch, reserve_pointer_batch, reserve_strided_batch, uniform_shape, PointerArray,
    PointerBatch, StridedBatch,
};
pub use session::DeviceSession;
pub use transfer::DeviceMatrix;
