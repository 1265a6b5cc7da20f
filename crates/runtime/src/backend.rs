//! Device backend trait and backend selection.
//!
//! A [`DeviceBackend`] is one execution context: one BLAS handle and one
//! stream. Every copy and GEMM it accepts is enqueued on that stream, so
//! work is executed in submission order. Backend selection happens once,
//! when a [`DeviceSession`](crate::DeviceSession) is opened.

use std::sync::Arc;

use batchgemm_core::{BackendKind, BlasDims, ElementKind, GemmError, RawScalars, Result, SessionConfig, Strides};

use crate::host::HostBackend;

/// Opaque device address. Interior addresses (`base + byte offset`) are
/// valid operands as long as they stay inside their allocation.
pub type DevicePtr = u64;

/// Free and total device memory in bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemInfo {
    /// Bytes currently available.
    pub free: usize,
    /// Bytes on the device.
    pub total: usize,
}

/// Vendor runtime + BLAS primitives the batching layer is built on.
///
/// Implementations are invoked, never reimplemented: the CUDA backend
/// forwards to cudart/cuBLAS, the host backend emulates a device in RAM.
pub trait DeviceBackend: Send + Sync {
    /// Backend name for logging.
    fn name(&self) -> &'static str;

    /// Number of devices this backend can address.
    fn device_count(&self) -> Result<usize>;

    /// Free/total memory of the bound device.
    fn mem_get_info(&self) -> Result<MemInfo>;

    /// Raw allocation. The error is the runtime's status code.
    fn malloc(&self, bytes: usize) -> std::result::Result<DevicePtr, i32>;

    /// Release an allocation made by [`malloc`](Self::malloc).
    fn free(&self, ptr: DevicePtr) -> Result<()>;

    /// Enqueue a host-to-device copy of `src` to `dst`.
    fn copy_to_device(&self, dst: DevicePtr, src: &[u8]) -> Result<()>;

    /// Copy `dst.len()` bytes from `src` into host memory.
    fn copy_to_host(&self, dst: &mut [u8], src: DevicePtr) -> Result<()>;

    /// Block until all work enqueued on the stream has completed.
    fn synchronize(&self) -> Result<()>;

    /// Single GEMM: `C = alpha * A * B + beta * C`.
    fn gemm(
        &self,
        kind: ElementKind,
        dims: &BlasDims,
        scalars: RawScalars,
        a: DevicePtr,
        b: DevicePtr,
        c: DevicePtr,
    ) -> Result<()>;

    /// Pointer-array batched GEMM. `a_array`, `b_array` and `c_array` are
    /// device buffers holding `batch_count` operand addresses each.
    #[allow(clippy::too_many_arguments)]
    fn gemm_batched(
        &self,
        kind: ElementKind,
        dims: &BlasDims,
        scalars: RawScalars,
        a_array: DevicePtr,
        b_array: DevicePtr,
        c_array: DevicePtr,
        batch_count: i32,
    ) -> Result<()>;

    /// Strided-batched GEMM: instance `i` uses `base + i * stride` (in
    /// elements) for each operand.
    #[allow(clippy::too_many_arguments)]
    fn gemm_strided_batched(
        &self,
        kind: ElementKind,
        dims: &BlasDims,
        scalars: RawScalars,
        a: DevicePtr,
        b: DevicePtr,
        c: DevicePtr,
        strides: &Strides,
        batch_count: i32,
    ) -> Result<()>;
}

/// Pick a backend according to `config.backend`.
///
/// `Auto` tries CUDA first and falls back to the host-emulated device.
pub fn select_backend(config: &SessionConfig) -> Result<Arc<dyn DeviceBackend>> {
    config.validate()?;
    match config.backend {
        BackendKind::Host => Ok(Arc::new(HostBackend::new(config.host_memory_bytes))),
        BackendKind::Cuda => cuda_backend(config),
        BackendKind::Auto => match cuda_backend(config) {
            Ok(backend) => Ok(backend),
            Err(e) => {
                tracing::info!(target: "batchgemm::runtime", error = %e, "CUDA not available, using host-emulated device");
                Ok(Arc::new(HostBackend::new(config.host_memory_bytes)))
            }
        },
    }
}

#[cfg(feature = "cuda")]
fn cuda_backend(config: &SessionConfig) -> Result<Arc<dyn DeviceBackend>> {
    let backend = crate::cuda::CudaBackend::try_new(config)?;
    tracing::info!(target: "batchgemm::runtime", device = config.device_index, pinned = config.pinned, "Using CUDA compute backend");
    Ok(Arc::new(backend))
}

#[cfg(not(feature = "cuda"))]
fn cuda_backend(_config: &SessionConfig) -> Result<Arc<dyn DeviceBackend>> {
    Err(GemmError::BackendUnavailable(
        "batchgemm-runtime was built without the `cuda` feature".to_string(),
    ))
}

/// Number of CUDA devices visible to this process.
///
/// A missing CUDA runtime, or a runtime that reports "no device", is a count
/// of zero. Any other failure of the query is returned as an error instead of
/// being folded into a count.
pub fn available_gpus() -> Result<usize> {
    #[cfg(feature = "cuda")]
    {
        match crate::cuda::device_count() {
            Err(GemmError::BackendUnavailable(reason)) => {
                tracing::debug!(target: "batchgemm::runtime", %reason, "CUDA runtime not loadable");
                Ok(0)
            }
            other => other,
        }
    }
    #[cfg(not(feature = "cuda"))]
    {
        Ok(0)
    }
}
