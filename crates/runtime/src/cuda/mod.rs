//! CUDA device backend.
//!
//! Loads the CUDA runtime and cuBLAS at runtime (no link-time dependency).
//! Falls back gracefully if CUDA is not available: `CudaBackend::try_new()`
//! returns `Err` and the backend selector moves on.
//!
//! One backend owns one stream and one cuBLAS handle bound to it. Copies and
//! GEMMs are all enqueued on that stream.

use std::ffi::{c_int, c_void};
use std::ptr;

use batchgemm_core::{BlasDims, ElementKind, GemmError, RawScalars, Result, SessionConfig, Strides};
use parking_lot::Mutex;

use crate::backend::{DeviceBackend, DevicePtr, MemInfo};
use ffi::{
    check_cublas, check_cuda, CublasApi, CublasHandle, CudaRuntimeApi, CudaStream, CUBLAS_OP_N,
    CUDA_ERROR_NO_DEVICE, CUDA_MEMCPY_DEVICE_TO_HOST, CUDA_MEMCPY_HOST_TO_DEVICE,
};

pub(crate) mod ffi;

/// Number of CUDA devices. `cudaErrorNoDevice` counts as zero; any other
/// failure is an error.
pub fn device_count() -> Result<usize> {
    let rt = ffi::cuda_runtime()?;
    let mut count: c_int = 0;
    // SAFETY: cudaGetDeviceCount writes one int.
    let code = unsafe { (rt.get_device_count)(&mut count) };
    if code == CUDA_ERROR_NO_DEVICE {
        return Ok(0);
    }
    check_cuda(code, "cudaGetDeviceCount")?;
    Ok(count.max(0) as usize)
}

// ---------------------------------------------------------------------------
// PinnedStaging: page-locked host buffer reused across transfers
// ---------------------------------------------------------------------------

struct PinnedStaging {
    ptr: *mut c_void,
    capacity: usize,
}

impl PinnedStaging {
    /// Grow to at least `bytes`, returning the staging area as a byte slice.
    fn ensure(&mut self, rt: &CudaRuntimeApi, bytes: usize) -> Result<&mut [u8]> {
        if self.capacity < bytes {
            self.release(rt);
            let mut p: *mut c_void = ptr::null_mut();
            // SAFETY: cudaMallocHost writes one pointer.
            check_cuda(unsafe { (rt.malloc_host)(&mut p, bytes) }, "cudaMallocHost")?;
            self.ptr = p;
            self.capacity = bytes;
        }
        if bytes == 0 {
            return Ok(&mut []);
        }
        // SAFETY: ptr is a live page-locked allocation of `capacity >= bytes`.
        Ok(unsafe { std::slice::from_raw_parts_mut(self.ptr as *mut u8, bytes) })
    }

    fn release(&mut self, rt: &CudaRuntimeApi) {
        if !self.ptr.is_null() {
            // SAFETY: ptr came from cudaMallocHost.
            if let Err(e) = check_cuda(unsafe { (rt.free_host)(self.ptr) }, "cudaFreeHost") {
                tracing::warn!(target: "batchgemm::runtime", error = %e, "CUDA: failed to free pinned staging buffer");
            }
            self.ptr = ptr::null_mut();
            self.capacity = 0;
        }
    }
}

// ---------------------------------------------------------------------------
// CudaBackend
// ---------------------------------------------------------------------------

/// CUDA + cuBLAS device backend.
pub struct CudaBackend {
    rt: &'static CudaRuntimeApi,
    blas: &'static CublasApi,
    device: c_int,
    stream: CudaStream,
    handle: CublasHandle,
    staging: Option<Mutex<PinnedStaging>>,
}

// SAFETY: the stream and cuBLAS handle are opaque runtime handles. The CUDA
// runtime is thread-safe; the pinned staging area is guarded by a mutex.
unsafe impl Send for CudaBackend {}
unsafe impl Sync for CudaBackend {}

impl CudaBackend {
    /// Attempt to open a backend on `config.device_index`.
    ///
    /// This will:
    /// 1. Load the CUDA runtime and cuBLAS.
    /// 2. Check the device ordinal against the device count.
    /// 3. Create a stream and a cuBLAS handle bound to it.
    pub fn try_new(config: &SessionConfig) -> Result<Self> {
        let rt = ffi::cuda_runtime()?;
        let blas = ffi::cublas()?;

        let count = device_count()?;
        if config.device_index >= count {
            return Err(GemmError::BackendUnavailable(format!(
                "device {} requested, {} CUDA device(s) present",
                config.device_index, count
            )));
        }
        let device = config.device_index as c_int;
        // SAFETY: plain runtime calls with valid out-pointers.
        unsafe {
            check_cuda((rt.set_device)(device), "cudaSetDevice")?;
        }

        let mut stream: CudaStream = ptr::null_mut();
        // SAFETY: cudaStreamCreate writes one handle.
        check_cuda(unsafe { (rt.stream_create)(&mut stream) }, "cudaStreamCreate")?;

        let mut handle: CublasHandle = ptr::null_mut();
        // SAFETY: cublasCreate_v2 initializes the output handle; on failure the
        // stream created above is destroyed before returning.
        let bound = unsafe {
            check_cublas((blas.create)(&mut handle), "cublasCreate_v2").and_then(|()| {
                check_cublas((blas.set_stream)(handle, stream), "cublasSetStream_v2")
            })
        };
        if let Err(e) = bound {
            // SAFETY: the handle is destroyed only if cublasCreate_v2 wrote
            // one, and the stream was created above; neither is used again.
            unsafe {
                if !handle.is_null() {
                    (blas.destroy)(handle);
                }
                (rt.stream_destroy)(stream);
            }
            return Err(e);
        }

        let staging = config.pinned.then(|| {
            Mutex::new(PinnedStaging {
                ptr: ptr::null_mut(),
                capacity: 0,
            })
        });

        Ok(Self {
            rt,
            blas,
            device,
            stream,
            handle,
            staging,
        })
    }

    /// Bind this backend's device to the calling thread.
    fn bind(&self) -> Result<()> {
        // SAFETY: plain runtime call.
        check_cuda(unsafe { (self.rt.set_device)(self.device) }, "cudaSetDevice")
    }

    fn sync(&self) {
        if let Err(e) = self.synchronize() {
            tracing::warn!(target: "batchgemm::runtime", error = %e, "CUDA: stream synchronize failed");
        }
    }

    fn memcpy(&self, dst: *mut c_void, src: *const c_void, bytes: usize, kind: c_int, call: &'static str) -> Result<()> {
        // SAFETY: callers pass a live device address and a host region of
        // `bytes` bytes.
        check_cuda(
            unsafe { (self.rt.memcpy_async)(dst, src, bytes, kind, self.stream) },
            call,
        )
    }
}

fn dev<T>(p: DevicePtr) -> *const T {
    p as usize as *const T
}

fn dev_mut<T>(p: DevicePtr) -> *mut T {
    p as usize as *mut T
}

impl DeviceBackend for CudaBackend {
    fn name(&self) -> &'static str {
        "cuda"
    }

    fn device_count(&self) -> Result<usize> {
        device_count()
    }

    fn mem_get_info(&self) -> Result<MemInfo> {
        self.bind()?;
        let (mut free, mut total) = (0usize, 0usize);
        // SAFETY: cudaMemGetInfo writes two size_t values.
        check_cuda(unsafe { (self.rt.mem_get_info)(&mut free, &mut total) }, "cudaMemGetInfo")?;
        Ok(MemInfo { free, total })
    }

    fn malloc(&self, bytes: usize) -> std::result::Result<DevicePtr, i32> {
        self.bind().map_err(|e| match e {
            GemmError::Runtime { code, .. } => code,
            _ => -1,
        })?;
        let mut p: *mut c_void = ptr::null_mut();
        // SAFETY: cudaMalloc writes one device pointer.
        let code = unsafe { (self.rt.malloc)(&mut p, bytes) };
        if code == ffi::CUDA_SUCCESS {
            Ok(p as usize as DevicePtr)
        } else {
            Err(code)
        }
    }

    fn free(&self, ptr: DevicePtr) -> Result<()> {
        self.bind()?;
        // SAFETY: ptr came from cudaMalloc on this device.
        check_cuda(unsafe { (self.rt.free)(dev_mut(ptr)) }, "cudaFree")
    }

    fn copy_to_device(&self, dst: DevicePtr, src: &[u8]) -> Result<()> {
        if src.is_empty() {
            return Ok(());
        }
        self.bind()?;
        match &self.staging {
            Some(staging) => {
                let mut staging = staging.lock();
                let area = staging.ensure(self.rt, src.len())?;
                area.copy_from_slice(src);
                self.memcpy(dev_mut(dst), area.as_ptr() as *const c_void, src.len(), CUDA_MEMCPY_HOST_TO_DEVICE, "cudaMemcpyAsync(HtoD)")?;
                // The staging area is reused by the next transfer.
                self.synchronize()
            }
            // Pageable source: the runtime stages it before returning.
            None => self.memcpy(dev_mut(dst), src.as_ptr() as *const c_void, src.len(), CUDA_MEMCPY_HOST_TO_DEVICE, "cudaMemcpyAsync(HtoD)"),
        }
    }

    fn copy_to_host(&self, dst: &mut [u8], src: DevicePtr) -> Result<()> {
        if dst.is_empty() {
            return Ok(());
        }
        self.bind()?;
        match &self.staging {
            Some(staging) => {
                let mut staging = staging.lock();
                let len = dst.len();
                let area = staging.ensure(self.rt, len)?;
                self.memcpy(area.as_mut_ptr() as *mut c_void, dev::<c_void>(src), len, CUDA_MEMCPY_DEVICE_TO_HOST, "cudaMemcpyAsync(DtoH)")?;
                self.synchronize()?;
                dst.copy_from_slice(area);
                Ok(())
            }
            None => {
                self.memcpy(dst.as_mut_ptr() as *mut c_void, dev::<c_void>(src), dst.len(), CUDA_MEMCPY_DEVICE_TO_HOST, "cudaMemcpyAsync(DtoH)")?;
                self.synchronize()
            }
        }
    }

    fn synchronize(&self) -> Result<()> {
        // SAFETY: stream is live for the lifetime of self.
        check_cuda(unsafe { (self.rt.stream_synchronize)(self.stream) }, "cudaStreamSynchronize")
    }

    fn gemm(
        &self,
        kind: ElementKind,
        dims: &BlasDims,
        scalars: RawScalars,
        a: DevicePtr,
        b: DevicePtr,
        c: DevicePtr,
    ) -> Result<()> {
        self.bind()?;
        let BlasDims { m, n, k, lda, ldb, ldc } = *dims;
        // SAFETY: operands are live device allocations sized by the caller
        // from the same dims; scalars are host pointers to locals.
        let status = unsafe {
            match kind {
                ElementKind::F32 => {
                    let (alpha, beta) = (scalars.alpha as f32, scalars.beta as f32);
                    (self.blas.sgemm)(self.handle, CUBLAS_OP_N, CUBLAS_OP_N, m, n, k, &alpha, dev(a), lda, dev(b), ldb, &beta, dev_mut(c), ldc)
                }
                ElementKind::F64 => {
                    let (alpha, beta) = (scalars.alpha, scalars.beta);
                    (self.blas.dgemm)(self.handle, CUBLAS_OP_N, CUBLAS_OP_N, m, n, k, &alpha, dev(a), lda, dev(b), ldb, &beta, dev_mut(c), ldc)
                }
            }
        };
        check_cublas(status, if kind == ElementKind::F32 { "cublasSgemm_v2" } else { "cublasDgemm_v2" })
    }

    fn gemm_batched(
        &self,
        kind: ElementKind,
        dims: &BlasDims,
        scalars: RawScalars,
        a_array: DevicePtr,
        b_array: DevicePtr,
        c_array: DevicePtr,
        batch_count: i32,
    ) -> Result<()> {
        self.bind()?;
        let BlasDims { m, n, k, lda, ldb, ldc } = *dims;
        // SAFETY: the three arrays are device buffers holding `batch_count`
        // device addresses each.
        let status = unsafe {
            match kind {
                ElementKind::F32 => {
                    let (alpha, beta) = (scalars.alpha as f32, scalars.beta as f32);
                    (self.blas.sgemm_batched)(
                        self.handle, CUBLAS_OP_N, CUBLAS_OP_N, m, n, k, &alpha,
                        dev(a_array), lda, dev(b_array), ldb, &beta, dev(c_array), ldc, batch_count,
                    )
                }
                ElementKind::F64 => {
                    let (alpha, beta) = (scalars.alpha, scalars.beta);
                    (self.blas.dgemm_batched)(
                        self.handle, CUBLAS_OP_N, CUBLAS_OP_N, m, n, k, &alpha,
                        dev(a_array), lda, dev(b_array), ldb, &beta, dev(c_array), ldc, batch_count,
                    )
                }
            }
        };
        check_cublas(status, if kind == ElementKind::F32 { "cublasSgemmBatched" } else { "cublasDgemmBatched" })
    }

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
    ) -> Result<()> {
        self.bind()?;
        let BlasDims { m, n, k, lda, ldb, ldc } = *dims;
        // SAFETY: base addresses plus `(batch_count - 1) * stride` stay inside
        // the caller's allocations.
        let status = unsafe {
            match kind {
                ElementKind::F32 => {
                    let (alpha, beta) = (scalars.alpha as f32, scalars.beta as f32);
                    (self.blas.sgemm_strided_batched)(
                        self.handle, CUBLAS_OP_N, CUBLAS_OP_N, m, n, k, &alpha,
                        dev(a), lda, strides.a, dev(b), ldb, strides.b, &beta, dev_mut(c), ldc, strides.c, batch_count,
                    )
                }
                ElementKind::F64 => {
                    let (alpha, beta) = (scalars.alpha, scalars.beta);
                    (self.blas.dgemm_strided_batched)(
                        self.handle, CUBLAS_OP_N, CUBLAS_OP_N, m, n, k, &alpha,
                        dev(a), lda, strides.a, dev(b), ldb, strides.b, &beta, dev_mut(c), ldc, strides.c, batch_count,
                    )
                }
            }
        };
        check_cublas(
            status,
            if kind == ElementKind::F32 { "cublasSgemmStridedBatched" } else { "cublasDgemmStridedBatched" },
        )
    }
}

impl Drop for CudaBackend {
    fn drop(&mut self) {
        // Synchronize before cleanup to ensure all work is complete.
        self.sync();

        // Destroy the cuBLAS handle before the stream it is bound to.
        // SAFETY: handle and stream are live and owned by self.
        unsafe {
            if let Err(e) = check_cublas((self.blas.destroy)(self.handle), "cublasDestroy_v2") {
                tracing::warn!(target: "batchgemm::runtime", error = %e, "CUDA: failed to destroy cuBLAS handle");
            }
        }
        if let Some(staging) = &self.staging {
            staging.lock().release(self.rt);
        }
        // SAFETY: the stream is idle after the synchronize above and nothing
        // is bound to it any more.
        unsafe {
            if let Err(e) = check_cuda((self.rt.stream_destroy)(self.stream), "cudaStreamDestroy") {
                tracing::warn!(target: "batchgemm::runtime", error = %e, "CUDA: failed to destroy stream");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Open a CUDA backend or skip the test when none is available.
    fn try_cuda(pinned: bool) -> Option<CudaBackend> {
        match CudaBackend::try_new(&SessionConfig::new().pinned(pinned)) {
            Ok(b) => Some(b),
            Err(e) => {
                eprintln!("Skipping CUDA test: {e}");
                None
            }
        }
    }

    #[test]
    fn test_device_count_without_driver_is_explicit() {
        match device_count() {
            Ok(_) => {}
            Err(e) => assert!(matches!(e, GemmError::BackendUnavailable(_) | GemmError::Runtime { .. })),
        }
    }

    #[test]
    fn test_copy_roundtrip() {
        for pinned in [false, true] {
            let Some(backend) = try_cuda(pinned) else { return };
            let p = backend.malloc(16).unwrap();
            let src: Vec<u8> = (0..16).collect();
            backend.copy_to_device(p, &src).unwrap();
            let mut out = [0u8; 16];
            backend.copy_to_host(&mut out, p).unwrap();
            assert_eq!(out.to_vec(), src);
            backend.free(p).unwrap();
        }
    }

    #[test]
    fn test_sgemm_identity() {
        let Some(backend) = try_cuda(false) else { return };
        let bytes = |v: &[f32]| batchgemm_core::element::to_bytes(v);
        let a = backend.malloc(16).unwrap();
        let b = backend.malloc(16).unwrap();
        let c = backend.malloc(16).unwrap();
        backend.copy_to_device(a, &bytes(&[1.0, 3.0, 2.0, 4.0])).unwrap();
        backend.copy_to_device(b, &bytes(&[1.0, 0.0, 0.0, 1.0])).unwrap();
        let dims = BlasDims { m: 2, n: 2, k: 2, lda: 2, ldb: 2, ldc: 2 };
        backend
            .gemm(ElementKind::F32, &dims, RawScalars { alpha: 1.0, beta: 0.0 }, a, b, c)
            .unwrap();
        let mut out = [0u8; 16];
        backend.copy_to_host(&mut out, c).unwrap();
        assert_eq!(batchgemm_core::element::from_bytes::<f32>(&out), vec![1.0, 3.0, 2.0, 4.0]);
        for p in [a, b, c] {
            backend.free(p).unwrap();
        }
    }
}
