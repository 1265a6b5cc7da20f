//! Runtime-loaded CUDA runtime and cuBLAS function pointers via dlopen.
//!
//! No link-time dependency on the CUDA toolkit: any install providing
//! `libcudart` and `libcublas` works.

use std::ffi::{c_int, c_longlong, c_void};
use std::sync::OnceLock;

use batchgemm_core::{GemmError, Result};
use libloading::Library;

// ---------------------------------------------------------------------------
// Status codes and opaque handles
// ---------------------------------------------------------------------------

pub type CudaErrorT = c_int;
pub const CUDA_SUCCESS: CudaErrorT = 0;
/// `cudaErrorNoDevice`: the runtime loaded but found no GPU.
pub const CUDA_ERROR_NO_DEVICE: CudaErrorT = 100;

// cudaMemcpyKind enum values
pub const CUDA_MEMCPY_HOST_TO_DEVICE: c_int = 1;
pub const CUDA_MEMCPY_DEVICE_TO_HOST: c_int = 2;

pub type CublasStatusT = c_int;
pub const CUBLAS_STATUS_SUCCESS: CublasStatusT = 0;

pub type CublasOperationT = c_int;
pub const CUBLAS_OP_N: CublasOperationT = 0;

pub type CudaStream = *mut c_void;
pub type CublasHandle = *mut c_void;

// ---------------------------------------------------------------------------
// CUDA runtime function signatures
// ---------------------------------------------------------------------------

type FnCudaGetDeviceCount = unsafe extern "C" fn(*mut c_int) -> CudaErrorT;
type FnCudaSetDevice = unsafe extern "C" fn(c_int) -> CudaErrorT;
type FnCudaMemGetInfo = unsafe extern "C" fn(*mut usize, *mut usize) -> CudaErrorT;
type FnCudaMalloc = unsafe extern "C" fn(*mut *mut c_void, usize) -> CudaErrorT;
type FnCudaFree = unsafe extern "C" fn(*mut c_void) -> CudaErrorT;
type FnCudaMallocHost = unsafe extern "C" fn(*mut *mut c_void, usize) -> CudaErrorT;
type FnCudaFreeHost = unsafe extern "C" fn(*mut c_void) -> CudaErrorT;
type FnCudaMemcpyAsync = unsafe extern "C" fn(
    *mut c_void, *const c_void, usize, c_int, CudaStream,
) -> CudaErrorT;
type FnCudaStreamCreate = unsafe extern "C" fn(*mut CudaStream) -> CudaErrorT;
type FnCudaStreamSynchronize = unsafe extern "C" fn(CudaStream) -> CudaErrorT;
type FnCudaStreamDestroy = unsafe extern "C" fn(CudaStream) -> CudaErrorT;

// ---------------------------------------------------------------------------
// cuBLAS function signatures
// ---------------------------------------------------------------------------

type FnCublasCreate = unsafe extern "C" fn(*mut CublasHandle) -> CublasStatusT;
type FnCublasDestroy = unsafe extern "C" fn(CublasHandle) -> CublasStatusT;
type FnCublasSetStream = unsafe extern "C" fn(CublasHandle, CudaStream) -> CublasStatusT;

type FnCublasGemm<T> = unsafe extern "C" fn(
    CublasHandle,
    CublasOperationT, CublasOperationT,
    c_int, c_int, c_int,          // m, n, k
    *const T,                     // alpha
    *const T, c_int,              // A, lda
    *const T, c_int,              // B, ldb
    *const T,                     // beta
    *mut T, c_int,                // C, ldc
) -> CublasStatusT;

type FnCublasGemmBatched<T> = unsafe extern "C" fn(
    CublasHandle,
    CublasOperationT, CublasOperationT,
    c_int, c_int, c_int,
    *const T,
    *const *const T, c_int,       // Aarray, lda
    *const *const T, c_int,       // Barray, ldb
    *const T,
    *const *mut T, c_int,         // Carray, ldc
    c_int,                        // batchCount
) -> CublasStatusT;

type FnCublasGemmStridedBatched<T> = unsafe extern "C" fn(
    CublasHandle,
    CublasOperationT, CublasOperationT,
    c_int, c_int, c_int,
    *const T,
    *const T, c_int, c_longlong,  // A, lda, strideA
    *const T, c_int, c_longlong,  // B, ldb, strideB
    *const T,
    *mut T, c_int, c_longlong,    // C, ldc, strideC
    c_int,
) -> CublasStatusT;

// ---------------------------------------------------------------------------
// Loaded API structs
// ---------------------------------------------------------------------------

pub struct CudaRuntimeApi {
    _lib: Library,
    pub get_device_count: FnCudaGetDeviceCount,
    pub set_device: FnCudaSetDevice,
    pub mem_get_info: FnCudaMemGetInfo,
    pub malloc: FnCudaMalloc,
    pub free: FnCudaFree,
    pub malloc_host: FnCudaMallocHost,
    pub free_host: FnCudaFreeHost,
    pub memcpy_async: FnCudaMemcpyAsync,
    pub stream_create: FnCudaStreamCreate,
    pub stream_synchronize: FnCudaStreamSynchronize,
    pub stream_destroy: FnCudaStreamDestroy,
}

pub struct CublasApi {
    _lib: Library,
    pub create: FnCublasCreate,
    pub destroy: FnCublasDestroy,
    pub set_stream: FnCublasSetStream,
    pub sgemm: FnCublasGemm<f32>,
    pub dgemm: FnCublasGemm<f64>,
    pub sgemm_batched: FnCublasGemmBatched<f32>,
    pub dgemm_batched: FnCublasGemmBatched<f64>,
    pub sgemm_strided_batched: FnCublasGemmStridedBatched<f32>,
    pub dgemm_strided_batched: FnCublasGemmStridedBatched<f64>,
}

// Safety: the loaded function pointers are process-global and the CUDA
// runtime and cuBLAS are internally synchronized.
unsafe impl Send for CudaRuntimeApi {}
unsafe impl Sync for CudaRuntimeApi {}
unsafe impl Send for CublasApi {}
unsafe impl Sync for CublasApi {}

// ---------------------------------------------------------------------------
// Library loading
// ---------------------------------------------------------------------------

const CUDART_CANDIDATES: &[&str] = &[
    "libcudart.so",
    "libcudart.so.12",
    "libcudart.so.11.0",
    "cudart64_12.dll",
    "cudart64_110.dll",
];

const CUBLAS_CANDIDATES: &[&str] = &[
    "libcublas.so",
    "libcublas.so.12",
    "libcublas.so.11",
    "cublas64_12.dll",
    "cublas64_11.dll",
];

static CUDA_RUNTIME: OnceLock<std::result::Result<CudaRuntimeApi, String>> = OnceLock::new();
static CUBLAS: OnceLock<std::result::Result<CublasApi, String>> = OnceLock::new();

fn open_first(candidates: &[&str]) -> std::result::Result<Library, String> {
    for name in candidates {
        // SAFETY: dynamic library probing only.
        if let Ok(lib) = unsafe { Library::new(name) } {
            return Ok(lib);
        }
    }
    Err(format!("failed to load any of {}", candidates.join(", ")))
}

fn symbol<T: Copy>(lib: &Library, name: &'static [u8]) -> std::result::Result<T, String> {
    // SAFETY: symbol type is expected to match the CUDA/cuBLAS C API.
    unsafe { lib.get::<T>(name) }.map(|s| *s).map_err(|e| {
        format!(
            "failed to resolve symbol {}: {e}",
            String::from_utf8_lossy(&name[..name.len().saturating_sub(1)])
        )
    })
}

impl CudaRuntimeApi {
    fn try_load() -> std::result::Result<Self, String> {
        let lib = open_first(CUDART_CANDIDATES)?;
        Ok(Self {
            get_device_count: symbol(&lib, b"cudaGetDeviceCount\0")?,
            set_device: symbol(&lib, b"cudaSetDevice\0")?,
            mem_get_info: symbol(&lib, b"cudaMemGetInfo\0")?,
            malloc: symbol(&lib, b"cudaMalloc\0")?,
            free: symbol(&lib, b"cudaFree\0")?,
            malloc_host: symbol(&lib, b"cudaMallocHost\0")?,
            free_host: symbol(&lib, b"cudaFreeHost\0")?,
            memcpy_async: symbol(&lib, b"cudaMemcpyAsync\0")?,
            stream_create: symbol(&lib, b"cudaStreamCreate\0")?,
            stream_synchronize: symbol(&lib, b"cudaStreamSynchronize\0")?,
            stream_destroy: symbol(&lib, b"cudaStreamDestroy\0")?,
            _lib: lib,
        })
    }
}

impl CublasApi {
    fn try_load() -> std::result::Result<Self, String> {
        let lib = open_first(CUBLAS_CANDIDATES)?;
        Ok(Self {
            create: symbol(&lib, b"cublasCreate_v2\0")?,
            destroy: symbol(&lib, b"cublasDestroy_v2\0")?,
            set_stream: symbol(&lib, b"cublasSetStream_v2\0")?,
            sgemm: symbol(&lib, b"cublasSgemm_v2\0")?,
            dgemm: symbol(&lib, b"cublasDgemm_v2\0")?,
            sgemm_batched: symbol(&lib, b"cublasSgemmBatched\0")?,
            dgemm_batched: symbol(&lib, b"cublasDgemmBatched\0")?,
            sgemm_strided_batched: symbol(&lib, b"cublasSgemmStridedBatched\0")?,
            dgemm_strided_batched: symbol(&lib, b"cublasDgemmStridedBatched\0")?,
            _lib: lib,
        })
    }
}

/// The runtime-loaded CUDA runtime API.
pub fn cuda_runtime() -> Result<&'static CudaRuntimeApi> {
    CUDA_RUNTIME
        .get_or_init(CudaRuntimeApi::try_load)
        .as_ref()
        .map_err(|e| GemmError::BackendUnavailable(format!("CUDA runtime: {e}")))
}

/// The runtime-loaded cuBLAS API.
pub fn cublas() -> Result<&'static CublasApi> {
    CUBLAS
        .get_or_init(CublasApi::try_load)
        .as_ref()
        .map_err(|e| GemmError::BackendUnavailable(format!("cuBLAS: {e}")))
}

// ---------------------------------------------------------------------------
// Error checking helpers
// ---------------------------------------------------------------------------

/// Check a CUDA runtime return code.
pub fn check_cuda(code: CudaErrorT, call: &'static str) -> Result<()> {
    if code == CUDA_SUCCESS {
        Ok(())
    } else {
        Err(GemmError::Runtime { call, code })
    }
}

/// Check a cuBLAS status.
pub fn check_cublas(status: CublasStatusT, call: &'static str) -> Result<()> {
    if status == CUBLAS_STATUS_SUCCESS {
        Ok(())
    } else {
        Err(GemmError::Runtime { call, code: status })
    }
}
