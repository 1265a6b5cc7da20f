//! Device memory allocator.
//!
//! Every allocation is checked against the device's free memory first, so an
//! impossible request fails before anything is reserved. Buffers are RAII
//! handles: dropping a [`DeviceBuffer`] returns its memory exactly once.

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use batchgemm_core::{GemmError, Result};
use parking_lot::Mutex;

use crate::backend::{DeviceBackend, DevicePtr, MemInfo};

/// Allocation counters for one allocator.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AllocatorStats {
    /// Successful device allocations.
    pub allocations: u64,
    /// Device allocations returned.
    pub frees: u64,
    /// Allocations currently alive.
    pub live_buffers: usize,
    /// Bytes currently allocated.
    pub live_bytes: usize,
}

/// Allocator bound to one backend.
pub struct DeviceAllocator {
    backend: Arc<dyn DeviceBackend>,
    live: Mutex<HashMap<DevicePtr, usize>>,
    allocations: AtomicU64,
    frees: AtomicU64,
}

impl DeviceAllocator {
    /// Allocator for `backend`.
    pub fn new(backend: Arc<dyn DeviceBackend>) -> Arc<Self> {
        Arc::new(Self {
            backend,
            live: Mutex::new(HashMap::new()),
            allocations: AtomicU64::new(0),
            frees: AtomicU64::new(0),
        })
    }

    /// Reserve `bytes` of device memory.
    ///
    /// Fails with [`GemmError::OutOfDeviceMemory`] when `bytes` exceeds the
    /// device's free memory, without attempting the allocation. A zero-byte
    /// request yields an empty buffer that owns nothing.
    pub fn allocate(self: &Arc<Self>, bytes: usize) -> Result<DeviceBuffer> {
        if bytes == 0 {
            return Ok(DeviceBuffer::empty());
        }
        let MemInfo { free, total } = self.backend.mem_get_info()?;
        if bytes > free {
            tracing::debug!(target: "batchgemm::runtime", requested = bytes, free, total, "allocation exceeds free device memory");
            return Err(GemmError::OutOfDeviceMemory {
                requested: bytes,
                free,
                total,
            });
        }
        let ptr = self
            .backend
            .malloc(bytes)
            .map_err(|code| GemmError::DeviceAllocationFailed {
                requested: bytes,
                code,
            })?;
        self.live.lock().insert(ptr, bytes);
        self.allocations.fetch_add(1, Ordering::Relaxed);
        tracing::debug!(target: "batchgemm::runtime", ptr = format_args!("{ptr:#x}"), bytes, "device alloc");
        Ok(DeviceBuffer {
            ptr,
            bytes,
            allocator: Some(Arc::clone(self)),
        })
    }

    /// Return `ptr` to the backend. Handles not currently live are rejected
    /// before the backend is called.
    ///
    /// The handle stays registered if the backend refuses the free: the
    /// memory is still held, so it keeps counting as live.
    pub(crate) fn free(&self, ptr: DevicePtr) -> Result<()> {
        let mut live = self.live.lock();
        if !live.contains_key(&ptr) {
            return Err(GemmError::DoubleFreeOrInvalidHandle { handle: ptr });
        }
        self.backend.free(ptr)?;
        live.remove(&ptr);
        self.frees.fetch_add(1, Ordering::Relaxed);
        tracing::debug!(target: "batchgemm::runtime", ptr = format_args!("{ptr:#x}"), "device free");
        Ok(())
    }

    /// Free/total memory of the device.
    pub fn mem_info(&self) -> Result<MemInfo> {
        self.backend.mem_get_info()
    }

    /// Current counters.
    pub fn stats(&self) -> AllocatorStats {
        let live = self.live.lock();
        AllocatorStats {
            allocations: self.allocations.load(Ordering::Relaxed),
            frees: self.frees.load(Ordering::Relaxed),
            live_buffers: live.len(),
            live_bytes: live.values().sum(),
        }
    }
}

impl fmt::Debug for DeviceAllocator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DeviceAllocator")
            .field("backend", &self.backend.name())
            .field("stats", &self.stats())
            .finish()
    }
}

// ---------------------------------------------------------------------------
// DeviceBuffer: RAII handle for one device allocation
// ---------------------------------------------------------------------------

/// A region of device memory. Freed when dropped.
pub struct DeviceBuffer {
    ptr: DevicePtr,
    bytes: usize,
    allocator: Option<Arc<DeviceAllocator>>,
}

impl DeviceBuffer {
    fn empty() -> Self {
        Self {
            ptr: 0,
            bytes: 0,
            allocator: None,
        }
    }

    /// Device address of the first byte.
    #[inline]
    pub fn as_ptr(&self) -> DevicePtr {
        self.ptr
    }

    /// Size in bytes.
    #[inline]
    pub fn len(&self) -> usize {
        self.bytes
    }

    /// Whether the buffer holds no memory.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.bytes == 0
    }

    /// Free now and report the result, instead of logging it on drop.
    pub fn release(mut self) -> Result<()> {
        match self.allocator.take() {
            Some(allocator) => allocator.free(self.ptr),
            None => Ok(()),
        }
    }
}

impl Drop for DeviceBuffer {
    fn drop(&mut self) {
        if let Some(allocator) = self.allocator.take() {
            if let Err(e) = allocator.free(self.ptr) {
                tracing::warn!(target: "batchgemm::runtime", error = %e, "failed to free device memory");
            }
        }
    }
}

impl fmt::Debug for DeviceBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DeviceBuffer")
            .field("ptr", &format_args!("{:#x}", self.ptr))
            .field("bytes", &self.bytes)
            .finish()
    }
}
