//! Device session: one backend, one stream, one allocator.

use std::cell::Cell;
use std::marker::PhantomData;
use std::sync::Arc;

use batchgemm_core::{Result, SessionConfig};

use crate::allocator::{AllocatorStats, DeviceAllocator, DeviceBuffer};
use crate::backend::{select_backend, DeviceBackend, MemInfo};

/// An open execution context on one device.
///
/// A session may be moved to another thread but not shared between threads
/// (`Send`, not `Sync`): all work goes through a single stream and callers
/// must not interleave operations on it.
///
/// Device memory is only reachable through [`DeviceBuffer`]s handed out by
/// the session's allocator; the raw backend is not part of the public API.
///
/// ```compile_fail
/// let session = batchgemm_runtime::DeviceSession::host(1024).unwrap();
/// let buf = session.allocate(64).unwrap();
/// session.backend().free(buf.as_ptr()).unwrap();
/// ```
pub struct DeviceSession {
    config: SessionConfig,
    backend: Arc<dyn DeviceBackend>,
    allocator: Arc<DeviceAllocator>,
    _single_writer: PhantomData<Cell<()>>,
}

impl DeviceSession {
    /// Open a session according to `config`.
    pub fn open(config: SessionConfig) -> Result<Self> {
        let backend = select_backend(&config)?;
        Ok(Self::with_backend(backend, config))
    }

    /// Host-emulated session with `capacity` bytes of device memory.
    pub fn host(capacity: usize) -> Result<Self> {
        Self::open(SessionConfig::host(capacity))
    }

    /// Session over an explicit backend.
    pub fn with_backend(backend: Arc<dyn DeviceBackend>, config: SessionConfig) -> Self {
        tracing::debug!(target: "batchgemm::runtime", backend = backend.name(), pinned = config.pinned, "device session opened");
        let allocator = DeviceAllocator::new(Arc::clone(&backend));
        Self {
            config,
            backend,
            allocator,
            _single_writer: PhantomData,
        }
    }

    /// Configuration the session was opened with.
    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    /// Name of the active backend (`"cuda"` or `"host"`).
    pub fn backend_name(&self) -> &'static str {
        self.backend.name()
    }

    /// The active backend. Raw `malloc`/`free` bypass the allocator, so the
    /// backend never leaves the crate.
    pub(crate) fn backend(&self) -> &Arc<dyn DeviceBackend> {
        &self.backend
    }

    /// The session's allocator.
    pub fn allocator(&self) -> &Arc<DeviceAllocator> {
        &self.allocator
    }

    /// Reserve `bytes` of device memory.
    pub fn allocate(&self, bytes: usize) -> Result<DeviceBuffer> {
        self.allocator.allocate(bytes)
    }

    /// Free/total device memory.
    pub fn mem_info(&self) -> Result<MemInfo> {
        self.allocator.mem_info()
    }

    /// Allocation counters.
    pub fn stats(&self) -> AllocatorStats {
        self.allocator.stats()
    }

    /// Wait for all enqueued work to finish.
    pub fn synchronize(&self) -> Result<()> {
        self.backend.synchronize()
    }
}

impl std::fmt::Debug for DeviceSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeviceSession")
            .field("backend", &self.backend.name())
            .field("config", &self.config)
            .finish()
    }
}

impl Drop for DeviceSession {
    fn drop(&mut self) {
        // Outstanding buffers keep the backend alive; only flush the stream.
        if let Err(e) = self.backend.synchronize() {
            tracing::warn!(target: "batchgemm::runtime", error = %e, "device session: final synchronize failed");
        }
    }
}
