//! Host-emulated device.
//!
//! Allocations live in RAM but are addressed through opaque [`DevicePtr`]
//! values, so every layer above the backend (allocator accounting, pointer
//! arrays, strides, interior addresses) runs exactly as it does on a GPU.
//! All work executes eagerly on the calling thread; `synchronize` is a no-op.

use std::collections::BTreeMap;

use batchgemm_core::element::{from_bytes, to_bytes};
use batchgemm_core::reference::gemm_col_major;
use batchgemm_core::{BlasDims, Element, ElementKind, GemmError, RawScalars, Result, Strides};
use parking_lot::Mutex;

use crate::backend::{DeviceBackend, DevicePtr, MemInfo};

/// First address handed out. Non-zero so that `0` never names a buffer.
const BASE_ADDR: u64 = 0x7f00_0000_0000;
/// Allocation granularity, same as `cudaMalloc`.
const ALIGN: u64 = 256;

/// `cudaErrorMemoryAllocation`.
const ERR_MEMORY_ALLOCATION: i32 = 2;
/// `cudaErrorInvalidValue`.
const ERR_INVALID_VALUE: i32 = 1;

/// Device backend that emulates device memory and BLAS on the host.
pub struct HostBackend {
    capacity: usize,
    arena: Mutex<Arena>,
}

struct Arena {
    next_addr: u64,
    used: usize,
    blocks: BTreeMap<u64, Vec<u8>>,
}

impl HostBackend {
    /// Emulated device with `capacity` bytes of memory.
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            arena: Mutex::new(Arena {
                next_addr: BASE_ADDR,
                used: 0,
                blocks: BTreeMap::new(),
            }),
        }
    }

    /// Number of live allocations.
    pub fn live_allocations(&self) -> usize {
        self.arena.lock().blocks.len()
    }
}

impl std::fmt::Debug for HostBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let arena = self.arena.lock();
        f.debug_struct("HostBackend")
            .field("capacity", &self.capacity)
            .field("used", &arena.used)
            .field("blocks", &arena.blocks.len())
            .finish()
    }
}

impl Arena {
    /// Find the block containing `[addr, addr + len)`; returns block base and
    /// byte offset.
    fn resolve(&self, call: &'static str, addr: DevicePtr, len: usize) -> Result<(u64, usize)> {
        let invalid = GemmError::Runtime {
            call,
            code: ERR_INVALID_VALUE,
        };
        let (&base, block) = self.blocks.range(..=addr).next_back().ok_or(invalid)?;
        let offset = (addr - base) as usize;
        match offset.checked_add(len) {
            Some(end) if end <= block.len() => Ok((base, offset)),
            _ => Err(GemmError::Runtime {
                call,
                code: ERR_INVALID_VALUE,
            }),
        }
    }

    fn read(&self, call: &'static str, addr: DevicePtr, len: usize) -> Result<&[u8]> {
        let (base, offset) = self.resolve(call, addr, len)?;
        Ok(&self.blocks[&base][offset..offset + len])
    }

    fn write(&mut self, call: &'static str, addr: DevicePtr, bytes: &[u8]) -> Result<()> {
        let (base, offset) = self.resolve(call, addr, bytes.len())?;
        if let Some(block) = self.blocks.get_mut(&base) {
            block[offset..offset + bytes.len()].copy_from_slice(bytes);
        }
        Ok(())
    }

    fn read_elems<T: Element>(&self, call: &'static str, addr: DevicePtr, count: usize) -> Result<Vec<T>> {
        Ok(from_bytes(self.read(call, addr, count * T::KIND.size_of())?))
    }

    fn read_ptrs(&self, call: &'static str, addr: DevicePtr, count: usize) -> Result<Vec<DevicePtr>> {
        let bytes = self.read(call, addr, count * std::mem::size_of::<DevicePtr>())?;
        Ok(bytes
            .chunks_exact(std::mem::size_of::<DevicePtr>())
            .map(|c| {
                let mut raw = [0u8; 8];
                raw.copy_from_slice(c);
                u64::from_ne_bytes(raw)
            })
            .collect())
    }

    fn gemm<T: Element>(
        &mut self,
        call: &'static str,
        dims: &BlasDims,
        scalars: RawScalars,
        a: DevicePtr,
        b: DevicePtr,
        c: DevicePtr,
    ) -> Result<()> {
        let (m, n, k) = (dims.m as usize, dims.n as usize, dims.k as usize);
        let (lda, ldb, ldc) = (dims.lda as usize, dims.ldb as usize, dims.ldc as usize);
        if m == 0 || n == 0 {
            return Ok(());
        }
        let a_vals: Vec<T> = self.read_elems(call, a, span(lda, m, k))?;
        let b_vals: Vec<T> = self.read_elems(call, b, span(ldb, k, n))?;
        let mut c_vals: Vec<T> = self.read_elems(call, c, span(ldc, m, n))?;
        gemm_col_major(
            m,
            n,
            k,
            T::from_f64(scalars.alpha),
            &a_vals,
            lda,
            &b_vals,
            ldb,
            T::from_f64(scalars.beta),
            &mut c_vals,
            ldc,
        );
        self.write(call, c, &to_bytes(&c_vals))
    }
}

/// Elements touched by a column-major `rows x cols` operand with leading
/// dimension `ld`.
fn span(ld: usize, rows: usize, cols: usize) -> usize {
    if rows == 0 || cols == 0 {
        0
    } else {
        ld * (cols - 1) + rows
    }
}

/// Address of operand `index` in a strided batch.
fn strided(base: DevicePtr, index: usize, stride: i64, kind: ElementKind) -> DevicePtr {
    let offset = index as i64 * stride * kind.size_of() as i64;
    base.wrapping_add(offset as u64)
}

impl DeviceBackend for HostBackend {
    fn name(&self) -> &'static str {
        "host"
    }

    fn device_count(&self) -> Result<usize> {
        Ok(1)
    }

    fn mem_get_info(&self) -> Result<MemInfo> {
        let arena = self.arena.lock();
        Ok(MemInfo {
            free: self.capacity.saturating_sub(arena.used),
            total: self.capacity,
        })
    }

    fn malloc(&self, bytes: usize) -> std::result::Result<DevicePtr, i32> {
        let mut arena = self.arena.lock();
        if arena.used.saturating_add(bytes) > self.capacity {
            return Err(ERR_MEMORY_ALLOCATION);
        }
        let addr = arena.next_addr;
        let footprint = (bytes.max(1) as u64 + ALIGN - 1) / ALIGN * ALIGN;
        arena.next_addr += footprint;
        arena.used += bytes;
        arena.blocks.insert(addr, vec![0u8; bytes]);
        Ok(addr)
    }

    fn free(&self, ptr: DevicePtr) -> Result<()> {
        let mut arena = self.arena.lock();
        match arena.blocks.remove(&ptr) {
            Some(block) => {
                arena.used -= block.len();
                Ok(())
            }
            None => Err(GemmError::Runtime {
                call: "hostFree",
                code: ERR_INVALID_VALUE,
            }),
        }
    }

    fn copy_to_device(&self, dst: DevicePtr, src: &[u8]) -> Result<()> {
        self.arena.lock().write("hostMemcpyHtoD", dst, src)
    }

    fn copy_to_host(&self, dst: &mut [u8], src: DevicePtr) -> Result<()> {
        let arena = self.arena.lock();
        dst.copy_from_slice(arena.read("hostMemcpyDtoH", src, dst.len())?);
        Ok(())
    }

    fn synchronize(&self) -> Result<()> {
        Ok(())
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
        let mut arena = self.arena.lock();
        match kind {
            ElementKind::F32 => arena.gemm::<f32>("hostSgemm", dims, scalars, a, b, c),
            ElementKind::F64 => arena.gemm::<f64>("hostDgemm", dims, scalars, a, b, c),
        }
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
        let count = usize::try_from(batch_count).map_err(|_| GemmError::Runtime {
            call: "hostGemmBatched",
            code: ERR_INVALID_VALUE,
        })?;
        let mut arena = self.arena.lock();
        let a_ptrs = arena.read_ptrs("hostGemmBatched", a_array, count)?;
        let b_ptrs = arena.read_ptrs("hostGemmBatched", b_array, count)?;
        let c_ptrs = arena.read_ptrs("hostGemmBatched", c_array, count)?;
        for ((a, b), c) in a_ptrs.into_iter().zip(b_ptrs).zip(c_ptrs) {
            match kind {
                ElementKind::F32 => arena.gemm::<f32>("hostSgemmBatched", dims, scalars, a, b, c)?,
                ElementKind::F64 => arena.gemm::<f64>("hostDgemmBatched", dims, scalars, a, b, c)?,
            }
        }
        Ok(())
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
        let count = usize::try_from(batch_count).map_err(|_| GemmError::Runtime {
            call: "hostGemmStridedBatched",
            code: ERR_INVALID_VALUE,
        })?;
        let mut arena = self.arena.lock();
        for i in 0..count {
            let (ai, bi, ci) = (
                strided(a, i, strides.a, kind),
                strided(b, i, strides.b, kind),
                strided(c, i, strides.c, kind),
            );
            match kind {
                ElementKind::F32 => arena.gemm::<f32>("hostSgemmStridedBatched", dims, scalars, ai, bi, ci)?,
                ElementKind::F64 => arena.gemm::<f64>("hostDgemmStridedBatched", dims, scalars, ai, bi, ci)?,
            }
        }
        Ok(())
    }
}
