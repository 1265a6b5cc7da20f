//! Batch packing: laying a tensor of same-shaped matrices out on the device.
//!
//! Two layouts are produced:
//!
//! - [`PointerBatch`]: one device buffer per matrix plus a [`PointerArray`]
//!   of their addresses, for the pointer-array batched GEMM.
//! - [`StridedBatch`]: one contiguous buffer with operand `i` at
//!   `base + i * stride`, for the strided-batched GEMM.

use std::marker::PhantomData;

use batchgemm_core::{Element, GemmError, Matrix, Result};

use crate::allocator::DeviceBuffer;
use crate::backend::DevicePtr;
use crate::session::DeviceSession;

/// Common `(rows, cols)` of every matrix in `tensor`, or `None` when the
/// tensor is empty.
pub fn uniform_shape<T: Element>(op: &'static str, tensor: &[Matrix<T>]) -> Result<Option<(usize, usize)>> {
    let Some(first) = tensor.first() else {
        return Ok(None);
    };
    let shape = first.shape();
    if let Some((i, m)) = tensor.iter().enumerate().find(|(_, m)| m.shape() != shape) {
        return Err(GemmError::shape(
            op,
            format!("every matrix {}x{}", shape.0, shape.1),
            format!("matrix {i} is {}x{}", m.rows(), m.cols()),
        ));
    }
    Ok(Some(shape))
}

fn byte_len<T: Element>(count: usize, rows: usize, cols: usize) -> Result<usize> {
    count
        .checked_mul(rows)
        .and_then(|n| n.checked_mul(cols))
        .and_then(|n| n.checked_mul(T::KIND.size_of()))
        .ok_or(GemmError::DimensionOverflow { what: "batch bytes", value: count })
}

// ---------------------------------------------------------------------------
// PointerArray
// ---------------------------------------------------------------------------

/// Host-side list of device operand addresses.
///
/// Uploaded to a request-scoped device buffer when a batched GEMM is
/// dispatched; the list itself never owns device memory.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct PointerArray {
    addresses: Vec<DevicePtr>,
}

impl PointerArray {
    /// Array over explicit addresses.
    pub fn new(addresses: Vec<DevicePtr>) -> Self {
        Self { addresses }
    }

    /// The same address repeated `count` times, for an operand shared by
    /// every instance.
    pub fn replicated(ptr: DevicePtr, count: usize) -> Self {
        Self::new(vec![ptr; count])
    }

    /// Number of addresses.
    pub fn len(&self) -> usize {
        self.addresses.len()
    }

    /// Whether the array is empty.
    pub fn is_empty(&self) -> bool {
        self.addresses.is_empty()
    }

    /// Address `i`, if any.
    pub fn get(&self, i: usize) -> Option<DevicePtr> {
        self.addresses.get(i).copied()
    }

    /// All addresses.
    pub fn as_slice(&self) -> &[DevicePtr] {
        &self.addresses
    }

    /// Copy the addresses into a fresh device buffer.
    pub fn to_device(&self, session: &DeviceSession) -> Result<DeviceBuffer> {
        let bytes: Vec<u8> = self.addresses.iter().flat_map(|p| p.to_ne_bytes()).collect();
        let buffer = session.allocate(bytes.len())?;
        session.write_bytes(&buffer, 0, &bytes)?;
        Ok(buffer)
    }
}

// ---------------------------------------------------------------------------
// PointerBatch
// ---------------------------------------------------------------------------

/// `count` device matrices of one shape, each in its own buffer.
#[derive(Debug)]
pub struct PointerBatch<T> {
    buffers: Vec<DeviceBuffer>,
    pointers: PointerArray,
    rows: usize,
    cols: usize,
    _marker: PhantomData<T>,
}

impl<T: Element> PointerBatch<T> {
    /// Allocate `count` uninitialised `rows x cols` matrices.
    ///
    /// If any allocation fails, the ones already made are released before
    /// the error is returned.
    pub fn reserve(session: &DeviceSession, count: usize, rows: usize, cols: usize) -> Result<Self> {
        let bytes = byte_len::<T>(1, rows, cols)?;
        byte_len::<T>(count, rows, cols)?;
        let mut buffers = Vec::with_capacity(count);
        for _ in 0..count {
            buffers.push(session.allocate(bytes)?);
        }
        let pointers = PointerArray::new(buffers.iter().map(DeviceBuffer::as_ptr).collect());
        Ok(Self {
            buffers,
            pointers,
            rows,
            cols,
            _marker: PhantomData,
        })
    }

    /// Allocate one buffer per matrix in `tensor` and upload it.
    pub fn pack(session: &DeviceSession, tensor: &[Matrix<T>]) -> Result<Self> {
        let (rows, cols) = uniform_shape("pack_pointer_batch", tensor)?.unwrap_or((0, 0));
        let batch = Self::reserve(session, tensor.len(), rows, cols)?;
        batch.upload(session, tensor)?;
        Ok(batch)
    }

    /// Overwrite the batch with `tensor`, which must match its count and
    /// shape.
    pub fn upload(&self, session: &DeviceSession, tensor: &[Matrix<T>]) -> Result<()> {
        if tensor.len() != self.len() {
            return Err(GemmError::shape(
                "upload_batch",
                format!("{} matrices", self.len()),
                format!("{} matrices", tensor.len()),
            ));
        }
        for (i, (buffer, m)) in self.buffers.iter().zip(tensor).enumerate() {
            if m.shape() != (self.rows, self.cols) {
                return Err(GemmError::shape(
                    "upload_batch",
                    format!("every matrix {}x{}", self.rows, self.cols),
                    format!("matrix {i} is {}x{}", m.rows(), m.cols()),
                ));
            }
            session.upload_into(buffer, 0, m)?;
        }
        Ok(())
    }

    /// Write the same matrix into every slot.
    pub fn upload_shared(&self, session: &DeviceSession, m: &Matrix<T>) -> Result<()> {
        if m.shape() != (self.rows, self.cols) {
            return Err(GemmError::shape(
                "upload_shared",
                format!("{}x{}", self.rows, self.cols),
                format!("{}x{}", m.rows(), m.cols()),
            ));
        }
        for buffer in &self.buffers {
            session.upload_into(buffer, 0, m)?;
        }
        Ok(())
    }

    /// Read every matrix back, in order.
    pub fn download_all(&self, session: &DeviceSession) -> Result<Vec<Matrix<T>>> {
        self.buffers
            .iter()
            .map(|b| session.download(b, 0, self.rows, self.cols))
            .collect()
    }

    /// Number of matrices.
    pub fn len(&self) -> usize {
        self.buffers.len()
    }

    /// Whether the batch holds no matrices.
    pub fn is_empty(&self) -> bool {
        self.buffers.is_empty()
    }

    /// `(rows, cols)` of each matrix.
    pub fn shape(&self) -> (usize, usize) {
        (self.rows, self.cols)
    }

    /// Device addresses of the matrices.
    pub fn pointers(&self) -> &PointerArray {
        &self.pointers
    }

    /// Free every buffer now. All buffers are released even if one fails;
    /// the first error is returned.
    pub fn release(self) -> Result<()> {
        let mut first = Ok(());
        for buffer in self.buffers {
            if let Err(e) = buffer.release() {
                if first.is_ok() {
                    first = Err(e);
                }
            }
        }
        first
    }
}

/// Reserve `count` uninitialised `rows x cols` matrices as a [`PointerBatch`].
pub fn reserve_pointer_batch<T: Element>(
    session: &DeviceSession,
    count: usize,
    rows: usize,
    cols: usize,
) -> Result<PointerBatch<T>> {
    PointerBatch::reserve(session, count, rows, cols)
}

/// Upload `tensor` as a [`PointerBatch`].
pub fn pack_pointer_batch<T: Element>(session: &DeviceSession, tensor: &[Matrix<T>]) -> Result<PointerBatch<T>> {
    PointerBatch::pack(session, tensor)
}

// ---------------------------------------------------------------------------
// StridedBatch
// ---------------------------------------------------------------------------

/// `count` device matrices of one shape, packed back to back in a single
/// buffer.
#[derive(Debug)]
pub struct StridedBatch<T> {
    buffer: DeviceBuffer,
    count: usize,
    rows: usize,
    cols: usize,
    _marker: PhantomData<T>,
}

impl<T: Element> StridedBatch<T> {
    /// Allocate room for `count` uninitialised `rows x cols` matrices.
    pub fn reserve(session: &DeviceSession, count: usize, rows: usize, cols: usize) -> Result<Self> {
        let buffer = session.allocate(byte_len::<T>(count, rows, cols)?)?;
        Ok(Self {
            buffer,
            count,
            rows,
            cols,
            _marker: PhantomData,
        })
    }

    /// Allocate one buffer for all of `tensor` and upload it.
    pub fn pack(session: &DeviceSession, tensor: &[Matrix<T>]) -> Result<Self> {
        let (rows, cols) = uniform_shape("pack_strided_batch", tensor)?.unwrap_or((0, 0));
        let batch = Self::reserve(session, tensor.len(), rows, cols)?;
        let stride = batch.stride_elems();
        for (i, m) in tensor.iter().enumerate() {
            session.upload_into(&batch.buffer, i * stride, m)?;
        }
        Ok(batch)
    }

    fn stride_elems(&self) -> usize {
        self.rows * self.cols
    }

    /// Element distance between consecutive matrices.
    pub fn stride(&self) -> i64 {
        self.stride_elems() as i64
    }

    /// Device address of the first matrix.
    pub fn base(&self) -> DevicePtr {
        self.buffer.as_ptr()
    }

    /// Number of matrices.
    pub fn len(&self) -> usize {
        self.count
    }

    /// Whether the batch holds no matrices.
    pub fn is_empty(&self) -> bool {
        self.count == 0
    }

    /// `(rows, cols)` of each matrix.
    pub fn shape(&self) -> (usize, usize) {
        (self.rows, self.cols)
    }

    /// Read matrix `i` back.
    pub fn download(&self, session: &DeviceSession, i: usize) -> Result<Matrix<T>> {
        if i >= self.count {
            return Err(GemmError::InvalidBatch(format!(
                "index {i} out of range for batch of {}",
                self.count
            )));
        }
        session.download(&self.buffer, i * self.stride_elems(), self.rows, self.cols)
    }

    /// Read every matrix back, in order.
    pub fn download_all(&self, session: &DeviceSession) -> Result<Vec<Matrix<T>>> {
        (0..self.count).map(|i| self.download(session, i)).collect()
    }
}

/// Reserve room for `count` `rows x cols` matrices as a [`StridedBatch`].
pub fn reserve_strided_batch<T: Element>(
    session: &DeviceSession,
    count: usize,
    rows: usize,
    cols: usize,
) -> Result<StridedBatch<T>> {
    StridedBatch::reserve(session, count, rows, cols)
}

/// Upload `tensor` as a [`StridedBatch`].
pub fn pack_strided_batch<T: Element>(session: &DeviceSession, tensor: &[Matrix<T>]) -> Result<StridedBatch<T>> {
    StridedBatch::pack(session, tensor)
}
