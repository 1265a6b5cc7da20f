//! Host <-> device transfers of column-major matrices.
//!
//! Uploads are enqueued on the session stream. Downloads synchronize the
//! stream first, so every GEMM submitted before a download is complete by
//! the time its result reaches host memory.

use std::marker::PhantomData;

use batchgemm_core::element::{from_bytes, to_bytes};
use batchgemm_core::{Element, GemmError, Matrix, Result};

use crate::allocator::DeviceBuffer;
use crate::backend::DevicePtr;
use crate::session::DeviceSession;

/// A matrix resident on the device. Owns its buffer.
#[derive(Debug)]
pub struct DeviceMatrix<T> {
    buffer: DeviceBuffer,
    rows: usize,
    cols: usize,
    _marker: PhantomData<T>,
}

impl<T: Element> DeviceMatrix<T> {
    /// Device address of element `(0, 0)`.
    #[inline]
    pub fn as_ptr(&self) -> DevicePtr {
        self.buffer.as_ptr()
    }

    /// Row count.
    #[inline]
    pub fn rows(&self) -> usize {
        self.rows
    }

    /// Column count.
    #[inline]
    pub fn cols(&self) -> usize {
        self.cols
    }

    /// The underlying buffer.
    pub fn buffer(&self) -> &DeviceBuffer {
        &self.buffer
    }
}

/// Byte range `[offset, offset + count)` in elements of `T`, checked against
/// a buffer of `len` bytes.
fn element_range<T: Element>(op: &'static str, len: usize, offset: usize, count: usize) -> Result<usize> {
    let width = T::KIND.size_of();
    let end = offset
        .checked_add(count)
        .and_then(|e| e.checked_mul(width))
        .ok_or(GemmError::DimensionOverflow { what: "transfer extent", value: offset })?;
    if end > len {
        return Err(GemmError::shape(
            op,
            format!("at most {len} bytes"),
            format!("{count} elements at offset {offset} ({end} bytes)"),
        ));
    }
    Ok(offset * width)
}

fn check_bytes(op: &'static str, buffer: &DeviceBuffer, byte_offset: usize, len: usize) -> Result<()> {
    match byte_offset.checked_add(len) {
        Some(end) if end <= buffer.len() => Ok(()),
        _ => Err(GemmError::shape(
            op,
            format!("at most {} bytes", buffer.len()),
            format!("{len} bytes at byte offset {byte_offset}"),
        )),
    }
}

impl DeviceSession {
    /// Allocate device memory for `m` and copy it over.
    pub fn upload<T: Element>(&self, m: &Matrix<T>) -> Result<DeviceMatrix<T>> {
        let buffer = self.allocate(m.byte_len())?;
        self.upload_into(&buffer, 0, m)?;
        Ok(DeviceMatrix {
            buffer,
            rows: m.rows(),
            cols: m.cols(),
            _marker: PhantomData,
        })
    }

    /// Uninitialised device matrix, typically a GEMM output.
    pub fn reserve_matrix<T: Element>(&self, rows: usize, cols: usize) -> Result<DeviceMatrix<T>> {
        let bytes = rows
            .checked_mul(cols)
            .and_then(|n| n.checked_mul(T::KIND.size_of()))
            .ok_or(GemmError::DimensionOverflow { what: "matrix bytes", value: rows })?;
        Ok(DeviceMatrix {
            buffer: self.allocate(bytes)?,
            rows,
            cols,
            _marker: PhantomData,
        })
    }

    /// Copy `m` into `buffer` starting at element `offset`.
    pub fn upload_into<T: Element>(&self, buffer: &DeviceBuffer, offset: usize, m: &Matrix<T>) -> Result<()> {
        let byte_offset = element_range::<T>("upload", buffer.len(), offset, m.len())?;
        self.write_bytes(buffer, byte_offset, &to_bytes(m.as_slice()))
    }

    /// Enqueue a copy of `bytes` into `buffer` at `byte_offset`.
    pub(crate) fn write_bytes(&self, buffer: &DeviceBuffer, byte_offset: usize, bytes: &[u8]) -> Result<()> {
        check_bytes("upload", buffer, byte_offset, bytes.len())?;
        if bytes.is_empty() {
            return Ok(());
        }
        self.backend()
            .copy_to_device(buffer.as_ptr() + byte_offset as u64, bytes)
    }

    /// Fill `out` from `buffer` at `byte_offset`, after the stream drains.
    pub(crate) fn read_bytes(&self, buffer: &DeviceBuffer, byte_offset: usize, out: &mut [u8]) -> Result<()> {
        check_bytes("download", buffer, byte_offset, out.len())?;
        if out.is_empty() {
            return Ok(());
        }
        self.synchronize()?;
        self.backend()
            .copy_to_host(out, buffer.as_ptr() + byte_offset as u64)
    }

    /// Read a `rows x cols` matrix from `buffer` starting at element
    /// `offset`. Waits for all enqueued work first.
    pub fn download<T: Element>(
        &self,
        buffer: &DeviceBuffer,
        offset: usize,
        rows: usize,
        cols: usize,
    ) -> Result<Matrix<T>> {
        let count = rows
            .checked_mul(cols)
            .ok_or(GemmError::DimensionOverflow { what: "matrix elements", value: rows })?;
        let byte_offset = element_range::<T>("download", buffer.len(), offset, count)?;
        if count == 0 {
            return Ok(Matrix::zeros(rows, cols));
        }
        let mut bytes = vec![0u8; count * T::KIND.size_of()];
        self.read_bytes(buffer, byte_offset, &mut bytes)?;
        Matrix::from_col_major(rows, cols, from_bytes(&bytes))
    }

    /// Read a whole device matrix back.
    pub fn download_matrix<T: Element>(&self, m: &DeviceMatrix<T>) -> Result<Matrix<T>> {
        self.download(&m.buffer, 0, m.rows, m.cols)
    }
}
