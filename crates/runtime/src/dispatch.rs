//! GEMM dispatch: one entry point for single, pointer-array and strided
//! batches.
//!
//! All operands are column-major and untransposed, so the BLAS call is
//! `m = A.rows`, `n = B.cols`, `k = A.cols`.

use batchgemm_core::shape::to_blas_int;
use batchgemm_core::{Element, GemmError, GemmScalars, Result, Shapes, Strides};

use crate::backend::DevicePtr;
use crate::packing::PointerArray;
use crate::session::DeviceSession;

/// Packing strategy of a batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PackingStrategy {
    /// One GEMM.
    Single,
    /// Independent buffers addressed through pointer arrays.
    PointerArray,
    /// Contiguous operands at fixed element strides.
    Strided,
}

/// Device operands for one dispatch.
#[derive(Debug, Clone, Copy)]
pub enum GemmOperands<'a> {
    /// A single product.
    Single {
        /// A operand.
        a: DevicePtr,
        /// B operand.
        b: DevicePtr,
        /// C operand.
        c: DevicePtr,
    },
    /// Instance `i` uses `a[i]`, `b[i]`, `c[i]`.
    PointerArray {
        /// A addresses.
        a: &'a PointerArray,
        /// B addresses.
        b: &'a PointerArray,
        /// C addresses.
        c: &'a PointerArray,
    },
    /// Instance `i` uses `base + i * stride` for each operand.
    Strided {
        /// A base.
        a: DevicePtr,
        /// B base.
        b: DevicePtr,
        /// C base.
        c: DevicePtr,
        /// Element strides.
        strides: Strides,
        /// Number of instances.
        count: usize,
    },
}

impl GemmOperands<'_> {
    /// The packing strategy these operands use.
    pub fn strategy(&self) -> PackingStrategy {
        match self {
            GemmOperands::Single { .. } => PackingStrategy::Single,
            GemmOperands::PointerArray { .. } => PackingStrategy::PointerArray,
            GemmOperands::Strided { .. } => PackingStrategy::Strided,
        }
    }

    /// Number of GEMM instances.
    pub fn batch_count(&self) -> usize {
        match self {
            GemmOperands::Single { .. } => 1,
            GemmOperands::PointerArray { a, .. } => a.len(),
            GemmOperands::Strided { count, .. } => *count,
        }
    }
}

/// Enqueue `C_i = alpha * A_i * B_i + beta * C_i` for every instance.
///
/// Shapes are validated once for the whole batch, before anything is
/// submitted. An empty batch, or a shape with no output elements, submits
/// nothing.
pub fn multiply<T: Element>(
    session: &DeviceSession,
    shapes: &Shapes,
    scalars: GemmScalars<T>,
    operands: GemmOperands<'_>,
) -> Result<()> {
    shapes.validate("multiply")?;
    let dims = shapes.blas_dims()?;
    let count = operands.batch_count();
    let batch_count = to_blas_int("batch count", count)?;

    if let GemmOperands::PointerArray { a, b, c } = operands {
        if b.len() != count || c.len() != count {
            return Err(GemmError::InvalidBatch(format!(
                "pointer arrays differ in length: A {}, B {}, C {}",
                a.len(),
                b.len(),
                c.len()
            )));
        }
    }
    if count == 0 || dims.m == 0 || dims.n == 0 {
        return Ok(());
    }

    let backend = session.backend();
    let raw = scalars.to_raw();
    tracing::debug!(
        target: "batchgemm::runtime",
        strategy = ?operands.strategy(),
        routine = T::KIND.blas_prefix(),
        m = dims.m,
        n = dims.n,
        k = dims.k,
        batch = count,
        "gemm dispatch"
    );

    match operands {
        GemmOperands::Single { a, b, c } => backend.gemm(T::KIND, &dims, raw, a, b, c),
        GemmOperands::PointerArray { a, b, c } => {
            let a_dev = a.to_device(session)?;
            let b_dev = b.to_device(session)?;
            let c_dev = c.to_device(session)?;
            backend.gemm_batched(
                T::KIND,
                &dims,
                raw,
                a_dev.as_ptr(),
                b_dev.as_ptr(),
                c_dev.as_ptr(),
                batch_count,
            )?;
            // The address arrays are read by the kernel; keep them alive
            // until it has run.
            session.synchronize()
        }
        GemmOperands::Strided { a, b, c, strides, .. } => {
            backend.gemm_strided_batched(T::KIND, &dims, raw, a, b, c, &strides, batch_count)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::packing::{PointerBatch, StridedBatch};
    use batchgemm_core::Matrix;

    fn session() -> DeviceSession {
        DeviceSession::host(1 << 20).unwrap()
    }

    #[test]
    fn test_single() {
        let s = session();
        let a = Matrix::<f32>::from_rows(&[&[1.0, 2.0, 3.0], &[4.0, 5.0, 6.0]]).unwrap();
        let b = Matrix::<f32>::from_rows(&[&[1.0, 0.0], &[0.0, 1.0], &[0.0, 0.0]]).unwrap();
        let (da, db) = (s.upload(&a).unwrap(), s.upload(&b).unwrap());
        let dc = s.reserve_matrix::<f32>(2, 2).unwrap();
        multiply::<f32>(
            &s,
            &Shapes::for_product(&a, &b),
            GemmScalars::default(),
            GemmOperands::Single { a: da.as_ptr(), b: db.as_ptr(), c: dc.as_ptr() },
        )
        .unwrap();
        let expected = Matrix::from_rows(&[&[1.0, 2.0], &[4.0, 5.0]]).unwrap();
        assert_eq!(s.download_matrix(&dc).unwrap(), expected);
    }

    #[test]
    fn test_pointer_and_strided_agree() {
        let s = session();
        let a = Matrix::<f64>::random(3, 4);
        let tensor: Vec<_> = (0..5).map(|_| Matrix::<f64>::random(4, 2)).collect();
        let shapes = Shapes::new(3, 4, 4, 2, 3);
        let da = s.upload(&a).unwrap();

        let b_ptr = PointerBatch::pack(&s, &tensor).unwrap();
        let c_ptr = PointerBatch::<f64>::reserve(&s, 5, 3, 2).unwrap();
        let a_ptrs = PointerArray::replicated(da.as_ptr(), 5);
        multiply::<f64>(
            &s,
            &shapes,
            GemmScalars::default(),
            GemmOperands::PointerArray { a: &a_ptrs, b: b_ptr.pointers(), c: c_ptr.pointers() },
        )
        .unwrap();

        let b_str = StridedBatch::pack(&s, &tensor).unwrap();
        let c_str = StridedBatch::<f64>::reserve(&s, 5, 3, 2).unwrap();
        multiply::<f64>(
            &s,
            &shapes,
            GemmScalars::default(),
            GemmOperands::Strided {
                a: da.as_ptr(),
                b: b_str.base(),
                c: c_str.base(),
                strides: Strides::shared_a(&shapes),
                count: 5,
            },
        )
        .unwrap();

        let via_ptr = c_ptr.download_all(&s).unwrap();
        let via_str = c_str.download_all(&s).unwrap();
        assert_eq!(via_ptr, via_str);
        for (c, b) in via_ptr.iter().zip(&tensor) {
            assert!(c.approx_eq(&a.matmul(b).unwrap(), 1e-12));
        }
    }

    #[test]
    fn test_request_scoped_arrays_freed() {
        let s = session();
        let t: Vec<_> = (0..3).map(|_| Matrix::<f32>::random(2, 2)).collect();
        let a = PointerBatch::pack(&s, &t).unwrap();
        let b = PointerBatch::pack(&s, &t).unwrap();
        let c = PointerBatch::<f32>::reserve(&s, 3, 2, 2).unwrap();
        let live_before = s.stats().live_buffers;
        multiply::<f32>(
            &s,
            &Shapes::new(2, 2, 2, 2, 2),
            GemmScalars::default(),
            GemmOperands::PointerArray { a: a.pointers(), b: b.pointers(), c: c.pointers() },
        )
        .unwrap();
        assert_eq!(s.stats().live_buffers, live_before);
    }

    #[test]
    fn test_shape_error_before_submission() {
        let s = session();
        let err = multiply::<f32>(
            &s,
            &Shapes::new(2, 3, 4, 2, 2),
            GemmScalars::default(),
            GemmOperands::Single { a: 0, b: 0, c: 0 },
        )
        .unwrap_err();
        assert!(matches!(err, GemmError::ShapeMismatch { .. }));
        assert_eq!(s.stats().allocations, 0);
    }

    #[test]
    fn test_mismatched_pointer_arrays() {
        let s = session();
        let (a, b) = (PointerArray::replicated(1, 2), PointerArray::replicated(1, 3));
        let err = multiply::<f32>(
            &s,
            &Shapes::new(1, 1, 1, 1, 1),
            GemmScalars::default(),
            GemmOperands::PointerArray { a: &a, b: &b, c: &a },
        )
        .unwrap_err();
        assert!(matches!(err, GemmError::InvalidBatch(_)));
    }

    #[test]
    fn test_accumulate_reads_c() {
        let s = session();
        let a = Matrix::<f64>::identity(2);
        let c0 = Matrix::<f64>::from_fn(2, 2, |r, c| (r + c) as f64);
        let (da, dc) = (s.upload(&a).unwrap(), s.upload(&c0).unwrap());
        multiply::<f64>(
            &s,
            &Shapes::new(2, 2, 2, 2, 2),
            GemmScalars::accumulate(),
            GemmOperands::Single { a: da.as_ptr(), b: da.as_ptr(), c: dc.as_ptr() },
        )
        .unwrap();
        let out = s.download_matrix(&dc).unwrap();
        assert_eq!(out, Matrix::from_fn(2, 2, |r, c| (r + c) as f64 + if r == c { 1.0 } else { 0.0 }));
    }
}
