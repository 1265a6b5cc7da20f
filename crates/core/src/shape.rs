//! Batch descriptor pieces: operand shapes, strides and GEMM scalars.
//!
//! A batch descriptor is the triple (`Shapes`, strides or pointer array,
//! batch count). It is built per call and consumed immediately.

use crate::element::Element;
use crate::error::{GemmError, Result};
use crate::matrix::Matrix;

/// Operand dimensions for one GEMM instance `C = A * B`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Shapes {
    /// Rows of A.
    pub a_rows: usize,
    /// Columns of A.
    pub a_cols: usize,
    /// Rows of B.
    pub b_rows: usize,
    /// Columns of B.
    pub b_cols: usize,
    /// Rows of C.
    pub c_rows: usize,
}

/// Dimensions converted to the BLAS integer type, column-major, no transpose.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlasDims {
    /// Rows of A and C.
    pub m: i32,
    /// Columns of B and C.
    pub n: i32,
    /// Inner dimension.
    pub k: i32,
    /// Leading dimension of A.
    pub lda: i32,
    /// Leading dimension of B.
    pub ldb: i32,
    /// Leading dimension of C.
    pub ldc: i32,
}

impl Shapes {
    /// Shapes from explicit dimensions.
    pub fn new(a_rows: usize, a_cols: usize, b_rows: usize, b_cols: usize, c_rows: usize) -> Self {
        Self {
            a_rows,
            a_cols,
            b_rows,
            b_cols,
            c_rows,
        }
    }

    /// Shapes for `a * b`, with `C` taking the rows of `a`.
    pub fn for_product<T: Element>(a: &Matrix<T>, b: &Matrix<T>) -> Self {
        Self::new(a.rows(), a.cols(), b.rows(), b.cols(), a.rows())
    }

    /// Columns of C.
    #[inline]
    pub fn c_cols(&self) -> usize {
        self.b_cols
    }

    /// Elements in one A operand.
    #[inline]
    pub fn a_len(&self) -> usize {
        self.a_rows * self.a_cols
    }

    /// Elements in one B operand.
    #[inline]
    pub fn b_len(&self) -> usize {
        self.b_rows * self.b_cols
    }

    /// Elements in one C operand.
    #[inline]
    pub fn c_len(&self) -> usize {
        self.c_rows * self.b_cols
    }

    /// Whether any output or inner dimension is zero.
    pub fn is_degenerate(&self) -> bool {
        self.a_rows == 0 || self.a_cols == 0 || self.b_cols == 0
    }

    /// Check the multiplication precondition `A.cols == B.rows` and
    /// `C.rows == A.rows`.
    pub fn validate(&self, op: &'static str) -> Result<()> {
        if self.a_cols != self.b_rows {
            return Err(GemmError::shape(
                op,
                format!("B with {} rows (A is {}x{})", self.a_cols, self.a_rows, self.a_cols),
                format!("B is {}x{}", self.b_rows, self.b_cols),
            ));
        }
        if self.c_rows != self.a_rows {
            return Err(GemmError::shape(
                op,
                format!("C with {} rows", self.a_rows),
                format!("C with {} rows", self.c_rows),
            ));
        }
        Ok(())
    }

    /// Convert to BLAS integers. Leading dimensions are clamped to at least
    /// one, as BLAS requires even for empty operands.
    pub fn blas_dims(&self) -> Result<BlasDims> {
        Ok(BlasDims {
            m: to_blas_int("A rows", self.a_rows)?,
            n: to_blas_int("B cols", self.b_cols)?,
            k: to_blas_int("A cols", self.a_cols)?,
            lda: to_blas_int("lda", self.a_rows.max(1))?,
            ldb: to_blas_int("ldb", self.b_rows.max(1))?,
            ldc: to_blas_int("ldc", self.c_rows.max(1))?,
        })
    }
}

/// Convert a count to the 32-bit BLAS integer.
pub fn to_blas_int(what: &'static str, value: usize) -> Result<i32> {
    i32::try_from(value).map_err(|_| GemmError::DimensionOverflow { what, value })
}

/// Per-operand element strides for strided-batched execution: operand `i`
/// lives at `base + i * stride`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Strides {
    /// Stride between consecutive A operands.
    pub a: i64,
    /// Stride between consecutive B operands.
    pub b: i64,
    /// Stride between consecutive C operands.
    pub c: i64,
}

impl Strides {
    /// Every operand tightly packed one after another.
    pub fn packed(shapes: &Shapes) -> Self {
        Self {
            a: shapes.a_len() as i64,
            b: shapes.b_len() as i64,
            c: shapes.c_len() as i64,
        }
    }

    /// One A shared by every instance (stride 0), B and C packed.
    pub fn shared_a(shapes: &Shapes) -> Self {
        Self {
            a: 0,
            ..Self::packed(shapes)
        }
    }
}

/// Scalars of `C = alpha * A * B + beta * C`.
///
/// The default is `alpha = 1, beta = 0`: a plain product that never reads
/// the previous contents of C.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct GemmScalars<T> {
    /// Scale of the product.
    pub alpha: T,
    /// Scale of the existing C.
    pub beta: T,
}

impl<T: Element> GemmScalars<T> {
    /// Explicit scalars.
    pub fn new(alpha: T, beta: T) -> Self {
        Self { alpha, beta }
    }

    /// `C += A * B`.
    pub fn accumulate() -> Self {
        Self::new(T::ONE, T::ONE)
    }

    /// Whether the previous contents of C take part in the result.
    pub fn reads_c(&self) -> bool {
        self.beta != T::ZERO
    }

    /// Widen to the type-erased form carried across the backend boundary.
    pub fn to_raw(&self) -> RawScalars {
        RawScalars {
            alpha: self.alpha.to_f64(),
            beta: self.beta.to_f64(),
        }
    }
}

impl<T: Element> Default for GemmScalars<T> {
    fn default() -> Self {
        Self::new(T::ONE, T::ZERO)
    }
}

/// GEMM scalars widened to `f64`; backends narrow them back to the
/// precision of the call.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RawScalars {
    /// Scale of the product.
    pub alpha: f64,
    /// Scale of the existing C.
    pub beta: f64,
}
