//! Reusable tensor-times-matrix pipeline.
//!
//! [`TensorMatrix`] allocates its device buffers once, at construction, and
//! reuses them for every [`tensor_dot_matrix`](TensorMatrix::tensor_dot_matrix)
//! call. Use it when the same batch shape is multiplied repeatedly.

use batchgemm_core::{Element, GemmError, GemmScalars, Matrix, Result, SessionConfig, Shapes};
use batchgemm_runtime::{multiply, DeviceSession, GemmOperands, PointerBatch};

/// Fixed dimensions of a [`TensorMatrix`] pipeline: each tensor element is
/// `tensor_rows x tensor_cols`, the right-hand matrix is
/// `tensor_cols x matrix_cols`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TensorMatrixDims {
    /// Rows of every tensor element (and of every product).
    pub tensor_rows: usize,
    /// Columns of every tensor element; rows of the right-hand matrix.
    pub tensor_cols: usize,
    /// Columns of the right-hand matrix (and of every product).
    pub matrix_cols: usize,
}

impl TensorMatrixDims {
    /// Dimensions from their three sizes.
    pub fn new(tensor_rows: usize, tensor_cols: usize, matrix_cols: usize) -> Self {
        Self {
            tensor_rows,
            tensor_cols,
            matrix_cols,
        }
    }

    fn shapes(&self) -> Shapes {
        Shapes::new(
            self.tensor_rows,
            self.tensor_cols,
            self.tensor_cols,
            self.matrix_cols,
            self.tensor_rows,
        )
    }
}

/// Pre-allocated pipeline computing `T_i * B` for a tensor of fixed size.
///
/// Holds three device buffer groups of `batch_count` buffers each: the tensor
/// (A), the right-hand matrix replicated per instance (B) and the products
/// (C). They are released on drop, or explicitly with
/// [`destroy`](Self::destroy).
#[derive(Debug)]
pub struct TensorMatrix<T> {
    session: DeviceSession,
    batch_count: usize,
    dims: TensorMatrixDims,
    tensor_a: PointerBatch<T>,
    tensor_b: PointerBatch<T>,
    tensor_c: PointerBatch<T>,
}

impl<T: Element> TensorMatrix<T> {
    /// Open a session and allocate the pipeline buffers.
    pub fn new(config: SessionConfig, batch_count: usize, dims: TensorMatrixDims) -> Result<Self> {
        Self::with_session(DeviceSession::open(config)?, batch_count, dims)
    }

    /// Allocate the pipeline buffers on an existing session.
    ///
    /// `batch_count` must be positive. If any allocation fails, everything
    /// already reserved is released and the error is returned.
    pub fn with_session(session: DeviceSession, batch_count: usize, dims: TensorMatrixDims) -> Result<Self> {
        if batch_count == 0 {
            return Err(GemmError::InvalidBatch(
                "TensorMatrix requires a positive batch count".to_string(),
            ));
        }
        dims.shapes().blas_dims()?;
        let tensor_a = PointerBatch::reserve(&session, batch_count, dims.tensor_rows, dims.tensor_cols)?;
        let tensor_b = PointerBatch::reserve(&session, batch_count, dims.tensor_cols, dims.matrix_cols)?;
        let tensor_c = PointerBatch::reserve(&session, batch_count, dims.tensor_rows, dims.matrix_cols)?;
        tracing::debug!(target: "batchgemm::engine", batch_count, ?dims, "tensor-matrix pipeline allocated");
        Ok(Self {
            session,
            batch_count,
            dims,
            tensor_a,
            tensor_b,
            tensor_c,
        })
    }

    /// Number of tensor elements per call.
    pub fn batch_count(&self) -> usize {
        self.batch_count
    }

    /// Pipeline dimensions.
    pub fn dims(&self) -> TensorMatrixDims {
        self.dims
    }

    /// The underlying session.
    pub fn session(&self) -> &DeviceSession {
        &self.session
    }

    /// `[T_0 * b, T_1 * b, ...]`, reusing the pre-allocated buffers.
    ///
    /// `tensor` must hold exactly `batch_count` matrices of
    /// `tensor_rows x tensor_cols`, and `b` must be
    /// `tensor_cols x matrix_cols`.
    pub fn tensor_dot_matrix(&mut self, tensor: &[Matrix<T>], b: &Matrix<T>) -> Result<Vec<Matrix<T>>> {
        let dims = self.dims;
        if tensor.len() != self.batch_count {
            return Err(GemmError::shape(
                "tensor_dot_matrix",
                format!("{} matrices", self.batch_count),
                format!("{} matrices", tensor.len()),
            ));
        }
        if b.shape() != (dims.tensor_cols, dims.matrix_cols) {
            return Err(GemmError::shape(
                "tensor_dot_matrix",
                format!("B {}x{}", dims.tensor_cols, dims.matrix_cols),
                format!("B {}x{}", b.rows(), b.cols()),
            ));
        }
        let shapes = dims.shapes();
        if shapes.is_degenerate() {
            for (i, m) in tensor.iter().enumerate() {
                if m.shape() != (dims.tensor_rows, dims.tensor_cols) {
                    return Err(GemmError::shape(
                        "tensor_dot_matrix",
                        format!("every matrix {}x{}", dims.tensor_rows, dims.tensor_cols),
                        format!("matrix {i} is {}x{}", m.rows(), m.cols()),
                    ));
                }
            }
            return Ok(vec![Matrix::zeros(dims.tensor_rows, dims.matrix_cols); self.batch_count]);
        }

        let s = &self.session;
        self.tensor_a.upload(s, tensor)?;
        self.tensor_b.upload_shared(s, b)?;
        multiply::<T>(
            s,
            &shapes,
            GemmScalars::default(),
            GemmOperands::PointerArray {
                a: self.tensor_a.pointers(),
                b: self.tensor_b.pointers(),
                c: self.tensor_c.pointers(),
            },
        )?;
        self.tensor_c.download_all(s)
    }

    /// Release all device buffers now, reporting the first failure. Every
    /// buffer is released even if an earlier one fails.
    pub fn destroy(self) -> Result<()> {
        let Self {
            tensor_a,
            tensor_b,
            tensor_c,
            ..
        } = self;
        let results = [tensor_a.release(), tensor_b.release(), tensor_c.release()];
        results.into_iter().collect()
    }
}
