//! The GEMM facade.
//!
//! [`GemmEngine`] takes host matrices and returns host matrices. Each call
//! validates shapes before touching the device, uploads its operands,
//! dispatches one GEMM or one batched GEMM per stage, downloads the results
//! and releases every device buffer it allocated, on success or failure.
//!
//! Calls whose result has no elements, or whose inner dimension is zero, are
//! answered on the host without a device round trip.

use std::marker::PhantomData;

use batchgemm_core::{Element, GemmError, GemmScalars, Matrix, Result, SessionConfig, Shapes, Strides};
use batchgemm_runtime::{
    multiply, uniform_shape, DeviceSession, GemmOperands, PointerArray, PointerBatch, StridedBatch,
};

use crate::stack::stack;

/// Batched GEMM engine over one device session, for element type `T`.
#[derive(Debug)]
pub struct GemmEngine<T> {
    session: DeviceSession,
    _marker: PhantomData<T>,
}

impl<T: Element> GemmEngine<T> {
    /// Open a device session according to `config`.
    pub fn new(config: SessionConfig) -> Result<Self> {
        Ok(Self::with_session(DeviceSession::open(config)?))
    }

    /// Engine over an existing session.
    pub fn with_session(session: DeviceSession) -> Self {
        Self {
            session,
            _marker: PhantomData,
        }
    }

    /// The underlying session.
    pub fn session(&self) -> &DeviceSession {
        &self.session
    }

    /// Give the session back.
    pub fn into_session(self) -> DeviceSession {
        self.session
    }

    /// `a * b`.
    pub fn dot(&self, a: &Matrix<T>, b: &Matrix<T>) -> Result<Matrix<T>> {
        let shapes = Shapes::for_product(a, b);
        shapes.validate("dot")?;
        if shapes.is_degenerate() {
            return Ok(Matrix::zeros(a.rows(), b.cols()));
        }
        tracing::debug!(target: "batchgemm::engine", a = ?a.shape(), b = ?b.shape(), "dot");

        let s = &self.session;
        let da = s.upload(a)?;
        let db = s.upload(b)?;
        let dc = s.reserve_matrix::<T>(a.rows(), b.cols())?;
        multiply::<T>(
            s,
            &shapes,
            GemmScalars::default(),
            GemmOperands::Single {
                a: da.as_ptr(),
                b: db.as_ptr(),
                c: dc.as_ptr(),
            },
        )?;
        s.download_matrix(&dc)
    }

    /// `c = alpha * a * b + beta * c`.
    ///
    /// The previous contents of `c` are only uploaded when `beta` is
    /// non-zero.
    pub fn gemm(&self, a: &Matrix<T>, b: &Matrix<T>, c: &mut Matrix<T>, scalars: GemmScalars<T>) -> Result<()> {
        let shapes = Shapes::for_product(a, b);
        shapes.validate("gemm")?;
        check_output("gemm", c, a.rows(), b.cols())?;
        if shapes.is_degenerate() {
            scale_in_place(c, scalars.beta);
            return Ok(());
        }
        tracing::debug!(target: "batchgemm::engine", a = ?a.shape(), b = ?b.shape(), beta = ?scalars.beta, "gemm");

        let s = &self.session;
        let da = s.upload(a)?;
        let db = s.upload(b)?;
        let dc = if scalars.reads_c() {
            s.upload(c)?
        } else {
            s.reserve_matrix::<T>(c.rows(), c.cols())?
        };
        multiply(
            s,
            &shapes,
            scalars,
            GemmOperands::Single {
                a: da.as_ptr(),
                b: db.as_ptr(),
                c: dc.as_ptr(),
            },
        )?;
        *c = s.download_matrix(&dc)?;
        Ok(())
    }

    /// `[a * T_0; a * T_1; ...]`: every tensor element left-multiplied by
    /// `a`, stacked vertically into one `(a.rows * N) x cols` matrix.
    ///
    /// Runs as a single strided-batched GEMM with `a` shared by every
    /// instance. An empty tensor yields a `0 x 0` matrix.
    pub fn matrix_tensor(&self, a: &Matrix<T>, tensor: &[Matrix<T>]) -> Result<Matrix<T>> {
        let Some((rows, cols)) = uniform_shape("matrix_tensor", tensor)? else {
            return Ok(Matrix::zeros(0, 0));
        };
        let shapes = Shapes::new(a.rows(), a.cols(), rows, cols, a.rows());
        shapes.validate("matrix_tensor")?;
        let n = tensor.len();
        if shapes.is_degenerate() {
            return Ok(Matrix::zeros(a.rows() * n, cols));
        }
        tracing::debug!(target: "batchgemm::engine", a = ?a.shape(), element = ?(rows, cols), batch = n, "matrix_tensor");

        let s = &self.session;
        let da = s.upload(a)?;
        let b = StridedBatch::pack(s, tensor)?;
        let c = StridedBatch::<T>::reserve(s, n, a.rows(), cols)?;
        multiply::<T>(
            s,
            &shapes,
            GemmScalars::default(),
            GemmOperands::Strided {
                a: da.as_ptr(),
                b: b.base(),
                c: c.base(),
                strides: Strides::shared_a(&shapes),
                count: n,
            },
        )?;
        stack(&c.download_all(s)?)
    }

    /// `[a * T_0, a * T_1, ...]` as separate matrices, in order.
    ///
    /// Runs as a single pointer-array batched GEMM. An empty tensor yields an
    /// empty vector.
    pub fn right_matrix_tensor(&self, a: &Matrix<T>, tensor: &[Matrix<T>]) -> Result<Vec<Matrix<T>>> {
        self.pointer_products("right_matrix_tensor", a, tensor, None, GemmScalars::default())
    }

    /// `outputs[i] = alpha * a * tensor[i] + beta * outputs[i]`.
    ///
    /// `outputs` must hold one `a.rows x cols` matrix per tensor element.
    pub fn right_matrix_tensor_into(
        &self,
        a: &Matrix<T>,
        tensor: &[Matrix<T>],
        outputs: &mut [Matrix<T>],
        scalars: GemmScalars<T>,
    ) -> Result<()> {
        if outputs.len() != tensor.len() {
            return Err(GemmError::shape(
                "right_matrix_tensor_into",
                format!("{} output matrices", tensor.len()),
                format!("{} output matrices", outputs.len()),
            ));
        }
        let results = self.pointer_products("right_matrix_tensor_into", a, tensor, Some(&*outputs), scalars)?;
        for (out, r) in outputs.iter_mut().zip(results) {
            *out = r;
        }
        Ok(())
    }

    fn pointer_products(
        &self,
        op: &'static str,
        a: &Matrix<T>,
        tensor: &[Matrix<T>],
        initial: Option<&[Matrix<T>]>,
        scalars: GemmScalars<T>,
    ) -> Result<Vec<Matrix<T>>> {
        let Some((rows, cols)) = uniform_shape(op, tensor)? else {
            return Ok(Vec::new());
        };
        let shapes = Shapes::new(a.rows(), a.cols(), rows, cols, a.rows());
        shapes.validate(op)?;
        if let Some(initial) = initial {
            for c in initial {
                check_output(op, c, a.rows(), cols)?;
            }
        }
        let n = tensor.len();
        if shapes.is_degenerate() {
            return Ok(match initial {
                Some(initial) => initial
                    .iter()
                    .map(|c| {
                        let mut c = c.clone();
                        scale_in_place(&mut c, scalars.beta);
                        c
                    })
                    .collect(),
                None => vec![Matrix::zeros(a.rows(), cols); n],
            });
        }
        tracing::debug!(target: "batchgemm::engine", op, a = ?a.shape(), element = ?(rows, cols), batch = n, "pointer-array batch");

        let s = &self.session;
        let da = s.upload(a)?;
        let b = PointerBatch::pack(s, tensor)?;
        let c = match initial {
            Some(initial) if scalars.reads_c() => PointerBatch::pack(s, initial)?,
            _ => PointerBatch::<T>::reserve(s, n, a.rows(), cols)?,
        };
        let a_ptrs = PointerArray::replicated(da.as_ptr(), n);
        multiply(
            s,
            &shapes,
            scalars,
            GemmOperands::PointerArray {
                a: &a_ptrs,
                b: b.pointers(),
                c: c.pointers(),
            },
        )?;
        c.download_all(s)
    }

    /// `[a * T_0 * c, a * T_1 * c, ...]`.
    ///
    /// Two dependent pointer-array batches on one stream: the intermediate
    /// `a * T_i` never leaves the device.
    pub fn triple_tensor_product(&self, a: &Matrix<T>, c: &Matrix<T>, tensor: &[Matrix<T>]) -> Result<Vec<Matrix<T>>> {
        let Some((rows, cols)) = uniform_shape("triple_tensor_product", tensor)? else {
            return Ok(Vec::new());
        };
        let first = Shapes::new(a.rows(), a.cols(), rows, cols, a.rows());
        first.validate("triple_tensor_product")?;
        let second = Shapes::new(a.rows(), cols, c.rows(), c.cols(), a.rows());
        second.validate("triple_tensor_product")?;
        let n = tensor.len();
        if first.is_degenerate() || second.is_degenerate() {
            return Ok(vec![Matrix::zeros(a.rows(), c.cols()); n]);
        }
        tracing::debug!(target: "batchgemm::engine", a = ?a.shape(), c = ?c.shape(), element = ?(rows, cols), batch = n, "triple_tensor_product");

        let s = &self.session;
        let da = s.upload(a)?;
        let dc = s.upload(c)?;
        let m = PointerBatch::pack(s, tensor)?;
        let inter = PointerBatch::<T>::reserve(s, n, a.rows(), cols)?;
        let out = PointerBatch::<T>::reserve(s, n, a.rows(), c.cols())?;
        let a_ptrs = PointerArray::replicated(da.as_ptr(), n);
        let c_ptrs = PointerArray::replicated(dc.as_ptr(), n);

        multiply::<T>(
            s,
            &first,
            GemmScalars::default(),
            GemmOperands::PointerArray {
                a: &a_ptrs,
                b: m.pointers(),
                c: inter.pointers(),
            },
        )?;
        multiply::<T>(
            s,
            &second,
            GemmScalars::default(),
            GemmOperands::PointerArray {
                a: inter.pointers(),
                b: &c_ptrs,
                c: out.pointers(),
            },
        )?;
        out.download_all(s)
    }
}

fn check_output<T: Element>(op: &'static str, c: &Matrix<T>, rows: usize, cols: usize) -> Result<()> {
    if c.shape() != (rows, cols) {
        return Err(GemmError::shape(
            op,
            format!("C {rows}x{cols}"),
            format!("C {}x{}", c.rows(), c.cols()),
        ));
    }
    Ok(())
}

/// `c = beta * c`, with `beta == 0` clearing `c` regardless of its contents.
fn scale_in_place<T: Element>(c: &mut Matrix<T>, beta: T) {
    for v in c.as_mut_slice() {
        *v = if beta == T::ZERO { T::ZERO } else { beta * *v };
    }
}
