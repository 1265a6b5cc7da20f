//! Column-major host matrix.
//!
//! The storage order matches the device BLAS convention byte for byte, so a
//! transfer is a flat copy of [`Matrix::as_slice`]. Callers own their
//! matrices; nothing in the workspace keeps a reference past the call that
//! consumes it.

use std::fmt;
use std::ops::Index;

use rand::Rng;

use crate::element::Element;
use crate::error::{GemmError, Result};
use crate::reference::gemm_col_major;

/// Dense 2-D matrix stored column-major.
#[derive(Clone, PartialEq)]
pub struct Matrix<T: Element> {
    rows: usize,
    cols: usize,
    data: Vec<T>,
}

impl<T: Element> Matrix<T> {
    /// All-zero matrix.
    pub fn zeros(rows: usize, cols: usize) -> Self {
        Self {
            rows,
            cols,
            data: vec![T::ZERO; rows * cols],
        }
    }

    /// Square identity matrix.
    pub fn identity(n: usize) -> Self {
        let mut m = Self::zeros(n, n);
        for i in 0..n {
            m.data[i + i * n] = T::ONE;
        }
        m
    }

    /// Wrap column-major data. Fails if `data.len() != rows * cols`.
    pub fn from_col_major(rows: usize, cols: usize, data: Vec<T>) -> Result<Self> {
        if data.len() != rows * cols {
            return Err(GemmError::shape(
                "Matrix::from_col_major",
                format!("{} elements for a {}x{} matrix", rows * cols, rows, cols),
                format!("{} elements", data.len()),
            ));
        }
        Ok(Self { rows, cols, data })
    }

    /// Build from row slices, i.e. the way a matrix is written on paper.
    pub fn from_rows(rows: &[&[T]]) -> Result<Self> {
        let n_rows = rows.len();
        let n_cols = rows.first().map_or(0, |r| r.len());
        if let Some((i, r)) = rows.iter().enumerate().find(|(_, r)| r.len() != n_cols) {
            return Err(GemmError::shape(
                "Matrix::from_rows",
                format!("{} columns in every row", n_cols),
                format!("{} columns in row {}", r.len(), i),
            ));
        }
        Ok(Self::from_fn(n_rows, n_cols, |i, j| rows[i][j]))
    }

    /// Build element by element from `f(row, col)`.
    pub fn from_fn(rows: usize, cols: usize, mut f: impl FnMut(usize, usize) -> T) -> Self {
        let mut data = Vec::with_capacity(rows * cols);
        for j in 0..cols {
            for i in 0..rows {
                data.push(f(i, j));
            }
        }
        Self { rows, cols, data }
    }

    /// Uniform random fill in `[-1, 1]` from the thread-local generator.
    pub fn random(rows: usize, cols: usize) -> Self {
        Self::random_with(&mut rand::thread_rng(), rows, cols)
    }

    /// Uniform random fill in `[-1, 1]` from a caller-supplied generator.
    pub fn random_with<R: Rng + ?Sized>(rng: &mut R, rows: usize, cols: usize) -> Self {
        let data = (0..rows * cols).map(|_| T::sample(rng)).collect();
        Self { rows, cols, data }
    }

    /// Number of rows.
    #[inline]
    pub fn rows(&self) -> usize {
        self.rows
    }

    /// Number of columns.
    #[inline]
    pub fn cols(&self) -> usize {
        self.cols
    }

    /// `(rows, cols)`.
    #[inline]
    pub fn shape(&self) -> (usize, usize) {
        (self.rows, self.cols)
    }

    /// Number of elements.
    #[inline]
    pub fn len(&self) -> usize {
        self.data.len()
    }

    /// Whether the matrix has no elements.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Size of the element storage in bytes.
    #[inline]
    pub fn byte_len(&self) -> usize {
        self.data.len() * T::KIND.size_of()
    }

    /// Element at `(row, col)`, or `None` when out of bounds.
    pub fn get(&self, row: usize, col: usize) -> Option<T> {
        (row < self.rows && col < self.cols).then(|| self.data[row + col * self.rows])
    }

    /// Overwrite the element at `(row, col)`.
    ///
    /// # Panics
    ///
    /// Panics if the index is out of bounds.
    pub fn set(&mut self, row: usize, col: usize, value: T) {
        assert!(
            row < self.rows && col < self.cols,
            "index ({}, {}) out of bounds for {}x{} matrix",
            row,
            col,
            self.rows,
            self.cols
        );
        self.data[row + col * self.rows] = value;
    }

    /// Column-major element storage.
    pub fn as_slice(&self) -> &[T] {
        &self.data
    }

    /// Mutable column-major element storage.
    pub fn as_mut_slice(&mut self) -> &mut [T] {
        &mut self.data
    }

    /// Consume the matrix, returning its column-major storage.
    pub fn into_vec(self) -> Vec<T> {
        self.data
    }

    /// Transposed copy.
    pub fn transpose(&self) -> Self {
        Self::from_fn(self.cols, self.rows, |i, j| self[(j, i)])
    }

    /// Host product `self * rhs`.
    pub fn matmul(&self, rhs: &Self) -> Result<Self> {
        if self.cols != rhs.rows {
            return Err(GemmError::shape(
                "Matrix::matmul",
                format!("rhs with {} rows", self.cols),
                format!("{}x{}", rhs.rows, rhs.cols),
            ));
        }
        let mut out = Self::zeros(self.rows, rhs.cols);
        if !out.is_empty() {
            gemm_col_major(
                self.rows,
                rhs.cols,
                self.cols,
                T::ONE,
                &self.data,
                self.rows.max(1),
                &rhs.data,
                rhs.rows.max(1),
                T::ZERO,
                &mut out.data,
                self.rows.max(1),
            );
        }
        Ok(out)
    }

    /// Normwise relative error `max|self - expected| / max|expected|`.
    ///
    /// Returns `f64::INFINITY` for mismatched shapes. An all-zero `expected`
    /// falls back to the absolute error.
    pub fn max_relative_error(&self, expected: &Self) -> f64 {
        if self.shape() != expected.shape() {
            return f64::INFINITY;
        }
        let scale = expected
            .data
            .iter()
            .map(|v| v.to_f64().abs())
            .fold(0.0f64, f64::max);
        let diff = self
            .data
            .iter()
            .zip(&expected.data)
            .map(|(a, b)| (a.to_f64() - b.to_f64()).abs())
            .fold(0.0f64, f64::max);
        if scale > 0.0 {
            diff / scale
        } else {
            diff
        }
    }

    /// Same shape and [`max_relative_error`](Self::max_relative_error) within `tol`.
    pub fn approx_eq(&self, expected: &Self, tol: f64) -> bool {
        self.max_relative_error(expected) <= tol
    }
}

impl<T: Element> Index<(usize, usize)> for Matrix<T> {
    type Output = T;

    fn index(&self, (row, col): (usize, usize)) -> &T {
        assert!(
            row < self.rows && col < self.cols,
            "index ({}, {}) out of bounds for {}x{} matrix",
            row,
            col,
            self.rows,
            self.cols
        );
        &self.data[row + col * self.rows]
    }
}

impl<T: Element> fmt::Debug for Matrix<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Matrix {}x{} [", self.rows, self.cols)?;
        for i in 0..self.rows {
            let row: Vec<T> = (0..self.cols).map(|j| self[(i, j)]).collect();
            writeln!(f, "  {:?}", row)?;
        }
        write!(f, "]")
    }
}
