//! Vertical concatenation of a tensor.

use batchgemm_core::{Element, GemmError, Matrix, Result};

/// Stack same-shaped `rows x cols` matrices into one `(rows * N) x cols`
/// matrix; matrix `i` occupies rows `i * rows .. (i + 1) * rows`.
///
/// An empty tensor stacks to a `0 x 0` matrix.
pub fn stack<T: Element>(tensor: &[Matrix<T>]) -> Result<Matrix<T>> {
    let Some(first) = tensor.first() else {
        return Ok(Matrix::zeros(0, 0));
    };
    let (rows, cols) = first.shape();
    for (i, m) in tensor.iter().enumerate() {
        if m.shape() != (rows, cols) {
            return Err(GemmError::shape(
                "stack",
                format!("every matrix {rows}x{cols}"),
                format!("matrix {i} is {}x{}", m.rows(), m.cols()),
            ));
        }
    }
    let total_rows = rows * tensor.len();
    let mut data = Vec::with_capacity(total_rows * cols);
    // Column-major: column j of the result is column j of every block in turn.
    for j in 0..cols {
        for m in tensor {
            data.extend_from_slice(&m.as_slice()[j * rows..(j + 1) * rows]);
        }
    }
    Matrix::from_col_major(total_rows, cols, data)
}
