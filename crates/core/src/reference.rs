//! Host reference GEMM over column-major storage.
//!
//! Same argument convention as the BLAS `?gemm` routine with both operands
//! untransposed. Used by [`Matrix::matmul`](crate::Matrix::matmul) and by the
//! host-emulated device backend.

use crate::element::Element;

/// `C = alpha * A * B + beta * C` for column-major `A (m x k)`, `B (k x n)`,
/// `C (m x n)` with leading dimensions `lda`, `ldb`, `ldc`.
///
/// When `beta` is zero the previous contents of `C` are not read, matching
/// BLAS semantics for uninitialised output buffers.
#[allow(clippy::too_many_arguments)]
pub fn gemm_col_major<T: Element>(
    m: usize,
    n: usize,
    k: usize,
    alpha: T,
    a: &[T],
    lda: usize,
    b: &[T],
    ldb: usize,
    beta: T,
    c: &mut [T],
    ldc: usize,
) {
    debug_assert!(lda >= m.max(1) && ldb >= k.max(1) && ldc >= m.max(1));
    for j in 0..n {
        for i in 0..m {
            let mut acc = T::ZERO;
            for p in 0..k {
                acc += a[i + p * lda] * b[p + j * ldb];
            }
            let idx = i + j * ldc;
            c[idx] = if beta == T::ZERO {
                alpha * acc
            } else {
                alpha * acc + beta * c[idx]
            };
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_gemm_2x2() {
        // A = [[1, 2], [3, 4]], B = [[5, 6], [7, 8]] stored column-major.
        let a = [1.0f64, 3.0, 2.0, 4.0];
        let b = [5.0f64, 7.0, 6.0, 8.0];
        let mut c = [0.0f64; 4];
        gemm_col_major(2, 2, 2, 1.0, &a, 2, &b, 2, 0.0, &mut c, 2);
        // [[19, 22], [43, 50]]
        assert_eq!(c, [19.0, 43.0, 22.0, 50.0]);
    }

    #[test]
    fn test_beta_zero_ignores_garbage() {
        let a = [1.0f32];
        let b = [2.0f32];
        let mut c = [f32::NAN];
        gemm_col_major(1, 1, 1, 1.0, &a, 1, &b, 1, 0.0, &mut c, 1);
        assert_eq!(c, [2.0]);
    }

    #[test]
    fn test_accumulate() {
        let a = [1.0f32, 1.0];
        let b = [3.0f32];
        let mut c = [10.0f32, 20.0];
        gemm_col_major(2, 1, 1, 2.0, &a, 2, &b, 1, 0.5, &mut c, 2);
        assert_eq!(c, [11.0, 16.0]);
    }
}
