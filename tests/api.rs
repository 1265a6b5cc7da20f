//! Public API tests
//!
//! Exercise the re-exported surface of the `batchgemm` crate:
//! - the worked 2x3 by 3x2 example
//! - sharing one session between an engine and a pipeline
//! - CUDA and host backends agreeing, when a GPU is present

use batchgemm::{
    available_gpus, stack, BackendKind, DeviceSession, GemmEngine, Matrix, SessionConfig, TensorMatrix,
    TensorMatrixDims,
};
use proptest::prelude::*;

fn host_engine() -> GemmEngine<f64> {
    GemmEngine::new(SessionConfig::host(1 << 22)).unwrap()
}

#[test]
fn test_worked_example() {
    let engine = host_engine();
    let a = Matrix::from_rows(&[&[1.0, 2.0, 3.0], &[4.0, 5.0, 6.0]]).unwrap();
    let b = Matrix::from_rows(&[&[1.0, 0.0], &[0.0, 1.0], &[0.0, 0.0]]).unwrap();
    let c = engine.dot(&a, &b).unwrap();
    assert_eq!(c, Matrix::from_rows(&[&[1.0, 2.0], &[4.0, 5.0]]).unwrap());
}

#[test]
fn test_session_shared_between_engine_and_pipeline() {
    let engine = GemmEngine::<f32>::with_session(DeviceSession::host(1 << 20).unwrap());
    let a = Matrix::<f32>::random(2, 2);
    engine.dot(&a, &a).unwrap();

    let session = engine.into_session();
    let mut tm = TensorMatrix::<f32>::with_session(session, 2, TensorMatrixDims::new(2, 2, 2)).unwrap();
    let out = tm.tensor_dot_matrix(&[a.clone(), a.clone()], &a).unwrap();
    assert!(out[1].approx_eq(&a.matmul(&a).unwrap(), 1e-5));
    tm.destroy().unwrap();
}

#[test]
fn test_cuda_matches_host_when_present() {
    let gpus = match available_gpus() {
        Ok(n) => n,
        Err(e) => {
            eprintln!("Skipping CUDA comparison: device query failed: {e}");
            return;
        }
    };
    if gpus == 0 {
        eprintln!("Skipping CUDA comparison: no GPU");
        return;
    }
    let cuda = GemmEngine::<f32>::new(SessionConfig::new().backend(BackendKind::Cuda)).unwrap();
    let host = GemmEngine::<f32>::new(SessionConfig::host(1 << 24)).unwrap();
    let a = Matrix::<f32>::random(33, 17);
    let t: Vec<_> = (0..5).map(|_| Matrix::<f32>::random(17, 9)).collect();
    let on_gpu = cuda.matrix_tensor(&a, &t).unwrap();
    let on_host = host.matrix_tensor(&a, &t).unwrap();
    assert!(on_gpu.max_relative_error(&on_host) < 1e-5);
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(24))]

    #[test]
    fn prop_stack_of_right_products_is_matrix_tensor(
        n in 0usize..5,
        rows in 1usize..5,
        k in 1usize..5,
        cols in 1usize..5,
    ) {
        let engine = host_engine();
        let a = Matrix::<f64>::random(rows, k);
        let t: Vec<_> = (0..n).map(|_| Matrix::<f64>::random(k, cols)).collect();
        let right = engine.right_matrix_tensor(&a, &t).unwrap();
        prop_assert_eq!(stack(&right).unwrap(), engine.matrix_tensor(&a, &t).unwrap());
    }
}
