//! End-to-end tests of the GEMM facade on the host-emulated device.
//!
//! These cover:
//! - products against the host reference
//! - strided and pointer-array batches agreeing with each other
//! - shape errors leaving device memory untouched
//! - TensorMatrix buffer reuse and release

use batchgemm_core::{GemmError, GemmScalars, Matrix, SessionConfig};
use batchgemm_engine::{stack, GemmEngine, TensorMatrix, TensorMatrixDims};
use proptest::prelude::*;
use rand::rngs::StdRng;
use rand::SeedableRng;

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_max_level(tracing::Level::DEBUG)
        .with_test_writer()
        .try_init();
}

fn engine<T: batchgemm_core::Element>() -> GemmEngine<T> {
    init_tracing();
    GemmEngine::new(SessionConfig::host(1 << 24)).unwrap()
}

fn random_tensor(rng: &mut StdRng, n: usize, rows: usize, cols: usize) -> Vec<Matrix<f32>> {
    (0..n).map(|_| Matrix::random_with(rng, rows, cols)).collect()
}

#[test]
fn test_dot_matches_reference() {
    let mut rng = StdRng::seed_from_u64(7);
    let e = engine::<f32>();
    let a = Matrix::random_with(&mut rng, 50, 30);
    let b = Matrix::random_with(&mut rng, 30, 40);
    let c = e.dot(&a, &b).unwrap();
    assert_eq!(c.shape(), (50, 40));
    assert!(c.max_relative_error(&a.matmul(&b).unwrap()) < 1e-5);
}

#[test]
fn test_dot_f64() {
    let e = engine::<f64>();
    let a = Matrix::<f64>::random(17, 9);
    let b = Matrix::<f64>::random(9, 5);
    assert!(e.dot(&a, &b).unwrap().approx_eq(&a.matmul(&b).unwrap(), 1e-12));
}

#[test]
fn test_dot_shape_mismatch_allocates_nothing() {
    let e = engine::<f32>();
    let before = e.session().mem_info().unwrap();
    let err = e.dot(&Matrix::zeros(2, 3), &Matrix::zeros(4, 2)).unwrap_err();
    assert!(matches!(err, GemmError::ShapeMismatch { op: "dot", .. }));
    assert!(err.is_recoverable());
    assert_eq!(e.session().stats().allocations, 0);
    assert_eq!(e.session().mem_info().unwrap(), before);
}

#[test]
fn test_out_of_memory_is_recoverable() {
    let e = GemmEngine::<f64>::new(SessionConfig::host(1024)).unwrap();
    let a = Matrix::<f64>::random(20, 20);
    let err = e.dot(&a, &a).unwrap_err();
    assert!(matches!(err, GemmError::OutOfDeviceMemory { .. }));
    assert_eq!(e.session().stats().live_buffers, 0);

    // The session is still usable for a request that fits.
    let small = Matrix::<f64>::identity(4);
    assert_eq!(e.dot(&small, &small).unwrap(), small);
}

#[test]
fn test_matrix_tensor_equals_stacked_right_products() {
    let mut rng = StdRng::seed_from_u64(11);
    let e = engine::<f32>();
    let a = Matrix::random_with(&mut rng, 6, 4);
    let t = random_tensor(&mut rng, 5, 4, 3);
    let strided = e.matrix_tensor(&a, &t).unwrap();
    let pointer = e.right_matrix_tensor(&a, &t).unwrap();
    assert_eq!(strided.shape(), (30, 3));
    assert_eq!(stack(&pointer).unwrap(), strided);
    for (p, m) in pointer.iter().zip(&t) {
        assert!(p.max_relative_error(&a.matmul(m).unwrap()) < 1e-5);
    }
}

#[test]
fn test_triple_product_equals_two_dots() {
    let mut rng = StdRng::seed_from_u64(3);
    let e = engine::<f32>();
    let a = Matrix::random_with(&mut rng, 4, 5);
    let c = Matrix::random_with(&mut rng, 6, 2);
    let t = random_tensor(&mut rng, 3, 5, 6);
    let out = e.triple_tensor_product(&a, &c, &t).unwrap();
    assert_eq!(out.len(), 3);
    for (o, m) in out.iter().zip(&t) {
        let expected = e.dot(&e.dot(&a, m).unwrap(), &c).unwrap();
        assert!(o.max_relative_error(&expected) < 1e-5);
    }
    assert_eq!(e.session().stats().live_buffers, 0);
}

#[test]
fn test_triple_product_rejects_bad_c() {
    let e = engine::<f32>();
    let t = vec![Matrix::zeros(5, 6); 2];
    let err = e
        .triple_tensor_product(&Matrix::zeros(4, 5), &Matrix::zeros(5, 2), &t)
        .unwrap_err();
    assert!(matches!(err, GemmError::ShapeMismatch { op: "triple_tensor_product", .. }));
    assert_eq!(e.session().stats().allocations, 0);
}

#[test]
fn test_triple_product_output_reserve_failure_releases_operands() {
    init_tracing();
    // a, c, the tensor and the intermediate take 192 bytes; the output does not fit.
    let e = GemmEngine::<f64>::new(SessionConfig::host(200)).unwrap();
    let a = Matrix::<f64>::random(2, 2);
    let c = Matrix::<f64>::random(2, 2);
    let t = vec![Matrix::<f64>::random(2, 2), Matrix::<f64>::random(2, 2)];
    let err = e.triple_tensor_product(&a, &c, &t).unwrap_err();
    assert!(matches!(err, GemmError::OutOfDeviceMemory { requested: 32, free: 8, .. }));

    let stats = e.session().stats();
    assert_eq!((stats.live_buffers, stats.live_bytes), (0, 0));
    assert_eq!(stats.allocations, stats.frees);
    let info = e.session().mem_info().unwrap();
    assert_eq!(info.free, info.total);

    let one = vec![Matrix::<f64>::identity(1)];
    let out = e.triple_tensor_product(&Matrix::identity(1), &Matrix::identity(1), &one).unwrap();
    assert_eq!(out, one);
}

#[test]
fn test_matrix_tensor_output_reserve_failure_releases_operands() {
    init_tracing();
    // a and the packed tensor take 128 bytes; the 96-byte output does not fit.
    let e = GemmEngine::<f64>::new(SessionConfig::host(160)).unwrap();
    let a = Matrix::<f64>::random(2, 2);
    let t = vec![Matrix::<f64>::random(2, 2); 3];
    let err = e.matrix_tensor(&a, &t).unwrap_err();
    assert!(matches!(err, GemmError::OutOfDeviceMemory { requested: 96, free: 32, .. }));

    let stats = e.session().stats();
    assert_eq!((stats.live_buffers, stats.live_bytes), (0, 0));
    assert_eq!(stats.allocations, stats.frees);
    let info = e.session().mem_info().unwrap();
    assert_eq!(info.free, info.total);

    let small = e.matrix_tensor(&a, &t[..1]).unwrap();
    assert!(small.approx_eq(&a.matmul(&t[0]).unwrap(), 1e-12));
}

#[test]
fn test_ragged_tensor_rejected() {
    let e = engine::<f32>();
    let t = vec![Matrix::zeros(2, 2), Matrix::zeros(2, 3)];
    assert!(e.matrix_tensor(&Matrix::zeros(2, 2), &t).is_err());
    assert!(e.right_matrix_tensor(&Matrix::zeros(2, 2), &t).is_err());
    assert_eq!(e.session().stats().allocations, 0);
}

#[test]
fn test_no_leaks_across_calls() {
    let mut rng = StdRng::seed_from_u64(5);
    let e = engine::<f32>();
    let total = e.session().mem_info().unwrap().total;
    let a = Matrix::random_with(&mut rng, 3, 3);
    let t = random_tensor(&mut rng, 4, 3, 3);
    for _ in 0..3 {
        e.dot(&a, &a).unwrap();
        e.matrix_tensor(&a, &t).unwrap();
        e.right_matrix_tensor(&a, &t).unwrap();
        e.triple_tensor_product(&a, &a, &t).unwrap();
    }
    let stats = e.session().stats();
    assert_eq!(stats.allocations, stats.frees);
    assert_eq!(e.session().mem_info().unwrap().free, total);
}

#[test]
fn test_tensor_matrix_reuse_and_destroy() {
    let mut rng = StdRng::seed_from_u64(13);
    let dims = TensorMatrixDims::new(3, 4, 2);
    let mut tm = TensorMatrix::<f32>::new(SessionConfig::host(1 << 20), 4, dims).unwrap();
    let allocator = std::sync::Arc::clone(tm.session().allocator());

    for _ in 0..2 {
        let t = random_tensor(&mut rng, 4, 3, 4);
        let b = Matrix::random_with(&mut rng, 4, 2);
        let out = tm.tensor_dot_matrix(&t, &b).unwrap();
        assert_eq!(out.len(), 4);
        for (o, m) in out.iter().zip(&t) {
            assert!(o.max_relative_error(&m.matmul(&b).unwrap()) < 1e-5);
        }
        // Only the request-scoped pointer arrays come and go.
        assert_eq!(allocator.stats().live_buffers, 12);
    }

    let before_destroy = allocator.stats().frees;
    tm.destroy().unwrap();
    let stats = allocator.stats();
    assert_eq!(stats.frees - before_destroy, 12);
    assert_eq!(stats.live_buffers, 0);
}

#[test]
fn test_tensor_matrix_drop_releases() {
    let tm = TensorMatrix::<f64>::new(SessionConfig::host(1 << 20), 2, TensorMatrixDims::new(2, 2, 2)).unwrap();
    let allocator = std::sync::Arc::clone(tm.session().allocator());
    drop(tm);
    assert_eq!(allocator.stats().live_buffers, 0);
    assert_eq!(allocator.stats().frees, 6);
}

#[test]
fn test_gemm_accumulate() {
    let e = engine::<f64>();
    let a = Matrix::<f64>::random(3, 3);
    let mut c = Matrix::<f64>::identity(3);
    e.gemm(&a, &Matrix::identity(3), &mut c, GemmScalars::accumulate()).unwrap();
    let expected = Matrix::from_fn(3, 3, |r, col| a[(r, col)] + if r == col { 1.0 } else { 0.0 });
    assert!(c.approx_eq(&expected, 1e-12));
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(32))]

    #[test]
    fn prop_dot_matches_reference(m in 1usize..12, k in 1usize..12, n in 1usize..12, seed in any::<u64>()) {
        let mut rng = StdRng::seed_from_u64(seed);
        let e = engine::<f32>();
        let a = Matrix::random_with(&mut rng, m, k);
        let b = Matrix::random_with(&mut rng, k, n);
        let c = e.dot(&a, &b).unwrap();
        prop_assert!(c.max_relative_error(&a.matmul(&b).unwrap()) < 1e-5);
    }

    #[test]
    fn prop_strided_equals_pointer(n in 1usize..6, r in 1usize..6, k in 1usize..6, cols in 1usize..6, seed in any::<u64>()) {
        let mut rng = StdRng::seed_from_u64(seed);
        let e = engine::<f32>();
        let a = Matrix::random_with(&mut rng, r, k);
        let t = random_tensor(&mut rng, n, k, cols);
        let strided = e.matrix_tensor(&a, &t).unwrap();
        let pointer = e.right_matrix_tensor(&a, &t).unwrap();
        prop_assert_eq!(stack(&pointer).unwrap(), strided);
    }

    #[test]
    fn prop_degenerate_shapes_are_zero(m in 0usize..4, n in 0usize..4) {
        let e = engine::<f64>();
        let c = e.dot(&Matrix::zeros(m, 0), &Matrix::zeros(0, n)).unwrap();
        prop_assert_eq!(c, Matrix::zeros(m, n));
    }
}
