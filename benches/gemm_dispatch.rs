//! GEMM Dispatch Benchmarks
//!
//! Measures the facade end to end (upload, dispatch, download, release) for
//! each packing strategy:
//!
//! | Operation             | Strategy        |
//! |-----------------------|-----------------|
//! | dot                   | single GEMM     |
//! | matrix_tensor         | strided batch   |
//! | right_matrix_tensor   | pointer array   |
//! | tensor_dot_matrix     | pre-allocated pointer array |
//!
//! Uses CUDA when available (`BATCHGEMM_BACKEND=cuda|host|auto`, default
//! `auto`), the host-emulated device otherwise.
//!
//! ## Running
//!
//! ```bash
//! cargo bench --bench gemm_dispatch
//! ```

use batchgemm::{BackendKind, GemmEngine, Matrix, SessionConfig, TensorMatrix, TensorMatrixDims};
use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use rand::rngs::StdRng;
use rand::SeedableRng;

// =============================================================================
// Utilities
// =============================================================================

fn config() -> SessionConfig {
    let backend = match std::env::var("BATCHGEMM_BACKEND").as_deref() {
        Ok("cuda") => BackendKind::Cuda,
        Ok("host") => BackendKind::Host,
        _ => BackendKind::Auto,
    };
    SessionConfig::new().backend(backend)
}

fn tensor(rng: &mut StdRng, n: usize, rows: usize, cols: usize) -> Vec<Matrix<f32>> {
    (0..n).map(|_| Matrix::random_with(rng, rows, cols)).collect()
}

fn flops(m: usize, k: usize, n: usize, batch: usize) -> u64 {
    (2 * m * k * n * batch) as u64
}

// =============================================================================
// Benchmarks
// =============================================================================

fn bench_dot(c: &mut Criterion) {
    let _ = tracing_subscriber::fmt().with_max_level(tracing::Level::WARN).try_init();
    let engine = GemmEngine::<f32>::new(config()).expect("open session");
    let mut rng = StdRng::seed_from_u64(42);
    let mut group = c.benchmark_group("dot");

    for size in [16usize, 64, 128] {
        let a = Matrix::random_with(&mut rng, size, size);
        let b = Matrix::random_with(&mut rng, size, size);
        group.throughput(Throughput::Elements(flops(size, size, size, 1)));
        group.bench_with_input(BenchmarkId::from_parameter(size), &size, |bench, _| {
            bench.iter(|| black_box(engine.dot(&a, &b).expect("dot")))
        });
    }
    group.finish();
}

fn bench_batches(c: &mut Criterion) {
    let engine = GemmEngine::<f32>::new(config()).expect("open session");
    let mut rng = StdRng::seed_from_u64(7);
    let mut group = c.benchmark_group("batch");
    let (rows, k, cols) = (32usize, 32usize, 32usize);

    for batch in [4usize, 32, 128] {
        let a = Matrix::random_with(&mut rng, rows, k);
        let t = tensor(&mut rng, batch, k, cols);
        group.throughput(Throughput::Elements(flops(rows, k, cols, batch)));

        group.bench_with_input(BenchmarkId::new("strided", batch), &batch, |bench, _| {
            bench.iter(|| black_box(engine.matrix_tensor(&a, &t).expect("matrix_tensor")))
        });
        group.bench_with_input(BenchmarkId::new("pointer_array", batch), &batch, |bench, _| {
            bench.iter(|| black_box(engine.right_matrix_tensor(&a, &t).expect("right_matrix_tensor")))
        });
    }
    group.finish();
}

fn bench_tensor_matrix(c: &mut Criterion) {
    let mut rng = StdRng::seed_from_u64(9);
    let mut group = c.benchmark_group("tensor_matrix");
    let dims = TensorMatrixDims::new(32, 32, 32);

    for batch in [4usize, 32] {
        let mut tm = TensorMatrix::<f32>::new(config(), batch, dims).expect("allocate pipeline");
        let t = tensor(&mut rng, batch, 32, 32);
        let b = Matrix::random_with(&mut rng, 32, 32);
        group.throughput(Throughput::Elements(flops(32, 32, 32, batch)));
        group.bench_with_input(BenchmarkId::from_parameter(batch), &batch, |bench, _| {
            bench.iter(|| black_box(tm.tensor_dot_matrix(&t, &b).expect("tensor_dot_matrix")))
        });
    }
    group.finish();
}

criterion_group!(benches, bench_dot, bench_batches, bench_tensor_matrix);
criterion_main!(benches);
