#![cfg(feature = "cuda")]

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use gpu_harness::cuda::{cuda_available, CudaDevice};
use gpu_harness::kernels::{AffineEnv, AffineProgram, DoubleValueEnv, DoubleValueProgram};
use gpu_harness::{HarnessConfig, SessionHarness};

// Every session re-creates the context, so these numbers include driver setup
// and module JIT, not just the kernel.

fn cuda_double_value_bench(c: &mut Criterion) {
    if !cuda_available() {
        eprintln!("[bench] skipping CUDA (no device)");
        return;
    }
    let harness = SessionHarness::new(HarnessConfig::default());
    let mut dev = CudaDevice::with_harness_kernels();
    let mut group = c.benchmark_group("cuda_double_value_session");
    group.sample_size(10);
    group.bench_function("round_trip", |b| {
        b.iter(|| {
            let env = DoubleValueEnv {
                value: black_box(42),
            };
            black_box(harness.run(&mut dev, &mut DoubleValueProgram, &env).output)
        })
    });
    group.finish();
}

fn cuda_affine_bench(c: &mut Criterion) {
    if !cuda_available() {
        eprintln!("[bench] skipping CUDA (no device)");
        return;
    }
    let harness = SessionHarness::new(HarnessConfig::default());
    let mut dev = CudaDevice::with_harness_kernels();
    let mut group = c.benchmark_group("cuda_affine_session");
    group.sample_size(10);
    for &count in &[65_536u32, 1_048_576, 16_777_216] {
        group.throughput(Throughput::Elements(count as u64));
        group.bench_with_input(BenchmarkId::from_parameter(count), &count, |b, &count| {
            let env = AffineEnv::new(1.5, -2.0, count);
            b.iter(|| black_box(harness.run(&mut dev, &mut AffineProgram, &env).output))
        });
    }
    group.finish();
}

criterion_group!(benches, cuda_double_value_bench, cuda_affine_bench);
criterion_main!(benches);
