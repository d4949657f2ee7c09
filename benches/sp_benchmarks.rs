//! Benchmarks for the computational hot paths: SDR format conversions,
//! overlap computation and the Spatial Pooler compute loop.
//!
//! Run with: `cargo bench --bench sp_benchmarks`

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use veles::prelude::*;
use veles::utils::Random;

fn random_sdr(size: u32, sparsity: f32, rng: &mut Random) -> Sdr {
    let mut sdr = Sdr::new(&[size]).unwrap();
    sdr.randomize(sparsity, rng);
    sdr
}

/// Overlap of two sorted sparse vectors, called repeatedly by metrics and
/// by most users comparing representations.
fn bench_sdr_overlap(c: &mut Criterion) {
    let mut group = c.benchmark_group("sdr_overlap");
    let mut rng = Random::new(42);

    for &size in &[2048u32, 16384, 65536] {
        let a = random_sdr(size, 0.02, &mut rng);
        let b = random_sdr(size, 0.02, &mut rng);

        group.throughput(Throughput::Elements(u64::from(size)));
        group.bench_with_input(BenchmarkId::from_parameter(size), &size, |bench, _| {
            bench.iter(|| black_box(a.get_overlap(&b).unwrap()));
        });
    }
    group.finish();
}

/// Dense/sparse conversions exercised by every cache miss.
fn bench_sdr_conversions(c: &mut Criterion) {
    let mut group = c.benchmark_group("sdr_conversions");
    let mut rng = Random::new(42);
    let size = 16384u32;

    group.bench_function("sparse_to_dense", |bench| {
        let sdr = random_sdr(size, 0.02, &mut rng);
        let sparse = sdr.get_sparse();
        bench.iter(|| {
            let mut fresh = Sdr::new(&[size]).unwrap();
            fresh.set_sparse(&sparse).unwrap();
            black_box(fresh.get_dense());
        });
    });

    group.bench_function("dense_to_sparse", |bench| {
        let sdr = random_sdr(size, 0.02, &mut rng);
        let dense = sdr.get_dense();
        bench.iter(|| {
            let mut fresh = Sdr::new(&[size]).unwrap();
            fresh.set_dense(&dense).unwrap();
            black_box(fresh.get_sparse());
        });
    });

    group.finish();
}

/// The full Spatial Pooler step, with and without learning.
fn bench_sp_compute(c: &mut Criterion) {
    let mut group = c.benchmark_group("sp_compute");
    group.sample_size(20);

    let mut rng = Random::new(42);
    let inputs: Vec<Sdr> = (0..32).map(|_| random_sdr(1024, 0.05, &mut rng)).collect();

    for &learn in &[false, true] {
        let mut sp = SpatialPooler::new(SpatialPoolerParams {
            input_dimensions: vec![1024],
            column_dimensions: vec![2048],
            potential_radius: 256,
            local_area_density: 0.02,
            ..Default::default()
        })
        .unwrap();
        let mut active = Sdr::new(&[2048]).unwrap();

        let name = if learn { "learning" } else { "inference" };
        group.bench_function(name, |bench| {
            let mut step = 0usize;
            bench.iter(|| {
                let input = &inputs[step % inputs.len()];
                step += 1;
                black_box(sp.compute(input, learn, &mut active).unwrap());
            });
        });
    }

    group.finish();
}

criterion_group!(
    benches,
    bench_sdr_overlap,
    bench_sdr_conversions,
    bench_sp_compute
);
criterion_main!(benches);
