//! Benchmarks for cache fingerprinting and bundle encoding.

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use deployflow::core::FileBundle;
use deployflow::storage::{CacheFingerprint, FingerprintInput};
use std::collections::BTreeMap;

fn fingerprint_benchmark(c: &mut Criterion) {
    let variables: BTreeMap<String, String> = (0..32)
        .map(|i| (format!("VAR_{i}"), format!("value-{i}")))
        .collect();
    let cache_paths = vec!["build/_deps".to_string(), "node_modules".to_string()];
    let input = FingerprintInput {
        image: "public.ecr.aws/codebuild/amazonlinux2-x86_64-standard:3.0",
        variables: &variables,
        phase: "install",
        commands: (0..16).map(|i| format!("yum install -y package-{i}")).collect(),
        cache_paths: &cache_paths,
        source_digest: None,
    };

    c.bench_function("fingerprint_compute", |b| {
        b.iter(|| CacheFingerprint::compute(black_box(&input)));
    });
}

fn bundle(files: usize, size: usize) -> FileBundle {
    let mut bundle = FileBundle::new();
    for i in 0..files {
        let _ = bundle.insert(format!("src/module_{i}/file.cpp"), vec![b'x'; size]);
    }
    bundle
}

fn bundle_benchmark(c: &mut Criterion) {
    let mut group = c.benchmark_group("bundle_encode");
    for files in [10, 100, 1000] {
        let input = bundle(files, 4096);
        group.bench_with_input(BenchmarkId::from_parameter(files), &input, |b, input| {
            b.iter(|| black_box(input).encode());
        });
    }
    group.finish();

    let encoded = bundle(100, 4096).encode();
    c.bench_function("bundle_decode_100", |b| {
        b.iter(|| FileBundle::decode(black_box(&encoded)));
    });
}

criterion_group!(benches, fingerprint_benchmark, bundle_benchmark);
criterion_main!(benches);
