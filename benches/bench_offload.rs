// DSA Memory Offload Engine
// Copyright 2025 Henk-Jan Lebbink
// SPDX-License-Identifier: MIT

//! Benchmarks comparing the offload shims against the std primitives.
//!
//! On machines without a DSA the shims take the CPU fallback, so the
//! comparison degenerates to measuring shim overhead.

use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use dsa_offload::{dsa_memcpy, dsa_memset, Container};

fn bench_memcpy(c: &mut Criterion) {
    Container::global().initialize();

    let sizes: Vec<usize> = vec![
        4 * 1024,        // 4 KB
        64 * 1024,       // 64 KB
        1024 * 1024,     // 1 MB
        4 * 1024 * 1024, // 4 MB
    ];

    let mut group = c.benchmark_group("memcpy");

    for size in sizes {
        let src: Vec<u8> = (0..size).map(|i| (i & 0xFF) as u8).collect();
        let mut dst = vec![0u8; size];

        group.throughput(Throughput::Bytes(size as u64));

        group.bench_with_input(BenchmarkId::new("std", size), &size, |b, &size| {
            b.iter(|| dst[..size].copy_from_slice(&src[..size]));
        });

        group.bench_with_input(BenchmarkId::new("shim", size), &size, |b, &size| {
            b.iter(|| unsafe { dsa_memcpy!(dst.as_mut_ptr(), src.as_ptr(), size) });
        });
    }

    group.finish();
}

fn bench_memset(c: &mut Criterion) {
    Container::global().initialize();

    let sizes: Vec<usize> = vec![64 * 1024, 1024 * 1024, 4 * 1024 * 1024];

    let mut group = c.benchmark_group("memset");

    for size in sizes {
        let mut dst = vec![0u8; size];

        group.throughput(Throughput::Bytes(size as u64));

        group.bench_with_input(BenchmarkId::new("std", size), &size, |b, &size| {
            b.iter(|| dst[..size].fill(0));
        });

        group.bench_with_input(BenchmarkId::new("shim", size), &size, |b, &size| {
            b.iter(|| unsafe { dsa_memset!(dst.as_mut_ptr(), 0, size) });
        });
    }

    group.finish();
}

criterion_group!(benches, bench_memcpy, bench_memset);
criterion_main!(benches);
