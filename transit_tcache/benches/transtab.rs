//! Translation table benchmarks using criterion.
//!
//! Run with: cargo bench --bench transtab

use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use std::hint::black_box;
use transit_tcache::{GuestExtent, HeapBackend, NewTranslation, TcacheConfig, TransRef, TransTab};

const CODE: [u8; 96] = [0x90; 96];

fn config() -> TcacheConfig {
    TcacheConfig {
        sectors: 4,
        slots_per_sector: 4096,
        avg_translation_size: 128,
        fast_cache_bits: 12,
        ..Default::default()
    }
}

fn populated(n: u64) -> (TransTab<HeapBackend>, Vec<TransRef>) {
    let mut tab = TransTab::new(config(), HeapBackend::default()).expect("valid config");
    let refs = (0..n)
        .map(|i| {
            let base = 0x40_0000 + i * 0x40;
            let extents = [GuestExtent::new(base, 0x30)];
            tab.add_translation(&NewTranslation::new(base, &extents, &CODE))
                .expect("add")
        })
        .collect();
    (tab, refs)
}

fn bench_add(c: &mut Criterion) {
    let mut group = c.benchmark_group("add_translation");
    group.throughput(Throughput::Elements(1));

    group.bench_function("steady_state", |b| {
        let mut tab = TransTab::new(config(), HeapBackend::default()).expect("valid config");
        let mut next = 0u64;
        b.iter(|| {
            let base = 0x40_0000 + (next % 100_000) * 0x40;
            next += 1;
            let extents = [GuestExtent::new(base, 0x30)];
            black_box(
                tab.add_translation(&NewTranslation::new(base, &extents, &CODE))
                    .expect("add"),
            )
        });
    });

    group.finish();
}

fn bench_lookup(c: &mut Criterion) {
    let mut group = c.benchmark_group("lookup");

    for &n in &[64u64, 1024, 8192] {
        let (mut tab, _) = populated(n);

        group.bench_with_input(BenchmarkId::new("full", n), &n, |b, &n| {
            let mut i = 0u64;
            b.iter(|| {
                let guest = 0x40_0000 + (i % n) * 0x40;
                i += 1;
                black_box(tab.lookup_full(guest, false))
            });
        });

        group.bench_with_input(BenchmarkId::new("fast", n), &n, |b, &n| {
            let mut i = 0u64;
            b.iter(|| {
                let guest = 0x40_0000 + (i % n) * 0x40;
                i += 1;
                black_box(tab.lookup_fast(guest))
            });
        });
    }

    group.bench_function("full_miss", |b| {
        let (mut tab, _) = populated(1024);
        b.iter(|| black_box(tab.lookup_full(black_box(0x10), false)));
    });

    group.finish();
}

fn bench_invalidate(c: &mut Criterion) {
    let mut group = c.benchmark_group("invalidate_range");

    group.bench_function("single_page", |b| {
        b.iter_batched(
            || populated(1024).0,
            |mut tab| black_box(tab.invalidate_range(0x40_4000, 0x1000)),
            criterion::BatchSize::LargeInput,
        );
    });

    group.bench_function("huge_range", |b| {
        b.iter_batched(
            || populated(1024).0,
            |mut tab| black_box(tab.invalidate_range(0, u64::MAX)),
            criterion::BatchSize::LargeInput,
        );
    });

    group.bench_function("miss", |b| {
        let (mut tab, _) = populated(1024);
        b.iter(|| black_box(tab.invalidate_range(0x10_0000, 0x100)));
    });

    group.finish();
}

fn bench_chain(c: &mut Criterion) {
    let mut group = c.benchmark_group("chain");

    group.bench_function("rechain", |b| {
        let (mut tab, refs) = populated(256);
        let site = tab.host_addr(refs[0]).expect("live") + 16;
        let mut i = 1usize;
        b.iter(|| {
            let target = refs[i % refs.len()];
            i += 1;
            black_box(tab.chain(site, target, i % 2 == 0))
        });
    });

    group.bench_function("delete_chained_target", |b| {
        b.iter_batched(
            || {
                let (mut tab, refs) = populated(64);
                for (i, &src) in refs.iter().enumerate().skip(1) {
                    let site = tab.host_addr(src).expect("live") + (i % 4) * 16;
                    tab.chain(site, refs[0], false);
                }
                tab
            },
            |mut tab| black_box(tab.invalidate_range(0x40_0000, 1)),
            criterion::BatchSize::LargeInput,
        );
    });

    group.finish();
}

criterion_group!(benches, bench_add, bench_lookup, bench_invalidate, bench_chain);
criterion_main!(benches);
