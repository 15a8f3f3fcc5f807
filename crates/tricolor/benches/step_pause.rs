//! Benchmark for collector pause times.
//!
//! Compares one full collection against a single incremental step over heaps
//! of various sizes. The incremental step should stay roughly flat while the
//! full collection grows with the heap.

#![allow(clippy::cast_precision_loss, clippy::cast_possible_wrap)]

use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion};
use tricolor::{GcConfig, GcPhase, ObjRef, Runtime, Value};

/// A pinned tree of `nodes` tables, sixteen children per level, plus as
/// many garbage tables.
fn build_heap(nodes: usize) -> Runtime {
    let mut rt = Runtime::new(GcConfig::default());
    let root = rt.new_table().unwrap();
    rt.pin(Value::Table(root));
    let key = rt.intern_str("index").unwrap();
    let mut parent: ObjRef = root;
    for i in 0..nodes {
        let t = rt.new_table().unwrap();
        rt.table_set_int(parent, (i % 16) as i64 + 1, Value::Table(t))
            .unwrap();
        rt.table_set(t, Value::String(key), Value::Number(i as f64))
            .unwrap();
        if i % 16 == 0 {
            parent = t;
        }
        rt.new_table().unwrap();
    }
    rt
}

fn benchmark_full_collection(c: &mut Criterion) {
    let mut group = c.benchmark_group("step_pause");
    group.sample_size(10);
    group.warm_up_time(std::time::Duration::from_millis(500));

    for nodes in [1_000, 10_000] {
        let mut rt = build_heap(nodes);
        group.bench_with_input(BenchmarkId::new("full", nodes), &nodes, |b, _| {
            b.iter(|| {
                rt.full_collect().unwrap();
                std::hint::black_box(rt.total_bytes());
            });
        });
    }
    group.finish();
}

fn benchmark_incremental_step(c: &mut Criterion) {
    let mut group = c.benchmark_group("step_pause");
    group.sample_size(10);
    group.warm_up_time(std::time::Duration::from_millis(500));

    for nodes in [1_000, 10_000] {
        let mut rt = build_heap(nodes);
        group.bench_with_input(BenchmarkId::new("step", nodes), &nodes, |b, _| {
            b.iter(|| {
                rt.step().unwrap();
                std::hint::black_box(rt.phase() == GcPhase::Pause);
            });
        });
        let m = rt.metrics().history();
        std::hint::black_box(m.max_pause_time(16));
    }
    group.finish();
}

criterion_group!(benches, benchmark_full_collection, benchmark_incremental_step);
criterion_main!(benches);
