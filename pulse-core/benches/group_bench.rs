//! # Group Benchmarks
//!
//! Compares tracked (soft) group rebuilds against full rebuilds.
//!
//! Run with: `cargo bench -p pulse-core`

use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion};
use pulse_core::{AddOptions, Collection, CollectionConfig, Group, Pulse, PulseConfig};
use serde_json::{json, Value};
use std::hint::black_box;

/// A collection with `size` entities, all in group `feed`.
fn populated(size: usize, threshold: usize) -> (Pulse, Collection, Group) {
    let pulse = Pulse::with_config(PulseConfig {
        group_full_rebuild_threshold: threshold,
        ..PulseConfig::default()
    });
    let posts = pulse.collection(CollectionConfig::new("posts"));
    let items: Vec<Value> = (0..size as i64)
        .map(|id| json!({ "id": id, "title": format!("post {id}") }))
        .collect();
    posts.collect(Value::Array(items), "feed");
    let feed = posts.group("feed");
    (pulse, posts, feed)
}

// =============================================================================
// BENCHMARKS
// =============================================================================

fn bench_single_entity_write(c: &mut Criterion) {
    let mut group = c.benchmark_group("single_entity_write");

    for size in [100, 1000, 10000].iter() {
        let (_pulse, posts, feed) = populated(*size, 512);
        let middle = (*size / 2) as i64;
        let mut revision = 0u64;
        group.bench_with_input(BenchmarkId::from_parameter(size), size, |b, _| {
            b.iter(|| {
                revision += 1;
                posts.collect(json!({ "id": middle, "rev": revision }), ());
                black_box(feed.output().len())
            });
        });
    }

    group.finish();
}

fn bench_add_remove(c: &mut Criterion) {
    let mut group = c.benchmark_group("add_remove");

    for (label, soft) in [("soft", true), ("full", false)] {
        for size in [100, 1000, 10000].iter() {
            let (_pulse, posts, feed) = populated(*size, 512);
            posts.collect(json!({ "id": -1 }), ());
            group.bench_with_input(BenchmarkId::new(label, size), size, |b, _| {
                b.iter(|| {
                    feed.add_with(
                        -1i64,
                        AddOptions {
                            soft_rebuild: soft,
                            ..AddOptions::default()
                        },
                    );
                    feed.remove_with(-1i64, soft);
                    black_box(feed.output().len())
                });
            });
        }
    }

    group.finish();
}

fn bench_full_collect(c: &mut Criterion) {
    let mut group = c.benchmark_group("full_collect");
    group.sample_size(20);

    for size in [100, 1000, 10000].iter() {
        group.bench_with_input(BenchmarkId::from_parameter(size), size, |b, &size| {
            b.iter(|| black_box(populated(size, 512).2.output().len()));
        });
    }

    group.finish();
}

criterion_group!(
    benches,
    bench_single_entity_write,
    bench_add_remove,
    bench_full_collect
);
criterion_main!(benches);
