use std::sync::Arc;

use bolide::{FieldDesc, FieldKind, GcConfig, Generation, Runtime, TypeDesc};
use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion};

fn setup(heaps: usize) -> (Runtime, Arc<TypeDesc>, Arc<TypeDesc>) {
    let runtime = Runtime::new(
        GcConfig {
            gen0_size: 512 * 1024,
            gen1_size: 2 * 1024 * 1024,
            ..GcConfig::default()
        }
        .with_heap_count(heaps),
    );
    let node = runtime
        .register_type(TypeDesc::class(
            "Node",
            vec![
                FieldDesc::new("Id", FieldKind::Int32),
                FieldDesc::new("Next", FieldKind::Ref),
            ],
        ))
        .unwrap();
    let holder = runtime
        .register_type(TypeDesc::class(
            "Holder",
            vec![FieldDesc::new("Child", FieldKind::Ref)],
        ))
        .unwrap();
    (runtime, node, holder)
}

/// Fills the nursery with a chain of nodes, a slice of them reachable from
/// an old-generation holder, then runs one minor collection.
fn churn_and_collect(runtime: &Runtime, node: &Arc<TypeDesc>, holder: &Arc<TypeDesc>, parallel: bool) {
    runtime.bind_current_thread(0);
    let keeper = runtime.alloc(holder, Some(Generation::Gen1)).unwrap();
    let mut survivor = bolide::NULL;
    for i in 0..4000 {
        let n = runtime.alloc(node, None).unwrap();
        runtime.set_int32(n, "Id", i).unwrap();
        if i % 16 == 0 {
            runtime.set_ref(n, "Next", survivor).unwrap();
            survivor = n;
        }
    }
    runtime.set_ref(keeper, "Child", survivor).unwrap();
    if parallel {
        runtime.collect_ephemeral_all_parallel().unwrap();
    } else {
        runtime.collect_ephemeral_all().unwrap();
    }
}

pub fn bench_minor_gc(c: &mut Criterion) {
    let mut group = c.benchmark_group("minor gc");
    group.sample_size(50);

    for heaps in [1usize, 2, 4] {
        group.bench_function(BenchmarkId::new("sequential", heaps), |b| {
            b.iter_batched_ref(
                || setup(heaps),
                |(runtime, node, holder)| churn_and_collect(runtime, node, holder, false),
                criterion::BatchSize::LargeInput,
            );
        });
        group.bench_function(BenchmarkId::new("parallel", heaps), |b| {
            b.iter_batched_ref(
                || setup(heaps),
                |(runtime, node, holder)| churn_and_collect(runtime, node, holder, true),
                criterion::BatchSize::LargeInput,
            );
        });
    }

    group.finish();
}

criterion_group!(benches, bench_minor_gc);
criterion_main!(benches);
