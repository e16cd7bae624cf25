//! Benchmarks for the barrier instance store in store/impl.rs
//!
//! Performance-critical paths:
//! - `BarrierStore::upsert`: named lock plus merge transaction
//! - `BarrierStore::update_position`: scatter write over a plan execution
//! - `BarrierStore::claim_standing`: the poller's batch claim

#![allow(missing_docs)]

use barrier_kernel::barrier::{
    BarrierExecutionInstance, BarrierPosition, PositionType, PositionUpdate,
};
use barrier_kernel::store::{migrate, BarrierStore};
use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use sqlx::sqlite::SqlitePoolOptions;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tokio::runtime::Runtime;

fn runtime() -> Runtime {
    tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .expect("runtime")
}

fn store(runtime: &Runtime) -> BarrierStore {
    runtime.block_on(async {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect("sqlite::memory:")
            .await
            .expect("in-memory database");
        migrate(&pool).await.expect("schema");
        BarrierStore::new(pool)
    })
}

fn barrier(plan: &str, members: usize) -> BarrierExecutionInstance {
    (0..members).fold(
        BarrierExecutionInstance::new("Sync", "sync", plan),
        |instance, n| instance.with_position(BarrierPosition::new(format!("s{n}"), format!("b{n}"))),
    )
}

fn bench_upsert(c: &mut Criterion) {
    let mut group = c.benchmark_group("instance_store/upsert");
    let runtime = runtime();

    for members in [1, 8, 32] {
        let store = store(&runtime);
        let plans = AtomicUsize::new(0);
        group.bench_with_input(BenchmarkId::new("create", members), &members, |b, members| {
            b.to_async(&runtime).iter(|| async {
                let plan = format!("plan-{}", plans.fetch_add(1, Ordering::Relaxed));
                store.upsert(&barrier(&plan, *members)).await.expect("upsert")
            });
        });

        let existing = barrier("plan-merge", members);
        runtime
            .block_on(store.upsert(&existing))
            .expect("seed upsert");
        group.bench_with_input(BenchmarkId::new("merge", members), &existing, |b, existing| {
            b.to_async(&runtime)
                .iter(|| async { store.upsert(black_box(existing)).await.expect("upsert") });
        });
    }

    group.finish();
}

fn bench_update_position(c: &mut Criterion) {
    let mut group = c.benchmark_group("instance_store/update_position");
    let runtime = runtime();
    let store = store(&runtime);
    runtime
        .block_on(store.upsert(&barrier("plan-1", 32)))
        .expect("seed upsert");

    // Rows are write-once, so after the first pass this measures the match.
    let update = PositionUpdate::new("plan-1", PositionType::Stage, "s7", "stage-7");
    group.bench_function("write_once_match", |b| {
        b.to_async(&runtime).iter(|| async {
            store
                .update_position(black_box(&update))
                .await
                .expect("update")
        });
    });

    group.finish();
}

fn bench_claim(c: &mut Criterion) {
    let mut group = c.benchmark_group("instance_store/claim_standing");
    let runtime = runtime();
    let store = store(&runtime);
    for n in 0..256 {
        runtime
            .block_on(store.upsert(&barrier(&format!("plan-{n}"), 2)))
            .expect("seed upsert");
    }

    group.bench_function("batch_100_zero_lease", |b| {
        b.to_async(&runtime).iter(|| async {
            store
                .claim_standing(black_box(100), Duration::ZERO)
                .await
                .expect("claim")
        });
    });

    group.finish();
}

criterion_group!(benches, bench_upsert, bench_update_position, bench_claim);
criterion_main!(benches);
