//! Benchmarks for the forcer tree in barrier/forcer.rs
//!
//! Performance-critical paths:
//! - `build_forcer`: rebuilt from the position rows on every evaluation
//! - `Forcer::push_down`: one proctor call per node plus the fold
//! - `aggregate`: the composite fold

#![allow(missing_docs)]

use async_trait::async_trait;
use barrier_kernel::barrier::{
    aggregate, build_forcer, BarrierExecutionInstance, BarrierPosition, ForcerId, ForcerMetadata,
    ForcerState, StatusProctor,
};
use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};

/// Proctor reporting every unit as arrived, so push-down visits the whole tree.
struct ArrivedProctor;

#[async_trait]
impl StatusProctor for ArrivedProctor {
    async fn resolve(&self, id: &ForcerId, _metadata: &ForcerMetadata) -> ForcerState {
        if id.as_str().starts_with("plan") || id.as_str().starts_with("stage") {
            ForcerState::Approaching
        } else {
            ForcerState::Arrived
        }
    }
}

fn instance(members: usize) -> BarrierExecutionInstance {
    (0..members).fold(
        BarrierExecutionInstance::new("Sync", "sync", "plan-1"),
        |instance, n| {
            let stage = format!("stage-{n}");
            let group = format!("group-{n}");
            let step = format!("step-{n}");
            let grouped = n % 2 == 0;
            let position = BarrierPosition::new(format!("s{n}"), format!("b{n}")).with_runtime_ids(
                Some(stage.as_str()),
                grouped.then_some(group.as_str()),
                Some(step.as_str()),
            );
            instance.with_position(position)
        },
    )
}

fn bench_build_forcer(c: &mut Criterion) {
    let mut group = c.benchmark_group("forcer/build");

    for members in [2, 16, 128] {
        let barrier = instance(members);
        group.bench_with_input(BenchmarkId::from_parameter(members), &barrier, |b, barrier| {
            b.iter(|| build_forcer(black_box(barrier)));
        });
    }

    group.finish();
}

fn bench_push_down(c: &mut Criterion) {
    let mut group = c.benchmark_group("forcer/push_down");
    let runtime = tokio::runtime::Builder::new_current_thread()
        .build()
        .expect("runtime");

    for members in [2, 16, 128] {
        let forcer = build_forcer(&instance(members));
        group.bench_with_input(BenchmarkId::from_parameter(members), &forcer, |b, forcer| {
            b.to_async(&runtime)
                .iter(|| async { black_box(forcer).push_down(&ArrivedProctor).await });
        });
    }

    group.finish();
}

fn bench_aggregate(c: &mut Criterion) {
    let mut group = c.benchmark_group("forcer/aggregate");

    let cases = [
        ("all_arrived", vec![ForcerState::Arrived; 64]),
        (
            "late_abandoned",
            [vec![ForcerState::Arrived; 63], vec![ForcerState::Abandoned]].concat(),
        ),
        (
            "timed_out",
            [vec![ForcerState::TimedOut], vec![ForcerState::Approaching; 63]].concat(),
        ),
    ];

    for (name, states) in &cases {
        group.bench_with_input(BenchmarkId::from_parameter(*name), states, |b, states| {
            b.iter(|| aggregate(black_box(states).iter().copied()));
        });
    }

    group.finish();
}

criterion_group!(benches, bench_build_forcer, bench_push_down, bench_aggregate);
criterion_main!(benches);
