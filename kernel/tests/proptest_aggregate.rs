//! Property-based tests for forcer aggregation.
//!
//! Checks the fold against its definition over arbitrary child sets and
//! against the full push-down over arbitrary position trees.

#![allow(missing_docs)]

use async_trait::async_trait;
use barrier_kernel::barrier::{
    aggregate, build_forcer, BarrierExecutionInstance, BarrierPosition, ForcerId, ForcerMetadata,
    ForcerState, StatusProctor,
};
use proptest::prelude::*;
use std::collections::HashMap;

fn state_strategy() -> impl Strategy<Value = ForcerState> {
    prop_oneof![
        Just(ForcerState::Approaching),
        Just(ForcerState::Arrived),
        Just(ForcerState::Abandoned),
        Just(ForcerState::TimedOut),
    ]
}

/// Proctor answering from a fixed table; unknown ids are approaching.
struct TableProctor(HashMap<String, ForcerState>);

#[async_trait]
impl StatusProctor for TableProctor {
    async fn resolve(&self, id: &ForcerId, _metadata: &ForcerMetadata) -> ForcerState {
        self.0
            .get(id.as_str())
            .copied()
            .unwrap_or(ForcerState::Approaching)
    }
}

fn push_down(instance: &BarrierExecutionInstance, table: HashMap<String, ForcerState>) -> ForcerState {
    let runtime = tokio::runtime::Builder::new_current_thread()
        .build()
        .expect("runtime");
    let proctor = TableProctor(table);
    runtime.block_on(build_forcer(instance).push_down(&proctor))
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(200))]

    /// Property: the fold is abandoned-first, then timed-out, then unanimous arrival.
    #[test]
    fn aggregate_follows_precedence(states in prop::collection::vec(state_strategy(), 0..12)) {
        let expected = if states.contains(&ForcerState::Abandoned) {
            ForcerState::Abandoned
        } else if states.contains(&ForcerState::TimedOut) {
            ForcerState::TimedOut
        } else if !states.is_empty() && states.iter().all(|s| *s == ForcerState::Arrived) {
            ForcerState::Arrived
        } else {
            ForcerState::Approaching
        };
        prop_assert_eq!(aggregate(states), expected);
    }

    /// Property: child order never changes the result.
    #[test]
    fn aggregate_ignores_order(mut states in prop::collection::vec(state_strategy(), 1..12)) {
        let forward = aggregate(states.clone());
        states.reverse();
        prop_assert_eq!(aggregate(states), forward);
    }

    /// Property: with only step statuses known, push-down equals the fold of those statuses.
    #[test]
    fn push_down_folds_step_states(steps in prop::collection::vec(state_strategy(), 1..8)) {
        let mut instance = BarrierExecutionInstance::new("Sync", "sync", "plan-1");
        let mut table = HashMap::new();
        for (n, state) in steps.iter().enumerate() {
            let stage = format!("stage-{n}");
            let step = format!("step-{n}");
            instance = instance.with_position(
                BarrierPosition::new(format!("s{n}"), format!("b{n}"))
                    .with_runtime_ids(Some(stage.as_str()), None, Some(step.as_str())),
            );
            table.insert(step, *state);
        }

        prop_assert_eq!(push_down(&instance, table), aggregate(steps));
    }

    /// Property: a terminal plan status decides the outcome regardless of members.
    #[test]
    fn terminal_plan_short_circuits(
        plan_state in state_strategy().prop_filter("terminal", |s| *s != ForcerState::Approaching),
        step_state in state_strategy(),
    ) {
        let instance = BarrierExecutionInstance::new("Sync", "sync", "plan-1").with_position(
            BarrierPosition::new("s1", "b1").with_runtime_ids(Some("stage-1"), None, Some("step-1")),
        );
        let table = HashMap::from([
            ("plan-1".to_string(), plan_state),
            ("step-1".to_string(), step_state),
        ]);

        prop_assert_eq!(push_down(&instance, table), plan_state);
    }
}
