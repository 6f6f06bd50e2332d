//! Property-based tests for adios-core using proptest.
//!
//! These drive the public `Scheduler` API with generated workloads and check
//! the ordering, accounting and learning guarantees that hold regardless of
//! the mix of operations.

use adios_core::{
    DispatchSource, OpCategory, OpRequest, OperationId, Scheduler, SchedulerConfig,
};
use proptest::prelude::*;
use std::collections::HashSet;

const MS: u64 = 1_000_000;

fn any_category() -> impl Strategy<Value = OpCategory> {
    prop_oneof![
        Just(OpCategory::Read),
        Just(OpCategory::Write),
        Just(OpCategory::Discard),
        Just(OpCategory::Other),
    ]
}

/// (category, size, arrival, at_head)
fn any_op() -> impl Strategy<Value = (OpCategory, u64, u64, bool)> {
    (
        any_category(),
        0u64..(1 << 20),
        0u64..(10 * MS),
        prop::bool::weighted(0.1),
    )
}

fn scheduler() -> Scheduler {
    Scheduler::new(SchedulerConfig::default()).unwrap()
}

/// Gives every category a base latency (and thus non-zero predictions).
fn warm_all(s: &Scheduler, base: u64) {
    for (i, category) in OpCategory::ALL.into_iter().enumerate() {
        let id = OperationId(u64::MAX - i as u64);
        s.insert(OpRequest::new(id, category, 512, 0), false).unwrap();
        let op = s.dispatch().unwrap();
        assert_eq!(op.id, id);
        s.complete(id, Some(0), base);
    }
}

proptest! {
    /// Every admitted operation is released exactly once, dispatch never
    /// returns None while work is queued, and nothing un-admitted appears.
    #[test]
    fn test_every_operation_dispatched_once(
        ops in proptest::collection::vec(any_op(), 1..200),
        warm in any::<bool>(),
    ) {
        let s = scheduler();
        if warm {
            warm_all(&s, 50_000);
        }

        let mut admitted = HashSet::new();
        for (i, (category, size, arrival, at_head)) in ops.iter().enumerate() {
            let id = OperationId(i as u64);
            s.insert(OpRequest::new(id, *category, *size, *arrival), *at_head).unwrap();
            admitted.insert(id);
        }

        let mut seen = HashSet::new();
        while s.has_work() {
            let op = s.dispatch();
            prop_assert!(op.is_some(), "dispatch returned None with work queued");
            let op = op.unwrap();
            prop_assert!(admitted.contains(&op.id));
            prop_assert!(seen.insert(op.id), "{} dispatched twice", op.id);
        }
        prop_assert_eq!(seen.len(), admitted.len());
        prop_assert!(s.dispatch().is_none());
    }

    /// Completing everything that was dispatched returns the in-flight
    /// budget to zero.
    #[test]
    fn test_budget_returns_to_zero(
        ops in proptest::collection::vec(any_op(), 1..150),
        base in 1_000u64..500_000,
    ) {
        let s = scheduler();
        warm_all(&s, base);
        prop_assert_eq!(s.total_predicted_latency(), 0);

        for (i, (category, size, arrival, at_head)) in ops.iter().enumerate() {
            s.insert(OpRequest::new(OperationId(i as u64), *category, *size, *arrival), *at_head)
                .unwrap();
        }

        let mut now = 10 * MS;
        while let Some(op) = s.dispatch() {
            now += 1_000;
            s.complete(op.id, None, now);
        }
        prop_assert_eq!(s.total_predicted_latency(), 0);
        prop_assert_eq!(s.queued(), 0);
    }

    /// Starting from an idle device, the first fill admits operations until
    /// the window is crossed, so the budget overshoots by at most one
    /// operation's prediction.
    #[test]
    fn test_first_fill_bounded_by_window(
        sizes in proptest::collection::vec(0u64..(1 << 20), 1..100),
        window_ms in 1u64..32,
        base in 10_000u64..2_000_000,
    ) {
        let s = scheduler();
        warm_all(&s, base);
        s.set_global_latency_window(window_ms * MS);

        let mut max_predicted = 0;
        for (i, size) in sizes.iter().enumerate() {
            max_predicted = max_predicted.max(s.predict(OpCategory::Read, *size));
            s.insert(OpRequest::new(OperationId(i as u64), OpCategory::Read, *size, 0), false)
                .unwrap();
        }

        s.dispatch().unwrap();
        let in_flight = s.total_predicted_latency();
        prop_assert!(in_flight > 0);
        prop_assert!(in_flight <= window_ms * MS + max_predicted);
    }

    /// Operations with equal deadlines leave in admission order.
    #[test]
    fn test_equal_deadlines_fifo(
        count in 1usize..100,
        category in any_category(),
        warm in any::<bool>(),
    ) {
        let s = scheduler();
        if warm {
            warm_all(&s, 20_000);
        }
        for i in 0..count {
            s.insert(OpRequest::new(OperationId(i as u64), category, 4096, 0), false).unwrap();
        }
        let order: Vec<u64> = std::iter::from_fn(|| s.dispatch()).map(|op| op.id.0).collect();
        let expected: Vec<u64> = (0..count as u64).collect();
        prop_assert_eq!(order, expected);
    }

    /// Priority-lane operations all leave before anything else, most
    /// recent first.
    #[test]
    fn test_priority_lane_drains_first(ops in proptest::collection::vec(any_op(), 1..100)) {
        let s = scheduler();
        let mut lane = Vec::new();
        for (i, (category, size, arrival, at_head)) in ops.iter().enumerate() {
            let id = OperationId(i as u64);
            s.insert(OpRequest::new(id, *category, *size, *arrival), *at_head).unwrap();
            if *at_head {
                lane.push(id);
            }
        }
        lane.reverse();

        for expected in lane {
            let op = s.dispatch().unwrap();
            prop_assert_eq!(op.id, expected);
            prop_assert_eq!(op.source, DispatchSource::PriorityLane);
        }
        if let Some(op) = s.dispatch() {
            prop_assert!(matches!(op.source, DispatchSource::BatchPage(_)));
        }
    }

    /// Small operations with a stable latency teach a base within 2% of it.
    #[test]
    fn test_base_converges(
        latency in 10_000u64..10_000_000,
        samples in 50u64..400,
        category in any_category(),
    ) {
        let s = scheduler();
        let step = latency / 200;
        let mut now = 0;
        for i in 0..samples {
            let id = OperationId(i);
            s.insert(OpRequest::new(id, category, 4096, now), false).unwrap();
            let op = s.dispatch().unwrap();
            prop_assert_eq!(op.id, id);
            // Within +-0.5% of the true latency.
            let observed = latency - step + (i % 3) * step;
            s.complete(id, Some(now), now + observed);
            now += observed;
        }
        s.refresh(now + 2_000 * MS);

        let base = s.model_params(category).base;
        prop_assert!(
            base.abs_diff(latency) <= latency / 50,
            "base {} not within 2% of {}", base, latency
        );
    }
}

#[test]
fn test_reads_leave_before_write_when_cold() {
    let s = scheduler();
    for id in 0..3 {
        s.insert(OpRequest::new(OperationId(id), OpCategory::Read, 0, 0), false)
            .unwrap();
    }
    s.insert(OpRequest::new(OperationId(3), OpCategory::Write, 0, 0), false)
        .unwrap();

    for expected in [0, 1, 2, 3] {
        assert_eq!(s.dispatch().unwrap().id, OperationId(expected));
    }
    assert!(s.dispatch().is_none());
}

#[test]
fn test_write_limit_one_spreads_across_fills() {
    let s = scheduler();
    warm_all(&s, 100_000);
    s.reset_batch_stats();
    s.store_attr("batch_size_limit_write", "1").unwrap();

    for id in 0..3 {
        s.insert(OpRequest::new(OperationId(id), OpCategory::Write, 0, 0), false)
            .unwrap();
    }
    // Each fill admits a single write.
    for expected in 0..3 {
        let op = s.dispatch().unwrap();
        assert_eq!(op.id, OperationId(expected));
        assert_eq!(s.total_predicted_latency(), (expected + 1) * 100_000);
    }
    assert_eq!(s.batch_size_actual_highest().write, 1);
}

#[test]
fn test_predict_converges_after_sample_threshold() {
    let s = scheduler();
    let latency = 120_000;
    for i in 0..1_100u64 {
        let id = OperationId(i);
        s.insert(OpRequest::new(id, OpCategory::Write, 4096, 0), false)
            .unwrap();
        s.dispatch().unwrap();
        s.complete(id, Some(0), latency);
    }
    // Count trigger: no time has passed since the bootstrap.
    let updates = s.refresh(latency);
    assert!(updates.write.small_processed);
    assert!(!updates.write.time_elapsed);
    assert_eq!(s.predict(OpCategory::Write, 4096), latency);

    s.store_attr("reset_latency_model", "1").unwrap();
    assert_eq!(s.predict(OpCategory::Write, 0), 0);
    assert_eq!(s.predict(OpCategory::Write, 1 << 20), 0);
}
