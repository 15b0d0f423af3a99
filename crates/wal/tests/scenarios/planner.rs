//! Historical vs full rebalance decisions

use crate::common::{test_config, TestNode, P};
use wal::{
    FullReason, HistoryPlanner, OwnerGuard, OwnerId, PartitionId, RebalancePlan, SegmentState,
    WalPointer,
};

/// Checkpoints at pointers 100, 250 and 400 with counters 10, 20 and 30
fn scenario_node(history_size: usize) -> TestNode {
    let mut config = test_config();
    config.wal.history_size = history_size;
    let node = TestNode::with_config(config);

    node.fill_segments(1);
    node.checkpoint(WalPointer::new(1, 100), 10);
    node.fill_segments(1);
    node.checkpoint(WalPointer::new(2, 250), 20);
    node.fill_segments(1);
    node.checkpoint(WalPointer::new(3, 400), 30);
    node
}

#[test]
fn test_historical_plan_reserves_before_returning() {
    let node = scenario_node(20);
    let planner = HistoryPlanner::new(node.manager.clone());
    let owner = OwnerId::generate();

    let plan = planner.plan_rebalance(P, 15, owner);

    let (token, range) = match plan {
        RebalancePlan::Historical { token, range } => (token, range),
        other => panic!("expected historical rebalance, got {:?}", other),
    };
    assert_eq!(range.from, WalPointer::new(1, 100));
    assert_eq!(range.to, node.manager.write_position().unwrap());
    assert_eq!(token.min_index(), 1);
    assert_eq!(token.owner(), owner);

    // Installed by the time the plan is visible
    assert_eq!(node.manager.lowest_reserved(), Some(1));
}

#[test]
fn test_reserved_segment_survives_archiver_while_token_live() {
    // Every further checkpoint pushes history past its depth of 3
    let node = scenario_node(3);
    let planner = HistoryPlanner::new(node.manager.clone());
    let owner = OwnerId::generate();

    let plan = planner.plan_rebalance(P, 15, owner);
    let token = *plan.token().unwrap();

    let archiver = node.archiver();
    for round in 0..5 {
        node.fill_segments(1);
        let ptr = node.manager.write_position().unwrap();
        node.checkpoint(ptr, 40 + round);

        let report = archiver.run_pass();
        assert!(!report.deleted.contains(&1));
        assert_eq!(node.manager.segment_state(1), Some(SegmentState::Archived));
    }
    assert_eq!(node.manager.segment_state(0), Some(SegmentState::Deleted));
    assert_eq!(node.manager.read_segment(1).unwrap().len(), 1024);

    node.manager.release(&token);
    archiver.run_pass();
    assert_eq!(node.manager.segment_state(1), Some(SegmentState::Deleted));
}

#[test]
fn test_counter_before_history_needs_full_rebalance() {
    let node = scenario_node(20);
    let planner = HistoryPlanner::new(node.manager.clone());
    let owner = OwnerId::generate();

    let plan = planner.plan_rebalance(P, 5, owner);

    assert_eq!(
        plan,
        RebalancePlan::Full {
            reason: FullReason::HistoryUnavailable
        }
    );
    assert!(plan.token().is_none());
    assert_eq!(node.manager.lowest_reserved(), None);

    // Unknown partition has no history at all
    let plan = planner.plan_rebalance(PartitionId(99), 50, owner);
    assert_eq!(plan.full_reason(), Some(FullReason::HistoryUnavailable));
}

#[test]
fn test_segment_threshold_forces_full() {
    let mut config = test_config();
    config.wal.rebalance_max_segments = 2;
    let node = TestNode::with_config(config);

    node.fill_segments(1);
    node.checkpoint(WalPointer::new(1, 0), 10);
    node.fill_segments(2);
    node.checkpoint(WalPointer::new(3, 0), 20);

    let planner = HistoryPlanner::new(node.manager.clone());
    let owner = OwnerId::generate();

    // From segment 1 to the active segment 3: three segments
    let plan = planner.plan_rebalance(P, 12, owner);
    assert_eq!(
        plan.full_reason(),
        Some(FullReason::TooManySegments { needed: 3, limit: 2 })
    );
    assert_eq!(node.manager.lowest_reserved(), None);

    // The newer checkpoint only needs the active segment
    let plan = planner.plan_rebalance(P, 25, owner);
    assert!(plan.is_historical());
}

#[test]
fn test_update_threshold_forces_full() {
    let mut config = test_config();
    config.wal.rebalance_max_missing_updates = 100;
    let node = TestNode::with_config(config);

    node.checkpoint(WalPointer::new(0, 0), 10);
    node.fill_segments(1);
    node.checkpoint(WalPointer::new(1, 0), 500);

    let planner = HistoryPlanner::new(node.manager.clone());
    let owner = OwnerId::generate();

    let plan = planner.plan_rebalance(P, 50, owner);
    assert_eq!(
        plan.full_reason(),
        Some(FullReason::TooManyUpdates {
            missing: 450,
            limit: 100
        })
    );

    let plan = planner.plan_rebalance(P, 450, owner);
    assert!(plan.is_historical());
}

#[test]
fn test_owner_guard_releases_on_drop() {
    let node = scenario_node(20);
    let planner = HistoryPlanner::new(node.manager.clone());

    {
        let guard = OwnerGuard::new(node.manager.clone());
        assert!(planner.plan_rebalance(P, 15, guard.owner()).is_historical());
        assert!(planner.plan_rebalance(P, 25, guard.owner()).is_historical());
        assert_eq!(node.manager.reservations().len(), 2);
    }

    assert!(node.manager.reservations().is_empty());

    // A guard that never reserved anything is fine too
    drop(OwnerGuard::new(node.manager.clone()));
}

#[test]
fn test_many_exchanges_plan_concurrently() {
    let node = scenario_node(20);
    let planner = HistoryPlanner::new(node.manager.clone());

    let handles: Vec<_> = (0..8)
        .map(|i| {
            let planner = planner.clone();
            std::thread::spawn(move || {
                let owner = OwnerId::generate();
                let plan = planner.plan_rebalance(P, 10 + i * 3, owner);
                (owner, plan)
            })
        })
        .collect();

    let results: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();
    assert!(results.iter().all(|(_, plan)| plan.is_historical()));
    assert_eq!(node.manager.reservations().len(), 8);

    for (owner, _) in &results {
        node.manager.release_all(*owner);
    }
    assert_eq!(node.manager.lowest_reserved(), None);
}
