//! Reservation contract through the manager facade

use crate::common::{TestNode, P};
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use std::sync::{Arc, Barrier};
use std::thread;
use wal::{OwnerId, ReservationToken, SegmentState, WalError, WalPointer};

#[test]
fn test_lowest_reserved_tracks_live_reservations() {
    let node = TestNode::new();
    node.fill_segments(40);

    let mut rng = ChaCha8Rng::seed_from_u64(42);
    let owners: Vec<OwnerId> = (0..5).map(|_| OwnerId::generate()).collect();
    let mut live: Vec<ReservationToken> = Vec::new();

    for step in 0..1500 {
        match rng.gen_range(0..12) {
            0..=5 => {
                let owner = owners[rng.gen_range(0..owners.len())];
                live.push(node.manager.reserve(rng.gen_range(0..40), owner).unwrap());
            }
            6..=10 if !live.is_empty() => {
                let token = live.swap_remove(rng.gen_range(0..live.len()));
                node.manager.release(&token);
            }
            _ => {
                let owner = owners[rng.gen_range(0..owners.len())];
                let expected = live.iter().filter(|t| t.owner() == owner).count();
                live.retain(|t| t.owner() != owner);
                assert_eq!(node.manager.release_all(owner), expected, "step {}", step);
            }
        }

        let expected = live.iter().map(|t| t.min_index()).min();
        assert_eq!(node.manager.lowest_reserved(), expected, "step {}", step);

        let counted: usize = node.manager.reservations().iter().map(|r| r.count as usize).sum();
        assert_eq!(counted, live.len());
    }
}

#[test]
fn test_reserve_release_round_trip() {
    let node = TestNode::new();
    node.fill_segments(10);

    let holder = OwnerId::generate();
    let _held = node.manager.reserve(6, holder).unwrap();

    for min_index in [2, 6, 9] {
        let before = node.manager.lowest_reserved();
        let token = node.manager.reserve(min_index, OwnerId::generate()).unwrap();
        node.manager.release(&token);
        assert_eq!(node.manager.lowest_reserved(), before);
    }
}

#[test]
fn test_release_all_is_idempotent() {
    let node = TestNode::new();
    node.fill_segments(5);

    let owner = OwnerId::generate();
    let other = OwnerId::generate();
    let _ = node.manager.reserve(1, owner).unwrap();
    let _ = node.manager.reserve(1, owner).unwrap();
    let _ = node.manager.reserve(3, owner).unwrap();
    let _ = node.manager.reserve(2, other).unwrap();

    assert_eq!(node.manager.release_all(owner), 3);
    let after_first = node.manager.reservations();

    assert_eq!(node.manager.release_all(owner), 0);
    assert_eq!(node.manager.reservations(), after_first);

    // Never reserved anything
    assert_eq!(node.manager.release_all(OwnerId::generate()), 0);
    assert_eq!(node.manager.reservations(), after_first);
    assert_eq!(node.manager.lowest_reserved(), Some(2));
}

#[test]
fn test_no_reservation_after_deletion() {
    let node = TestNode::new();
    node.fill_segments(6);
    node.checkpoint(WalPointer::new(4, 0), 100);

    let report = node.archiver().run_pass();
    assert_eq!(report.deleted, vec![0, 1, 2, 3]);

    let owner = OwnerId::generate();
    for min_index in 0..=3 {
        let err = node.manager.reserve(min_index, owner).unwrap_err();
        assert!(
            matches!(err, WalError::SegmentTruncated { last_deleted: 3, .. }),
            "reserve({}) returned {:?}",
            min_index,
            err
        );
    }
    assert!(node.manager.reserve(4, owner).is_ok());

    // Checkpoints cannot point into deleted WAL either
    let err = node
        .manager
        .record_checkpoint(WalPointer::new(3, 10), crate::common::counters(1), wal::CheckpointReason::Forced)
        .unwrap_err();
    assert!(matches!(err, WalError::SegmentTruncated { .. }));
    assert_eq!(node.manager.history_for(P).len(), 1);
}

#[test]
fn test_concurrent_reservations_bound_the_boundary() {
    let node = TestNode::new();
    node.fill_segments(60);
    node.checkpoint(WalPointer::new(59, 0), 500);

    let owner1 = OwnerId::generate();
    let owner2 = OwnerId::generate();
    let barrier = Arc::new(Barrier::new(2));

    // 1. Two exchange threads reserve at the same time
    let handles: Vec<_> = [(50, owner1), (30, owner2)]
        .into_iter()
        .map(|(min_index, owner)| {
            let manager = node.manager.clone();
            let barrier = barrier.clone();
            thread::spawn(move || {
                barrier.wait();
                manager.reserve(min_index, owner).unwrap()
            })
        })
        .collect();
    let tokens: Vec<ReservationToken> = handles.into_iter().map(|h| h.join().unwrap()).collect();

    // 2. The archiver sees both
    assert!(node.manager.safe_delete_boundary().unwrap() <= 30);
    let report = node.archiver().run_pass();
    assert_eq!(report.deleted, (0..30).collect::<Vec<_>>());
    assert_eq!(node.manager.segment_state(30), Some(SegmentState::Archived));

    // 3. Releasing owner2's token moves the boundary up to owner1's reservation
    let owner2_token = tokens.iter().find(|t| t.owner() == owner2).unwrap();
    node.manager.release(owner2_token);
    assert!(node.manager.safe_delete_boundary().unwrap() <= 50);

    let report = node.archiver().run_pass();
    assert_eq!(report.deleted, (30..50).collect::<Vec<_>>());
    assert_eq!(node.manager.segment_state(50), Some(SegmentState::Archived));
}

#[test]
fn test_reservations_race_with_cleanup() {
    let node = TestNode::new();
    node.fill_segments(30);
    node.checkpoint(WalPointer::new(29, 0), 1);

    let archiver = Arc::new(node.archiver());
    let cleaner = {
        let archiver = archiver.clone();
        thread::spawn(move || {
            let mut deleted = Vec::new();
            for _ in 0..10 {
                deleted.extend(archiver.run_pass().deleted);
            }
            deleted
        })
    };

    // Every reservation that succeeds must keep its segments on disk
    let owner = OwnerId::generate();
    let mut granted = Vec::new();
    for min_index in (0..30).rev() {
        if let Ok(token) = node.manager.reserve(min_index, owner) {
            granted.push(token.min_index());
        }
    }

    let deleted = cleaner.join().unwrap();
    for index in &granted {
        assert!(!deleted.contains(index), "reserved segment {} was deleted", index);
        assert_ne!(node.manager.segment_state(*index), Some(SegmentState::Deleted));
    }

    // Deletion is strictly in order
    assert!(deleted.windows(2).all(|w| w[1] == w[0] + 1));
}
