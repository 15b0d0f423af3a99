//! Archiver passes, background loop and hooks

use crate::common::{test_config, wait_until, TestNode, P};
use parking_lot::Mutex;
use std::io;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::mpsc;
use std::sync::Arc;
use std::time::Duration;
use wal::{
    ArchiverHook, ArchiverState, HistoryPlanner, OwnerGuard, OwnerId, PassReport, SegmentIndex,
    SegmentState, WalError, WalPointer,
};

/// Fails `before_delete` for one segment a fixed number of times
struct FailingDelete {
    index: SegmentIndex,
    remaining: AtomicUsize,
}

impl ArchiverHook for FailingDelete {
    fn before_delete(&self, index: SegmentIndex) -> io::Result<()> {
        if index == self.index
            && self
                .remaining
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok()
        {
            return Err(io::Error::new(io::ErrorKind::Other, "disk unavailable"));
        }
        Ok(())
    }
}

/// Records state transitions and pass reports
#[derive(Default)]
struct Observer {
    states: Mutex<Vec<ArchiverState>>,
    passes: Mutex<Vec<PassReport>>,
}

impl ArchiverHook for Observer {
    fn on_state_change(&self, _from: ArchiverState, to: ArchiverState) {
        self.states.lock().push(to);
    }

    fn on_pass_complete(&self, report: &PassReport) {
        self.passes.lock().push(report.clone());
    }
}

#[test]
fn test_pass_walks_every_state() {
    let mut config = test_config();
    config.wal.compaction_enabled = true;
    let node = TestNode::with_config(config);
    let observer = Arc::new(Observer::default());
    node.manager.hooks().register(observer.clone());

    node.fill_segments(2);
    node.checkpoint(WalPointer::new(1, 0), 5);
    node.archiver().run_pass();

    assert_eq!(
        *observer.states.lock(),
        vec![
            ArchiverState::Archiving,
            ArchiverState::Compressing,
            ArchiverState::Cleaning,
            ArchiverState::Idle,
        ]
    );

    let passes = observer.passes.lock();
    assert_eq!(passes.len(), 1);
    assert_eq!(passes[0].compressed, vec![1]);
    assert_eq!(passes[0].deleted, vec![0]);
}

#[test]
fn test_deletion_failure_aborts_pass_and_retries() {
    let node = TestNode::new();
    node.manager.hooks().register(Arc::new(FailingDelete {
        index: 2,
        remaining: AtomicUsize::new(1),
    }));

    node.fill_segments(5);
    node.checkpoint(WalPointer::new(5, 0), 1);
    let archiver = node.archiver();

    // 1. Fails at segment 2 and leaves everything above it alone
    let report = archiver.run_pass();
    assert_eq!(report.deleted, vec![0, 1]);
    assert!(report.error.as_deref().unwrap().contains("disk unavailable"));
    assert_eq!(node.manager.segment_state(2), Some(SegmentState::Archived));
    assert_eq!(node.manager.segment_state(3), Some(SegmentState::Archived));

    let diagnostics = node.manager.diagnostics();
    assert_eq!(diagnostics.archiver.failures, 1);
    assert_eq!(diagnostics.archived_bytes, 3 * 1024);
    assert_eq!(diagnostics.archiver.state, ArchiverState::Idle);

    // 2. Next pass picks up where the failed one stopped
    let report = archiver.run_pass();
    assert!(report.is_ok());
    assert_eq!(report.deleted, vec![2, 3, 4]);
    assert_eq!(node.manager.diagnostics().archived_bytes, 0);
}

#[test]
fn test_persistent_failure_shows_in_diagnostics() {
    let node = TestNode::new();
    node.manager.hooks().register(Arc::new(FailingDelete {
        index: 0,
        remaining: AtomicUsize::new(usize::MAX),
    }));
    let archiver = node.archiver();

    let mut previous = 0;
    for round in 1..=4u64 {
        node.fill_segments(1);
        let ptr = node.manager.write_position().unwrap();
        node.checkpoint(ptr, round);
        archiver.run_pass();

        let diagnostics = node.manager.diagnostics();
        assert!(diagnostics.archived_bytes > previous);
        assert_eq!(diagnostics.archiver.failures, round);
        assert_eq!(diagnostics.last_deleted, None);
        previous = diagnostics.archived_bytes;
    }
}

/// Blocks inside `before_delete` of one segment until released
struct GateOnDelete {
    index: SegmentIndex,
    reached: Mutex<Option<mpsc::Sender<()>>>,
    proceed: Mutex<Option<mpsc::Receiver<()>>>,
}

impl ArchiverHook for GateOnDelete {
    fn before_delete(&self, index: SegmentIndex) -> io::Result<()> {
        if index != self.index {
            return Ok(());
        }
        if let Some(reached) = self.reached.lock().take() {
            let _ = reached.send(());
            if let Some(proceed) = self.proceed.lock().take() {
                let _ = proceed.recv();
            }
        }
        Ok(())
    }
}

#[test]
fn test_reservation_between_decision_and_delete_wins() {
    let node = TestNode::new();
    node.fill_segments(4);
    node.checkpoint(WalPointer::new(4, 0), 1);

    let (reached_tx, reached_rx) = mpsc::channel();
    let (proceed_tx, proceed_rx) = mpsc::channel();
    node.manager.hooks().register(Arc::new(GateOnDelete {
        index: 1,
        reached: Mutex::new(Some(reached_tx)),
        proceed: Mutex::new(Some(proceed_rx)),
    }));

    // 1. The archiver has already listed segment 1 as deletable
    let archiver = Arc::new(node.archiver());
    let pass = {
        let archiver = archiver.clone();
        std::thread::spawn(move || archiver.run_pass())
    };
    reached_rx.recv().unwrap();

    // 2. An exchange reserves it before the file is removed
    let owner = OwnerId::generate();
    let _token = node.manager.reserve(1, owner).unwrap();
    proceed_tx.send(()).unwrap();

    // 3. The re-check under the lock keeps the segment
    let report = pass.join().unwrap();
    assert_eq!(report.deleted, vec![0]);
    assert_eq!(report.blocked_at, Some(1));
    assert!(report.is_ok());
    assert_eq!(node.manager.segment_state(1), Some(SegmentState::Archived));
    assert!(node.manager.read_segment(1).is_ok());
}

#[test]
fn test_reads_never_miss_segments_being_compressed() {
    let mut config = test_config();
    config.wal.compaction_enabled = true;
    let node = TestNode::with_config(config);
    node.fill_segments(200);

    let stop = Arc::new(AtomicBool::new(false));
    let reader = {
        let manager = node.manager.clone();
        let stop = stop.clone();
        std::thread::spawn(move || {
            let mut reads = 0usize;
            loop {
                for index in 0..200 {
                    let data = manager
                        .read_segment(index)
                        .unwrap_or_else(|e| panic!("read of segment {} failed: {}", index, e));
                    assert_eq!(data.len(), 1024);
                    reads += 1;
                }
                if stop.load(Ordering::SeqCst) {
                    return reads;
                }
            }
        })
    };

    for index in 0..200 {
        node.manager.compress_segment(index).unwrap();
    }
    stop.store(true, Ordering::SeqCst);

    assert!(reader.join().unwrap() > 0);
    assert_eq!(node.manager.segment_state(199), Some(SegmentState::Compressed));
}

#[test]
fn test_direct_delete_above_boundary_fails() {
    let node = TestNode::new();
    node.fill_segments(3);
    node.checkpoint(WalPointer::new(1, 0), 1);

    assert!(matches!(
        node.manager.delete_segment(1),
        Err(WalError::SegmentInUse { index: 1, boundary: 1 })
    ));
    assert!(matches!(
        node.manager.delete_segment(3),
        Err(WalError::SegmentInUse { .. })
    ));
    node.manager.delete_segment(0).unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_departed_owner_unblocks_background_archiver() {
    let mut config = test_config();
    // Only wake-ups should drive passes after the first tick
    config.archiver.interval_ms = 3_600_000;
    config.wal.history_size = 1;
    let node = TestNode::with_config(config);

    node.fill_segments(1);
    node.checkpoint(WalPointer::new(1, 0), 10);

    // 1. An exchange context reserves history, then its node leaves
    let planner = HistoryPlanner::new(node.manager.clone());
    let guard = OwnerGuard::new(node.manager.clone());
    let plan = planner.plan_rebalance(P, 15, guard.owner());
    assert_eq!(plan.token().unwrap().min_index(), 1);

    // The reservation keeps the old checkpoint despite history_size = 1
    node.fill_segments(5);
    node.checkpoint(WalPointer::new(6, 0), 60);
    assert_eq!(node.manager.checkpoint_count(), 2);

    let handle = node.archiver().spawn().unwrap();

    // 2. The archiver deletes below the reservation and stops there
    let manager = node.manager.clone();
    assert!(
        wait_until(Duration::from_secs(5), || {
            manager.segment_state(0) == Some(SegmentState::Deleted)
        })
        .await
    );
    assert_eq!(manager.segment_state(1), Some(SegmentState::Archived));

    // 3. Departure cleanup releases everything the owner held
    drop(guard);
    assert!(manager.reservations().is_empty());

    assert!(
        wait_until(Duration::from_secs(5), || {
            manager.segment_state(5) == Some(SegmentState::Deleted)
        })
        .await,
        "archiver did not proceed after release_all"
    );
    assert_eq!(manager.segment_state(6), Some(SegmentState::Active));
    assert_eq!(manager.checkpoint_count(), 1);

    handle.shutdown().await;
    assert!(manager.archiver_status().passes >= 2);
}

#[tokio::test]
async fn test_shutdown_stops_loop() {
    let node = TestNode::new();
    let handle = node.archiver().spawn().unwrap();

    assert!(!handle.is_finished());
    handle.shutdown().await;

    let passes = node.manager.archiver_status().passes;
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(node.manager.archiver_status().passes, passes);
}
