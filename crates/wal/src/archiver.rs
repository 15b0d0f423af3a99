//! Background archiver and cleanup worker
//!
//! One pass walks IDLE -> ARCHIVING -> COMPRESSING -> CLEANING -> IDLE:
//! 1. roll the active segment over if it is full
//! 2. evict checkpoint history the retention policy no longer needs
//! 3. compress archived segments at or above the boundary (if enabled)
//! 4. delete segments below a freshly computed boundary, lowest first
//!
//! A failure aborts the rest of the pass; the next pass retries.

use crate::manager::WalManager;
use parking_lot::Mutex;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, info, warn};
use wk_core::{SegmentIndex, WalError};

/// Where the archiver is within a pass
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ArchiverState {
    #[default]
    Idle,
    Archiving,
    Compressing,
    Cleaning,
}

/// Running totals reported through diagnostics
#[derive(Debug, Clone, Default, Serialize)]
pub struct ArchiverStatus {
    pub state: ArchiverState,
    pub passes: u64,
    pub failures: u64,
    pub segments_deleted: u64,
    pub last_error: Option<String>,
}

/// Outcome of one pass
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct PassReport {
    /// Segment sealed by this pass
    pub archived: Option<SegmentIndex>,
    /// Checkpoint records evicted
    pub evicted: usize,
    pub compressed: Vec<SegmentIndex>,
    pub deleted: Vec<SegmentIndex>,
    /// Boundary the cleaning step started from
    pub boundary: Option<SegmentIndex>,
    /// First segment cleaning had to leave in place
    pub blocked_at: Option<SegmentIndex>,
    pub error: Option<String>,
}

impl PassReport {
    pub fn is_ok(&self) -> bool {
        self.error.is_none()
    }
}

/// Drives archiving, compression and cleanup for one [`WalManager`]
pub struct Archiver {
    manager: Arc<WalManager>,
    /// Serializes passes between the background loop and direct callers
    pass_lock: Mutex<()>,
}

impl Archiver {
    pub fn new(manager: Arc<WalManager>) -> Self {
        Self {
            manager,
            pass_lock: Mutex::new(()),
        }
    }

    pub fn manager(&self) -> &Arc<WalManager> {
        &self.manager
    }

    /// Run one full pass synchronously
    pub fn run_pass(&self) -> PassReport {
        let _pass = self.pass_lock.lock();
        let mut report = PassReport::default();

        if !self.manager.is_enabled() {
            return report;
        }

        if let Err(e) = self.archive_step(&mut report) {
            return self.finish(report, Some(e));
        }

        match self.manager.evict_history() {
            Ok(evicted) => report.evicted = evicted,
            Err(e) => return self.finish(report, Some(e)),
        }

        if self.manager.wal_config().compaction_enabled {
            if let Err(e) = self.compress_step(&mut report) {
                return self.finish(report, Some(e));
            }
        }

        let result = self.clean_step(&mut report);
        self.finish(report, result.err())
    }

    fn archive_step(&self, report: &mut PassReport) -> Result<(), WalError> {
        self.transition(ArchiverState::Archiving);

        if !self.manager.is_active_full() {
            return Ok(());
        }
        let Some(active) = self.manager.active_index() else {
            return Ok(());
        };

        let hooks = self.manager.hooks();
        hooks.before_archive(active)?;
        let sealed = self.manager.rollover()?;
        hooks.after_archive(sealed);

        report.archived = Some(sealed);
        Ok(())
    }

    fn compress_step(&self, report: &mut PassReport) -> Result<(), WalError> {
        self.transition(ArchiverState::Compressing);

        let hooks = self.manager.hooks();
        for index in self.manager.compression_candidates() {
            hooks.before_compress(index)?;
            match self.manager.compress_segment(index) {
                Ok(_) => report.compressed.push(index),
                // Deleted by a concurrent direct call; nothing left to compress
                Err(WalError::InvalidTransition { .. }) => continue,
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }

    fn clean_step(&self, report: &mut PassReport) -> Result<(), WalError> {
        self.transition(ArchiverState::Cleaning);

        let (boundary, candidates) = self.manager.deletion_candidates();
        report.boundary = Some(boundary);

        let hooks = self.manager.hooks();
        for index in candidates {
            hooks.before_delete(index)?;

            match self.manager.delete_segment(index) {
                Ok(()) => {
                    report.deleted.push(index);
                    hooks.after_delete(index);
                }
                Err(WalError::SegmentInUse { boundary, .. }) => {
                    // A reservation or checkpoint landed after candidates were listed
                    debug!("Segment {} became reserved (boundary: {})", index, boundary);
                    report.blocked_at = Some(index);
                    return Ok(());
                }
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }

    fn transition(&self, next: ArchiverState) {
        let previous = self.manager.set_archiver_state(next);
        if previous != next {
            self.manager.hooks().state_changed(previous, next);
        }
    }

    fn finish(&self, mut report: PassReport, error: Option<WalError>) -> PassReport {
        if let Some(e) = &error {
            warn!("Archiver pass aborted: {}", e);
            report.error = Some(e.to_string());
        }

        self.manager.update_archiver_status(|status| {
            status.passes += 1;
            status.segments_deleted += report.deleted.len() as u64;
            if let Some(e) = &report.error {
                status.failures += 1;
                status.last_error = Some(e.clone());
            }
        });
        self.transition(ArchiverState::Idle);

        if !report.deleted.is_empty() || report.archived.is_some() {
            debug!(
                "Archiver pass: archived {:?}, compressed {:?}, deleted {:?}",
                report.archived, report.compressed, report.deleted
            );
        }

        self.manager.hooks().pass_complete(&report);
        report
    }

    /// Start the background loop on the current tokio runtime
    ///
    /// Returns `None` when WAL is disabled: the archiver is never scheduled.
    pub fn spawn(self) -> Option<ArchiverHandle> {
        if !self.manager.is_enabled() {
            info!("WAL disabled, archiver not scheduled");
            return None;
        }

        let period = Duration::from_millis(self.manager.config().archiver.interval_ms);
        let (shutdown_tx, mut shutdown_rx) = watch::channel(false);
        let archiver = Arc::new(self);

        let join = tokio::spawn(async move {
            let mut timer = interval(period);
            timer.set_missed_tick_behavior(MissedTickBehavior::Delay);

            info!("Starting archiver (interval: {:?})", period);

            loop {
                tokio::select! {
                    _ = timer.tick() => {}
                    _ = archiver.manager.wake_handle().notified() => {}
                    _ = shutdown_rx.changed() => break,
                }

                let worker = Arc::clone(&archiver);
                if let Err(e) = tokio::task::spawn_blocking(move || worker.run_pass()).await {
                    warn!("Archiver pass panicked: {}", e);
                }
            }

            info!("Archiver stopped");
        });

        Some(ArchiverHandle { shutdown_tx, join })
    }
}

/// Handle to a running background archiver
pub struct ArchiverHandle {
    shutdown_tx: watch::Sender<bool>,
    join: JoinHandle<()>,
}

impl ArchiverHandle {
    /// Stop after the current pass and wait for the loop to exit
    pub async fn shutdown(self) {
        let _ = self.shutdown_tx.send(true);
        if let Err(e) = self.join.await {
            warn!("Archiver task failed: {}", e);
        }
    }

    pub fn is_finished(&self) -> bool {
        self.join.is_finished()
    }
}
