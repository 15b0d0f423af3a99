//! WAL manager: the single owner of ledger, reservations and checkpoint history
//!
//! Everything that decides whether a segment may be deleted lives in one
//! [`LedgerState`] behind one mutex. Reservation changes, checkpoint records
//! and the boundary re-check that gates each deletion are therefore
//! linearizable with each other.

use crate::archiver::{ArchiverState, ArchiverStatus};
use crate::diagnostics::{CheckpointSummary, DiagnosticsSnapshot};
use crate::hooks::HookRegistry;
use journal::{CheckpointHistory, CheckpointReason, CheckpointRecord, RetentionPolicy};
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::path::Path;
use tokio::sync::Notify;
use tracing::{debug, info, warn};
use wk_core::{
    ActiveSegment, OwnerId, PartitionId, ReservationInfo, ReservationStorage, ReservationToken,
    Result, SegmentIndex, SegmentLedger, SegmentState, SegmentStore, StorageConfig, UpdateCounter,
    WalConfig, WalDirLock, WalError, WalMode, WalPointer,
};

/// All mutable retention state
pub(crate) struct LedgerState {
    pub(crate) ledger: SegmentLedger,
    pub(crate) reservations: ReservationStorage,
    pub(crate) history: CheckpointHistory,
    pub(crate) writer: ActiveSegment,
}

impl LedgerState {
    /// Segments strictly below this index may be deleted
    ///
    /// min(lowest reservation, oldest retained checkpoint, active segment).
    /// Without any checkpoint nothing is deletable.
    pub(crate) fn boundary(&self) -> SegmentIndex {
        let Some(oldest_checkpoint) = self.history.oldest_segment() else {
            return self.ledger.lowest_index();
        };

        let boundary = self.ledger.active_index().min(oldest_checkpoint);
        match self.reservations.lowest_reserved() {
            Some(lowest) => boundary.min(lowest),
            None => boundary,
        }
    }

    /// Current write position
    pub(crate) fn write_position(&self) -> WalPointer {
        WalPointer::new(self.ledger.active_index(), self.writer.len())
    }
}

struct EnabledWal {
    store: SegmentStore,
    state: Mutex<LedgerState>,
    _lock: WalDirLock,
}

/// Facade over the retention subsystem of one node
///
/// With `WalMode::None` the manager is inert: nothing is created on disk,
/// reservations are not stored and nothing is ever deleted.
pub struct WalManager {
    config: StorageConfig,
    wal: Option<EnabledWal>,
    hooks: HookRegistry,
    wake: Notify,
    status: Mutex<ArchiverStatus>,
}

impl WalManager {
    /// Open (or create) the WAL under `root`
    pub fn open(root: &Path, config: StorageConfig) -> Result<Self> {
        config.validate()?;

        if !config.wal.mode.is_enabled() {
            info!("WAL disabled, retention subsystem is inert");
            return Ok(Self::with_wal(config, None));
        }

        let lock = WalDirLock::acquire(root).map_err(WalError::Locked)?;
        let store = SegmentStore::init(root)?;

        let recovered = SegmentLedger::recover(store.scan()?);
        for orphan in &recovered.orphans {
            warn!("Removing segment {} stranded below a gap in the WAL", orphan.index);
            store.remove(orphan.index, orphan.state)?;
        }
        let ledger = recovered.ledger;

        let active = ledger.active_index();
        let writer = if store.work_path(active).exists() {
            store.open_active(active, config.wal.mode)?
        } else {
            store.create_active(active, config.wal.mode)?
        };

        let mut history = CheckpointHistory::open(store.history_dir())?;
        history.discard_before(ledger.lowest_index())?;

        let reservations =
            ReservationStorage::with_floor(ledger.last_deleted_index().map_or(0, |d| d + 1));

        info!(
            "Opened WAL at {} (mode: {}, segments {}..={}, {} checkpoints)",
            root.display(),
            config.wal.mode,
            ledger.lowest_index(),
            active,
            history.len()
        );

        let state = LedgerState {
            ledger,
            reservations,
            history,
            writer,
        };

        Ok(Self::with_wal(
            config,
            Some(EnabledWal {
                store,
                state: Mutex::new(state),
                _lock: lock,
            }),
        ))
    }

    fn with_wal(config: StorageConfig, wal: Option<EnabledWal>) -> Self {
        Self {
            config,
            wal,
            hooks: HookRegistry::new(),
            wake: Notify::new(),
            status: Mutex::new(ArchiverStatus::default()),
        }
    }

    pub fn config(&self) -> &StorageConfig {
        &self.config
    }

    pub fn wal_config(&self) -> &WalConfig {
        &self.config.wal
    }

    pub fn mode(&self) -> WalMode {
        self.config.wal.mode
    }

    pub fn is_enabled(&self) -> bool {
        self.wal.is_some()
    }

    /// Archiver extension points
    pub fn hooks(&self) -> &HookRegistry {
        &self.hooks
    }

    fn enabled(&self) -> Result<&EnabledWal> {
        self.wal.as_ref().ok_or(WalError::WalDisabled)
    }

    /// Run `f` under the state lock; `None` when WAL is disabled
    pub(crate) fn with_state<R>(&self, f: impl FnOnce(&mut LedgerState) -> R) -> Option<R> {
        self.wal.as_ref().map(|wal| f(&mut wal.state.lock()))
    }

    pub(crate) fn wake_handle(&self) -> &Notify {
        &self.wake
    }

    /// Ask the background archiver to run a pass soon
    pub fn wake_archiver(&self) {
        self.wake.notify_one();
    }

    // ---------------------------------------------------------------------
    // Segments
    // ---------------------------------------------------------------------

    /// Append an opaque record to the active segment
    ///
    /// Returns the pointer where the record starts. Rollover is left to the
    /// archiver (or an explicit [`WalManager::rollover`]).
    pub fn append(&self, payload: &[u8]) -> Result<WalPointer> {
        let wal = self.enabled()?;
        let mut state = wal.state.lock();

        let ptr = state.write_position();
        state.writer.append(payload)?;
        state.ledger.record_append(payload.len() as u64);
        Ok(ptr)
    }

    /// Current write position, `None` when WAL is disabled
    pub fn write_position(&self) -> Option<WalPointer> {
        self.with_state(|state| state.write_position())
    }

    pub fn active_index(&self) -> Option<SegmentIndex> {
        self.with_state(|state| state.ledger.active_index())
    }

    /// Whether the active segment reached `segment_size`
    pub fn is_active_full(&self) -> bool {
        let limit = self.config.wal.segment_size;
        self.with_state(|state| state.ledger.active_size() >= limit)
            .unwrap_or(false)
    }

    /// Seal the active segment, move it to the archive and start the next one
    ///
    /// Returns the sealed index.
    pub fn rollover(&self) -> Result<SegmentIndex> {
        let wal = self.enabled()?;
        let mut state = wal.state.lock();

        let sealed = state.ledger.active_index();
        state.writer.sync()?;

        // Next work file first: a crash in between leaves two work files,
        // which recovery resolves by archiving the lower one
        let next = wal.store.create_active(sealed + 1, self.config.wal.mode)?;
        if let Err(e) = wal.store.archive(sealed) {
            let _ = wal.store.remove(sealed + 1, SegmentState::Active);
            return Err(e);
        }

        state.writer = next;
        state.ledger.rollover();

        debug!("Rolled over segment {}", sealed);
        Ok(sealed)
    }

    /// Compress one archived segment in place
    pub fn compress_segment(&self, index: SegmentIndex) -> Result<u64> {
        let wal = self.enabled()?;

        let state = wal.state.lock().ledger.state(index);
        match state {
            Some(SegmentState::Archived) => {}
            Some(from) => {
                return Err(WalError::InvalidTransition {
                    index,
                    from,
                    to: SegmentState::Compressed,
                })
            }
            None => return Err(WalError::UnknownSegment(index)),
        }

        // Encoding runs unlocked; the raw file stays readable meanwhile
        let compressed_size = wal.store.compress(index, self.config.wal.compaction_level)?;

        let mut state = wal.state.lock();
        if let Err(e) = state.ledger.mark_compressed(index, compressed_size) {
            // Deleted meanwhile; drop the orphaned copy unless another call won
            if state.ledger.state(index) != Some(SegmentState::Compressed) {
                let _ = wal.store.remove(index, SegmentState::Compressed);
            }
            return Err(e);
        }
        // Left behind on failure; the next scan drops raw twins
        if let Err(e) = wal.store.remove(index, SegmentState::Archived) {
            warn!("Keeping raw copy of compressed segment {}: {}", index, e);
        }
        Ok(compressed_size)
    }

    /// Delete the lowest segment if it is below the safe-delete boundary
    ///
    /// The boundary is recomputed under the state lock and the lock is held
    /// until the file is gone.
    pub fn delete_segment(&self, index: SegmentIndex) -> Result<()> {
        let wal = self.enabled()?;
        let mut state = wal.state.lock();

        let boundary = state.boundary();
        let segment_state = state.ledger.check_deletable(index, boundary)?.state;

        wal.store.remove(index, segment_state)?;
        state.ledger.mark_deleted(index, boundary)?;
        state.reservations.truncate_below(index + 1);

        debug!("Deleted segment {} (boundary: {})", index, boundary);
        Ok(())
    }

    /// Segments strictly below this index may be deleted; `None` when WAL is disabled
    pub fn safe_delete_boundary(&self) -> Option<SegmentIndex> {
        self.with_state(|state| state.boundary())
    }

    /// Current boundary and the segments below it, lowest first
    pub(crate) fn deletion_candidates(&self) -> (SegmentIndex, Vec<SegmentIndex>) {
        self.with_state(|state| {
            let boundary = state.boundary();
            (boundary, state.ledger.deletion_candidates(boundary))
        })
        .unwrap_or_default()
    }

    /// Archived segments at or above the boundary that are not compressed yet
    pub(crate) fn compression_candidates(&self) -> Vec<SegmentIndex> {
        self.with_state(|state| state.ledger.compression_candidates(state.boundary()))
            .unwrap_or_default()
    }

    pub fn segment_state(&self, index: SegmentIndex) -> Option<SegmentState> {
        self.with_state(|state| state.ledger.state(index)).flatten()
    }

    /// Raw contents of a segment, decompressed if needed
    pub fn read_segment(&self, index: SegmentIndex) -> Result<Vec<u8>> {
        let wal = self.enabled()?;

        // A compression can drop the raw file between lookup and read; the
        // ledger already says COMPRESSED by then, so one retry suffices
        for _ in 0..2 {
            let state = wal
                .state
                .lock()
                .ledger
                .state(index)
                .ok_or(WalError::UnknownSegment(index))?;

            match wal.store.read_segment(index, state) {
                Err(WalError::Io(e)) if e.kind() == std::io::ErrorKind::NotFound => continue,
                other => return other,
            }
        }

        Err(WalError::UnknownSegment(index))
    }

    // ---------------------------------------------------------------------
    // Reservations
    // ---------------------------------------------------------------------

    /// Pin every segment `>= min_index` for `owner`
    ///
    /// With WAL disabled the returned token is not stored anywhere.
    pub fn reserve(&self, min_index: SegmentIndex, owner: OwnerId) -> Result<ReservationToken> {
        match self.with_state(|state| state.reservations.reserve(min_index, owner)) {
            Some(result) => result,
            None => Ok(ReservationToken::new(min_index, owner)),
        }
    }

    /// Release one reserve; unknown tokens are logged and ignored
    pub fn release(&self, token: &ReservationToken) {
        let Some(result) = self.with_state(|state| state.reservations.release(token)) else {
            return;
        };

        match result {
            Ok(_) => self.wake_archiver(),
            Err(e) => warn!("Ignoring release of {}: {}", token, e),
        }
    }

    /// Release everything `owner` holds
    ///
    /// Safe to call for an owner that never reserved anything.
    pub fn release_all(&self, owner: OwnerId) -> usize {
        let released = self
            .with_state(|state| state.reservations.release_all(owner))
            .unwrap_or(0);

        if released > 0 {
            debug!("Released {} reservations of {}", released, owner);
            self.wake_archiver();
        }
        released
    }

    pub fn lowest_reserved(&self) -> Option<SegmentIndex> {
        self.with_state(|state| state.reservations.lowest_reserved())
            .flatten()
    }

    /// Read-only view of live reservations
    pub fn reservations(&self) -> Vec<ReservationInfo> {
        self.with_state(|state| state.reservations.snapshot())
            .unwrap_or_default()
    }

    // ---------------------------------------------------------------------
    // Checkpoint history
    // ---------------------------------------------------------------------

    /// Record a completed checkpoint
    ///
    /// `ptr` must point into a live segment and not behind the latest
    /// checkpoint. Returns `None` when WAL is disabled.
    pub fn record_checkpoint(
        &self,
        ptr: WalPointer,
        counters: BTreeMap<PartitionId, UpdateCounter>,
        reason: CheckpointReason,
    ) -> Result<Option<CheckpointRecord>> {
        let policy = RetentionPolicy::from_config(&self.config.wal);

        let result = self.with_state(|state| {
            if let Some(last_deleted) = state.ledger.last_deleted_index() {
                if ptr.segment <= last_deleted {
                    return Err(WalError::SegmentTruncated {
                        index: ptr.segment,
                        last_deleted,
                    });
                }
            }
            if ptr.segment > state.ledger.active_index() {
                return Err(WalError::UnknownSegment(ptr.segment));
            }

            let record = state.history.record(ptr, counters, reason)?;
            Self::settle_eviction(Self::evict_locked(state, &policy));
            Ok(record)
        });

        match result {
            Some(Ok(record)) => {
                debug!("Recorded checkpoint {} at {}", record.seq, record.wal_ptr);
                self.wake_archiver();
                Ok(Some(record))
            }
            Some(Err(e)) => Err(e),
            None => Ok(None),
        }
    }

    /// Apply the retention policy to checkpoint history
    pub fn evict_history(&self) -> Result<usize> {
        let policy = RetentionPolicy::from_config(&self.config.wal);
        self.with_state(|state| Self::evict_locked(state, &policy))
            .unwrap_or(Ok(0))
    }

    /// Eviction after a recorded checkpoint is best effort
    ///
    /// The record is already durable, so a failure here must not be reported
    /// as a failed checkpoint. The next archiver pass evicts again.
    fn settle_eviction(result: Result<usize>) -> usize {
        result.unwrap_or_else(|e| {
            warn!("Deferring checkpoint history eviction: {}", e);
            0
        })
    }

    fn evict_locked(state: &mut LedgerState, policy: &RetentionPolicy) -> Result<usize> {
        let LedgerState {
            ledger,
            reservations,
            history,
            ..
        } = state;
        history.evict(policy, reservations, |from| ledger.archived_bytes_from(from))
    }

    /// Where replay for `partition` would start given `from_counter`
    pub fn reserved_wal_range_for(
        &self,
        partition: PartitionId,
        from_counter: UpdateCounter,
    ) -> Option<WalPointer> {
        self.with_state(|state| state.history.reserved_wal_range_for(partition, from_counter))
            .flatten()
    }

    /// `(counter, pointer)` history for `partition`, most recent first
    pub fn history_for(&self, partition: PartitionId) -> Vec<(UpdateCounter, WalPointer)> {
        self.with_state(|state| state.history.history_for(partition))
            .unwrap_or_default()
    }

    pub fn checkpoint_count(&self) -> usize {
        self.with_state(|state| state.history.len()).unwrap_or(0)
    }

    // ---------------------------------------------------------------------
    // Archiver status and diagnostics
    // ---------------------------------------------------------------------

    pub fn archiver_status(&self) -> ArchiverStatus {
        self.status.lock().clone()
    }

    /// Swap the archiver state, returning the previous one
    pub(crate) fn set_archiver_state(&self, next: ArchiverState) -> ArchiverState {
        std::mem::replace(&mut self.status.lock().state, next)
    }

    pub(crate) fn update_archiver_status(&self, f: impl FnOnce(&mut ArchiverStatus)) {
        f(&mut self.status.lock());
    }

    /// Read-only snapshot for operational tooling and tests
    pub fn diagnostics(&self) -> DiagnosticsSnapshot {
        let archiver = self.archiver_status();

        let snapshot = self.with_state(|state| DiagnosticsSnapshot {
            mode: self.mode(),
            enabled: true,
            active_index: Some(state.ledger.active_index()),
            write_position: Some(state.write_position()),
            boundary: Some(state.boundary()),
            lowest_reserved: state.reservations.lowest_reserved(),
            last_archived: state.ledger.last_archived_index(),
            last_compressed: state.ledger.last_compressed_index(),
            last_deleted: state.ledger.last_deleted_index(),
            archived_bytes: state.ledger.archived_bytes(),
            segments: state.ledger.segments().cloned().collect(),
            reservations: state.reservations.snapshot(),
            checkpoints: CheckpointSummary {
                count: state.history.len(),
                oldest: state.history.oldest().map(|r| r.wal_ptr),
                latest: state.history.latest().map(|r| r.wal_ptr),
                latest_seq: state.history.latest().map(|r| r.seq),
            },
            archiver: archiver.clone(),
        });

        snapshot.unwrap_or_else(|| DiagnosticsSnapshot::disabled(self.mode(), archiver))
    }
}
