//! Segment ledger: which WAL segments exist and where each one is in its lifecycle
//!
//! The ledger is plain state with no locking of its own. The WAL manager owns
//! it together with the reservation storage behind a single lock, which is what
//! makes the boundary check in [`SegmentLedger::mark_deleted`] linearizable with
//! reservation changes.

use crate::error::{Result, WalError};
use crate::types::{unix_time_ms, SegmentIndex, SegmentState};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Bookkeeping for one segment
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SegmentMeta {
    pub index: SegmentIndex,
    pub state: SegmentState,
    /// Raw (uncompressed) size in bytes
    pub size_bytes: u64,
    /// Size on disk after compression
    pub compressed_size: Option<u64>,
    pub created_at_ms: u64,
}

impl SegmentMeta {
    pub fn new(index: SegmentIndex, state: SegmentState, size_bytes: u64, created_at_ms: u64) -> Self {
        Self {
            index,
            state,
            size_bytes,
            compressed_size: None,
            created_at_ms,
        }
    }

    /// Bytes this segment currently occupies on disk
    pub fn stored_bytes(&self) -> u64 {
        self.compressed_size.unwrap_or(self.size_bytes)
    }
}

/// Outcome of rebuilding a ledger from segments found on disk
#[derive(Debug)]
pub struct RecoveredLedger {
    pub ledger: SegmentLedger,
    /// Segments stranded below a gap in the index sequence; they can never
    /// be replayed and should be removed by the caller
    pub orphans: Vec<SegmentMeta>,
}

/// Lifecycle tracker for every live segment
#[derive(Debug)]
pub struct SegmentLedger {
    /// Non-deleted segments, keyed by index
    segments: BTreeMap<SegmentIndex, SegmentMeta>,
    active: SegmentIndex,
    last_archived: Option<SegmentIndex>,
    last_compressed: Option<SegmentIndex>,
    last_deleted: Option<SegmentIndex>,
}

impl SegmentLedger {
    /// Start a fresh ledger whose first active segment is `first`
    pub fn new(first: SegmentIndex) -> Self {
        let mut segments = BTreeMap::new();
        segments.insert(
            first,
            SegmentMeta::new(first, SegmentState::Active, 0, unix_time_ms()),
        );

        Self {
            segments,
            active: first,
            last_archived: None,
            last_compressed: None,
            last_deleted: first.checked_sub(1),
        }
    }

    /// Rebuild a ledger from discovered segments
    ///
    /// The highest index becomes the active segment unless it is already
    /// sealed, in which case the next index is. Everything below the highest
    /// gap in the sequence is returned as orphaned.
    pub fn recover(mut found: Vec<SegmentMeta>) -> RecoveredLedger {
        found.sort_by_key(|meta| meta.index);

        let mut ledger = match found.pop() {
            Some(last) if last.state == SegmentState::Active => {
                let mut ledger = Self::new(last.index);
                if let Some(active) = ledger.segments.get_mut(&last.index) {
                    active.size_bytes = last.size_bytes;
                    active.created_at_ms = last.created_at_ms;
                }
                ledger
            }
            Some(sealed) => {
                // No work file survived; writing resumes in a fresh segment
                let next = sealed.index + 1;
                found.push(sealed);
                Self::new(next)
            }
            None => {
                return RecoveredLedger {
                    ledger: Self::new(0),
                    orphans: Vec::new(),
                }
            }
        };

        let mut orphans = Vec::new();
        let mut expected = ledger.active;
        while let Some(mut meta) = found.pop() {
            if expected == 0 || meta.index != expected - 1 {
                orphans.push(meta);
                orphans.extend(found.drain(..).rev());
                break;
            }
            expected = meta.index;

            if meta.state == SegmentState::Active {
                // Sealed by a rollover that crashed before the move
                meta.state = SegmentState::Archived;
            }
            if meta.state == SegmentState::Compressed {
                ledger.last_compressed = Some(ledger.last_compressed.map_or(meta.index, |c| c.max(meta.index)));
            }
            ledger.last_archived = Some(ledger.last_archived.map_or(meta.index, |a| a.max(meta.index)));
            ledger.segments.insert(meta.index, meta);
        }

        ledger.last_deleted = expected.checked_sub(1);

        RecoveredLedger { ledger, orphans }
    }

    /// Index of the current write target
    pub fn active_index(&self) -> SegmentIndex {
        self.active
    }

    /// Bytes written to the active segment so far
    pub fn active_size(&self) -> u64 {
        self.segments
            .get(&self.active)
            .map(|meta| meta.size_bytes)
            .unwrap_or(0)
    }

    /// Account for bytes appended to the active segment
    pub fn record_append(&mut self, bytes: u64) {
        if let Some(meta) = self.segments.get_mut(&self.active) {
            meta.size_bytes += bytes;
        }
    }

    /// Seal the active segment and allocate the next index as active
    ///
    /// Returns the sealed segment's index.
    pub fn rollover(&mut self) -> SegmentIndex {
        let sealed = self.active;
        if let Some(meta) = self.segments.get_mut(&sealed) {
            meta.state = SegmentState::Archived;
        }
        self.last_archived = Some(sealed);

        self.active = sealed + 1;
        self.segments.insert(
            self.active,
            SegmentMeta::new(self.active, SegmentState::Active, 0, unix_time_ms()),
        );

        sealed
    }

    /// Transition ARCHIVED -> COMPRESSED
    pub fn mark_compressed(&mut self, index: SegmentIndex, compressed_size: u64) -> Result<()> {
        let state = self.state(index).ok_or(WalError::UnknownSegment(index))?;
        if state != SegmentState::Archived {
            return Err(WalError::InvalidTransition {
                index,
                from: state,
                to: SegmentState::Compressed,
            });
        }

        if let Some(meta) = self.segments.get_mut(&index) {
            meta.state = SegmentState::Compressed;
            meta.compressed_size = Some(compressed_size);
        }
        self.last_compressed = Some(self.last_compressed.map_or(index, |c| c.max(index)));
        Ok(())
    }

    /// Validate that `index` may be deleted against `boundary` without mutating anything
    pub fn check_deletable(&self, index: SegmentIndex, boundary: SegmentIndex) -> Result<&SegmentMeta> {
        let Some(meta) = self.segments.get(&index) else {
            return match self.state(index) {
                Some(state) => Err(WalError::InvalidTransition {
                    index,
                    from: state,
                    to: SegmentState::Deleted,
                }),
                None => Err(WalError::UnknownSegment(index)),
            };
        };

        if index >= boundary {
            return Err(WalError::SegmentInUse { index, boundary });
        }

        if !meta.state.can_transition_to(SegmentState::Deleted) {
            return Err(WalError::InvalidTransition {
                index,
                from: meta.state,
                to: SegmentState::Deleted,
            });
        }

        let lowest = self.lowest_index();
        if index != lowest {
            return Err(WalError::OutOfOrderDeletion {
                index,
                expected: lowest,
            });
        }

        Ok(meta)
    }

    /// Transition to DELETED
    ///
    /// Fails with `SegmentInUse` if `index >= boundary`. This is the single
    /// enforcement point that keeps reserved WAL on disk.
    pub fn mark_deleted(&mut self, index: SegmentIndex, boundary: SegmentIndex) -> Result<SegmentMeta> {
        self.check_deletable(index, boundary)?;

        let mut meta = self
            .segments
            .remove(&index)
            .ok_or(WalError::UnknownSegment(index))?;
        meta.state = SegmentState::Deleted;
        self.last_deleted = Some(index);
        Ok(meta)
    }

    /// State of `index`, or `None` if it was never allocated
    pub fn state(&self, index: SegmentIndex) -> Option<SegmentState> {
        if let Some(meta) = self.segments.get(&index) {
            return Some(meta.state);
        }
        match self.last_deleted {
            Some(deleted) if index <= deleted => Some(SegmentState::Deleted),
            _ => None,
        }
    }

    pub fn get(&self, index: SegmentIndex) -> Option<&SegmentMeta> {
        self.segments.get(&index)
    }

    /// Live segments in index order
    pub fn segments(&self) -> impl Iterator<Item = &SegmentMeta> {
        self.segments.values()
    }

    /// Lowest segment still on disk
    pub fn lowest_index(&self) -> SegmentIndex {
        self.segments
            .keys()
            .next()
            .copied()
            .unwrap_or(self.active)
    }

    /// Bytes held by sealed segments
    pub fn archived_bytes(&self) -> u64 {
        self.archived_bytes_from(0)
    }

    /// Bytes held by sealed segments with index `>= from`
    pub fn archived_bytes_from(&self, from: SegmentIndex) -> u64 {
        self.segments
            .range(from..self.active)
            .map(|(_, meta)| meta.stored_bytes())
            .sum()
    }

    /// Sealed segments strictly below `boundary`, lowest first
    pub fn deletion_candidates(&self, boundary: SegmentIndex) -> Vec<SegmentIndex> {
        let end = boundary.min(self.active);
        self.segments.range(..end).map(|(&index, _)| index).collect()
    }

    /// Uncompressed archived segments with index `>= from`, lowest first
    pub fn compression_candidates(&self, from: SegmentIndex) -> Vec<SegmentIndex> {
        self.segments
            .range(from..self.active)
            .filter(|(_, meta)| meta.state == SegmentState::Archived)
            .map(|(&index, _)| index)
            .collect()
    }

    pub fn last_archived_index(&self) -> Option<SegmentIndex> {
        self.last_archived
    }

    pub fn last_compressed_index(&self) -> Option<SegmentIndex> {
        self.last_compressed
    }

    pub fn last_deleted_index(&self) -> Option<SegmentIndex> {
        self.last_deleted
    }
}
