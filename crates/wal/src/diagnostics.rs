//! Read-only diagnostics snapshot

use crate::archiver::ArchiverStatus;
use serde::Serialize;
use wk_core::{ReservationInfo, SegmentIndex, SegmentMeta, WalMode, WalPointer};

/// Checkpoint history at a glance
#[derive(Debug, Clone, Default, Serialize)]
pub struct CheckpointSummary {
    pub count: usize,
    pub oldest: Option<WalPointer>,
    pub latest: Option<WalPointer>,
    pub latest_seq: Option<u64>,
}

/// Point-in-time view of the retention subsystem
///
/// Taken under the manager lock, so all fields are mutually consistent.
#[derive(Debug, Clone, Serialize)]
pub struct DiagnosticsSnapshot {
    pub mode: WalMode,
    pub enabled: bool,
    pub active_index: Option<SegmentIndex>,
    pub write_position: Option<WalPointer>,
    /// Segments strictly below this index may be deleted
    pub boundary: Option<SegmentIndex>,
    pub lowest_reserved: Option<SegmentIndex>,
    pub last_archived: Option<SegmentIndex>,
    pub last_compressed: Option<SegmentIndex>,
    pub last_deleted: Option<SegmentIndex>,
    /// Bytes held by sealed segments; keeps growing while deletion fails
    pub archived_bytes: u64,
    pub segments: Vec<SegmentMeta>,
    pub reservations: Vec<ReservationInfo>,
    pub checkpoints: CheckpointSummary,
    pub archiver: ArchiverStatus,
}

impl DiagnosticsSnapshot {
    pub(crate) fn disabled(mode: WalMode, archiver: ArchiverStatus) -> Self {
        Self {
            mode,
            enabled: false,
            active_index: None,
            write_position: None,
            boundary: None,
            lowest_reserved: None,
            last_archived: None,
            last_compressed: None,
            last_deleted: None,
            archived_bytes: 0,
            segments: Vec::new(),
            reservations: Vec::new(),
            checkpoints: CheckpointSummary::default(),
            archiver,
        }
    }

    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string_pretty(self)
    }
}
