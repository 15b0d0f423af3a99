//! Error taxonomy for the retention subsystem

use crate::types::{OwnerId, PartitionId, SegmentIndex, SegmentState, UpdateCounter, WalPointer};
use thiserror::Error;

/// Errors raised by the ledger, reservation storage, history and planner
#[derive(Debug, Error)]
pub enum WalError {
    /// Lifecycle transition attempted out of order (consistency bug)
    #[error("Invalid transition for segment {index}: {from} -> {to}")]
    InvalidTransition {
        index: SegmentIndex,
        from: SegmentState,
        to: SegmentState,
    },

    /// Deletion attempted at or above the safe-delete boundary
    #[error("Segment {index} is in use (safe-delete boundary: {boundary})")]
    SegmentInUse {
        index: SegmentIndex,
        boundary: SegmentIndex,
    },

    /// Deletion would leave a gap below an existing segment
    #[error("Segment {index} cannot be deleted before segment {expected}")]
    OutOfOrderDeletion {
        index: SegmentIndex,
        expected: SegmentIndex,
    },

    /// No retained checkpoint can supply the requested counter
    #[error("No WAL history for partition {partition} from counter {from_counter}")]
    HistoryUnavailable {
        partition: PartitionId,
        from_counter: UpdateCounter,
    },

    /// Release called with a token that is not live
    #[error("Reservation not found: segment {min_index} owned by {owner}")]
    ReservationNotFound {
        min_index: SegmentIndex,
        owner: OwnerId,
    },

    /// Reservation or checkpoint references WAL that is already deleted
    #[error("Segment {index} was already truncated (last deleted: {last_deleted})")]
    SegmentTruncated {
        index: SegmentIndex,
        last_deleted: SegmentIndex,
    },

    /// Checkpoint recorded behind the latest retained one
    #[error("Checkpoint at {ptr} is behind the latest checkpoint at {latest}")]
    CheckpointRegression { ptr: WalPointer, latest: WalPointer },

    #[error("Unknown segment: {0}")]
    UnknownSegment(SegmentIndex),

    #[error("WAL is disabled on this node")]
    WalDisabled,

    #[error("Invalid configuration: {0}")]
    Config(String),

    #[error("WAL directory unavailable: {0}")]
    Locked(#[source] anyhow::Error),

    #[error("Checkpoint journal error: {0}")]
    Journal(#[from] anyhow::Error),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl WalError {
    /// Whether the caller can simply retry later or fall back to a full rebalance
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            WalError::SegmentInUse { .. }
                | WalError::HistoryUnavailable { .. }
                | WalError::ReservationNotFound { .. }
                | WalError::SegmentTruncated { .. }
                | WalError::Io(_)
        )
    }
}

/// Result type for retention operations
pub type Result<T> = std::result::Result<T, WalError>;
