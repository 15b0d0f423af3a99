//! WAL segment retention for historical rebalance
//!
//! This crate provides:
//! - `WalManager`: segment lifecycle, reservations and checkpoint history behind one lock
//! - `HistoryPlanner`: historical vs full rebalance decisions
//! - `Archiver`: background archiving, compression and cleanup
//! - Archiver hooks and a read-only diagnostics snapshot

pub mod archiver;
pub mod diagnostics;
pub mod hooks;
pub mod manager;
pub mod planner;

// Re-exports
pub use archiver::{Archiver, ArchiverHandle, ArchiverState, ArchiverStatus, PassReport};
pub use diagnostics::{CheckpointSummary, DiagnosticsSnapshot};
pub use hooks::{ArchiverHook, HookRegistry};
pub use manager::WalManager;
pub use planner::{FullReason, HistoryPlanner, OwnerGuard, RebalancePlan};

pub use journal::{CheckpointReason, CheckpointRecord};
pub use wk_core::{
    OwnerId, PartitionId, ReservationInfo, ReservationToken, SegmentIndex, SegmentState,
    StorageConfig, UpdateCounter, WalError, WalMode, WalPointer, WalRange,
};
