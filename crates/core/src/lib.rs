//! Core types for WAL segment retention
//!
//! This crate provides:
//! - Segment identifiers, pointers and lifecycle states
//! - The segment ledger tracking every live segment
//! - Reservation storage pinning WAL for history consumers
//! - On-disk segment layout (work, archive, compression)
//! - Storage configuration and the WAL directory lock

pub mod config;
pub mod error;
pub mod locks;
pub mod reservation;
pub mod segment;
pub mod store;
pub mod types;

// Re-exports
pub use config::{ArchiverConfig, StorageConfig, WalConfig, WalMode};
pub use error::{Result, WalError};
pub use locks::{LockHolder, WalDirLock};
pub use reservation::{ReservationInfo, ReservationStorage, ReservationToken};
pub use segment::{RecoveredLedger, SegmentLedger, SegmentMeta};
pub use store::{atomic_write, ActiveSegment, SegmentStore};
pub use types::{
    unix_time_ms, OwnerId, PartitionId, SegmentIndex, SegmentState, UpdateCounter, WalPointer,
    WalRange,
};
