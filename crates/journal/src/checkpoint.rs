//! Checkpoint records kept for historical rebalance

use crate::Result;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use ulid::Ulid;
use wk_core::{unix_time_ms, PartitionId, UpdateCounter, WalPointer};

/// A completed checkpoint: where the WAL stood and how far each partition had progressed
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckpointRecord {
    /// Unique ID (ULID for timestamp + uniqueness)
    pub id: Ulid,
    /// Position in the history journal
    pub seq: u64,
    /// WAL position at which the checkpoint was taken
    pub wal_ptr: WalPointer,
    /// Update counter per partition at the checkpoint
    pub counters: BTreeMap<PartitionId, UpdateCounter>,
    /// Timestamp (Unix milliseconds)
    pub ts_unix_ms: u64,
    /// Reason for checkpoint
    pub reason: CheckpointReason,
}

/// Why a checkpoint was taken
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CheckpointReason {
    /// Periodic checkpoint timer
    Scheduled,
    /// Too many dirty pages in memory
    DirtyPagesThreshold,
    /// Explicitly requested
    Forced,
    /// Final checkpoint on node shutdown
    NodeStopping,
}

impl CheckpointRecord {
    /// Create a new record; `seq` is assigned when it is added to the history
    pub fn new(
        wal_ptr: WalPointer,
        counters: BTreeMap<PartitionId, UpdateCounter>,
        reason: CheckpointReason,
    ) -> Self {
        Self {
            id: Ulid::new(),
            seq: 0,
            wal_ptr,
            counters,
            ts_unix_ms: unix_time_ms(),
            reason,
        }
    }

    /// Update counter recorded for `partition`
    pub fn counter_for(&self, partition: PartitionId) -> Option<UpdateCounter> {
        self.counters.get(&partition).copied()
    }

    /// Serialize checkpoint to bytes
    pub fn serialize(&self) -> Result<Vec<u8>> {
        Ok(bincode::serialize(self)?)
    }

    /// Deserialize checkpoint from bytes
    pub fn deserialize(bytes: &[u8]) -> Result<Self> {
        Ok(bincode::deserialize(bytes)?)
    }
}
