//! Checkpoint history: retained checkpoints and lookups for historical rebalance

use crate::retention::{GarbageCollector, RetentionPolicy};
use crate::{CheckpointReason, CheckpointRecord, Journal};
use std::collections::{BTreeMap, VecDeque};
use std::path::Path;
use wk_core::{
    PartitionId, ReservationStorage, Result, SegmentIndex, UpdateCounter, WalError, WalPointer,
};

/// Ordered window of completed checkpoints, oldest first
pub struct CheckpointHistory {
    records: VecDeque<CheckpointRecord>,
    /// Durable copy; `None` for a purely in-memory history
    journal: Option<Journal>,
}

impl CheckpointHistory {
    /// Open the history persisted under `dir`
    pub fn open(dir: &Path) -> Result<Self> {
        let journal = Journal::open(dir)?;
        let records: VecDeque<_> = journal.load_all()?.into();

        tracing::debug!("Loaded {} checkpoint records", records.len());

        Ok(Self {
            records,
            journal: Some(journal),
        })
    }

    /// History that is never written to disk
    pub fn in_memory() -> Self {
        Self {
            records: VecDeque::new(),
            journal: None,
        }
    }

    /// Append a completed checkpoint
    ///
    /// Fails with `CheckpointRegression` if `ptr` is behind the latest record.
    pub fn record(
        &mut self,
        ptr: WalPointer,
        counters: BTreeMap<PartitionId, UpdateCounter>,
        reason: CheckpointReason,
    ) -> Result<CheckpointRecord> {
        if let Some(latest) = self.records.back() {
            if ptr < latest.wal_ptr {
                return Err(WalError::CheckpointRegression {
                    ptr,
                    latest: latest.wal_ptr,
                });
            }
        }

        let mut record = CheckpointRecord::new(ptr, counters, reason);
        match &self.journal {
            Some(journal) => {
                journal.append(&mut record)?;
            }
            None => {
                record.seq = self.records.back().map_or(1, |r| r.seq + 1);
            }
        }

        self.records.push_back(record.clone());
        Ok(record)
    }

    /// `(counter, pointer)` pairs for `partition`, most recent first
    pub fn history_for(&self, partition: PartitionId) -> Vec<(UpdateCounter, WalPointer)> {
        self.records
            .iter()
            .rev()
            .filter_map(|r| r.counter_for(partition).map(|counter| (counter, r.wal_ptr)))
            .collect()
    }

    /// Where WAL replay has to start to supply every update after `from_counter`
    ///
    /// Picks the newest record whose counter is at or below `from_counter`.
    /// `None` means the counter predates all retained history.
    pub fn reserved_wal_range_for(
        &self,
        partition: PartitionId,
        from_counter: UpdateCounter,
    ) -> Option<WalPointer> {
        self.records
            .iter()
            .rev()
            .find(|r| r.counter_for(partition).is_some_and(|c| c <= from_counter))
            .map(|r| r.wal_ptr)
    }

    /// Counter of `partition` in the most recent record that tracks it
    pub fn latest_counter(&self, partition: PartitionId) -> Option<UpdateCounter> {
        self.records
            .iter()
            .rev()
            .find_map(|r| r.counter_for(partition))
    }

    pub fn latest(&self) -> Option<&CheckpointRecord> {
        self.records.back()
    }

    pub fn oldest(&self) -> Option<&CheckpointRecord> {
        self.records.front()
    }

    /// Lowest segment any retained record points into
    pub fn oldest_segment(&self) -> Option<SegmentIndex> {
        self.records.front().map(|r| r.wal_ptr.segment)
    }

    pub fn iter(&self) -> impl Iterator<Item = &CheckpointRecord> {
        self.records.iter()
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Drop old records the retention policy no longer needs
    ///
    /// Returns the number of records evicted.
    pub fn evict<F>(
        &mut self,
        policy: &RetentionPolicy,
        reservations: &ReservationStorage,
        archived_bytes_from: F,
    ) -> Result<usize>
    where
        F: Fn(SegmentIndex) -> u64,
    {
        let gc = GarbageCollector::new(policy.clone());
        let count = gc.collect(self.records.make_contiguous(), reservations, archived_bytes_from);

        self.drop_oldest(count)?;
        if count > 0 {
            tracing::debug!(
                "Evicted {} checkpoint records, oldest now at {:?}",
                count,
                self.oldest().map(|r| r.wal_ptr)
            );
        }
        Ok(count)
    }

    /// Drop records pointing below `segment`
    ///
    /// Used on open when part of the archive is already gone.
    pub fn discard_before(&mut self, segment: SegmentIndex) -> Result<usize> {
        let count = self
            .records
            .iter()
            .take_while(|r| r.wal_ptr.segment < segment)
            .count();

        if count > 0 {
            tracing::warn!(
                "Discarding {} checkpoint records whose WAL was removed (below segment {})",
                count,
                segment
            );
        }
        self.drop_oldest(count)?;
        Ok(count)
    }

    fn drop_oldest(&mut self, count: usize) -> Result<()> {
        for record in self.records.drain(..count) {
            if let Some(journal) = &self.journal {
                journal.delete(&record.id)?;
            }
        }
        if count > 0 {
            if let Some(journal) = &self.journal {
                journal.flush()?;
            }
        }
        Ok(())
    }
}
