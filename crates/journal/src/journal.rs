//! Append-only checkpoint journal using sled

use crate::CheckpointRecord;
use crate::Result;
use anyhow::Context;
use parking_lot::RwLock;
use sled::Db;
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use ulid::Ulid;

/// Durable log of checkpoint records
pub struct Journal {
    db: Db,
    /// Record id to sled key
    seq_by_id: RwLock<BTreeMap<Ulid, u64>>,
    next_seq: AtomicU64,
}

impl Journal {
    /// Open or create a journal at the given path
    pub fn open(path: &Path) -> Result<Self> {
        let db = sled::open(path.join("checkpoints.db")).context("Failed to open checkpoint journal")?;

        let mut seq_by_id = BTreeMap::new();
        let mut max_seq = 0u64;

        for item in db.iter() {
            let (key, value) = item?;
            let seq = u64::from_be_bytes(key.as_ref().try_into()?);
            let record = CheckpointRecord::deserialize(&value)?;
            seq_by_id.insert(record.id, seq);
            max_seq = max_seq.max(seq);
        }

        Ok(Self {
            db,
            seq_by_id: RwLock::new(seq_by_id),
            next_seq: AtomicU64::new(max_seq + 1),
        })
    }

    /// Append a record, assigning its sequence number
    pub fn append(&self, record: &mut CheckpointRecord) -> Result<u64> {
        let seq = self.next_seq.fetch_add(1, Ordering::SeqCst);
        record.seq = seq;

        // Big-endian keys keep sled's iteration order equal to sequence order
        let key = seq.to_be_bytes();
        let value = record.serialize()?;
        self.db.insert(key, value)?;

        self.seq_by_id.write().insert(record.id, seq);
        self.db.flush()?;

        Ok(seq)
    }

    /// Every record in sequence order
    pub fn load_all(&self) -> Result<Vec<CheckpointRecord>> {
        let mut records = Vec::with_capacity(self.count());
        for item in self.db.iter() {
            let (_, value) = item?;
            records.push(CheckpointRecord::deserialize(&value)?);
        }
        Ok(records)
    }

    /// Delete a record
    pub fn delete(&self, id: &Ulid) -> Result<()> {
        let seq = match self.seq_by_id.write().remove(id) {
            Some(seq) => seq,
            None => return Ok(()), // Already deleted
        };

        self.db.remove(seq.to_be_bytes())?;
        Ok(())
    }

    /// Flush pending deletes to disk
    pub fn flush(&self) -> Result<()> {
        self.db.flush()?;
        Ok(())
    }

    /// Number of live records
    pub fn count(&self) -> usize {
        self.seq_by_id.read().len()
    }
}
