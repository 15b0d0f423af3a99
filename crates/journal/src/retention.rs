//! Retention policy for checkpoint history

use crate::CheckpointRecord;
use wk_core::{ReservationStorage, SegmentIndex, WalConfig};

/// Retention policy configuration
#[derive(Debug, Clone)]
pub struct RetentionPolicy {
    /// Number of checkpoint records to keep (default: 20)
    pub history_size: usize,
    /// Archive size above which old records are dropped early (0 = unlimited)
    pub max_archive_size: u64,
}

impl Default for RetentionPolicy {
    fn default() -> Self {
        Self {
            history_size: 20,
            max_archive_size: 1024 * 1024 * 1024, // 1 GB
        }
    }
}

impl RetentionPolicy {
    pub fn from_config(config: &WalConfig) -> Self {
        Self {
            history_size: config.history_size,
            max_archive_size: config.max_archive_size,
        }
    }
}

/// Decides how many of the oldest checkpoint records can be dropped
pub struct GarbageCollector {
    policy: RetentionPolicy,
}

impl GarbageCollector {
    /// Create a new GC with the given policy
    pub fn new(policy: RetentionPolicy) -> Self {
        Self { policy }
    }

    /// Number of records to evict from the front of `records` (oldest first)
    ///
    /// A record goes only while the policy is exceeded, and only if:
    /// 1. it is not the most recent record
    /// 2. its segment is below both the lowest reservation and the most recent checkpoint
    /// 3. no reservation starts inside the WAL span it covers
    ///
    /// `archived_bytes_from(idx)` reports the archive size from segment `idx` upwards.
    pub fn collect<F>(
        &self,
        records: &[CheckpointRecord],
        reservations: &ReservationStorage,
        archived_bytes_from: F,
    ) -> usize
    where
        F: Fn(SegmentIndex) -> u64,
    {
        let Some(latest) = records.last() else {
            return 0;
        };

        let latest_segment = latest.wal_ptr.segment;
        let limit = reservations
            .lowest_reserved()
            .map_or(latest_segment, |lowest| lowest.min(latest_segment));

        let mut evicted = 0;
        for pair in records.windows(2) {
            let (record, next) = (&pair[0], &pair[1]);
            let segment = record.wal_ptr.segment;

            let over_depth = records.len() - evicted > self.policy.history_size;
            let over_size = self.policy.max_archive_size > 0
                && archived_bytes_from(segment) > self.policy.max_archive_size;
            if !over_depth && !over_size {
                break;
            }

            if segment >= limit {
                break;
            }
            if reservations.any_within(segment..next.wal_ptr.segment) {
                break;
            }

            evicted += 1;
        }

        evicted
    }
}
