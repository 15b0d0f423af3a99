//! Identifiers and positions shared by the ledger, history and planner

use serde::{Deserialize, Serialize};
use ulid::Ulid;

/// Monotonic index of a WAL segment file
pub type SegmentIndex = u64;

/// Per-partition update counter value
pub type UpdateCounter = u64;

/// Current wall-clock time in unix milliseconds
pub fn unix_time_ms() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// A position in the segmented WAL: segment index plus byte offset inside it
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct WalPointer {
    pub segment: SegmentIndex,
    pub offset: u64,
}

impl WalPointer {
    pub const fn new(segment: SegmentIndex, offset: u64) -> Self {
        Self { segment, offset }
    }
}

impl std::fmt::Display for WalPointer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.segment, self.offset)
    }
}

/// Inclusive range of WAL positions a historical supplier has to stream
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct WalRange {
    pub from: WalPointer,
    pub to: WalPointer,
}

impl WalRange {
    /// Number of segment files the range touches
    pub fn segment_count(&self) -> u64 {
        self.to.segment.saturating_sub(self.from.segment) + 1
    }
}

/// Cache partition identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct PartitionId(pub u32);

impl std::fmt::Display for PartitionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<u32> for PartitionId {
    fn from(value: u32) -> Self {
        PartitionId(value)
    }
}

/// Identity of whoever holds reservations: an exchange context, a history
/// consumer, or an explicit pin.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct OwnerId(Ulid);

impl OwnerId {
    /// Allocate a fresh owner identity
    pub fn generate() -> Self {
        Self(Ulid::new())
    }

    pub fn as_ulid(&self) -> Ulid {
        self.0
    }
}

impl From<Ulid> for OwnerId {
    fn from(value: Ulid) -> Self {
        OwnerId(value)
    }
}

impl std::fmt::Display for OwnerId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Lifecycle state of a segment. Transitions only move forward.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SegmentState {
    /// Current write target
    Active,
    /// Sealed and moved to the archive directory
    Archived,
    /// Archived and zstd-compressed
    Compressed,
    /// Removed from disk
    Deleted,
}

impl SegmentState {
    fn rank(self) -> u8 {
        match self {
            SegmentState::Active => 0,
            SegmentState::Archived => 1,
            SegmentState::Compressed => 2,
            SegmentState::Deleted => 3,
        }
    }

    /// Whether moving from `self` to `next` respects the lifecycle order
    pub fn can_transition_to(self, next: SegmentState) -> bool {
        match (self, next) {
            // Compression is optional, so an archived segment may be deleted directly
            (SegmentState::Archived, SegmentState::Deleted) => true,
            (from, to) => to.rank() == from.rank() + 1,
        }
    }
}

impl std::fmt::Display for SegmentState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SegmentState::Active => write!(f, "active"),
            SegmentState::Archived => write!(f, "archived"),
            SegmentState::Compressed => write!(f, "compressed"),
            SegmentState::Deleted => write!(f, "deleted"),
        }
    }
}
