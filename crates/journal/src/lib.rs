//! Checkpoint history and its durable journal
//!
//! This crate provides:
//! - Checkpoint records (ULID ids, WAL pointer, per-partition counters)
//! - Append-only journal (sled embedded DB)
//! - Checkpoint history lookups used by the rebalance planner
//! - Retention policy & eviction

pub mod checkpoint;
pub mod history;
pub mod journal;
pub mod retention;

// Re-exports
pub use checkpoint::{CheckpointReason, CheckpointRecord};
pub use history::CheckpointHistory;
pub use journal::Journal;
pub use retention::{GarbageCollector, RetentionPolicy};

/// Result type for journal operations
pub type Result<T> = anyhow::Result<T>;
