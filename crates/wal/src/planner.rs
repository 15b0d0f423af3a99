//! History reservation planner
//!
//! Decides between historical and full rebalance for a partition and, for a
//! historical one, installs the reservation before the decision is returned.
//! The lookup, threshold checks and reserve all run under one acquisition of
//! the manager lock, so the planned range cannot be deleted in between.

use crate::manager::WalManager;
use serde::Serialize;
use std::sync::Arc;
use tracing::{debug, warn};
use wk_core::{
    OwnerId, PartitionId, ReservationToken, SegmentIndex, UpdateCounter, WalError, WalRange,
};

/// Why historical rebalance was not possible
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FullReason {
    /// This node runs without a WAL
    WalDisabled,
    /// The counter predates all retained checkpoint history
    HistoryUnavailable,
    /// Replaying would stream more segments than allowed
    TooManySegments { needed: u64, limit: u64 },
    /// Replaying would apply more updates than allowed
    TooManyUpdates { missing: u64, limit: u64 },
    /// The needed WAL was deleted before it could be reserved
    SegmentsTruncated,
    /// The reservation was refused for another reason
    ReservationFailed,
}

impl std::fmt::Display for FullReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FullReason::WalDisabled => write!(f, "WAL disabled"),
            FullReason::HistoryUnavailable => write!(f, "history unavailable"),
            FullReason::TooManySegments { needed, limit } => {
                write!(f, "{} segments needed, limit {}", needed, limit)
            }
            FullReason::TooManyUpdates { missing, limit } => {
                write!(f, "{} updates missing, limit {}", missing, limit)
            }
            FullReason::SegmentsTruncated => write!(f, "segments truncated"),
            FullReason::ReservationFailed => write!(f, "reservation failed"),
        }
    }
}

/// Outcome of [`HistoryPlanner::plan_rebalance`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RebalancePlan {
    /// Stream `range` from the WAL; the reservation is already installed
    Historical {
        token: ReservationToken,
        range: WalRange,
    },
    /// Fall back to full state transfer
    Full { reason: FullReason },
}

impl RebalancePlan {
    pub fn is_historical(&self) -> bool {
        matches!(self, RebalancePlan::Historical { .. })
    }

    pub fn token(&self) -> Option<&ReservationToken> {
        match self {
            RebalancePlan::Historical { token, .. } => Some(token),
            RebalancePlan::Full { .. } => None,
        }
    }

    pub fn full_reason(&self) -> Option<FullReason> {
        match self {
            RebalancePlan::Historical { .. } => None,
            RebalancePlan::Full { reason } => Some(*reason),
        }
    }

    fn full(reason: FullReason) -> Self {
        RebalancePlan::Full { reason }
    }
}

/// Plans historical rebalance for partition exchange
#[derive(Clone)]
pub struct HistoryPlanner {
    manager: Arc<WalManager>,
}

impl HistoryPlanner {
    pub fn new(manager: Arc<WalManager>) -> Self {
        Self { manager }
    }

    /// Decide how `partition` can be brought up to date from `from_counter`
    ///
    /// On `Historical` the owner holds a reservation from the checkpoint's
    /// segment; it must eventually be released (`release` or `release_all`).
    pub fn plan_rebalance(
        &self,
        partition: PartitionId,
        from_counter: UpdateCounter,
        owner: OwnerId,
    ) -> RebalancePlan {
        let limits = Limits {
            max_segments: self.manager.wal_config().rebalance_max_segments,
            max_updates: self.manager.wal_config().rebalance_max_missing_updates,
        };

        let plan = self
            .manager
            .with_state(|state| {
                let Some(start) = state.history.reserved_wal_range_for(partition, from_counter)
                else {
                    return RebalancePlan::full(FullReason::HistoryUnavailable);
                };

                let end = state.write_position();
                if let Some(reason) = limits.check(
                    start.segment,
                    end.segment,
                    state.history.latest_counter(partition),
                    from_counter,
                ) {
                    return RebalancePlan::full(reason);
                }

                match state.reservations.reserve(start.segment, owner) {
                    Ok(token) => RebalancePlan::Historical {
                        token,
                        range: WalRange {
                            from: start,
                            to: end,
                        },
                    },
                    Err(e) => RebalancePlan::full(reason_for(&e)),
                }
            })
            .unwrap_or(RebalancePlan::full(FullReason::WalDisabled));

        match &plan {
            RebalancePlan::Historical { token, range } => debug!(
                "Partition {} from counter {}: historical {}..{} ({})",
                partition, from_counter, range.from, range.to, token
            ),
            RebalancePlan::Full { reason } => debug!(
                "Partition {} from counter {}: full rebalance ({})",
                partition, from_counter, reason
            ),
        }

        plan
    }
}

fn reason_for(err: &WalError) -> FullReason {
    match err {
        WalError::SegmentTruncated { .. } => FullReason::SegmentsTruncated,
        e => {
            warn!("Unexpected reservation failure: {}", e);
            FullReason::ReservationFailed
        }
    }
}

struct Limits {
    max_segments: u64,
    max_updates: u64,
}

impl Limits {
    /// Threshold violated by a replay of `[from_segment, to_segment]`, if any
    fn check(
        &self,
        from_segment: SegmentIndex,
        to_segment: SegmentIndex,
        latest_counter: Option<UpdateCounter>,
        from_counter: UpdateCounter,
    ) -> Option<FullReason> {
        let needed = to_segment.saturating_sub(from_segment) + 1;
        if self.max_segments > 0 && needed > self.max_segments {
            return Some(FullReason::TooManySegments {
                needed,
                limit: self.max_segments,
            });
        }

        let missing = latest_counter.unwrap_or(from_counter).saturating_sub(from_counter);
        if self.max_updates > 0 && missing > self.max_updates {
            return Some(FullReason::TooManyUpdates {
                missing,
                limit: self.max_updates,
            });
        }

        None
    }
}

/// Releases every reservation of an exchange context when dropped
///
/// Covers success, failure and early return alike.
pub struct OwnerGuard {
    manager: Arc<WalManager>,
    owner: OwnerId,
}

impl OwnerGuard {
    /// Guard a freshly generated owner
    pub fn new(manager: Arc<WalManager>) -> Self {
        Self::for_owner(manager, OwnerId::generate())
    }

    pub fn for_owner(manager: Arc<WalManager>, owner: OwnerId) -> Self {
        Self { manager, owner }
    }

    pub fn owner(&self) -> OwnerId {
        self.owner
    }
}

impl Drop for OwnerGuard {
    fn drop(&mut self) {
        self.manager.release_all(self.owner);
    }
}
