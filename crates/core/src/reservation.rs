//! Reservation storage: who pins which WAL segments and from where
//!
//! A reservation `(min_index, owner)` keeps every segment `>= min_index` on
//! disk until it is released. The same owner may reserve the same index more
//! than once; each reserve needs a matching release.

use crate::error::{Result, WalError};
use crate::types::{OwnerId, SegmentIndex};
use ahash::AHashMap;
use serde::Serialize;
use smallvec::SmallVec;
use std::collections::BTreeMap;
use std::ops::Range;

/// Handle returned by a successful reserve
///
/// Tokens are plain values. Dropping one does not release the reservation;
/// pass it back to `release` (or release everything the owner holds).
#[must_use = "a reservation pins WAL until it is released"]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ReservationToken {
    min_index: SegmentIndex,
    owner: OwnerId,
}

impl ReservationToken {
    /// A token not backed by any storage entry
    ///
    /// Releasing it against a storage that never issued it fails with
    /// `ReservationNotFound`.
    pub fn new(min_index: SegmentIndex, owner: OwnerId) -> Self {
        Self { min_index, owner }
    }

    pub fn min_index(&self) -> SegmentIndex {
        self.min_index
    }

    pub fn owner(&self) -> OwnerId {
        self.owner
    }
}

impl std::fmt::Display for ReservationToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}@{}", self.owner, self.min_index)
    }
}

/// One live reservation as reported by diagnostics
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ReservationInfo {
    pub min_index: SegmentIndex,
    pub owner: OwnerId,
    /// Number of outstanding reserves for this `(min_index, owner)` pair
    pub count: u32,
}

/// Multiset of live reservations
#[derive(Debug, Default)]
pub struct ReservationStorage {
    entries: BTreeMap<(SegmentIndex, OwnerId), u32>,
    by_owner: AHashMap<OwnerId, SmallVec<[SegmentIndex; 4]>>,
    /// Lowest index that can still be reserved
    floor: SegmentIndex,
}

impl ReservationStorage {
    pub fn new() -> Self {
        Self::default()
    }

    /// Storage that refuses reservations below `floor`
    pub fn with_floor(floor: SegmentIndex) -> Self {
        Self {
            floor,
            ..Self::default()
        }
    }

    /// Pin every segment `>= min_index` for `owner`
    ///
    /// Fails with `SegmentTruncated` if `min_index` has already been deleted.
    pub fn reserve(&mut self, min_index: SegmentIndex, owner: OwnerId) -> Result<ReservationToken> {
        if min_index < self.floor {
            return Err(WalError::SegmentTruncated {
                index: min_index,
                last_deleted: self.floor - 1,
            });
        }

        let count = self.entries.entry((min_index, owner)).or_insert(0);
        if *count == 0 {
            self.by_owner.entry(owner).or_default().push(min_index);
        }
        *count += 1;

        Ok(ReservationToken::new(min_index, owner))
    }

    /// Drop one reserve matching the token
    ///
    /// Returns how many reserves remain for the same `(min_index, owner)`.
    pub fn release(&mut self, token: &ReservationToken) -> Result<u32> {
        let key = (token.min_index, token.owner);
        let Some(count) = self.entries.get_mut(&key) else {
            return Err(WalError::ReservationNotFound {
                min_index: token.min_index,
                owner: token.owner,
            });
        };

        *count -= 1;
        let remaining = *count;
        if remaining == 0 {
            self.entries.remove(&key);
            self.forget_owner_index(token.owner, token.min_index);
        }

        Ok(remaining)
    }

    /// Drop every reservation held by `owner`
    ///
    /// Returns the number of reserves removed. Unknown owners are a no-op.
    pub fn release_all(&mut self, owner: OwnerId) -> usize {
        let Some(indices) = self.by_owner.remove(&owner) else {
            return 0;
        };

        indices
            .into_iter()
            .filter_map(|index| self.entries.remove(&(index, owner)))
            .map(|count| count as usize)
            .sum()
    }

    /// Smallest reserved index, if any
    pub fn lowest_reserved(&self) -> Option<SegmentIndex> {
        self.entries.keys().next().map(|&(index, _)| index)
    }

    /// Whether any reservation starts inside `range`
    pub fn any_within(&self, range: Range<SegmentIndex>) -> bool {
        if range.is_empty() {
            return false;
        }
        let start = (range.start, OwnerId::from(ulid::Ulid::nil()));
        self.entries
            .range(start..)
            .next()
            .is_some_and(|(&(index, _), _)| index < range.end)
    }

    /// Every live reservation, lowest index first
    pub fn snapshot(&self) -> Vec<ReservationInfo> {
        self.entries
            .iter()
            .map(|(&(min_index, owner), &count)| ReservationInfo {
                min_index,
                owner,
                count,
            })
            .collect()
    }

    /// Raise the floor after segments below `index` were deleted
    ///
    /// Live reservations are never below the floor, since deletion stops at
    /// the lowest reservation.
    pub fn truncate_below(&mut self, index: SegmentIndex) {
        self.floor = self.floor.max(index);
    }

    pub fn floor(&self) -> SegmentIndex {
        self.floor
    }

    /// Number of distinct `(min_index, owner)` pairs
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn forget_owner_index(&mut self, owner: OwnerId, index: SegmentIndex) {
        if let Some(indices) = self.by_owner.get_mut(&owner) {
            indices.retain(|i| *i != index);
            if indices.is_empty() {
                self.by_owner.remove(&owner);
            }
        }
    }
}
