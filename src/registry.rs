// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2025 Daniel Negri
//
// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU Affero General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE. See the
// GNU Affero General Public License for more details.
//
// You should have received a copy of the GNU Affero General Public License
// along with this program. If not, see <https://www.gnu.org/licenses/>.

//! Thread-safe idempotency registry.
//!
//! Tracks which idempotency keys (payment event IDs, conversion IDs) have
//! already been applied so that at-least-once deliveries are applied at most
//! once.
//!
//! A key moves through two states: claimed while its first attempt runs,
//! then done once that attempt succeeded. A failed attempt releases the key.

use crate::CreditError;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use std::hash::Hash;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ClaimState {
    InFlight,
    Done,
}

#[derive(Debug, Clone, Copy)]
struct Claim {
    state: ClaimState,
    /// When the key was claimed, or completed once done.
    at: DateTime<Utc>,
}

/// A concurrent set of claimed idempotency keys.
///
/// Claiming goes through the [`DashMap`] entry API, so two threads racing on
/// the same key cannot both win.
#[derive(Debug)]
pub struct EventRegistry<K>
where
    K: Eq + Hash,
{
    claimed: DashMap<K, Claim>,
}

impl<K> EventRegistry<K>
where
    K: Eq + Hash + Clone,
{
    pub fn new() -> Self {
        Self {
            claimed: DashMap::new(),
        }
    }

    /// Claims `key` for processing.
    ///
    /// # Errors
    ///
    /// - [`CreditError::DuplicateEvent`] - The key was already applied.
    /// - [`CreditError::EventInProgress`] - Another attempt holds the key and
    ///   has not finished; the caller should retry later.
    pub fn claim(&self, key: &K) -> Result<(), CreditError> {
        match self.claimed.entry(key.clone()) {
            Entry::Occupied(entry) => match entry.get().state {
                ClaimState::Done => Err(CreditError::DuplicateEvent),
                ClaimState::InFlight => Err(CreditError::EventInProgress),
            },
            Entry::Vacant(entry) => {
                entry.insert(Claim {
                    state: ClaimState::InFlight,
                    at: Utc::now(),
                });
                Ok(())
            }
        }
    }

    /// Marks a claimed key as applied.
    pub fn complete(&self, key: &K) {
        self.mark_done(key.clone(), Utc::now());
    }

    /// Records a key applied in an earlier run.
    pub(crate) fn mark_done(&self, key: K, at: DateTime<Utc>) {
        self.claimed.insert(
            key,
            Claim {
                state: ClaimState::Done,
                at,
            },
        );
    }

    /// Gives a key back after its processing failed, so a retry can claim it.
    pub fn release(&self, key: &K) {
        self.claimed
            .remove_if(key, |_, claim| claim.state == ClaimState::InFlight);
    }

    /// Forgets applied keys completed before `cutoff`. Returns how many were
    /// removed. Keys still in flight are kept.
    pub fn prune_before(&self, cutoff: DateTime<Utc>) -> usize {
        let before = self.claimed.len();
        self.claimed
            .retain(|_, claim| claim.state == ClaimState::InFlight || claim.at >= cutoff);
        before.saturating_sub(self.claimed.len())
    }

    pub fn contains(&self, key: &K) -> bool {
        self.claimed.contains_key(key)
    }

    pub fn is_done(&self, key: &K) -> bool {
        self.claimed
            .get(key)
            .is_some_and(|claim| claim.state == ClaimState::Done)
    }

    pub fn claimed_at(&self, key: &K) -> Option<DateTime<Utc>> {
        self.claimed.get(key).map(|claim| claim.at)
    }

    pub fn len(&self) -> usize {
        self.claimed.len()
    }

    pub fn is_empty(&self) -> bool {
        self.claimed.is_empty()
    }
}

impl<K> Default for EventRegistry<K>
where
    K: Eq + Hash + Clone,
{
    fn default() -> Self {
        Self::new()
    }
}
