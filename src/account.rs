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

//! Account balances.
//!
//! An [`Account`] holds the denormalized `credits_remaining` figure that the
//! ledger must always agree with. The balance sits behind a mutex; the
//! [`CreditService`](crate::CreditService) holds that lock for the whole
//! validate → persist → settle sequence of an operation, which is what
//! serializes concurrent operations on one account.
//!
//! # Example
//!
//! ```
//! use rust_decimal_macros::dec;
//! use credit_ledger::{Account, AccountId};
//!
//! let account = Account::new(AccountId(1));
//! assert_eq!(account.credits_remaining(), dec!(0.00));
//! assert!(account.is_active());
//! ```

use crate::CreditError;
use crate::base::AccountId;
use crate::ledger::{CREDIT_SCALE, LedgerMutation};
use chrono::{DateTime, Utc};
use parking_lot::{Mutex, MutexGuard};
use rust_decimal::Decimal;
use serde::Serialize;
use serde::ser::{SerializeStruct, Serializer};

#[derive(Debug)]
pub(crate) struct AccountData {
    id: AccountId,
    credits_remaining: Decimal,
    active: bool,
    created_at: DateTime<Utc>,
}

impl AccountData {
    fn new(id: AccountId, credits_remaining: Decimal) -> Self {
        Self {
            id,
            credits_remaining,
            active: true,
            created_at: Utc::now(),
        }
    }

    fn assert_invariants(&self) {
        debug_assert!(
            self.credits_remaining >= Decimal::ZERO,
            "Invariant violated: credits_remaining went negative: {}",
            self.credits_remaining
        );
    }

    pub(crate) fn id(&self) -> AccountId {
        self.id
    }

    pub(crate) fn balance(&self) -> Decimal {
        self.credits_remaining
    }

    pub(crate) fn is_active(&self) -> bool {
        self.active
    }

    pub(crate) fn ensure_active(&self) -> Result<(), CreditError> {
        if !self.active {
            return Err(CreditError::AccountInactive);
        }
        Ok(())
    }

    /// Computes the balance that applying `mutation` would leave, without
    /// changing anything.
    pub(crate) fn preview(&self, mutation: &LedgerMutation) -> Result<Decimal, CreditError> {
        debug_assert_eq!(mutation.account, self.id);
        mutation.validate()?;
        let balance_after = self
            .credits_remaining
            .checked_add(mutation.amount)
            .ok_or(CreditError::InvalidAmount)?;
        if balance_after < Decimal::ZERO {
            return Err(CreditError::InsufficientCredits);
        }
        Ok(balance_after)
    }

    /// Records the balance of an entry that has already been persisted.
    pub(crate) fn settle(&mut self, balance_after: Decimal) {
        self.credits_remaining = balance_after;
        self.assert_invariants();
    }

    pub(crate) fn deactivate(&mut self) {
        self.active = false;
    }
}

/// Point-in-time copy of an account.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AccountSnapshot {
    pub account: AccountId,
    pub credits_remaining: Decimal,
    pub active: bool,
    pub created_at: DateTime<Utc>,
}

/// Credit account.
#[derive(Debug)]
pub struct Account {
    inner: Mutex<AccountData>,
}

impl Account {
    const DECIMAL_PRECISION: u32 = CREDIT_SCALE;

    pub fn new(id: AccountId) -> Self {
        Self::with_balance(id, Decimal::ZERO)
    }

    pub(crate) fn with_balance(id: AccountId, credits_remaining: Decimal) -> Self {
        Self {
            inner: Mutex::new(AccountData::new(id, credits_remaining)),
        }
    }

    pub fn id(&self) -> AccountId {
        self.inner.lock().id
    }

    pub fn credits_remaining(&self) -> Decimal {
        self.inner.lock().credits_remaining
    }

    pub fn is_active(&self) -> bool {
        self.inner.lock().active
    }

    pub fn has_credits(&self, amount: Decimal) -> bool {
        self.inner.lock().credits_remaining >= amount
    }

    pub fn snapshot(&self) -> AccountSnapshot {
        let data = self.inner.lock();
        AccountSnapshot {
            account: data.id,
            credits_remaining: data.credits_remaining,
            active: data.active,
            created_at: data.created_at,
        }
    }

    pub(crate) fn lock(&self) -> MutexGuard<'_, AccountData> {
        self.inner.lock()
    }
}

impl Serialize for Account {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let data = self.inner.lock();
        let mut state = serializer.serialize_struct("Account", 3)?;
        state.serialize_field("account", &data.id)?;
        state.serialize_field(
            "credits_remaining",
            &data.credits_remaining.round_dp(Account::DECIMAL_PRECISION),
        )?;
        state.serialize_field("active", &data.active)?;
        state.end()
    }
}
