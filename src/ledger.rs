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

//! Ledger entries and the mutations that produce them.
//!
//! Every change to an account balance is described first as a
//! [`LedgerMutation`], validated in one place, and then materialized as an
//! immutable [`LedgerEntry`] carrying the signed delta and the running
//! balance right after it.
//!
//! For any one account, entries ordered by ID form a running sum:
//!
//! ```text
//! balance_after[n] = balance_after[n - 1] + amount[n]     (balance_after[-1] = 0)
//! ```
//!
//! [`audit`] replays a slice of entries and reports the first place where
//! that chain breaks.

use crate::CreditError;
use crate::base::{AccountId, ConversionId, EntryId, OrderId};
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Number of decimal places the ledger stores for credit amounts.
pub const CREDIT_SCALE: u32 = 2;

/// Kind of balance change recorded by a ledger entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EntryType {
    Purchase,
    Usage,
    Refund,
    Bonus,
    Adjustment,
}

impl fmt::Display for EntryType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Purchase => "purchase",
            Self::Usage => "usage",
            Self::Refund => "refund",
            Self::Bonus => "bonus",
            Self::Adjustment => "adjustment",
        };
        f.write_str(name)
    }
}

/// An intended balance change, validated before anything is written.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LedgerMutation {
    pub account: AccountId,
    /// Signed delta applied to the balance.
    pub amount: Decimal,
    pub entry_type: EntryType,
    pub description: String,
    pub order: Option<OrderId>,
    pub conversion: Option<ConversionId>,
}

impl LedgerMutation {
    /// Builds a positive change of `entry_type`.
    pub fn credit(
        account: AccountId,
        amount: Decimal,
        entry_type: EntryType,
        description: impl Into<String>,
    ) -> Result<Self, CreditError> {
        if amount <= Decimal::ZERO {
            return Err(CreditError::InvalidAmount);
        }
        Self::signed(account, amount, entry_type, description)
    }

    /// Builds a negative change of `entry_type` from a positive `amount`.
    pub fn debit(
        account: AccountId,
        amount: Decimal,
        entry_type: EntryType,
        description: impl Into<String>,
    ) -> Result<Self, CreditError> {
        if amount <= Decimal::ZERO {
            return Err(CreditError::InvalidAmount);
        }
        Self::signed(account, -amount, entry_type, description)
    }

    /// Builds a change with an explicit sign.
    pub fn signed(
        account: AccountId,
        amount: Decimal,
        entry_type: EntryType,
        description: impl Into<String>,
    ) -> Result<Self, CreditError> {
        let mutation = Self {
            account,
            amount,
            entry_type,
            description: description.into(),
            order: None,
            conversion: None,
        };
        mutation.validate()?;
        Ok(mutation)
    }

    pub fn with_order(mut self, order: OrderId) -> Self {
        self.order = Some(order);
        self
    }

    pub fn with_conversion(mut self, conversion: ConversionId) -> Self {
        self.conversion = Some(conversion);
        self
    }

    /// Checks the amount against the entry type.
    ///
    /// # Errors
    ///
    /// Returns [`CreditError::InvalidAmount`] for a zero amount, an amount
    /// with more than [`CREDIT_SCALE`] decimal places, or a sign that does
    /// not match the entry type.
    pub fn validate(&self) -> Result<(), CreditError> {
        if self.amount.is_zero() || self.amount.normalize().scale() > CREDIT_SCALE {
            return Err(CreditError::InvalidAmount);
        }
        let sign_ok = match self.entry_type {
            EntryType::Purchase | EntryType::Bonus => self.amount.is_sign_positive(),
            EntryType::Usage => self.amount.is_sign_negative(),
            EntryType::Refund | EntryType::Adjustment => true,
        };
        if !sign_ok {
            return Err(CreditError::InvalidAmount);
        }
        Ok(())
    }
}

/// Immutable audit record of a single balance change.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LedgerEntry {
    pub id: EntryId,
    pub account: AccountId,
    pub order: Option<OrderId>,
    pub conversion: Option<ConversionId>,
    pub amount: Decimal,
    pub balance_after: Decimal,
    #[serde(rename = "type")]
    pub entry_type: EntryType,
    pub description: String,
    pub created_at: DateTime<Utc>,
}

impl LedgerEntry {
    pub(crate) fn from_mutation(
        id: EntryId,
        mutation: LedgerMutation,
        balance_after: Decimal,
    ) -> Self {
        Self {
            id,
            account: mutation.account,
            order: mutation.order,
            conversion: mutation.conversion,
            amount: mutation.amount,
            balance_after,
            entry_type: mutation.entry_type,
            description: mutation.description,
            created_at: Utc::now(),
        }
    }
}

/// Ledger consistency violations found by [`audit`].
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AuditError {
    /// An entry's `balance_after` does not follow from its predecessor
    #[error("entry {entry}: expected balance {expected}, recorded {recorded}")]
    BrokenChain {
        entry: EntryId,
        expected: Decimal,
        recorded: Decimal,
    },

    /// The replayed ledger disagrees with the account balance
    #[error("ledger sums to {ledger}, account holds {account}")]
    BalanceMismatch { ledger: Decimal, account: Decimal },

    /// The running sum leaves the representable range
    #[error("entry {entry}: running balance overflows")]
    Overflow { entry: EntryId },

    /// The audited account is not registered
    #[error("account {0} not found")]
    UnknownAccount(AccountId),
}

/// Result of a successful ledger replay.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct AuditReport {
    pub account: AccountId,
    pub entries: usize,
    pub balance: Decimal,
}

/// Replays one account's entries in ID order and verifies the running sum.
///
/// When `expected_balance` is given, the final running balance must also
/// equal it.
///
/// # Errors
///
/// Returns the first [`AuditError`] encountered.
pub fn audit(
    account: AccountId,
    entries: &[LedgerEntry],
    expected_balance: Option<Decimal>,
) -> Result<AuditReport, AuditError> {
    let mut ordered: Vec<&LedgerEntry> = entries.iter().filter(|e| e.account == account).collect();
    ordered.sort_by_key(|e| e.id);

    let mut running = Decimal::ZERO;
    for entry in &ordered {
        let expected = running
            .checked_add(entry.amount)
            .ok_or(AuditError::Overflow { entry: entry.id })?;
        if expected != entry.balance_after {
            return Err(AuditError::BrokenChain {
                entry: entry.id,
                expected,
                recorded: entry.balance_after,
            });
        }
        running = expected;
    }

    if let Some(balance) = expected_balance {
        if balance != running {
            return Err(AuditError::BalanceMismatch {
                ledger: running,
                account: balance,
            });
        }
    }

    Ok(AuditReport {
        account,
        entries: ordered.len(),
        balance: running,
    })
}
