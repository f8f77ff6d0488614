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

//! Error types for credit operations.

use crate::order::OrderStatus;
use thiserror::Error;

/// Credit service errors.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CreditError {
    /// Amount is zero, has the wrong sign for the operation, or carries more
    /// precision than the ledger stores
    #[error("invalid amount (must be positive with at most 2 decimal places)")]
    InvalidAmount,

    /// Deduction would take the balance below zero
    #[error("insufficient credits")]
    InsufficientCredits,

    /// Idempotency key was already applied
    #[error("event already processed")]
    DuplicateEvent,

    /// Idempotency key is held by an attempt that has not finished yet
    #[error("event is still being processed")]
    EventInProgress,

    /// The ledger store could not commit the entry
    #[error("persistence failure: {0}")]
    PersistenceFailure(String),

    /// Referenced account does not exist
    #[error("account not found")]
    AccountNotFound,

    /// Account ID is already registered
    #[error("account already exists")]
    AccountExists,

    /// Account has been deactivated
    #[error("account is inactive")]
    AccountInactive,

    /// Referenced order does not exist
    #[error("order not found")]
    OrderNotFound,

    /// Conversion was never charged to this account
    #[error("conversion not found")]
    ConversionNotFound,

    /// Package code is not in the catalog
    #[error("package not found")]
    PackageNotFound,

    /// Order is not in the state the transition requires
    #[error("order is {actual}, expected {expected}")]
    InvalidOrderState {
        expected: OrderStatus,
        actual: OrderStatus,
    },
}

#[cfg(test)]
mod tests {
    use super::CreditError;
    use crate::order::OrderStatus;

    #[test]
    fn error_display_messages() {
        assert_eq!(
            CreditError::InvalidAmount.to_string(),
            "invalid amount (must be positive with at most 2 decimal places)"
        );
        assert_eq!(CreditError::InsufficientCredits.to_string(), "insufficient credits");
        assert_eq!(CreditError::DuplicateEvent.to_string(), "event already processed");
        assert_eq!(
            CreditError::PersistenceFailure("disk full".into()).to_string(),
            "persistence failure: disk full"
        );
        assert_eq!(CreditError::AccountNotFound.to_string(), "account not found");
        assert_eq!(CreditError::AccountExists.to_string(), "account already exists");
        assert_eq!(CreditError::AccountInactive.to_string(), "account is inactive");
        assert_eq!(CreditError::OrderNotFound.to_string(), "order not found");
        assert_eq!(CreditError::PackageNotFound.to_string(), "package not found");
        assert_eq!(
            CreditError::EventInProgress.to_string(),
            "event is still being processed"
        );
        assert_eq!(CreditError::ConversionNotFound.to_string(), "conversion not found");
        assert_eq!(
            CreditError::InvalidOrderState {
                expected: OrderStatus::Completed,
                actual: OrderStatus::Pending,
            }
            .to_string(),
            "order is pending, expected completed"
        );
    }

    #[test]
    fn errors_are_cloneable() {
        let error = CreditError::InsufficientCredits;
        let cloned = error.clone();
        assert_eq!(error, cloned);
    }
}
