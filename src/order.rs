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

//! Credit package orders.
//!
//! Orders follow a state machine:
//!
//! ```text
//! Pending ──payment confirmed──► Completed ──refund──► Refunded
//!    │
//!    └──payment failed/expired──► Failed
//! ```
//!
//! Only the completion and refund transitions touch the ledger; the
//! service performs them under the owning account's lock.

use crate::CreditError;
use crate::base::{AccountId, OrderId};
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OrderStatus {
    Pending,
    Completed,
    Failed,
    Refunded,
}

impl fmt::Display for OrderStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Pending => "pending",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Refunded => "refunded",
        };
        f.write_str(name)
    }
}

/// A purchasable bundle of credits.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Package {
    pub code: String,
    pub name: String,
    /// Price in the order currency.
    pub price: Decimal,
    pub credits: Decimal,
}

impl Package {
    pub fn new(code: &str, name: &str, price: Decimal, credits: Decimal) -> Self {
        Self {
            code: code.to_string(),
            name: name.to_string(),
            price,
            credits,
        }
    }
}

/// Packages offered when the configuration does not list any.
pub fn default_catalog() -> Vec<Package> {
    vec![
        Package::new("starter_pack", "Starter Pack", dec!(1.99), dec!(2.00)),
        Package::new("pro_pack", "Pro Pack", dec!(2.49), dec!(3.00)),
        Package::new("bulk_pack", "Bulk Pack", dec!(7.99), dec!(10.00)),
    ]
}

/// A purchase of one credit package.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Order {
    pub id: OrderId,
    pub account: AccountId,
    pub package_code: String,
    /// Money charged for the package.
    pub amount: Decimal,
    pub currency: String,
    pub credits_purchased: Decimal,
    pub status: OrderStatus,
    /// Payment processor transaction ID, set on completion.
    pub payment_id: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Order {
    pub const CURRENCY: &'static str = "USD";

    pub fn pending(id: OrderId, account: AccountId, package: &Package) -> Self {
        let now = Utc::now();
        Self {
            id,
            account,
            package_code: package.code.clone(),
            amount: package.price,
            currency: Self::CURRENCY.to_string(),
            credits_purchased: package.credits,
            status: OrderStatus::Pending,
            payment_id: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// Fails with [`CreditError::InvalidOrderState`] unless the order is in `expected`.
    pub fn require(&self, expected: OrderStatus) -> Result<(), CreditError> {
        if self.status != expected {
            return Err(CreditError::InvalidOrderState {
                expected,
                actual: self.status,
            });
        }
        Ok(())
    }

    pub(crate) fn transition(&mut self, from: OrderStatus, to: OrderStatus) -> Result<(), CreditError> {
        self.require(from)?;
        self.status = to;
        self.updated_at = Utc::now();
        Ok(())
    }
}
