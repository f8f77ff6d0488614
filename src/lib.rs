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

//! # Credit Ledger
//!
//! This library keeps prepaid credit balances for users of a metered
//! service: a signup grant, usage debits per conversion, credit package
//! purchases confirmed by payment webhooks, and refunds.
//!
//! Every balance change is recorded as an append-only [`LedgerEntry`], and
//! an account's entries always sum to its `credits_remaining`.
//!
//! ## Core Components
//!
//! - [`CreditService`]: The only component that changes balances
//! - [`Account`]: Per-account balance behind a mutex
//! - [`LedgerEntry`] / [`LedgerMutation`]: Audit records and the validated requests producing them
//! - [`Order`] / [`Package`]: Credit package purchases and their lifecycle
//! - [`LedgerStore`]: Append-only persistence ([`MemoryStore`], [`JournalStore`])
//! - [`WebhookHandler`]: Signed, idempotent payment gateway events
//! - [`CreditError`]: Error types for credit operations
//!
//! ## Example
//!
//! ```
//! use credit_ledger::{AccountId, CreditService, CreditError};
//! use rust_decimal_macros::dec;
//!
//! let service = CreditService::new();
//!
//! // Signup grants 3 credits
//! service.open_account(AccountId(1)).unwrap();
//!
//! // One conversion costs one credit
//! service.deduct_credits(AccountId(1), dec!(1.00), "Conversion").unwrap();
//! assert_eq!(service.balance(AccountId(1)).unwrap(), dec!(2.00));
//!
//! // Overdrafts are rejected and change nothing
//! let result = service.deduct_credits(AccountId(1), dec!(5.00), "Conversion");
//! assert_eq!(result, Err(CreditError::InsufficientCredits));
//! assert_eq!(service.entries(AccountId(1)).len(), 2);
//! ```
//!
//! ## Thread Safety
//!
//! Operations on one account are serialized by its lock; different accounts
//! proceed in parallel.

pub mod account;
mod base;
pub mod config;
pub mod error;
pub mod ledger;
pub mod order;
mod registry;
mod service;
pub mod store;
pub mod telemetry;
pub mod webhook;

pub use account::{Account, AccountSnapshot};
pub use base::{AccountId, ConversionId, EntryId, OrderId, PaymentEventId};
pub use config::{CreditPolicy, RefundPolicy, Settings, WebhookConfig};
pub use error::CreditError;
pub use ledger::{AuditError, AuditReport, EntryType, LedgerEntry, LedgerMutation};
pub use order::{Order, OrderStatus, Package};
pub use registry::EventRegistry;
pub use service::{CreditService, Outcome, RefundReceipt};
pub use store::{AccountStatus, JournalStore, LedgerStore, MemoryStore};
pub use webhook::{PaymentEvent, WebhookError, WebhookHandler, WebhookOutcome};
