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

//! Credit service.
//!
//! The [`CreditService`] is the only component that changes account
//! balances. Callers are account registration (signup grant), the conversion
//! pipeline (usage debit and compensation), the payment webhook (purchase
//! and refund) and admin tools (adjustments, deactivation).
//!
//! # Atomicity
//!
//! Every operation runs under the target account's lock and follows the
//! same sequence:
//!
//! 1. build a [`LedgerMutation`] and validate it against the current balance,
//! 2. append the resulting [`LedgerEntry`] to the [`LedgerStore`],
//! 3. settle the new balance (and order status) in memory.
//!
//! If step 2 fails nothing else happens, so the balance and the ledger never
//! diverge.
//!
//! # Thread Safety
//!
//! Accounts live in a [`DashMap`]; the per-account mutex serializes
//! operations on one account while different accounts proceed in parallel.
//! Locks are always taken account first, then the order map.

use crate::account::{Account, AccountData, AccountSnapshot};
use crate::base::{AccountId, ConversionId, EntryId, OrderId};
use crate::config::{CreditPolicy, RefundPolicy, Settings};
use crate::ledger::{AuditError, AuditReport, EntryType, LedgerEntry, LedgerMutation, audit};
use crate::order::{Order, OrderStatus, Package, default_catalog};
use crate::registry::EventRegistry;
use crate::store::{AccountStatus, LedgerStore, MemoryStore};
use crate::CreditError;
use dashmap::DashMap;
use rust_decimal::Decimal;
use serde::Serialize;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use tracing::{debug, error, info, warn};

/// Result of an idempotent operation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome<T> {
    /// The operation took effect.
    Applied(T),
    /// The operation had already taken effect; nothing changed.
    Duplicate,
}

impl<T> Outcome<T> {
    pub fn is_duplicate(&self) -> bool {
        matches!(self, Self::Duplicate)
    }

    pub fn applied(self) -> Option<T> {
        match self {
            Self::Applied(value) => Some(value),
            Self::Duplicate => None,
        }
    }
}

/// What a refund actually clawed back.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RefundReceipt {
    pub order: OrderId,
    /// Credits the order granted.
    pub requested: Decimal,
    /// Credits removed from the account.
    pub clawed_back: Decimal,
    /// Credits that could not be removed because they were already spent.
    pub shortfall: Decimal,
    /// The refund entry, absent when nothing could be clawed back.
    pub entry: Option<LedgerEntry>,
}

/// A conversion that was paid for, and what it cost.
#[derive(Debug, Clone, Copy)]
struct ConversionCharge {
    account: AccountId,
    credits: Decimal,
}

/// Credit service managing accounts, orders and the ledger.
///
/// # Invariants
///
/// - `credits_remaining` is never negative.
/// - Every balance change has exactly one ledger entry, and the entries of an
///   account form a running sum ending at `credits_remaining`.
/// - An order credits its account at most once and is refunded at most once.
pub struct CreditService<S: LedgerStore = MemoryStore> {
    /// Accounts indexed by ID.
    accounts: DashMap<AccountId, Account>,
    /// Orders indexed by ID.
    orders: DashMap<OrderId, Order>,
    /// Charged conversions.
    conversions: DashMap<ConversionId, ConversionCharge>,
    /// Conversions whose failed usage was already given back.
    compensations: EventRegistry<ConversionId>,
    store: S,
    policy: CreditPolicy,
    catalog: Vec<Package>,
    next_entry: AtomicU64,
    next_order: AtomicU32,
}

impl CreditService<MemoryStore> {
    /// Creates a service with an in-memory store and the default policy.
    pub fn new() -> Self {
        Self::with_store(MemoryStore::new(), CreditPolicy::default())
    }
}

impl Default for CreditService<MemoryStore> {
    fn default() -> Self {
        Self::new()
    }
}

impl<S: LedgerStore> CreditService<S> {
    pub fn with_store(store: S, policy: CreditPolicy) -> Self {
        Self {
            accounts: DashMap::new(),
            orders: DashMap::new(),
            conversions: DashMap::new(),
            compensations: EventRegistry::new(),
            store,
            policy,
            catalog: default_catalog(),
            next_entry: AtomicU64::new(1),
            next_order: AtomicU32::new(1),
        }
    }

    pub fn from_settings(store: S, settings: &Settings) -> Self {
        Self::with_store(store, settings.credits.clone()).with_catalog(settings.packages.clone())
    }

    pub fn with_catalog(mut self, catalog: Vec<Package>) -> Self {
        self.catalog = catalog;
        self
    }

    /// Rebuilds accounts from the records already in `store`.
    ///
    /// Balances, account status, charged and compensated conversions and the
    /// ID counters are restored. Orders are not part of the ledger and start
    /// empty; new order IDs continue after the highest one any entry names.
    ///
    /// # Errors
    ///
    /// Returns an [`AuditError`] if any account's stored entries do not form
    /// a consistent running sum.
    pub fn recover(store: S, policy: CreditPolicy) -> Result<Self, AuditError> {
        let service = Self::with_store(store, policy);
        let mut next_entry: u64 = 1;
        let mut next_order: u32 = 1;

        for id in service.store.accounts() {
            let entries = service.store.entries(id);
            let report = audit(id, &entries, None)?;

            for entry in &entries {
                next_entry = next_entry.max(entry.id.0.saturating_add(1));
                if let Some(order) = entry.order {
                    next_order = next_order.max(order.0.saturating_add(1));
                }
                match (entry.conversion, entry.entry_type) {
                    (Some(conversion), EntryType::Usage) => {
                        service.conversions.insert(
                            conversion,
                            ConversionCharge {
                                account: id,
                                credits: -entry.amount,
                            },
                        );
                    }
                    (Some(conversion), EntryType::Refund) => {
                        service.compensations.mark_done(conversion, entry.created_at);
                    }
                    _ => {}
                }
            }
            service
                .accounts
                .insert(id, Account::with_balance(id, report.balance));
        }

        for status in service.store.statuses() {
            let account = service
                .accounts
                .entry(status.account)
                .or_insert_with(|| Account::new(status.account));
            if !status.active {
                account.lock().deactivate();
            }
        }

        service.next_entry.store(next_entry, Ordering::SeqCst);
        service.next_order.store(next_order, Ordering::SeqCst);
        info!(
            accounts = service.accounts.len(),
            entries = service.store.len(),
            next_order,
            "recovered accounts from ledger"
        );
        Ok(service)
    }

    // === Accounts ===

    /// Registers an account and grants the signup bonus.
    ///
    /// Returns the bonus entry, or `None` when the policy grants nothing.
    ///
    /// # Errors
    ///
    /// - [`CreditError::AccountExists`] - The ID is already registered.
    /// - [`CreditError::PersistenceFailure`] - The grant could not be stored;
    ///   the account is not created.
    pub fn open_account(&self, id: AccountId) -> Result<Option<LedgerEntry>, CreditError> {
        use dashmap::mapref::entry::Entry;

        let Entry::Vacant(slot) = self.accounts.entry(id) else {
            return Err(CreditError::AccountExists);
        };

        let account = Account::new(id);
        let grant = if self.policy.signup_grant > Decimal::ZERO {
            let mutation =
                LedgerMutation::credit(id, self.policy.signup_grant, EntryType::Bonus, "Signup bonus")?;
            let mut data = account.lock();
            Some(self.commit(&mut data, mutation)?)
        } else {
            self.store.record_status(&AccountStatus::new(id, true))?;
            None
        };

        slot.insert(account);
        info!(account = %id, "account opened");
        Ok(grant)
    }

    /// Soft-deactivates an account. Its history is kept.
    ///
    /// # Errors
    ///
    /// - [`CreditError::AccountNotFound`].
    /// - [`CreditError::PersistenceFailure`] - The account stays active.
    pub fn deactivate_account(&self, id: AccountId) -> Result<(), CreditError> {
        self.with_account(id, |data| {
            if !data.is_active() {
                return Ok(());
            }
            self.store.record_status(&AccountStatus::inactive(id))?;
            data.deactivate();
            info!(account = %id, "account deactivated");
            Ok(())
        })
    }

    /// Retrieves an account by ID.
    pub fn get_account(
        &self,
        id: &AccountId,
    ) -> Option<dashmap::mapref::one::Ref<'_, AccountId, Account>> {
        self.accounts.get(id)
    }

    /// Returns an iterator over all accounts.
    pub fn accounts(
        &self,
    ) -> impl Iterator<Item = dashmap::mapref::multiple::RefMulti<'_, AccountId, Account>> {
        self.accounts.iter()
    }

    pub fn snapshot(&self, id: AccountId) -> Option<AccountSnapshot> {
        self.accounts.get(&id).map(|account| account.snapshot())
    }

    pub fn balance(&self, id: AccountId) -> Result<Decimal, CreditError> {
        self.accounts
            .get(&id)
            .map(|account| account.credits_remaining())
            .ok_or(CreditError::AccountNotFound)
    }

    /// Whether the account can pay for `amount`. Unknown accounts cannot.
    pub fn has_credits(&self, id: AccountId, amount: Decimal) -> bool {
        self.accounts
            .get(&id)
            .is_some_and(|account| account.is_active() && account.has_credits(amount))
    }

    // === Balance changes ===

    /// Adds credits: a `purchase` entry when tied to an order, a `bonus`
    /// entry otherwise.
    ///
    /// # Errors
    ///
    /// - [`CreditError::InvalidAmount`] - `amount` is not positive.
    /// - [`CreditError::AccountNotFound`] / [`CreditError::AccountInactive`].
    /// - [`CreditError::PersistenceFailure`] - Nothing was changed.
    pub fn add_credits(
        &self,
        id: AccountId,
        amount: Decimal,
        description: &str,
        order: Option<OrderId>,
    ) -> Result<LedgerEntry, CreditError> {
        let entry_type = if order.is_some() {
            EntryType::Purchase
        } else {
            EntryType::Bonus
        };
        let mut mutation = LedgerMutation::credit(id, amount, entry_type, description)?;
        if let Some(order) = order {
            mutation = mutation.with_order(order);
        }

        self.with_account(id, |data| {
            data.ensure_active()?;
            self.commit(data, mutation)
        })
    }

    /// Applies a signed admin adjustment.
    ///
    /// # Errors
    ///
    /// - [`CreditError::InvalidAmount`] - `amount` is zero.
    /// - [`CreditError::InsufficientCredits`] - A negative adjustment exceeds
    ///   the balance.
    pub fn adjust_credits(
        &self,
        id: AccountId,
        amount: Decimal,
        description: &str,
    ) -> Result<LedgerEntry, CreditError> {
        let mutation = LedgerMutation::signed(id, amount, EntryType::Adjustment, description)?;
        self.with_account(id, |data| {
            data.ensure_active()?;
            self.commit(data, mutation)
        })
    }

    /// Deducts credits for usage.
    ///
    /// # Errors
    ///
    /// - [`CreditError::InvalidAmount`] - `amount` is not positive.
    /// - [`CreditError::InsufficientCredits`] - Balance is below `amount`;
    ///   nothing changes.
    pub fn deduct_credits(
        &self,
        id: AccountId,
        amount: Decimal,
        description: &str,
    ) -> Result<LedgerEntry, CreditError> {
        let mutation = LedgerMutation::debit(id, amount, EntryType::Usage, description)?;
        self.with_account(id, |data| {
            data.ensure_active()?;
            self.commit(data, mutation)
        })
    }

    /// Charges the policy's per-conversion price for one conversion attempt.
    ///
    /// # Errors
    ///
    /// - [`CreditError::DuplicateEvent`] - The conversion was already charged.
    /// - [`CreditError::InsufficientCredits`] - Nothing changes.
    /// - [`CreditError::AccountNotFound`] / [`CreditError::AccountInactive`].
    pub fn charge_conversion(
        &self,
        id: AccountId,
        conversion: ConversionId,
    ) -> Result<LedgerEntry, CreditError> {
        use dashmap::mapref::entry::Entry;

        let credits = self.policy.credits_per_conversion;
        let mutation = LedgerMutation::debit(
            id,
            credits,
            EntryType::Usage,
            format!("Conversion {conversion}"),
        )?
        .with_conversion(conversion);

        self.with_account(id, |data| {
            data.ensure_active()?;
            let Entry::Vacant(slot) = self.conversions.entry(conversion) else {
                warn!(account = %id, %conversion, "conversion already charged");
                return Err(CreditError::DuplicateEvent);
            };
            let entry = self.commit(data, mutation)?;
            slot.insert(ConversionCharge {
                account: id,
                credits,
            });
            Ok(entry)
        })
    }

    /// Gives back the credit of a conversion that failed after it was paid for.
    ///
    /// Only a conversion charged to this account through
    /// [`charge_conversion`](Self::charge_conversion) can be compensated, and
    /// it gets back what it was charged. At most one compensation is applied
    /// per conversion; later calls return [`Outcome::Duplicate`].
    ///
    /// # Errors
    ///
    /// - [`CreditError::ConversionNotFound`] - The conversion was never
    ///   charged to this account.
    /// - [`CreditError::AccountNotFound`] / [`CreditError::AccountInactive`].
    /// - [`CreditError::PersistenceFailure`] - A retry can still compensate.
    pub fn compensate_failed_usage(
        &self,
        id: AccountId,
        conversion: ConversionId,
        description: &str,
    ) -> Result<Outcome<LedgerEntry>, CreditError> {
        self.with_account(id, |data| {
            data.ensure_active()?;
            let Some(credits) = self
                .conversions
                .get(&conversion)
                .filter(|charge| charge.account == id)
                .map(|charge| charge.credits)
            else {
                warn!(account = %id, %conversion, "compensation for uncharged conversion");
                return Err(CreditError::ConversionNotFound);
            };
            let mutation = LedgerMutation::credit(id, credits, EntryType::Refund, description)?
                .with_conversion(conversion);

            match self.compensations.claim(&conversion) {
                Ok(()) => {}
                Err(CreditError::DuplicateEvent) => {
                    debug!(account = %id, %conversion, "conversion already compensated");
                    return Ok(Outcome::Duplicate);
                }
                Err(e) => return Err(e),
            }
            match self.commit(data, mutation) {
                Ok(entry) => {
                    self.compensations.complete(&conversion);
                    Ok(Outcome::Applied(entry))
                }
                Err(e) => {
                    self.compensations.release(&conversion);
                    Err(e)
                }
            }
        })
    }

    // === Orders ===

    /// Creates a pending order for a catalog package.
    ///
    /// # Errors
    ///
    /// - [`CreditError::PackageNotFound`] - Unknown package code.
    /// - [`CreditError::AccountNotFound`] / [`CreditError::AccountInactive`].
    pub fn checkout(&self, id: AccountId, package_code: &str) -> Result<Order, CreditError> {
        let package = self
            .catalog
            .iter()
            .find(|p| p.code == package_code)
            .ok_or(CreditError::PackageNotFound)?;

        self.with_account(id, |data| {
            data.ensure_active()?;
            let order_id = OrderId(self.next_order.fetch_add(1, Ordering::SeqCst));
            let order = Order::pending(order_id, id, package);
            self.orders.insert(order_id, order.clone());
            info!(account = %id, order = %order_id, package = %package.code, "order created");
            Ok(order)
        })
    }

    /// Marks a pending order paid and credits its account.
    ///
    /// A second completion of the same order returns [`Outcome::Duplicate`]
    /// without crediting again.
    ///
    /// # Errors
    ///
    /// - [`CreditError::OrderNotFound`].
    /// - [`CreditError::InvalidOrderState`] - The order failed or was refunded.
    /// - [`CreditError::AccountInactive`].
    /// - [`CreditError::PersistenceFailure`] - The order stays pending.
    pub fn complete_order(
        &self,
        order_id: OrderId,
        payment_id: &str,
    ) -> Result<Outcome<LedgerEntry>, CreditError> {
        let id = self.order_account(order_id)?;

        self.with_account(id, |data| {
            let mut order = self
                .orders
                .get_mut(&order_id)
                .ok_or(CreditError::OrderNotFound)?;
            if order.status == OrderStatus::Completed {
                debug!(order = %order_id, "order already completed");
                return Ok(Outcome::Duplicate);
            }
            data.ensure_active()?;

            let mut updated = order.clone();
            updated.transition(OrderStatus::Pending, OrderStatus::Completed)?;
            updated.payment_id = Some(payment_id.to_string());

            let mutation = LedgerMutation::credit(
                id,
                order.credits_purchased,
                EntryType::Purchase,
                format!("Purchase: {}", order.package_code),
            )?
            .with_order(order_id);
            let entry = self.commit(data, mutation)?;

            *order = updated;
            info!(account = %id, order = %order_id, credits = %entry.amount, "order completed");
            Ok(Outcome::Applied(entry))
        })
    }

    /// Marks a pending order as failed. No credits move.
    pub fn fail_order(&self, order_id: OrderId) -> Result<Outcome<Order>, CreditError> {
        let id = self.order_account(order_id)?;

        self.with_account(id, |_| {
            let mut order = self
                .orders
                .get_mut(&order_id)
                .ok_or(CreditError::OrderNotFound)?;
            if order.status == OrderStatus::Failed {
                return Ok(Outcome::Duplicate);
            }
            order.transition(OrderStatus::Pending, OrderStatus::Failed)?;
            warn!(account = %id, order = %order_id, "order payment failed");
            Ok(Outcome::Applied(order.clone()))
        })
    }

    /// Refunds a completed order, clawing its credits back.
    ///
    /// Under [`RefundPolicy::Clamp`] the clawback is capped at the current
    /// balance and the rest is reported as `shortfall`; under
    /// [`RefundPolicy::Strict`] an uncovered refund fails. Refunding an
    /// already refunded order returns [`Outcome::Duplicate`].
    ///
    /// # Errors
    ///
    /// - [`CreditError::OrderNotFound`].
    /// - [`CreditError::InvalidOrderState`] - The order is pending or failed.
    /// - [`CreditError::InsufficientCredits`] - Strict policy only.
    /// - [`CreditError::PersistenceFailure`] - The order stays completed.
    pub fn process_refund(&self, order_id: OrderId) -> Result<Outcome<RefundReceipt>, CreditError> {
        let id = self.order_account(order_id)?;

        self.with_account(id, |data| {
            let mut order = self
                .orders
                .get_mut(&order_id)
                .ok_or(CreditError::OrderNotFound)?;
            if order.status == OrderStatus::Refunded {
                debug!(order = %order_id, "order already refunded");
                return Ok(Outcome::Duplicate);
            }

            let mut updated = order.clone();
            updated.transition(OrderStatus::Completed, OrderStatus::Refunded)?;

            let requested = order.credits_purchased;
            let balance = data.balance();
            let clawed_back = match self.policy.refund_policy {
                RefundPolicy::Clamp => requested.min(balance),
                RefundPolicy::Strict if balance < requested => {
                    warn!(account = %id, order = %order_id, %balance, %requested, "refund exceeds balance");
                    return Err(CreditError::InsufficientCredits);
                }
                RefundPolicy::Strict => requested,
            };
            let shortfall = requested - clawed_back;

            let entry = if clawed_back > Decimal::ZERO {
                let mutation = LedgerMutation::debit(
                    id,
                    clawed_back,
                    EntryType::Refund,
                    format!("Refund: {}", order.package_code),
                )?
                .with_order(order_id);
                Some(self.commit(data, mutation)?)
            } else {
                None
            };

            *order = updated;
            if shortfall > Decimal::ZERO {
                warn!(account = %id, order = %order_id, %shortfall, "refund clawback capped at balance");
            }
            info!(account = %id, order = %order_id, %clawed_back, "order refunded");

            Ok(Outcome::Applied(RefundReceipt {
                order: order_id,
                requested,
                clawed_back,
                shortfall,
                entry,
            }))
        })
    }

    pub fn order(&self, order_id: OrderId) -> Option<Order> {
        self.orders.get(&order_id).map(|order| order.value().clone())
    }

    /// Orders placed by one account, oldest first.
    pub fn orders_for(&self, id: AccountId) -> Vec<Order> {
        let mut orders: Vec<Order> = self
            .orders
            .iter()
            .filter(|order| order.account == id)
            .map(|order| order.value().clone())
            .collect();
        orders.sort_by_key(|order| order.id);
        orders
    }

    // === Ledger ===

    /// One account's ledger entries in creation order.
    pub fn entries(&self, id: AccountId) -> Vec<LedgerEntry> {
        let mut entries = self.store.entries(id);
        entries.sort_by_key(|entry| entry.id);
        entries
    }

    /// Replays an account's ledger and checks it against the balance.
    ///
    /// The account is locked while its entries are read, so the check sees a
    /// consistent pair.
    pub fn audit(&self, id: AccountId) -> Result<AuditReport, AuditError> {
        let account = self
            .accounts
            .get(&id)
            .ok_or(AuditError::UnknownAccount(id))?;
        let data = account.lock();
        audit(id, &self.store.entries(id), Some(data.balance()))
    }

    pub fn policy(&self) -> &CreditPolicy {
        &self.policy
    }

    pub fn catalog(&self) -> &[Package] {
        &self.catalog
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    // === Internals ===

    fn order_account(&self, order_id: OrderId) -> Result<AccountId, CreditError> {
        self.orders
            .get(&order_id)
            .map(|order| order.account)
            .ok_or(CreditError::OrderNotFound)
    }

    fn with_account<T>(
        &self,
        id: AccountId,
        f: impl FnOnce(&mut AccountData) -> Result<T, CreditError>,
    ) -> Result<T, CreditError> {
        let account = self.accounts.get(&id).ok_or(CreditError::AccountNotFound)?;
        let mut data = account.lock();
        f(&mut data)
    }

    fn next_entry_id(&self) -> EntryId {
        EntryId(self.next_entry.fetch_add(1, Ordering::SeqCst))
    }

    /// Validates, persists and settles one mutation. Caller holds the account lock.
    fn commit(
        &self,
        data: &mut AccountData,
        mutation: LedgerMutation,
    ) -> Result<LedgerEntry, CreditError> {
        let balance_after = data.preview(&mutation).inspect_err(|e| {
            warn!(account = %data.id(), amount = %mutation.amount, error = %e, "ledger mutation rejected");
        })?;

        let entry = LedgerEntry::from_mutation(self.next_entry_id(), mutation, balance_after);
        if let Err(e) = self.store.append(&entry) {
            error!(account = %entry.account, entry = %entry.id, error = %e, "ledger append failed");
            return Err(e);
        }

        data.settle(balance_after);
        info!(
            account = %entry.account,
            entry = %entry.id,
            kind = %entry.entry_type,
            amount = %entry.amount,
            balance = %balance_after,
            "ledger entry committed"
        );
        Ok(entry)
    }
}
