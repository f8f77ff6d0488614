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

//! Ledger persistence.
//!
//! The [`LedgerStore`] trait is the append-only record of ledger entries and
//! of account status changes. [`MemoryStore`] keeps both in process memory;
//! [`JournalStore`] also appends every record as a CSV row to journal files
//! and can be reopened to recover a previous run.

use crate::CreditError;
use crate::base::AccountId;
use crate::ledger::LedgerEntry;
use chrono::{DateTime, Utc};
use csv::{ReaderBuilder, WriterBuilder};
use dashmap::DashMap;
use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{debug, info};

/// A recorded change of an account's active flag.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccountStatus {
    pub account: AccountId,
    pub active: bool,
    pub changed_at: DateTime<Utc>,
}

impl AccountStatus {
    pub fn new(account: AccountId, active: bool) -> Self {
        Self {
            account,
            active,
            changed_at: Utc::now(),
        }
    }

    pub fn inactive(account: AccountId) -> Self {
        Self::new(account, false)
    }
}

/// Append-only storage for ledger entries and account status changes.
///
/// Writes must be all-or-nothing: when one returns an error the record is
/// not visible to later reads.
pub trait LedgerStore: Send + Sync {
    /// Persists one entry.
    ///
    /// # Errors
    ///
    /// Returns [`CreditError::PersistenceFailure`] if the entry could not be stored.
    fn append(&self, entry: &LedgerEntry) -> Result<(), CreditError>;

    /// Returns one account's entries in append order.
    fn entries(&self, account: AccountId) -> Vec<LedgerEntry>;

    /// Returns every account that has at least one entry.
    fn accounts(&self) -> Vec<AccountId>;

    /// Total number of stored entries.
    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Persists a change of an account's active flag.
    ///
    /// # Errors
    ///
    /// Returns [`CreditError::PersistenceFailure`] if the change could not be stored.
    fn record_status(&self, status: &AccountStatus) -> Result<(), CreditError>;

    /// Latest recorded status of every account that has one, by account ID.
    fn statuses(&self) -> Vec<AccountStatus>;
}

/// In-memory ledger store.
#[derive(Debug, Default)]
pub struct MemoryStore {
    entries: DashMap<AccountId, Vec<LedgerEntry>>,
    statuses: DashMap<AccountId, AccountStatus>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn load(entries: Vec<LedgerEntry>, statuses: Vec<AccountStatus>) -> Self {
        let store = Self::new();
        for entry in entries {
            store.entries.entry(entry.account).or_default().push(entry);
        }
        for status in statuses {
            store.statuses.insert(status.account, status);
        }
        store
    }
}

impl LedgerStore for MemoryStore {
    fn append(&self, entry: &LedgerEntry) -> Result<(), CreditError> {
        self.entries
            .entry(entry.account)
            .or_default()
            .push(entry.clone());
        Ok(())
    }

    fn entries(&self, account: AccountId) -> Vec<LedgerEntry> {
        self.entries
            .get(&account)
            .map(|entries| entries.value().clone())
            .unwrap_or_default()
    }

    fn accounts(&self) -> Vec<AccountId> {
        let mut accounts: Vec<AccountId> = self.entries.iter().map(|e| *e.key()).collect();
        accounts.sort();
        accounts
    }

    fn len(&self) -> usize {
        self.entries.iter().map(|e| e.value().len()).sum()
    }

    fn record_status(&self, status: &AccountStatus) -> Result<(), CreditError> {
        self.statuses.insert(status.account, status.clone());
        Ok(())
    }

    fn statuses(&self) -> Vec<AccountStatus> {
        let mut statuses: Vec<AccountStatus> =
            self.statuses.iter().map(|s| s.value().clone()).collect();
        statuses.sort_by_key(|s| s.account);
        statuses
    }
}

/// Errors opening or reading a journal file.
#[derive(Error, Debug)]
pub enum JournalError {
    #[error("journal I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("journal format error: {0}")]
    Csv(#[from] csv::Error),
}

/// Appends CSV rows to one file, writing the header before the first row.
#[derive(Debug)]
struct CsvAppender {
    file: File,
    needs_header: bool,
}

impl CsvAppender {
    fn open(path: &Path) -> Result<Self, JournalError> {
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        let needs_header = file.metadata()?.len() == 0;
        Ok(Self { file, needs_header })
    }

    /// Encodes `record` in full, then writes and flushes it in one go.
    fn append<T: Serialize>(&mut self, record: &T) -> Result<(), CreditError> {
        let bytes = encode(record, self.needs_header)
            .map_err(|e| CreditError::PersistenceFailure(e.to_string()))?;
        self.file
            .write_all(&bytes)
            .and_then(|()| self.file.flush())
            .map_err(|e| CreditError::PersistenceFailure(e.to_string()))?;
        self.needs_header = false;
        Ok(())
    }
}

fn encode<T: Serialize>(record: &T, with_header: bool) -> Result<Vec<u8>, csv::Error> {
    let mut wtr = WriterBuilder::new()
        .has_headers(with_header)
        .from_writer(Vec::new());
    wtr.serialize(record)?;
    wtr.into_inner()
        .map_err(|e| csv::Error::from(e.into_error()))
}

/// CSV-file-backed ledger store.
///
/// Entries go to the journal file; account status changes go to a second
/// file next to it (see [`JournalStore::status_path`]). Each row is encoded
/// in full before a single write, and only added to the in-memory index once
/// that write succeeded.
///
/// # CSV Format
///
/// ```csv
/// id,account,order,conversion,amount,balance_after,type,description,created_at
/// 1,1,,,3.00,3.00,bonus,Signup bonus,2025-01-01T00:00:00Z
/// 2,1,,7,-1.00,2.00,usage,Conversion 7,2025-01-01T00:01:00Z
/// ```
#[derive(Debug)]
pub struct JournalStore {
    path: PathBuf,
    status_path: PathBuf,
    entries: Mutex<CsvAppender>,
    statuses: Mutex<CsvAppender>,
    index: MemoryStore,
}

impl JournalStore {
    /// Opens (or creates) a journal, loading any records it already holds.
    ///
    /// # Errors
    ///
    /// Returns a [`JournalError`] if a file cannot be opened or an existing
    /// row cannot be parsed.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, JournalError> {
        let path = path.as_ref().to_path_buf();
        let status_path = Self::status_path_for(&path);

        let entries = CsvAppender::open(&path)?;
        let existing = if entries.needs_header {
            Vec::new()
        } else {
            read_journal(&path)?
        };
        let statuses = CsvAppender::open(&status_path)?;
        let recorded = if statuses.needs_header {
            Vec::new()
        } else {
            read_csv(&status_path)?
        };
        info!(
            path = %path.display(),
            entries = existing.len(),
            statuses = recorded.len(),
            "opened ledger journal"
        );

        Ok(Self {
            path,
            status_path,
            entries: Mutex::new(entries),
            statuses: Mutex::new(statuses),
            index: MemoryStore::load(existing, recorded),
        })
    }

    /// Where the account status file of the journal at `path` lives.
    pub fn status_path_for(path: &Path) -> PathBuf {
        path.with_extension("accounts.csv")
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn status_path(&self) -> &Path {
        &self.status_path
    }
}

impl LedgerStore for JournalStore {
    fn append(&self, entry: &LedgerEntry) -> Result<(), CreditError> {
        self.entries.lock().append(entry)?;
        debug!(entry = %entry.id, account = %entry.account, "journaled ledger entry");
        self.index.append(entry)
    }

    fn entries(&self, account: AccountId) -> Vec<LedgerEntry> {
        self.index.entries(account)
    }

    fn accounts(&self) -> Vec<AccountId> {
        self.index.accounts()
    }

    fn len(&self) -> usize {
        self.index.len()
    }

    fn record_status(&self, status: &AccountStatus) -> Result<(), CreditError> {
        self.statuses.lock().append(status)?;
        debug!(account = %status.account, active = status.active, "journaled account status");
        self.index.record_status(status)
    }

    fn statuses(&self) -> Vec<AccountStatus> {
        self.index.statuses()
    }
}

/// Reads every entry from a journal file.
///
/// # Errors
///
/// Returns a [`JournalError`] if the file cannot be read or a row is malformed.
pub fn read_journal(path: impl AsRef<Path>) -> Result<Vec<LedgerEntry>, JournalError> {
    read_csv(path.as_ref())
}

fn read_csv<T: DeserializeOwned>(path: &Path) -> Result<Vec<T>, JournalError> {
    let mut rdr = ReaderBuilder::new()
        .has_headers(true)
        .from_reader(File::open(path)?);

    let mut records = Vec::new();
    for result in rdr.deserialize::<T>() {
        records.push(result?);
    }
    Ok(records)
}
