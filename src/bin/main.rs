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

use clap::{Parser, Subcommand};
use credit_ledger::ledger::{self, AuditError};
use credit_ledger::store::read_journal;
use credit_ledger::telemetry::init_tracing;
use credit_ledger::{
    AccountId, ConversionId, CreditError, CreditService, JournalStore, LedgerEntry, LedgerStore,
    MemoryStore, OrderId, Settings,
};
use csv::{ReaderBuilder, Trim, Writer};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs::File;
use std::io::{BufReader, Read, Write};
use std::path::PathBuf;
use std::process;
use tracing::{debug, error, warn};

/// Credit Ledger - Replay and audit credit ledgers
///
/// Replays CSV files of credit operations and verifies ledger journals.
#[derive(Parser, Debug)]
#[command(name = "credit-ledger")]
#[command(about = "A prepaid credit ledger with an auditable journal", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Apply a CSV of credit operations and print account balances
    ///
    /// Expected format: type,account,reference,amount
    /// Example: credit-ledger replay ops.csv --journal ledger.csv > accounts.csv
    Replay {
        #[arg(value_name = "FILE")]
        input: PathBuf,

        /// Journal file to append ledger entries to (recovered if it exists)
        #[arg(long, value_name = "FILE")]
        journal: Option<PathBuf>,

        /// Configuration file (YAML)
        #[arg(long, value_name = "FILE")]
        config: Option<String>,
    },

    /// Verify that every account in a journal forms a consistent running sum
    Audit {
        #[arg(value_name = "FILE")]
        journal: PathBuf,
    },
}

fn main() {
    init_tracing();
    let cli = Cli::parse();

    let code = match cli.command {
        Command::Replay {
            input,
            journal,
            config,
        } => run_replay(input, journal, config.as_deref()),
        Command::Audit { journal } => run_audit(journal),
    };
    process::exit(code);
}

fn run_replay(input: PathBuf, journal: Option<PathBuf>, config: Option<&str>) -> i32 {
    let settings = match Settings::load(config) {
        Ok(settings) => settings,
        Err(e) => {
            error!(error = %e, "failed to load configuration");
            return 1;
        }
    };

    let file = match File::open(&input) {
        Ok(f) => f,
        Err(e) => {
            error!(path = %input.display(), error = %e, "failed to open input");
            return 1;
        }
    };
    let reader = BufReader::new(file);

    let result = match journal {
        Some(path) => {
            let store = match JournalStore::open(&path) {
                Ok(store) => store,
                Err(e) => {
                    error!(path = %path.display(), error = %e, "failed to open journal");
                    return 1;
                }
            };
            let service = match CreditService::recover(store, settings.credits.clone()) {
                Ok(service) => service.with_catalog(settings.packages.clone()),
                Err(e) => {
                    error!(path = %path.display(), error = %e, "journal is inconsistent");
                    return 1;
                }
            };
            replay_and_write(&service, reader)
        }
        None => {
            let service = CreditService::from_settings(MemoryStore::new(), &settings);
            replay_and_write(&service, reader)
        }
    };

    match result {
        Ok(()) => 0,
        Err(e) => {
            error!(error = %e, "replay failed");
            1
        }
    }
}

fn replay_and_write<S: LedgerStore, R: Read>(
    service: &CreditService<S>,
    reader: R,
) -> Result<(), csv::Error> {
    process_operations(service, reader)?;
    write_accounts(service, std::io::stdout())
}

fn run_audit(journal: PathBuf) -> i32 {
    let entries = match read_journal(&journal) {
        Ok(entries) => entries,
        Err(e) => {
            error!(path = %journal.display(), error = %e, "failed to read journal");
            return 1;
        }
    };

    match audit_entries(&entries, std::io::stdout()) {
        Ok(true) => 0,
        Ok(false) => 1,
        Err(e) => {
            error!(error = %e, "failed to write audit report");
            1
        }
    }
}

/// Raw CSV record matching the operations format.
///
/// Fields: `type, account, reference, amount`
#[derive(Debug, Deserialize)]
struct CsvRecord {
    #[serde(rename = "type")]
    op_type: String,
    account: u32,
    #[serde(default)]
    reference: Option<String>,
    #[serde(default, deserialize_with = "csv::invalid_option")]
    amount: Option<Decimal>,
}

/// A single replayable credit operation.
#[derive(Debug, Clone, PartialEq, Eq)]
enum Operation {
    Open,
    Bonus(Decimal),
    Adjust(Decimal),
    Usage(Decimal),
    Convert(ConversionId),
    Compensate(ConversionId),
    Checkout(String),
    Complete(OrderId),
    Fail(OrderId),
    Refund(OrderId),
    Deactivate,
}

impl CsvRecord {
    /// Converts a CSV record to an operation.
    ///
    /// Returns `None` for unknown types or missing/unparseable fields.
    fn into_operation(self) -> Option<(AccountId, Operation)> {
        let account = AccountId(self.account);
        let reference = self.reference.filter(|r| !r.is_empty());
        let conversion = || reference.as_deref()?.parse().ok().map(ConversionId);
        let order = || reference.as_deref()?.parse().ok().map(OrderId);

        let operation = match self.op_type.to_lowercase().as_str() {
            "open" => Operation::Open,
            "bonus" => Operation::Bonus(self.amount?),
            "adjust" => Operation::Adjust(self.amount?),
            "usage" => Operation::Usage(self.amount?),
            "convert" => Operation::Convert(conversion()?),
            "compensate" => Operation::Compensate(conversion()?),
            "checkout" => Operation::Checkout(reference.clone()?),
            "complete" => Operation::Complete(order()?),
            "fail" => Operation::Fail(order()?),
            "refund" => Operation::Refund(order()?),
            "deactivate" => Operation::Deactivate,
            _ => return None,
        };
        Some((account, operation))
    }
}

fn apply<S: LedgerStore>(
    service: &CreditService<S>,
    account: AccountId,
    operation: Operation,
) -> Result<(), CreditError> {
    match operation {
        Operation::Open => service.open_account(account).map(drop),
        Operation::Bonus(amount) => service.add_credits(account, amount, "Bonus", None).map(drop),
        Operation::Adjust(amount) => service.adjust_credits(account, amount, "Adjustment").map(drop),
        Operation::Usage(amount) => service.deduct_credits(account, amount, "Usage").map(drop),
        Operation::Convert(conversion) => service.charge_conversion(account, conversion).map(drop),
        Operation::Compensate(conversion) => service
            .compensate_failed_usage(account, conversion, &format!("Conversion {conversion} failed"))
            .map(drop),
        Operation::Checkout(package) => service.checkout(account, &package).map(drop),
        Operation::Complete(order) => {
            require_owner(service, account, order)?;
            service
                .complete_order(order, &format!("replay-{order}"))
                .map(drop)
        }
        Operation::Fail(order) => {
            require_owner(service, account, order)?;
            service.fail_order(order).map(drop)
        }
        Operation::Refund(order) => {
            require_owner(service, account, order)?;
            service.process_refund(order).map(drop)
        }
        Operation::Deactivate => service.deactivate_account(account),
    }
}

/// Rejects order operations whose row names a different account.
fn require_owner<S: LedgerStore>(
    service: &CreditService<S>,
    account: AccountId,
    order: OrderId,
) -> Result<(), CreditError> {
    match service.order(order) {
        Some(o) if o.account == account => Ok(()),
        _ => Err(CreditError::OrderNotFound),
    }
}

/// Process credit operations from a CSV reader.
///
/// Rows are streamed; malformed rows and rejected operations are logged
/// and skipped.
///
/// # CSV Format
///
/// Expected columns: `type, account, reference, amount`
/// - `type`: open, bonus, adjust, usage, convert, compensate, checkout,
///   complete, fail, refund, deactivate
/// - `account`: Account ID (u32)
/// - `reference`: Conversion ID, package code or order ID depending on type
/// - `amount`: Decimal amount (bonus, adjust, usage only)
///
/// # Example
///
/// ```csv
/// type,account,reference,amount
/// open,1,,
/// convert,1,100,
/// checkout,1,bulk_pack,
/// complete,1,1,
/// ```
///
/// # Errors
///
/// Returns a CSV error if the reader fails or the CSV structure is invalid.
fn process_operations<S: LedgerStore, R: Read>(
    service: &CreditService<S>,
    reader: R,
) -> Result<(), csv::Error> {
    let mut rdr = ReaderBuilder::new()
        .trim(Trim::All)
        .flexible(true)
        .has_headers(true)
        .from_reader(reader);

    for (line, result) in rdr.deserialize::<CsvRecord>().enumerate() {
        let record = match result {
            Ok(record) => record,
            Err(e) => {
                warn!(row = line + 1, error = %e, "skipping malformed row");
                continue;
            }
        };

        let Some((account, operation)) = record.into_operation() else {
            warn!(row = line + 1, "skipping invalid operation record");
            continue;
        };

        debug!(row = line + 1, %account, ?operation, "applying operation");
        if let Err(e) = apply(service, account, operation) {
            warn!(row = line + 1, %account, error = %e, "operation rejected");
        }
    }

    Ok(())
}

/// Write account balances to a CSV writer, ordered by account ID.
///
/// # CSV Format
///
/// ```csv
/// account,credits_remaining,active
/// 1,12.00,true
/// 2,3.00,false
/// ```
fn write_accounts<S: LedgerStore, W: Write>(
    service: &CreditService<S>,
    writer: W,
) -> Result<(), csv::Error> {
    let mut wtr = Writer::from_writer(writer);

    let mut ids: Vec<AccountId> = service.accounts().map(|account| *account.key()).collect();
    ids.sort();
    for id in ids {
        if let Some(account) = service.get_account(&id) {
            wtr.serialize(account.value())?;
        }
    }

    wtr.flush()?;
    Ok(())
}

/// One row of the audit report.
#[derive(Debug, Serialize)]
struct AuditRow {
    account: AccountId,
    entries: usize,
    balance: Decimal,
    consistent: bool,
}

/// Audits every account found in `entries` and writes one row per account.
///
/// Returns `true` if every account is consistent.
fn audit_entries<W: Write>(entries: &[LedgerEntry], writer: W) -> Result<bool, csv::Error> {
    let mut by_account: BTreeMap<AccountId, Vec<LedgerEntry>> = BTreeMap::new();
    for entry in entries {
        by_account.entry(entry.account).or_default().push(entry.clone());
    }

    let mut wtr = Writer::from_writer(writer);
    let mut all_consistent = true;
    for (account, entries) in &by_account {
        let row = match ledger::audit(*account, entries, None) {
            Ok(report) => AuditRow {
                account: *account,
                entries: report.entries,
                balance: report.balance,
                consistent: true,
            },
            Err(e) => {
                warn!(%account, error = %e, "ledger inconsistency");
                all_consistent = false;
                AuditRow {
                    account: *account,
                    entries: entries.len(),
                    balance: recorded_balance(&e, entries),
                    consistent: false,
                }
            }
        };
        wtr.serialize(AuditRow {
            balance: row.balance.round_dp(2),
            ..row
        })?;
    }

    wtr.flush()?;
    Ok(all_consistent)
}

/// Balance recorded by the latest entry of an inconsistent account.
fn recorded_balance(error: &AuditError, entries: &[LedgerEntry]) -> Decimal {
    match error {
        AuditError::BalanceMismatch { account, .. } => *account,
        _ => entries
            .iter()
            .max_by_key(|e| e.id)
            .map_or(Decimal::ZERO, |e| e.balance_after),
    }
}
