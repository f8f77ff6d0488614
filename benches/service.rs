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

//! Benchmarks for the credit service.
//!
//! Run with: cargo bench
//!
//! Benchmarks include:
//! - Single-threaded credit and usage operations
//! - Order completion and refund
//! - Multi-threaded concurrent operations
//! - Scaling with number of accounts
//! - Webhook verification and dispatch

use chrono::Utc;
use credit_ledger::webhook::sign_payload;
use credit_ledger::{
    AccountId, ConversionId, CreditService, OrderId, WebhookConfig, WebhookHandler,
};
use criterion::{BenchmarkId, Criterion, Throughput, black_box, criterion_group, criterion_main};
use rayon::prelude::*;
use rust_decimal::Decimal;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

// =============================================================================
// Helper Functions
// =============================================================================

fn credits(cents: i64) -> Decimal {
    Decimal::new(cents, 2)
}

fn service_with_accounts(count: u32) -> CreditService {
    let service = CreditService::new();
    for id in 1..=count {
        service.open_account(AccountId(id)).unwrap();
    }
    service
}

// =============================================================================
// Single-Threaded Benchmarks
// =============================================================================

fn bench_open_account(c: &mut Criterion) {
    c.bench_function("open_account", |b| {
        b.iter(|| {
            let service = CreditService::new();
            service.open_account(black_box(AccountId(1))).unwrap();
        })
    });
}

fn bench_usage_throughput(c: &mut Criterion) {
    let mut group = c.benchmark_group("usage_throughput");

    for count in [100, 1_000, 10_000].iter() {
        group.throughput(Throughput::Elements(*count as u64));
        group.bench_with_input(BenchmarkId::from_parameter(count), count, |b, &count| {
            b.iter(|| {
                let service = service_with_accounts(1);
                service
                    .add_credits(AccountId(1), credits(count * 100), "Top-up", None)
                    .unwrap();
                for i in 0..count {
                    service
                        .charge_conversion(AccountId(1), ConversionId(i as u64))
                        .unwrap();
                }
                black_box(&service);
            })
        });
    }
    group.finish();
}

fn bench_mixed_operations(c: &mut Criterion) {
    let mut group = c.benchmark_group("mixed_operations");

    for count in [100, 1_000, 10_000].iter() {
        group.throughput(Throughput::Elements(*count as u64));
        group.bench_with_input(BenchmarkId::from_parameter(count), count, |b, &count| {
            b.iter(|| {
                let service = service_with_accounts(1);
                for i in 0..count {
                    service
                        .add_credits(AccountId(1), credits(200), "Promo", None)
                        .unwrap();
                    let _ = service.deduct_credits(AccountId(1), credits(150), "Usage");
                    if i % 10 == 0 {
                        let conversion = ConversionId(i as u64);
                        if service.charge_conversion(AccountId(1), conversion).is_ok() {
                            let _ = service.compensate_failed_usage(
                                AccountId(1),
                                conversion,
                                "Conversion failed",
                            );
                        }
                    }
                }
                black_box(&service);
            })
        });
    }
    group.finish();
}

// =============================================================================
// Order Lifecycle Benchmarks
// =============================================================================

fn bench_order_lifecycle(c: &mut Criterion) {
    let mut group = c.benchmark_group("order_lifecycle");

    group.bench_function("checkout_complete", |b| {
        let service = service_with_accounts(1);
        b.iter(|| {
            let order = service.checkout(AccountId(1), "bulk_pack").unwrap();
            service.complete_order(black_box(order.id), "pi").unwrap();
        })
    });

    group.bench_function("checkout_complete_refund", |b| {
        let service = service_with_accounts(1);
        b.iter(|| {
            let order = service.checkout(AccountId(1), "bulk_pack").unwrap();
            service.complete_order(order.id, "pi").unwrap();
            service.process_refund(black_box(order.id)).unwrap();
        })
    });

    group.finish();
}

// =============================================================================
// Multi-Threaded Benchmarks
// =============================================================================

fn bench_parallel_usage_same_account(c: &mut Criterion) {
    let mut group = c.benchmark_group("parallel_usage_same_account");

    for count in [1_000u64, 10_000, 100_000].iter() {
        group.throughput(Throughput::Elements(*count));
        group.bench_with_input(BenchmarkId::from_parameter(count), count, |b, &count| {
            b.iter(|| {
                let service = Arc::new(service_with_accounts(1));
                service
                    .add_credits(AccountId(1), credits(count as i64 * 100), "Top-up", None)
                    .unwrap();

                (0..count).into_par_iter().for_each(|i| {
                    let _ = service.charge_conversion(AccountId(1), ConversionId(i));
                });

                black_box(&service);
            })
        });
    }
    group.finish();
}

fn bench_parallel_usage_different_accounts(c: &mut Criterion) {
    let mut group = c.benchmark_group("parallel_usage_different_accounts");
    const ACCOUNTS: u32 = 1_000;

    for count in [1_000u32, 10_000, 100_000].iter() {
        group.throughput(Throughput::Elements(*count as u64));
        group.bench_with_input(BenchmarkId::from_parameter(count), count, |b, &count| {
            b.iter(|| {
                let service = Arc::new(service_with_accounts(ACCOUNTS));

                (0..count).into_par_iter().for_each(|i| {
                    let id = AccountId(i % ACCOUNTS + 1);
                    service.add_credits(id, credits(100), "Promo", None).unwrap();
                    service.deduct_credits(id, credits(100), "Usage").unwrap();
                });

                black_box(&service);
            })
        });
    }
    group.finish();
}

fn bench_parallel_webhooks(c: &mut Criterion) {
    const SECRET: &str = "whsec_bench";
    let mut group = c.benchmark_group("parallel_webhooks");

    for count in [100u32, 1_000].iter() {
        group.throughput(Throughput::Elements(*count as u64));
        group.bench_with_input(BenchmarkId::from_parameter(count), count, |b, &count| {
            b.iter_batched(
                || {
                    let service = Arc::new(service_with_accounts(10));
                    let payloads: Vec<(Vec<u8>, String)> = (0..count)
                        .map(|i| {
                            let order = service.checkout(AccountId(i % 10 + 1), "pro_pack").unwrap();
                            let payload = format!(
                                r#"{{"id":"evt_{i}","type":"checkout.session.completed","data":{{"object":{{"metadata":{{"order_id":"{}"}}}}}}}}"#,
                                order.id
                            )
                            .into_bytes();
                            let signature =
                                sign_payload(SECRET, Utc::now().timestamp(), &payload).unwrap();
                            (payload, signature)
                        })
                        .collect();
                    let handler = WebhookHandler::new(
                        service,
                        WebhookConfig {
                            secret: SECRET.to_string(),
                            ..WebhookConfig::default()
                        },
                    );
                    (handler, payloads)
                },
                |(handler, payloads)| {
                    payloads.par_iter().for_each(|(payload, signature)| {
                        handler.handle(payload, signature).unwrap();
                    });
                },
                criterion::BatchSize::SmallInput,
            )
        });
    }
    group.finish();
}

// =============================================================================
// Scaling Benchmarks
// =============================================================================

fn bench_thread_scaling(c: &mut Criterion) {
    let mut group = c.benchmark_group("thread_scaling");
    let total_operations = 100_000u32;

    for num_threads in [1, 2, 4, 8].iter() {
        group.throughput(Throughput::Elements(total_operations as u64));
        group.bench_with_input(
            BenchmarkId::from_parameter(num_threads),
            num_threads,
            |b, &num_threads| {
                let pool = rayon::ThreadPoolBuilder::new()
                    .num_threads(num_threads)
                    .build()
                    .unwrap();

                b.iter(|| {
                    let service = Arc::new(service_with_accounts(1_000));

                    pool.install(|| {
                        (0..total_operations).into_par_iter().for_each(|i| {
                            let id = AccountId(i % 1_000 + 1);
                            service.add_credits(id, credits(100), "Promo", None).unwrap();
                        });
                    });

                    black_box(&service);
                })
            },
        );
    }
    group.finish();
}

fn bench_contention(c: &mut Criterion) {
    let mut group = c.benchmark_group("contention");
    let total_ops = 10_000u64;

    // Fewer accounts = more threads competing for the same lock
    for num_accounts in [1u32, 10, 100, 1_000].iter() {
        group.throughput(Throughput::Elements(total_ops));
        group.bench_with_input(
            BenchmarkId::new("accounts", num_accounts),
            num_accounts,
            |b, &num_accounts| {
                b.iter(|| {
                    let service = Arc::new(service_with_accounts(num_accounts));
                    let conversions = AtomicU64::new(0);

                    (0..total_ops).into_par_iter().for_each(|i| {
                        let id = AccountId((i % num_accounts as u64) as u32 + 1);
                        service.add_credits(id, credits(100), "Promo", None).unwrap();
                        let conversion = ConversionId(conversions.fetch_add(1, Ordering::Relaxed));
                        service.charge_conversion(id, conversion).unwrap();
                    });

                    black_box(&service);
                })
            },
        );
    }
    group.finish();
}

// =============================================================================
// Ledger History Benchmarks
// =============================================================================

fn bench_ledger_history(c: &mut Criterion) {
    let mut group = c.benchmark_group("ledger_history");

    // How appends and audits behave as an account's ledger grows
    for history_size in [100, 1_000, 10_000].iter() {
        group.bench_with_input(
            BenchmarkId::new("append", history_size),
            history_size,
            |b, &history_size| {
                b.iter_batched(
                    || {
                        let service = service_with_accounts(1);
                        for _ in 0..history_size {
                            service
                                .add_credits(AccountId(1), credits(100), "Promo", None)
                                .unwrap();
                        }
                        service
                    },
                    |service| {
                        service
                            .deduct_credits(AccountId(1), black_box(credits(100)), "Usage")
                            .unwrap();
                    },
                    criterion::BatchSize::SmallInput,
                )
            },
        );

        group.bench_with_input(
            BenchmarkId::new("audit", history_size),
            history_size,
            |b, &history_size| {
                let service = service_with_accounts(1);
                for _ in 0..history_size {
                    service
                        .add_credits(AccountId(1), credits(100), "Promo", None)
                        .unwrap();
                }
                b.iter(|| service.audit(black_box(AccountId(1))).unwrap())
            },
        );
    }
    group.finish();
}

fn bench_order_lookup(c: &mut Criterion) {
    let service = service_with_accounts(1);
    for _ in 0..1_000 {
        service.checkout(AccountId(1), "starter_pack").unwrap();
    }
    c.bench_function("order_lookup", |b| {
        b.iter(|| service.order(black_box(OrderId(500))).unwrap())
    });
}

// =============================================================================
// Criterion Groups
// =============================================================================

criterion_group!(
    single_threaded,
    bench_open_account,
    bench_usage_throughput,
    bench_mixed_operations,
);

criterion_group!(orders, bench_order_lifecycle, bench_order_lookup,);

criterion_group!(
    multi_threaded,
    bench_parallel_usage_same_account,
    bench_parallel_usage_different_accounts,
    bench_parallel_webhooks,
);

criterion_group!(scaling, bench_thread_scaling, bench_contention,);

criterion_group!(memory, bench_ledger_history,);

criterion_main!(single_threaded, orders, multi_threaded, scaling, memory);
