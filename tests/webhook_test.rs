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

//! Payment webhook integration tests.

use chrono::Utc;
use credit_ledger::webhook::sign_payload;
use credit_ledger::{
    AccountId, CreditError, CreditService, EntryType, OrderId, OrderStatus, PaymentEvent,
    WebhookConfig, WebhookError, WebhookHandler, WebhookOutcome,
};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use std::sync::Arc;
use std::thread;

const SECRET: &str = "whsec_test_secret";

fn handler() -> WebhookHandler<credit_ledger::MemoryStore> {
    let service = Arc::new(CreditService::new());
    service.open_account(AccountId(1)).unwrap();
    WebhookHandler::new(
        service,
        WebhookConfig {
            secret: SECRET.to_string(),
            ..WebhookConfig::default()
        },
    )
}

fn event(id: &str, kind: &str, order: OrderId) -> Vec<u8> {
    serde_json::json!({
        "id": id,
        "type": kind,
        "created": 1_700_000_000,
        "data": {
            "object": {
                "id": "cs_test",
                "payment_intent": format!("pi_{id}"),
                "metadata": { "order_id": order.to_string() }
            }
        }
    })
    .to_string()
    .into_bytes()
}

fn deliver(handler: &WebhookHandler<credit_ledger::MemoryStore>, payload: &[u8]) -> Result<WebhookOutcome, WebhookError> {
    let signature = sign_payload(SECRET, Utc::now().timestamp(), payload).unwrap();
    handler.handle(payload, &signature)
}

/// Delivers like the gateway does: an attempt that lands while another
/// one for the same event is running is retried.
fn deliver_until_settled(
    handler: &WebhookHandler<credit_ledger::MemoryStore>,
    payload: &[u8],
) -> Result<WebhookOutcome, WebhookError> {
    loop {
        match deliver(handler, payload) {
            Err(WebhookError::Credit(CreditError::EventInProgress)) => thread::yield_now(),
            result => return result,
        }
    }
}

fn purchases(handler: &WebhookHandler<credit_ledger::MemoryStore>) -> usize {
    handler
        .service()
        .entries(AccountId(1))
        .iter()
        .filter(|e| e.entry_type == EntryType::Purchase)
        .count()
}

#[test]
fn completed_checkout_credits_account() {
    let handler = handler();
    let order = handler.service().checkout(AccountId(1), "bulk_pack").unwrap();

    let outcome = deliver(&handler, &event("evt_1", "checkout.session.completed", order.id)).unwrap();
    let WebhookOutcome::Credited(entry) = outcome else {
        panic!("expected a purchase entry, got {outcome:?}");
    };
    assert_eq!(entry.amount, dec!(10.00));
    assert_eq!(entry.order, Some(order.id));

    let order = handler.service().order(order.id).unwrap();
    assert_eq!(order.status, OrderStatus::Completed);
    assert_eq!(order.payment_id.as_deref(), Some("pi_evt_1"));
    assert_eq!(handler.service().balance(AccountId(1)).unwrap(), dec!(13.00));
}

#[test]
fn redelivered_event_credits_once() {
    let handler = handler();
    let order = handler.service().checkout(AccountId(1), "bulk_pack").unwrap();
    let payload = event("evt_dup", "checkout.session.completed", order.id);

    assert!(matches!(deliver(&handler, &payload), Ok(WebhookOutcome::Credited(_))));
    assert_eq!(deliver(&handler, &payload), Ok(WebhookOutcome::Duplicate));
    assert_eq!(deliver(&handler, &payload), Ok(WebhookOutcome::Duplicate));

    assert_eq!(purchases(&handler), 1);
    assert_eq!(handler.service().balance(AccountId(1)).unwrap(), dec!(13.00));
}

#[test]
fn distinct_events_for_same_order_credit_once() {
    let handler = handler();
    let order = handler.service().checkout(AccountId(1), "pro_pack").unwrap();

    deliver(&handler, &event("evt_a", "checkout.session.completed", order.id)).unwrap();
    let second = deliver(&handler, &event("evt_b", "checkout.session.completed", order.id));
    assert_eq!(second, Ok(WebhookOutcome::Duplicate));

    assert_eq!(purchases(&handler), 1);
    assert_eq!(handler.service().balance(AccountId(1)).unwrap(), dec!(6.00));
}

#[test]
fn concurrent_redeliveries_credit_once() {
    let handler = Arc::new(handler());
    let order = handler.service().checkout(AccountId(1), "bulk_pack").unwrap();
    let payload = Arc::new(event("evt_race", "checkout.session.completed", order.id));

    let handles: Vec<_> = (0..32)
        .map(|_| {
            let handler = Arc::clone(&handler);
            let payload = Arc::clone(&payload);
            thread::spawn(move || deliver_until_settled(&handler, &payload).unwrap())
        })
        .collect();

    let outcomes: Vec<WebhookOutcome> = handles.into_iter().map(|h| h.join().unwrap()).collect();
    let credited = outcomes
        .iter()
        .filter(|o| matches!(o, WebhookOutcome::Credited(_)))
        .count();
    assert_eq!(credited, 1);
    assert!(outcomes
        .iter()
        .all(|o| matches!(o, WebhookOutcome::Credited(_) | WebhookOutcome::Duplicate)));
    assert_eq!(purchases(&handler), 1);
    assert_eq!(handler.service().balance(AccountId(1)).unwrap(), dec!(13.00));
}

#[test]
fn payment_failure_marks_order_failed() {
    let handler = handler();
    let order = handler.service().checkout(AccountId(1), "starter_pack").unwrap();

    let outcome = deliver(&handler, &event("evt_f", "payment_intent.payment_failed", order.id));
    assert_eq!(outcome, Ok(WebhookOutcome::Failed(order.id)));
    assert_eq!(
        handler.service().order(order.id).unwrap().status,
        OrderStatus::Failed
    );

    let late = deliver(&handler, &event("evt_late", "checkout.session.completed", order.id));
    assert!(matches!(
        late,
        Err(WebhookError::Credit(CreditError::InvalidOrderState { .. }))
    ));
    assert_eq!(handler.service().balance(AccountId(1)).unwrap(), dec!(3.00));
}

#[test]
fn refund_event_claws_back_credits() {
    let handler = handler();
    handler
        .service()
        .deduct_credits(AccountId(1), dec!(1.00), "Conversion")
        .unwrap();
    let order = handler.service().checkout(AccountId(1), "bulk_pack").unwrap();
    deliver(&handler, &event("evt_paid", "checkout.session.completed", order.id)).unwrap();
    assert_eq!(handler.service().balance(AccountId(1)).unwrap(), dec!(12.00));

    let outcome = deliver(&handler, &event("evt_refund", "charge.refunded", order.id)).unwrap();
    let WebhookOutcome::Refunded(receipt) = outcome else {
        panic!("expected a refund receipt, got {outcome:?}");
    };
    assert_eq!(receipt.clawed_back, dec!(10.00));
    assert_eq!(receipt.shortfall, Decimal::ZERO);
    assert_eq!(handler.service().balance(AccountId(1)).unwrap(), dec!(2.00));

    let again = deliver(&handler, &event("evt_refund_2", "charge.refunded", order.id));
    assert_eq!(again, Ok(WebhookOutcome::Duplicate));
    assert!(handler.service().audit(AccountId(1)).is_ok());
}

#[test]
fn unhandled_event_type_is_ignored() {
    let handler = handler();
    let outcome = deliver(&handler, &event("evt_x", "customer.subscription.created", OrderId(1)));
    assert_eq!(outcome, Ok(WebhookOutcome::Ignored));
    assert_eq!(handler.service().entries(AccountId(1)).len(), 1);
}

#[test]
fn bad_signature_is_rejected_without_effect() {
    let handler = handler();
    let order = handler.service().checkout(AccountId(1), "bulk_pack").unwrap();
    let payload = event("evt_forged", "checkout.session.completed", order.id);

    let signature = sign_payload("not_the_secret", Utc::now().timestamp(), &payload).unwrap();
    assert_eq!(
        handler.handle(&payload, &signature),
        Err(WebhookError::InvalidSignature)
    );
    assert_eq!(
        handler.handle(&payload, ""),
        Err(WebhookError::InvalidSignature)
    );

    assert_eq!(
        handler.service().order(order.id).unwrap().status,
        OrderStatus::Pending
    );

    // A correctly signed delivery of the same event still applies.
    assert!(matches!(deliver(&handler, &payload), Ok(WebhookOutcome::Credited(_))));
}

#[test]
fn failed_event_can_be_retried() {
    let handler = handler();
    let payload = event("evt_early", "checkout.session.completed", OrderId(1));

    // Delivered before the order exists.
    assert_eq!(
        deliver(&handler, &payload),
        Err(WebhookError::Credit(CreditError::OrderNotFound))
    );

    let order = handler.service().checkout(AccountId(1), "starter_pack").unwrap();
    assert_eq!(order.id, OrderId(1));
    assert!(matches!(deliver(&handler, &payload), Ok(WebhookOutcome::Credited(_))));
}

#[test]
fn dispatch_accepts_parsed_events() {
    let handler = handler();
    let order = handler.service().checkout(AccountId(1), "pro_pack").unwrap();
    let event = PaymentEvent::parse(&event("evt_p", "checkout.session.expired", order.id)).unwrap();

    assert_eq!(handler.dispatch(&event), Ok(WebhookOutcome::Failed(order.id)));
    assert_eq!(handler.dispatch(&event), Ok(WebhookOutcome::Duplicate));
}
