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

//! Payment gateway webhooks.
//!
//! Deliveries are signed with HMAC-SHA256 over `"<timestamp>.<payload>"`
//! and carry the signature in a header of the form:
//!
//! ```text
//! t=1700000000,v1=5257a869e7ecebeda32affa62cdca3fa51cad7e77a0e56ff536d0ce8e108d8bd
//! ```
//!
//! The gateway delivers at least once. [`WebhookHandler`] claims each event
//! ID before acting on it, so a redelivered event is acknowledged as
//! [`WebhookOutcome::Duplicate`] instead of crediting or debiting twice.
//! A redelivery that overlaps a still running attempt gets
//! [`CreditError::EventInProgress`] so the gateway tries it again later.
//!
//! | Event type | Effect |
//! |------------|--------|
//! | `checkout.session.completed` | Complete the order, credit the account |
//! | `checkout.session.async_payment_failed` | Fail the order |
//! | `checkout.session.expired` | Fail the order |
//! | `payment_intent.payment_failed` | Fail the order |
//! | `charge.refunded` | Refund the order, claw credits back |
//! | anything else | Ignored |

use crate::base::{OrderId, PaymentEventId};
use crate::config::WebhookConfig;
use crate::ledger::LedgerEntry;
use crate::registry::EventRegistry;
use crate::service::{CreditService, Outcome, RefundReceipt};
use crate::store::LedgerStore;
use crate::CreditError;
use chrono::{DateTime, Duration, Utc};
use hmac::{Hmac, Mac};
use serde::Deserialize;
use sha2::Sha256;
use std::collections::HashMap;
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, info, warn};

type HmacSha256 = Hmac<Sha256>;

/// Header carrying the delivery signature.
pub const SIGNATURE_HEADER: &str = "Stripe-Signature";

/// Webhook processing errors.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum WebhookError {
    /// Signature missing, stale, or not matching the shared secret
    #[error("invalid webhook signature")]
    InvalidSignature,

    /// Payload is not a usable event
    #[error("malformed webhook event: {0}")]
    Malformed(String),

    #[error(transparent)]
    Credit(#[from] CreditError),
}

/// A payment gateway event.
#[derive(Debug, Clone, Deserialize)]
pub struct PaymentEvent {
    pub id: PaymentEventId,
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub created: i64,
    pub data: EventData,
}

#[derive(Debug, Clone, Deserialize)]
pub struct EventData {
    pub object: EventObject,
}

/// The checkout session or charge the event is about.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct EventObject {
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub payment_intent: Option<String>,
    #[serde(default)]
    pub metadata: HashMap<String, String>,
}

/// What an event asks the credit service to do.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EventAction {
    Complete { order: OrderId, payment_id: String },
    Fail { order: OrderId },
    Refund { order: OrderId },
    Ignore,
}

impl PaymentEvent {
    /// Parses a raw JSON delivery.
    pub fn parse(payload: &[u8]) -> Result<Self, WebhookError> {
        serde_json::from_slice(payload).map_err(|e| WebhookError::Malformed(e.to_string()))
    }

    pub fn action(&self) -> Result<EventAction, WebhookError> {
        let action = match self.kind.as_str() {
            "checkout.session.completed" => EventAction::Complete {
                order: self.order_id()?,
                payment_id: self.payment_id(),
            },
            "checkout.session.async_payment_failed"
            | "checkout.session.expired"
            | "payment_intent.payment_failed" => EventAction::Fail {
                order: self.order_id()?,
            },
            "charge.refunded" => EventAction::Refund {
                order: self.order_id()?,
            },
            _ => EventAction::Ignore,
        };
        Ok(action)
    }

    fn order_id(&self) -> Result<OrderId, WebhookError> {
        let raw = self
            .data
            .object
            .metadata
            .get("order_id")
            .ok_or_else(|| WebhookError::Malformed("missing metadata.order_id".to_string()))?;
        raw.trim()
            .parse()
            .map(OrderId)
            .map_err(|_| WebhookError::Malformed(format!("invalid order_id {raw:?}")))
    }

    /// Payment intent if present, else the session ID, else the event ID.
    fn payment_id(&self) -> String {
        let object = &self.data.object;
        object
            .payment_intent
            .clone()
            .or_else(|| object.id.clone())
            .unwrap_or_else(|| self.id.to_string())
    }
}

fn mac_for(secret: &str, timestamp: i64, payload: &[u8]) -> Result<HmacSha256, WebhookError> {
    let mut mac = HmacSha256::new_from_slice(secret.as_bytes())
        .map_err(|_| WebhookError::InvalidSignature)?;
    mac.update(timestamp.to_string().as_bytes());
    mac.update(b".");
    mac.update(payload);
    Ok(mac)
}

/// Builds the signature header value for `payload` signed at `timestamp`.
pub fn sign_payload(secret: &str, timestamp: i64, payload: &[u8]) -> Result<String, WebhookError> {
    let signature = mac_for(secret, timestamp, payload)?.finalize().into_bytes();
    Ok(format!("t={timestamp},v1={}", hex::encode(signature)))
}

/// Verifies a signature header against `payload`.
///
/// Any `v1` signature in the header may match. Deliveries signed more than
/// `tolerance_secs` away from `now` are rejected.
///
/// # Errors
///
/// Returns [`WebhookError::InvalidSignature`] on an empty secret, an
/// unparseable header, a stale timestamp or a mismatching signature.
pub fn verify_signature(
    payload: &[u8],
    header: &str,
    secret: &str,
    tolerance_secs: i64,
    now: DateTime<Utc>,
) -> Result<(), WebhookError> {
    if secret.is_empty() {
        warn!("webhook secret is not configured");
        return Err(WebhookError::InvalidSignature);
    }

    let mut timestamp = None;
    let mut signatures = Vec::new();
    for part in header.split(',') {
        match part.trim().split_once('=') {
            Some(("t", value)) => timestamp = value.parse::<i64>().ok(),
            Some(("v1", value)) => signatures.push(value),
            _ => {}
        }
    }

    let timestamp = timestamp.ok_or(WebhookError::InvalidSignature)?;
    if (now.timestamp() - timestamp).abs() > tolerance_secs {
        return Err(WebhookError::InvalidSignature);
    }

    let mac = mac_for(secret, timestamp, payload)?;
    let matched = signatures.into_iter().any(|signature| {
        hex::decode(signature).is_ok_and(|bytes| mac.clone().verify_slice(&bytes).is_ok())
    });
    if !matched {
        return Err(WebhookError::InvalidSignature);
    }
    Ok(())
}

/// Result of handling one delivery.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WebhookOutcome {
    /// Payment confirmed; the purchase entry.
    Credited(LedgerEntry),
    /// Payment failed; the order was marked failed.
    Failed(OrderId),
    /// Order refunded.
    Refunded(RefundReceipt),
    /// Event type this handler does not act on.
    Ignored,
    /// Event (or its effect) was already applied.
    Duplicate,
}

/// Verifies, deduplicates and applies payment gateway events.
pub struct WebhookHandler<S: LedgerStore> {
    service: Arc<CreditService<S>>,
    events: EventRegistry<PaymentEventId>,
    config: WebhookConfig,
}

impl<S: LedgerStore> WebhookHandler<S> {
    pub fn new(service: Arc<CreditService<S>>, config: WebhookConfig) -> Self {
        Self {
            service,
            events: EventRegistry::new(),
            config,
        }
    }

    pub fn service(&self) -> &Arc<CreditService<S>> {
        &self.service
    }

    /// Verifies the signature of a raw delivery and applies it.
    pub fn handle(&self, payload: &[u8], signature: &str) -> Result<WebhookOutcome, WebhookError> {
        verify_signature(
            payload,
            signature,
            &self.config.secret,
            self.config.tolerance_secs,
            Utc::now(),
        )
        .inspect_err(|_| warn!("rejected webhook with invalid signature"))?;

        let event = PaymentEvent::parse(payload)?;
        self.dispatch(&event)
    }

    /// Applies an already verified event at most once.
    ///
    /// A delivery that arrives while another attempt for the same event is
    /// still running fails with [`CreditError::EventInProgress`] so the
    /// gateway retries it. If applying fails, the event ID is released so
    /// that retry can succeed.
    pub fn dispatch(&self, event: &PaymentEvent) -> Result<WebhookOutcome, WebhookError> {
        match self.events.claim(&event.id) {
            Ok(()) => {}
            Err(CreditError::DuplicateEvent) => {
                debug!(event = %event.id, "duplicate webhook delivery");
                return Ok(WebhookOutcome::Duplicate);
            }
            Err(e) => {
                debug!(event = %event.id, "webhook delivery still in progress");
                return Err(e.into());
            }
        }

        let result = self.apply(event);
        match &result {
            Ok(outcome) => {
                self.events.complete(&event.id);
                info!(event = %event.id, kind = %event.kind, ?outcome, "webhook applied");
            }
            Err(e) => {
                warn!(event = %event.id, kind = %event.kind, error = %e, "webhook failed");
                self.events.release(&event.id);
            }
        }
        result
    }

    /// Forgets applied event IDs older than the configured retention.
    ///
    /// A delivery of a forgotten event is still caught by the order state.
    pub fn prune_events(&self, now: DateTime<Utc>) -> usize {
        let cutoff = now - Duration::seconds(self.config.event_retention_secs);
        let removed = self.events.prune_before(cutoff);
        if removed > 0 {
            debug!(removed, "pruned applied webhook events");
        }
        removed
    }

    pub fn tracked_events(&self) -> usize {
        self.events.len()
    }

    fn apply(&self, event: &PaymentEvent) -> Result<WebhookOutcome, WebhookError> {
        let outcome = match event.action()? {
            EventAction::Complete { order, payment_id } => {
                match self.service.complete_order(order, &payment_id)? {
                    Outcome::Applied(entry) => WebhookOutcome::Credited(entry),
                    Outcome::Duplicate => WebhookOutcome::Duplicate,
                }
            }
            EventAction::Fail { order } => match self.service.fail_order(order)? {
                Outcome::Applied(_) => WebhookOutcome::Failed(order),
                Outcome::Duplicate => WebhookOutcome::Duplicate,
            },
            EventAction::Refund { order } => match self.service.process_refund(order)? {
                Outcome::Applied(receipt) => WebhookOutcome::Refunded(receipt),
                Outcome::Duplicate => WebhookOutcome::Duplicate,
            },
            EventAction::Ignore => WebhookOutcome::Ignored,
        };
        Ok(outcome)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SECRET: &str = "whsec_test";

    fn event_json(id: &str, kind: &str, order: &str) -> String {
        format!(
            r#"{{"id":"{id}","type":"{kind}","created":1700000000,
                "data":{{"object":{{"id":"cs_1","payment_intent":"pi_1","metadata":{{"order_id":"{order}"}}}}}}}}"#
        )
    }

    #[test]
    fn signature_round_trip_verifies() {
        let payload = br#"{"id":"evt_1"}"#;
        let now = Utc::now();
        let header = sign_payload(SECRET, now.timestamp(), payload).unwrap();
        assert!(verify_signature(payload, &header, SECRET, 300, now).is_ok());
    }

    #[test]
    fn tampered_payload_is_rejected() {
        let now = Utc::now();
        let header = sign_payload(SECRET, now.timestamp(), b"original").unwrap();
        assert_eq!(
            verify_signature(b"tampered", &header, SECRET, 300, now),
            Err(WebhookError::InvalidSignature)
        );
    }

    #[test]
    fn wrong_secret_is_rejected() {
        let now = Utc::now();
        let header = sign_payload("other", now.timestamp(), b"payload").unwrap();
        assert_eq!(
            verify_signature(b"payload", &header, SECRET, 300, now),
            Err(WebhookError::InvalidSignature)
        );
    }

    #[test]
    fn stale_timestamp_is_rejected() {
        let now = Utc::now();
        let header = sign_payload(SECRET, now.timestamp() - 301, b"payload").unwrap();
        assert_eq!(
            verify_signature(b"payload", &header, SECRET, 300, now),
            Err(WebhookError::InvalidSignature)
        );
    }

    #[test]
    fn any_v1_signature_may_match() {
        let now = Utc::now();
        let valid = sign_payload(SECRET, now.timestamp(), b"payload").unwrap();
        let v1 = valid.split_once("v1=").unwrap().1;
        let header = format!("t={},v1=deadbeef,v1={v1}", now.timestamp());
        assert!(verify_signature(b"payload", &header, SECRET, 300, now).is_ok());
    }

    #[test]
    fn empty_secret_rejects_everything() {
        let now = Utc::now();
        let header = sign_payload("", now.timestamp(), b"payload").unwrap();
        assert_eq!(
            verify_signature(b"payload", &header, "", 300, now),
            Err(WebhookError::InvalidSignature)
        );
    }

    #[test]
    fn garbage_header_is_rejected() {
        assert_eq!(
            verify_signature(b"payload", "nonsense", SECRET, 300, Utc::now()),
            Err(WebhookError::InvalidSignature)
        );
    }

    #[test]
    fn completed_checkout_maps_to_complete() {
        let event =
            PaymentEvent::parse(event_json("evt_1", "checkout.session.completed", "7").as_bytes())
                .unwrap();
        assert_eq!(
            event.action().unwrap(),
            EventAction::Complete {
                order: OrderId(7),
                payment_id: "pi_1".to_string(),
            }
        );
    }

    #[test]
    fn failure_and_refund_types_map() {
        for kind in [
            "checkout.session.async_payment_failed",
            "checkout.session.expired",
            "payment_intent.payment_failed",
        ] {
            let event = PaymentEvent::parse(event_json("evt", kind, "3").as_bytes()).unwrap();
            assert_eq!(event.action().unwrap(), EventAction::Fail { order: OrderId(3) });
        }

        let event = PaymentEvent::parse(event_json("evt", "charge.refunded", "3").as_bytes()).unwrap();
        assert_eq!(event.action().unwrap(), EventAction::Refund { order: OrderId(3) });
    }

    #[test]
    fn unknown_type_is_ignored() {
        let event = PaymentEvent::parse(event_json("evt", "customer.created", "x").as_bytes()).unwrap();
        assert_eq!(event.action().unwrap(), EventAction::Ignore);
    }

    #[test]
    fn bad_order_id_is_malformed() {
        let event =
            PaymentEvent::parse(event_json("evt", "checkout.session.completed", "abc").as_bytes())
                .unwrap();
        assert!(matches!(event.action(), Err(WebhookError::Malformed(_))));
    }

    #[test]
    fn invalid_json_is_malformed() {
        assert!(matches!(
            PaymentEvent::parse(b"{not json"),
            Err(WebhookError::Malformed(_))
        ));
    }

    fn handler_with_order() -> (WebhookHandler<crate::MemoryStore>, OrderId) {
        let service = Arc::new(CreditService::new());
        service.open_account(crate::AccountId(1)).unwrap();
        let order = service.checkout(crate::AccountId(1), "bulk_pack").unwrap();
        let handler = WebhookHandler::new(
            service,
            WebhookConfig {
                secret: SECRET.to_string(),
                ..WebhookConfig::default()
            },
        );
        (handler, order.id)
    }

    #[test]
    fn delivery_during_running_attempt_must_be_retried() {
        let (handler, order) = handler_with_order();
        let payload = event_json("evt_1", "checkout.session.completed", &order.to_string());
        let event = PaymentEvent::parse(payload.as_bytes()).unwrap();

        // First attempt still running.
        handler.events.claim(&event.id).unwrap();
        assert_eq!(
            handler.dispatch(&event),
            Err(WebhookError::Credit(CreditError::EventInProgress))
        );

        // First attempt fails; the gateway's retry must still apply.
        handler.events.release(&event.id);
        assert!(matches!(
            handler.dispatch(&event),
            Ok(WebhookOutcome::Credited(_))
        ));
        assert_eq!(handler.dispatch(&event), Ok(WebhookOutcome::Duplicate));
    }

    #[test]
    fn pruned_events_are_still_caught_by_order_state() {
        let (handler, order) = handler_with_order();
        let payload = event_json("evt_1", "checkout.session.completed", &order.to_string());
        let event = PaymentEvent::parse(payload.as_bytes()).unwrap();

        assert!(matches!(
            handler.dispatch(&event),
            Ok(WebhookOutcome::Credited(_))
        ));
        assert_eq!(handler.tracked_events(), 1);

        assert_eq!(handler.prune_events(Utc::now()), 0);
        assert_eq!(handler.prune_events(Utc::now() + Duration::days(8)), 1);
        assert_eq!(handler.tracked_events(), 0);

        assert_eq!(handler.dispatch(&event), Ok(WebhookOutcome::Duplicate));
        assert_eq!(
            handler.service().balance(crate::AccountId(1)).unwrap(),
            rust_decimal_macros::dec!(13.00)
        );
    }
}
