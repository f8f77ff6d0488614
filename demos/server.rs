//! REST API server example for the credit ledger.
//!
//! Run with: `cargo run --example server`
//!
//! The webhook secret is read from configuration, e.g.
//! `CREDIT_LEDGER__WEBHOOK__SECRET=whsec_test cargo run --example server`.
//!
//! ## Endpoints
//!
//! - `POST /accounts/{id}` - Open an account (grants the signup bonus)
//! - `GET /accounts/{id}` - Get an account balance
//! - `GET /accounts/{id}/ledger` - List an account's ledger entries
//! - `POST /accounts/{id}/conversions` - Charge one conversion
//! - `POST /accounts/{id}/conversions/{conversion}/failure` - Give a failed conversion's credit back
//! - `POST /accounts/{id}/checkout` - Create a pending order for a package
//! - `POST /webhooks/payments` - Payment gateway webhook (signed)
//!
//! ## Example Usage
//!
//! ```bash
//! # Open account 1
//! curl -X POST http://localhost:3000/accounts/1
//!
//! # Charge a conversion
//! curl -X POST http://localhost:3000/accounts/1/conversions \
//!   -H "Content-Type: application/json" \
//!   -d '{"conversion_id": 42}'
//!
//! # Start a purchase
//! curl -X POST http://localhost:3000/accounts/1/checkout \
//!   -H "Content-Type: application/json" \
//!   -d '{"package": "bulk_pack"}'
//!
//! # Get account
//! curl http://localhost:3000/accounts/1
//! ```

use axum::{
    Json, Router,
    body::Bytes,
    extract::{Path, State},
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
};
use chrono::Utc;
use credit_ledger::telemetry::init_tracing;
use credit_ledger::webhook::SIGNATURE_HEADER;
use credit_ledger::{
    AccountId, ConversionId, CreditError, CreditService, LedgerEntry, MemoryStore, Order, Settings,
    WebhookError, WebhookHandler, WebhookOutcome,
};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;

// === Request/Response DTOs ===

#[derive(Debug, Deserialize)]
pub struct ConversionRequest {
    pub conversion_id: u64,
}

#[derive(Debug, Deserialize)]
pub struct CheckoutRequest {
    pub package: String,
}

/// Response body for account information.
#[derive(Debug, Serialize)]
pub struct AccountResponse {
    pub account: u32,
    pub credits_remaining: Decimal,
    pub active: bool,
}

/// Response body for webhook deliveries.
#[derive(Debug, Serialize)]
pub struct WebhookResponse {
    pub status: &'static str,
}

/// Response body for errors.
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: String,
    pub code: String,
}

// === Application State ===

#[derive(Clone)]
pub struct AppState {
    pub service: Arc<CreditService>,
    pub webhooks: Arc<WebhookHandler<MemoryStore>>,
}

// === Error Handling ===

/// Wrapper for converting credit and webhook errors into HTTP responses.
pub struct AppError(WebhookError);

impl From<CreditError> for AppError {
    fn from(err: CreditError) -> Self {
        AppError(WebhookError::Credit(err))
    }
}

impl From<WebhookError> for AppError {
    fn from(err: WebhookError) -> Self {
        AppError(err)
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, code) = match &self.0 {
            WebhookError::InvalidSignature => (StatusCode::BAD_REQUEST, "INVALID_SIGNATURE"),
            WebhookError::Malformed(_) => (StatusCode::BAD_REQUEST, "MALFORMED_EVENT"),
            WebhookError::Credit(err) => match err {
                CreditError::InvalidAmount => (StatusCode::BAD_REQUEST, "INVALID_AMOUNT"),
                CreditError::InsufficientCredits => {
                    (StatusCode::PAYMENT_REQUIRED, "INSUFFICIENT_CREDITS")
                }
                CreditError::DuplicateEvent => (StatusCode::CONFLICT, "DUPLICATE_EVENT"),
                CreditError::EventInProgress => {
                    (StatusCode::SERVICE_UNAVAILABLE, "EVENT_IN_PROGRESS")
                }
                CreditError::PersistenceFailure(_) => {
                    (StatusCode::SERVICE_UNAVAILABLE, "PERSISTENCE_FAILURE")
                }
                CreditError::AccountNotFound => (StatusCode::NOT_FOUND, "ACCOUNT_NOT_FOUND"),
                CreditError::AccountExists => (StatusCode::CONFLICT, "ACCOUNT_EXISTS"),
                CreditError::AccountInactive => (StatusCode::FORBIDDEN, "ACCOUNT_INACTIVE"),
                CreditError::OrderNotFound => (StatusCode::NOT_FOUND, "ORDER_NOT_FOUND"),
                CreditError::ConversionNotFound => {
                    (StatusCode::NOT_FOUND, "CONVERSION_NOT_FOUND")
                }
                CreditError::PackageNotFound => (StatusCode::NOT_FOUND, "PACKAGE_NOT_FOUND"),
                CreditError::InvalidOrderState { .. } => {
                    (StatusCode::CONFLICT, "INVALID_ORDER_STATE")
                }
            },
        };

        (
            status,
            Json(ErrorResponse {
                error: self.0.to_string(),
                code: code.to_string(),
            }),
        )
            .into_response()
    }
}

// === Handlers ===

fn account_response(service: &CreditService, id: AccountId) -> Result<AccountResponse, AppError> {
    let snapshot = service.snapshot(id).ok_or(CreditError::AccountNotFound)?;
    Ok(AccountResponse {
        account: snapshot.account.0,
        credits_remaining: snapshot.credits_remaining,
        active: snapshot.active,
    })
}

/// POST /accounts/{id} - Open an account.
async fn open_account(
    State(state): State<AppState>,
    Path(id): Path<u32>,
) -> Result<(StatusCode, Json<AccountResponse>), AppError> {
    state.service.open_account(AccountId(id))?;
    let account = account_response(&state.service, AccountId(id))?;
    Ok((StatusCode::CREATED, Json(account)))
}

/// GET /accounts/{id} - Get account balance.
async fn get_account(
    State(state): State<AppState>,
    Path(id): Path<u32>,
) -> Result<Json<AccountResponse>, AppError> {
    account_response(&state.service, AccountId(id)).map(Json)
}

/// GET /accounts/{id}/ledger - List ledger entries.
async fn get_ledger(
    State(state): State<AppState>,
    Path(id): Path<u32>,
) -> Result<Json<Vec<LedgerEntry>>, AppError> {
    let id = AccountId(id);
    if state.service.get_account(&id).is_none() {
        return Err(CreditError::AccountNotFound.into());
    }
    Ok(Json(state.service.entries(id)))
}

/// POST /accounts/{id}/conversions - Charge one conversion.
async fn charge_conversion(
    State(state): State<AppState>,
    Path(id): Path<u32>,
    Json(request): Json<ConversionRequest>,
) -> Result<(StatusCode, Json<LedgerEntry>), AppError> {
    let entry = state
        .service
        .charge_conversion(AccountId(id), ConversionId(request.conversion_id))?;
    Ok((StatusCode::CREATED, Json(entry)))
}

/// POST /accounts/{id}/conversions/{conversion}/failure - Compensate a failed conversion.
async fn compensate_conversion(
    State(state): State<AppState>,
    Path((id, conversion)): Path<(u32, u64)>,
) -> Result<StatusCode, AppError> {
    let outcome = state.service.compensate_failed_usage(
        AccountId(id),
        ConversionId(conversion),
        "Conversion failed",
    )?;
    if outcome.is_duplicate() {
        return Ok(StatusCode::OK);
    }
    Ok(StatusCode::CREATED)
}

/// POST /accounts/{id}/checkout - Create a pending order.
async fn checkout(
    State(state): State<AppState>,
    Path(id): Path<u32>,
    Json(request): Json<CheckoutRequest>,
) -> Result<(StatusCode, Json<Order>), AppError> {
    let order = state.service.checkout(AccountId(id), &request.package)?;
    Ok((StatusCode::CREATED, Json(order)))
}

/// POST /webhooks/payments - Payment gateway webhook.
async fn payment_webhook(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Json<WebhookResponse>, AppError> {
    let signature = headers
        .get(SIGNATURE_HEADER)
        .and_then(|value| value.to_str().ok())
        .ok_or(WebhookError::InvalidSignature)?;

    let status = match state.webhooks.handle(&body, signature)? {
        WebhookOutcome::Credited(_) => "credited",
        WebhookOutcome::Failed(_) => "failed",
        WebhookOutcome::Refunded(_) => "refunded",
        WebhookOutcome::Ignored => "ignored",
        WebhookOutcome::Duplicate => "duplicate",
    };
    Ok(Json(WebhookResponse { status }))
}

// === Router ===

fn create_router(state: AppState) -> Router {
    Router::new()
        .route("/accounts/{id}", post(open_account).get(get_account))
        .route("/accounts/{id}/ledger", get(get_ledger))
        .route("/accounts/{id}/conversions", post(charge_conversion))
        .route(
            "/accounts/{id}/conversions/{conversion}/failure",
            post(compensate_conversion),
        )
        .route("/accounts/{id}/checkout", post(checkout))
        .route("/webhooks/payments", post(payment_webhook))
        .with_state(state)
}

// === Main ===

#[tokio::main]
async fn main() {
    init_tracing();
    let settings = Settings::load(None).unwrap();

    let service = Arc::new(CreditService::from_settings(MemoryStore::new(), &settings));
    let webhooks = Arc::new(WebhookHandler::new(service.clone(), settings.webhook.clone()));
    let state = AppState {
        service,
        webhooks: webhooks.clone(),
    };

    // Forget applied webhook events once they are past retention.
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(Duration::from_secs(3600));
        loop {
            interval.tick().await;
            webhooks.prune_events(Utc::now());
        }
    });

    let app = create_router(state);

    let listener = TcpListener::bind("127.0.0.1:3000").await.unwrap();
    println!("Credit ledger API server running on http://127.0.0.1:3000");
    println!();
    println!("Endpoints:");
    println!("  POST /accounts/:id              - Open an account");
    println!("  GET  /accounts/:id              - Get account balance");
    println!("  GET  /accounts/:id/ledger       - List ledger entries");
    println!("  POST /accounts/:id/conversions  - Charge a conversion");
    println!("  POST /accounts/:id/checkout     - Create an order");
    println!("  POST /webhooks/payments         - Payment webhook");

    axum::serve(listener, app).await.unwrap();
}
