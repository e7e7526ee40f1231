//! HTTP handlers
//!
//! Each handler deserializes its body, calls one engine operation and wraps
//! the result in [`ApiResponse`]. No business rules live here.

use std::str::FromStr;
use std::sync::Arc;

use axum::{
    Json,
    body::Bytes,
    extract::{Path, State},
    http::StatusCode,
};
use chrono::Utc;
use serde::Serialize;

use super::types::{
    ApiError, ApiResponse, ApiResult, ApproveWithdrawalBody, CaptureBody, OpenWalletBody,
    ReversalBody, ReviewAction, ReviewBody, ok,
};
use crate::core_types::{CardTxId, TransferId, WalletId};
use crate::engine::{
    AdjustmentRequest, AuthorizeOutcome, AuthorizeRequest, CaptureReceipt, DepositRequest,
    FxTransferReceipt, FxTransferRequest, LedgerEngine, ReversalRequest, ReviewDecision,
    TransferRequest, WithdrawalApproval, WithdrawalRequest, WithdrawalTicket,
};
use crate::idempotency::Guarded;
use crate::ledger::{Balance, LedgerEntry};
use crate::models::{CardTransaction, Deposit, Reversal, ReversalTarget, Transfer, Wallet};

fn parse_path<T: FromStr>(raw: &str, what: &str) -> Result<T, ApiError> {
    raw.parse()
        .map_err(|_| ApiError::bad_request(format!("Invalid {}: {}", what, raw)))
}

// === Wallets ===

pub async fn open_wallet(
    State(engine): State<Arc<LedgerEngine>>,
    Json(body): Json<OpenWalletBody>,
) -> ApiResult<Guarded<Wallet>> {
    ok(engine
        .open_wallet(body.owner_id, body.currency, body.kind)
        .await?)
}

#[derive(Debug, Serialize)]
pub struct BalanceData {
    pub wallet_id: WalletId,
    #[serde(flatten)]
    pub balance: Balance,
}

pub async fn get_balance(
    State(engine): State<Arc<LedgerEngine>>,
    Path(wallet_id): Path<String>,
) -> ApiResult<BalanceData> {
    let wallet_id: WalletId = parse_path(&wallet_id, "wallet id")?;
    let balance = engine.compute_balance(wallet_id).await?;
    ok(BalanceData { wallet_id, balance })
}

// === Transfers ===

pub async fn create_transfer(
    State(engine): State<Arc<LedgerEngine>>,
    Json(req): Json<TransferRequest>,
) -> ApiResult<Guarded<Transfer>> {
    ok(engine.post_transfer(req).await?)
}

pub async fn get_transfer(
    State(engine): State<Arc<LedgerEngine>>,
    Path(transfer_id): Path<String>,
) -> ApiResult<Transfer> {
    let transfer_id: TransferId = parse_path(&transfer_id, "transfer id")?;
    ok(engine.get_transfer(transfer_id).await?)
}

pub async fn create_fx_transfer(
    State(engine): State<Arc<LedgerEngine>>,
    Json(req): Json<FxTransferRequest>,
) -> ApiResult<FxTransferReceipt> {
    ok(engine.post_fx_transfer(req).await?)
}

pub async fn review_transfer(
    State(engine): State<Arc<LedgerEngine>>,
    Path(transfer_id): Path<String>,
    Json(body): Json<ReviewBody>,
) -> ApiResult<Transfer> {
    let transfer_id: TransferId = parse_path(&transfer_id, "transfer id")?;
    let decision = ReviewDecision {
        reviewer: body.reviewer,
        note: body.note,
    };
    let transfer = match body.action {
        ReviewAction::Approve => engine.approve_review(transfer_id, decision).await?,
        ReviewAction::Reject => engine.reject_review(transfer_id, decision).await?,
    };
    ok(transfer)
}

// === Deposits / withdrawals ===

pub async fn create_deposit(
    State(engine): State<Arc<LedgerEngine>>,
    Json(req): Json<DepositRequest>,
) -> ApiResult<Guarded<Deposit>> {
    ok(engine.post_deposit(req).await?)
}

pub async fn request_withdrawal(
    State(engine): State<Arc<LedgerEngine>>,
    Json(req): Json<WithdrawalRequest>,
) -> ApiResult<Guarded<WithdrawalTicket>> {
    ok(engine.request_withdrawal(req).await?)
}

pub async fn approve_withdrawal(
    State(engine): State<Arc<LedgerEngine>>,
    Json(body): Json<ApproveWithdrawalBody>,
) -> ApiResult<WithdrawalApproval> {
    ok(engine.approve_withdrawal(body.agent_id, &body.code).await?)
}

// === Card holds ===

/// A decline is still `code: 0`; the outcome carries `ok: false`
pub async fn authorize_hold(
    State(engine): State<Arc<LedgerEngine>>,
    Json(req): Json<AuthorizeRequest>,
) -> ApiResult<Guarded<AuthorizeOutcome>> {
    ok(engine.authorize_hold(req).await?)
}

pub async fn capture_hold(
    State(engine): State<Arc<LedgerEngine>>,
    Path(card_tx_id): Path<String>,
    body: Bytes,
) -> ApiResult<CaptureReceipt> {
    let card_tx_id: CardTxId = parse_path(&card_tx_id, "card transaction id")?;
    // Empty body captures the full authorized amount
    let body: CaptureBody = if body.is_empty() {
        CaptureBody::default()
    } else {
        serde_json::from_slice(&body)
            .map_err(|e| ApiError::bad_request(format!("Invalid capture body: {}", e)))?
    };
    ok(engine.capture_hold(card_tx_id, body.amount).await?)
}

pub async fn reverse_hold(
    State(engine): State<Arc<LedgerEngine>>,
    Path(card_tx_id): Path<String>,
) -> ApiResult<CardTransaction> {
    let card_tx_id: CardTxId = parse_path(&card_tx_id, "card transaction id")?;
    ok(engine.reverse_hold(card_tx_id).await?)
}

// === Corrections ===

pub async fn create_reversal(
    State(engine): State<Arc<LedgerEngine>>,
    Json(body): Json<ReversalBody>,
) -> ApiResult<Guarded<Reversal>> {
    let target = ReversalTarget::from_parts(body.target_type, &body.target_id)?;
    ok(engine
        .reverse(ReversalRequest {
            target,
            reason: body.reason,
            idempotency_key: body.idempotency_key,
        })
        .await?)
}

pub async fn create_adjustment(
    State(engine): State<Arc<LedgerEngine>>,
    Json(req): Json<AdjustmentRequest>,
) -> ApiResult<Guarded<LedgerEntry>> {
    ok(engine.post_adjustment(req).await?)
}

// === System ===

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub store: &'static str,
    pub timestamp_ms: i64,
}

/// - Healthy: 200 OK + {code: 0, data: {store, timestamp_ms}}
/// - Unhealthy: 503 Service Unavailable + {code: 5001, msg: "unavailable"}
pub async fn health_check(
    State(engine): State<Arc<LedgerEngine>>,
) -> (StatusCode, Json<ApiResponse<HealthResponse>>) {
    match engine.health_check().await {
        Ok(()) => (
            StatusCode::OK,
            Json(ApiResponse::success(HealthResponse {
                store: engine.store_name(),
                timestamp_ms: Utc::now().timestamp_millis(),
            })),
        ),
        Err(e) => {
            tracing::error!(error = %e, "[HEALTH] store ping failed");
            (
                StatusCode::SERVICE_UNAVAILABLE,
                Json(ApiResponse {
                    code: super::types::error_codes::SERVICE_UNAVAILABLE,
                    msg: "unavailable".to_string(),
                    data: None,
                }),
            )
        }
    }
}
