//! Gateway request / response types
//!
//! - `ApiResponse<T>`: unified response wrapper
//! - `ApiError`: `LedgerError` rendered as an HTTP response
//! - request bodies that do not map 1:1 onto engine requests

use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::core_types::{Currency, UserId};
use crate::error::LedgerError;
use crate::idempotency::IdempotencyKey;
use crate::models::{ReversalKind, WalletKind};

// ============================================================================
// Unified API Response Format
// ============================================================================

/// Unified API response wrapper
///
/// - code: 0 = success, non-zero = error code
/// - msg: short message description
/// - data: actual data (success) or absent (error)
#[derive(Debug, Serialize, Deserialize)]
pub struct ApiResponse<T> {
    pub code: i32,
    pub msg: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<T>,
}

impl<T> ApiResponse<T> {
    pub fn success(data: T) -> Self {
        Self {
            code: error_codes::SUCCESS,
            msg: "ok".to_string(),
            data: Some(data),
        }
    }

    pub fn error(code: i32, msg: impl Into<String>) -> ApiResponse<()> {
        ApiResponse {
            code,
            msg: msg.into(),
            data: None,
        }
    }
}

pub type ApiResult<T> = Result<Json<ApiResponse<T>>, ApiError>;

pub fn ok<T>(data: T) -> ApiResult<T> {
    Ok(Json(ApiResponse::success(data)))
}

// ============================================================================
// Errors
// ============================================================================

#[derive(Debug)]
pub struct ApiError {
    pub status: StatusCode,
    pub code: i32,
    pub msg: String,
}

impl ApiError {
    pub fn new(status: StatusCode, code: i32, msg: impl Into<String>) -> Self {
        Self {
            status,
            code,
            msg: msg.into(),
        }
    }

    pub fn bad_request(msg: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, error_codes::INVALID_PARAMETER, msg)
    }

    pub fn service_unavailable(msg: impl Into<String>) -> Self {
        Self::new(
            StatusCode::SERVICE_UNAVAILABLE,
            error_codes::SERVICE_UNAVAILABLE,
            msg,
        )
    }

    pub fn into_err<T>(self) -> ApiResult<T> {
        Err(self)
    }
}

impl From<LedgerError> for ApiError {
    fn from(e: LedgerError) -> Self {
        let status =
            StatusCode::from_u16(e.http_status()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        if status.is_server_error() {
            tracing::error!(error = %e, "Request failed");
        }
        Self::new(status, error_codes::for_error(&e), format!("{}: {}", e.code(), e))
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.status, Json(ApiResponse::<()>::error(self.code, self.msg))).into_response()
    }
}

// ============================================================================
// Request bodies
// ============================================================================

#[derive(Debug, Deserialize)]
pub struct OpenWalletBody {
    pub owner_id: UserId,
    pub currency: Currency,
    #[serde(default = "default_kind")]
    pub kind: WalletKind,
}

fn default_kind() -> WalletKind {
    WalletKind::User
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReviewAction {
    Approve,
    Reject,
}

#[derive(Debug, Deserialize)]
pub struct ReviewBody {
    pub action: ReviewAction,
    pub reviewer: String,
    #[serde(default)]
    pub note: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct ApproveWithdrawalBody {
    pub agent_id: UserId,
    pub code: String,
}

#[derive(Debug, Default, Deserialize)]
pub struct CaptureBody {
    /// Defaults to the full authorized amount
    #[serde(default)]
    pub amount: Option<Decimal>,
}

#[derive(Debug, Deserialize)]
pub struct ReversalBody {
    pub target_type: ReversalKind,
    pub target_id: String,
    pub reason: String,
    pub idempotency_key: IdempotencyKey,
}

// ============================================================================
// Error Codes
// ============================================================================

pub mod error_codes {
    use crate::error::LedgerError;

    pub const SUCCESS: i32 = 0;

    // Client errors (1xxx)
    pub const INVALID_PARAMETER: i32 = 1001;
    pub const INSUFFICIENT_BALANCE: i32 = 1002;
    pub const LIMIT_EXCEEDED: i32 = 1003;

    // Auth errors (2xxx)
    pub const FORBIDDEN: i32 = 2003;

    // Resource / state errors (4xxx)
    pub const NOT_FOUND: i32 = 4004;
    pub const INVALID_STATE: i32 = 4009;
    pub const EXPIRED: i32 = 4010;
    pub const CONFLICT: i32 = 4090;

    // Server errors (5xxx)
    pub const INTERNAL_ERROR: i32 = 5000;
    pub const SERVICE_UNAVAILABLE: i32 = 5001;

    pub fn for_error(e: &LedgerError) -> i32 {
        match e {
            LedgerError::Validation(_)
            | LedgerError::InvalidAmount
            | LedgerError::SameWallet
            | LedgerError::CurrencyMismatch { .. } => INVALID_PARAMETER,
            LedgerError::InsufficientFunds(_) => INSUFFICIENT_BALANCE,
            LedgerError::LimitExceeded(_) => LIMIT_EXCEEDED,
            LedgerError::Forbidden(_) => FORBIDDEN,
            LedgerError::NotFound(_) => NOT_FOUND,
            LedgerError::InvalidState(_) | LedgerError::AlreadyProcessed => INVALID_STATE,
            LedgerError::Expired => EXPIRED,
            LedgerError::Conflict(_) => CONFLICT,
            LedgerError::RateUnavailable(_) => SERVICE_UNAVAILABLE,
            LedgerError::Storage(_) | LedgerError::System(_) => INTERNAL_ERROR,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core_types::WalletId;

    #[test]
    fn test_ledger_error_mapping() {
        let e = ApiError::from(LedgerError::InsufficientFunds(WalletId::new()));
        assert_eq!(e.status, StatusCode::UNPROCESSABLE_ENTITY);
        assert_eq!(e.code, error_codes::INSUFFICIENT_BALANCE);
        assert!(e.msg.starts_with("INSUFFICIENT_FUNDS"));

        let e = ApiError::from(LedgerError::Expired);
        assert_eq!(e.status, StatusCode::GONE);
        assert_eq!(e.code, error_codes::EXPIRED);
    }

    #[test]
    fn test_review_body() {
        let body: ReviewBody =
            serde_json::from_str(r#"{"action":"reject","reviewer":"ops"}"#).unwrap();
        assert_eq!(body.action, ReviewAction::Reject);
        assert!(body.note.is_none());
    }

    #[test]
    fn test_error_response_omits_data() {
        let json = serde_json::to_value(ApiResponse::success(5)).unwrap();
        assert_eq!(json["code"], 0);
        assert_eq!(json["data"], 5);
        let err = serde_json::to_value(ApiResponse::<()>::error(1001, "bad")).unwrap();
        assert!(err.get("data").is_none());
    }
}
