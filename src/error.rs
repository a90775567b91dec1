//! Error Handling Module
//!
//! Domain error taxonomy for the settlement core. Uses thiserror for the
//! variants and maps every variant to a stable reason code so the
//! surrounding application can render it however it likes.
//!
//! | class      | variants                                                   |
//! |------------|------------------------------------------------------------|
//! | business   | InsufficientBalance, ListingUnavailable, CampaignInactive  |
//! | caller     | IdempotencyKeyConflict, Validation, NotFound               |
//! | transient  | IdempotencyInProgress, LockAcquisitionTimeout              |
//! | fatal      | LedgerIntegrityViolation                                   |
//! | infra      | Database, Serialization, Config, StaleTicket               |

use serde::Serialize;
use thiserror::Error;
use uuid::Uuid;

/// PostgreSQL `lock_not_available` (NOWAIT 실패 / lock_timeout 초과)
const PG_LOCK_NOT_AVAILABLE: &str = "55P03";
/// PostgreSQL `deadlock_detected`
const PG_DEADLOCK_DETECTED: &str = "40P01";

/// 정산 코어 에러 타입
#[derive(Debug, Error)]
pub enum SettlementError {
    // ============ Business ============
    #[error("insufficient {asset_code} balance: required {required}, available {available}")]
    InsufficientBalance {
        asset_code: String,
        required: i64,
        available: i64,
    },

    #[error("listing {listing_id} is no longer available (status: {status})")]
    ListingUnavailable { listing_id: Uuid, status: String },

    #[error("campaign {0} is not active")]
    CampaignInactive(String),

    // ============ Caller ============
    #[error("idempotency key {0} was already used for a different request")]
    IdempotencyKeyConflict(String),

    #[error("Validation failed: {0}")]
    Validation(String),

    #[error("Resource not found: {0}")]
    NotFound(String),

    // ============ Transient ============
    #[error("request with idempotency key {0} is still being processed")]
    IdempotencyInProgress(String),

    #[error("timed out acquiring lock on {0}")]
    LockAcquisitionTimeout(String),

    // ============ Fatal ============
    #[error("ledger integrity violation: {0}")]
    LedgerIntegrityViolation(String),

    // ============ Infrastructure ============
    #[error("idempotency ticket for {0} no longer owns the record")]
    StaleTicket(String),

    #[error("Invalid configuration: {0}")]
    Config(String),

    #[error("Database error: {0}")]
    Database(String),

    #[error("Serialization error: {0}")]
    Serialization(String),
}

pub type Result<T, E = SettlementError> = std::result::Result<T, E>;

/// 외부 애플리케이션에 전달하는 에러 응답 구조
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: String,
    pub code: String,
    pub retryable: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<String>,
}

impl SettlementError {
    /// Stable reason code for the error class.
    pub fn reason_code(&self) -> &'static str {
        match self {
            SettlementError::InsufficientBalance { .. } => "INSUFFICIENT_BALANCE",
            SettlementError::ListingUnavailable { .. } => "LISTING_UNAVAILABLE",
            SettlementError::CampaignInactive(_) => "CAMPAIGN_INACTIVE",
            SettlementError::IdempotencyKeyConflict(_) => "IDEMPOTENCY_KEY_CONFLICT",
            SettlementError::Validation(_) => "VALIDATION_ERROR",
            SettlementError::NotFound(_) => "NOT_FOUND",
            SettlementError::IdempotencyInProgress(_) => "IDEMPOTENCY_IN_PROGRESS",
            SettlementError::LockAcquisitionTimeout(_) => "LOCK_ACQUISITION_TIMEOUT",
            SettlementError::LedgerIntegrityViolation(_) => "LEDGER_INTEGRITY_VIOLATION",
            SettlementError::StaleTicket(_) => "STALE_TICKET",
            SettlementError::Config(_) => "CONFIG_ERROR",
            SettlementError::Database(_) => "DATABASE_ERROR",
            SettlementError::Serialization(_) => "SERIALIZATION_ERROR",
        }
    }

    /// Transient errors: the caller retries with the *same* idempotency key.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            SettlementError::IdempotencyInProgress(_) | SettlementError::LockAcquisitionTimeout(_)
        )
    }

    /// 비즈니스 에러는 사유를 그대로, 내부 에러는 상세 정보를 숨김
    pub fn to_response(&self) -> ErrorResponse {
        let (error, details) = match self {
            SettlementError::Database(_)
            | SettlementError::Serialization(_)
            | SettlementError::Config(_) => ("An internal error occurred".to_string(), None),
            SettlementError::LedgerIntegrityViolation(msg) => {
                tracing::error!("Ledger integrity violation surfaced to caller: {}", msg);
                ("An internal error occurred".to_string(), None)
            }
            SettlementError::Validation(msg) => ("Validation failed".to_string(), Some(msg.clone())),
            other => (other.to_string(), None),
        };

        ErrorResponse {
            error,
            code: self.reason_code().to_string(),
            retryable: self.is_retryable(),
            details,
        }
    }
}

/// Lock timeout, NOWAIT failure and deadlock victim all mean "retry later".
fn is_lock_failure(sqlstate: &str) -> bool {
    matches!(sqlstate, PG_LOCK_NOT_AVAILABLE | PG_DEADLOCK_DETECTED)
}

/// SQLx 에러를 SettlementError로 변환
impl From<sqlx::Error> for SettlementError {
    fn from(err: sqlx::Error) -> Self {
        if let Some(code) = err.as_database_error().and_then(|db| db.code()) {
            if is_lock_failure(&code) {
                tracing::warn!("Row lock not acquired: {}", err);
                return SettlementError::LockAcquisitionTimeout("row lock".to_string());
            }
        }
        tracing::error!("SQLx error: {:?}", err);
        SettlementError::Database(err.to_string())
    }
}

impl From<serde_json::Error> for SettlementError {
    fn from(err: serde_json::Error) -> Self {
        SettlementError::Serialization(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transient_errors_are_retryable() {
        assert!(SettlementError::IdempotencyInProgress("k".into()).is_retryable());
        assert!(SettlementError::LockAcquisitionTimeout("listing".into()).is_retryable());
        assert!(!SettlementError::IdempotencyKeyConflict("k".into()).is_retryable());
        assert!(!SettlementError::InsufficientBalance {
            asset_code: "POINTS".into(),
            required: 10,
            available: 0,
        }
        .is_retryable());
    }

    #[test]
    fn test_lock_sqlstates_recognized() {
        assert!(is_lock_failure("55P03"));
        assert!(is_lock_failure("40P01"));
        assert!(!is_lock_failure("23505"));
        assert!(!is_lock_failure("40001"));
    }

    #[test]
    fn test_non_database_sqlx_error_not_lock_failure() {
        let err = SettlementError::from(sqlx::Error::RowNotFound);
        assert!(matches!(err, SettlementError::Database(_)));
        assert!(!err.is_retryable());
    }

    #[test]
    fn test_internal_details_hidden() {
        let resp = SettlementError::Database("password auth failed for user".into()).to_response();
        assert_eq!(resp.code, "DATABASE_ERROR");
        assert!(!resp.error.contains("password"));

        let resp = SettlementError::ListingUnavailable {
            listing_id: Uuid::nil(),
            status: "sold".into(),
        }
        .to_response();
        assert_eq!(resp.code, "LISTING_UNAVAILABLE");
        assert!(resp.error.contains("sold"));
    }
}
