use thiserror::Error;
use uuid::Uuid;

use crate::decimal::Money;
use crate::payment::PayoutStatus;

#[derive(Error, Debug)]
pub enum LedgerError {
    #[error("validation failed: {message}")]
    Validation {
        message: String,
    },

    #[error("duplicate transaction for idempotency key {key}")]
    DuplicateTransaction {
        key: String,
        existing: Uuid,
    },

    #[error("insufficient balance: available {available}, requested {requested}")]
    InsufficientBalance {
        available: Money,
        requested: Money,
    },

    #[error("account blocked: {reason}")]
    AccountBlocked {
        owner: Uuid,
        reason: String,
    },

    #[error("due {due} already settled")]
    AlreadySettled {
        due: Uuid,
    },

    #[error("payment {payment} already refunded")]
    AlreadyRefunded {
        payment: Uuid,
    },

    #[error("refund window expired: {days_elapsed} days elapsed, window is {window_days} days")]
    RefundWindowExpired {
        days_elapsed: i64,
        window_days: u32,
    },

    #[error("gateway error: {message}")]
    Gateway {
        message: String,
    },

    #[error("payment not found: {payment}")]
    PaymentNotFound {
        payment: Uuid,
    },

    #[error("due not found: {due}")]
    DueNotFound {
        due: Uuid,
    },

    #[error("payout {payout} is {status:?}, expected pending")]
    PayoutNotPending {
        payout: Uuid,
        status: PayoutStatus,
    },
}

impl LedgerError {
    /// duplicate webhook deliveries are expected; callers treat this as
    /// "already processed" rather than a failure to surface
    pub fn is_duplicate(&self) -> bool {
        matches!(self, LedgerError::DuplicateTransaction { .. })
    }
}

pub type Result<T> = std::result::Result<T, LedgerError>;
