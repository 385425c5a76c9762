// src/infra/errors.rs — Error types for Sibyl

use rust_decimal::Decimal;
use thiserror::Error;

use crate::sessions::SessionState;

#[derive(Error, Debug)]
pub enum EngineError {
    // Contract violations (caller bugs)
    #[error("Invalid amount {amount}: must be strictly positive")]
    InvalidAmount { amount: Decimal },

    // Ledger outcomes
    #[error("Insufficient funds on account '{account}': balance {balance} < {requested}")]
    InsufficientFunds {
        account: String,
        balance: Decimal,
        requested: Decimal,
    },

    #[error("Account '{account}' not found")]
    AccountNotFound { account: String },

    // Session lifecycle
    #[error("Session '{session}' not found")]
    SessionNotFound { session: String },

    #[error("Invalid session transition: {from} -> {to}")]
    InvalidTransition {
        from: SessionState,
        to: SessionState,
    },

    #[error("Reconnect grace period expired for session '{session}'")]
    GraceExpired { session: String },

    // Bookings
    #[error("Slot '{slot}' not found")]
    SlotNotFound { slot: String },

    #[error("Slot '{slot}' is not bookable (status: {status})")]
    SlotUnavailable { slot: String, status: String },

    #[error("Booking '{booking}' not found")]
    BookingNotFound { booking: String },

    // External collaborators (transport tokens, payout rail)
    #[error("External call to '{provider}' failed: {message}")]
    ExternalCallFailed { provider: String, message: String },

    // Infra
    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl EngineError {
    /// True for errors that should surface to the initiating caller
    /// rather than be recovered inside a scheduler job.
    pub fn is_caller_visible(&self) -> bool {
        matches!(
            self,
            EngineError::AccountNotFound { .. }
                | EngineError::SessionNotFound { .. }
                | EngineError::InvalidTransition { .. }
                | EngineError::GraceExpired { .. }
                | EngineError::SlotNotFound { .. }
                | EngineError::SlotUnavailable { .. }
        )
    }
}
