//! Crate-wide error type.
//!
//! This module defines the error hierarchy surfaced by the delivery service to its
//! callers (the queue processor, the facade, and operator-facing tools). It does not
//! convert to any wire format itself; producers see the typed [`ErrorCode`] values
//! from [`Error::code`], and the service logs full detail via `tracing`.
//!
//! # Error Hierarchy
//!
//! - **Configuration**: invalid destination config, missing encryption key
//! - **NotFound** / **Conflict**: CRUD-level problems
//! - **Database**: wraps [`DbError`]
//! - **Other**: unexpected error with full context chain, for bugs and I/O surprises

use crate::db::errors::DbError;
use thiserror::Error as ThisError;

#[derive(ThisError, Debug)]
pub enum Error {
    /// Requested resource not found
    #[error("{resource} with id {id} not found")]
    NotFound { resource: String, id: String },

    /// Destination configuration failed validation
    #[error("invalid destination config: {message}")]
    InvalidConfig { message: String },

    /// Destination is disabled and cannot accept new deliveries
    #[error("destination {destination_id} is disabled")]
    DestinationDisabled { destination_id: String },

    /// Circuit breaker is open for the destination
    #[error("circuit open for destination {destination_id}")]
    CircuitOpen { destination_id: String },

    /// Local rate limiter denied the call
    #[error("rate limited: retry after {retry_after_secs}s")]
    RateLimited { retry_after_secs: u64 },

    /// All configured retries have been exhausted
    #[error("retries exhausted for delivery {delivery_id}")]
    RetriesExhausted { delivery_id: String },

    /// Conflicting state, e.g. unique constraint violation surfaced as a business rule
    #[error("conflict: {message}")]
    Conflict { message: String },

    /// Database operation error
    #[error(transparent)]
    Database(#[from] DbError),

    /// Unexpected error with full context chain
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Stable error codes surfaced to producers. These are independent of
/// the `Display` text, which is for logs/operators, not for wire contracts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCode {
    DestinationNotFound,
    DestinationDisabled,
    InvalidConfig,
    DuplicateIdempotencyKey,
    CircuitOpen,
    RateLimited,
    RetriesExhausted,
    Internal,
}

impl ErrorCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCode::DestinationNotFound => "DESTINATION_NOT_FOUND",
            ErrorCode::DestinationDisabled => "DESTINATION_DISABLED",
            ErrorCode::InvalidConfig => "INVALID_CONFIG",
            ErrorCode::DuplicateIdempotencyKey => "DUPLICATE_IDEMPOTENCY_KEY",
            ErrorCode::CircuitOpen => "CIRCUIT_OPEN",
            ErrorCode::RateLimited => "RATE_LIMITED",
            ErrorCode::RetriesExhausted => "RETRIES_EXHAUSTED",
            ErrorCode::Internal => "INTERNAL",
        }
    }
}

impl Error {
    pub fn code(&self) -> ErrorCode {
        match self {
            Error::NotFound { .. } => ErrorCode::DestinationNotFound,
            Error::InvalidConfig { .. } => ErrorCode::InvalidConfig,
            Error::DestinationDisabled { .. } => ErrorCode::DestinationDisabled,
            Error::CircuitOpen { .. } => ErrorCode::CircuitOpen,
            Error::RateLimited { .. } => ErrorCode::RateLimited,
            Error::RetriesExhausted { .. } => ErrorCode::RetriesExhausted,
            Error::Conflict { .. } => ErrorCode::DuplicateIdempotencyKey,
            Error::Database(DbError::NotFound) => ErrorCode::DestinationNotFound,
            Error::Database(_) | Error::Other(_) => ErrorCode::Internal,
        }
    }

    /// Log this error at the level appropriate to its severity, then return it.
    pub fn log(self) -> Self {
        match &self {
            Error::Database(DbError::Other(_)) | Error::Other(_) => {
                tracing::error!(error = %self, "internal error");
            }
            Error::Database(_) | Error::Conflict { .. } => {
                tracing::warn!(error = %self, "database constraint error");
            }
            Error::CircuitOpen { .. } | Error::RateLimited { .. } | Error::DestinationDisabled { .. } => {
                tracing::info!(error = %self, "delivery suppressed");
            }
            Error::NotFound { .. } | Error::InvalidConfig { .. } | Error::RetriesExhausted { .. } => {
                tracing::debug!(error = %self, "client error");
            }
        }
        self
    }
}

pub type Result<T> = std::result::Result<T, Error>;
