//! Error types for the ledger

use crate::types::WorkerId;
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Result type for ledger operations
pub type Result<T> = std::result::Result<T, Error>;

/// Domain failure reasons.
///
/// These are expected business outcomes. They are reported to the caller
/// inside the operation result, always logged, and never mutate balances.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ErrorKind {
    /// Account id is unknown (or a new account was set without a currency)
    AccountNotFound,
    /// Neither the pair nor its inverse has a stored rate
    RateNotFound,
    /// Debited balance is lower than the requested amount
    InsufficientFunds,
    /// Account currency differs from the requested currency
    CurrencyMismatch,
    /// Negative balance, non-positive rate or non-positive amount
    InvalidAmount,
}

impl ErrorKind {
    /// Stable name used on the wire and in the log
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::AccountNotFound => "AccountNotFound",
            ErrorKind::RateNotFound => "RateNotFound",
            ErrorKind::InsufficientFunds => "InsufficientFunds",
            ErrorKind::CurrencyMismatch => "CurrencyMismatch",
            ErrorKind::InvalidAmount => "InvalidAmount",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Ledger errors
#[derive(Error, Debug)]
pub enum Error {
    /// Domain failure (recoverable, reported in the result payload)
    #[error("Domain error: {0}")]
    Domain(ErrorKind),

    /// No writer answered a routed mutation in time
    #[error("Writer unavailable: {0}")]
    WriterUnavailable(String),

    /// Caller tried to persist without holding the writer role
    #[error("Worker {0} does not hold the writer role")]
    NotWriter(WorkerId),

    /// Durable write failed; fatal for the writer
    #[error("Persistence error: {0}")]
    Persistence(String),

    /// Snapshot checksum mismatch
    #[error("Snapshot integrity check failed: expected {expected}, got {actual}")]
    Integrity {
        /// Checksum recorded in the envelope
        expected: String,
        /// Checksum computed over the loaded state
        actual: String,
    },

    /// Snapshot written by a newer format version
    #[error("Unsupported snapshot version: {0}")]
    UnsupportedVersion(u32),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] bincode::Error),

    /// JSON error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// The worker's mailbox is closed: it exited
    #[error("Worker {0} mailbox closed")]
    MailboxClosed(WorkerId),

    /// Concurrency error (dropped reply channel, etc.)
    #[error("Concurrency error: {0}")]
    Concurrency(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// A worker slot crashed more often than its restart budget allows
    #[error("Restart budget exhausted for worker slot {0}")]
    RestartBudgetExhausted(usize),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Generic error
    #[error("{0}")]
    Other(String),
}

impl Error {
    /// Domain failure reason, if this is one
    pub fn kind(&self) -> Option<ErrorKind> {
        match self {
            Error::Domain(kind) => Some(*kind),
            _ => None,
        }
    }

    /// Faults that leave the writer unable to durably record mutations.
    pub fn is_persistence_fault(&self) -> bool {
        matches!(
            self,
            Error::Persistence(_)
                | Error::NotWriter(_)
                | Error::Io(_)
                | Error::Serialization(_)
                | Error::Json(_)
        )
    }
}

impl From<ErrorKind> for Error {
    fn from(kind: ErrorKind) -> Self {
        Error::Domain(kind)
    }
}

impl From<String> for Error {
    fn from(msg: String) -> Self {
        Error::Other(msg)
    }
}

impl From<&str> for Error {
    fn from(msg: &str) -> Self {
        Error::Other(msg.to_string())
    }
}
