//! Errors surfaced by the cash desk.
use std::path::{Path, PathBuf};

use rust_decimal::Decimal;
use serde::Serialize;
use thiserror::Error;

use crate::desk::{Currency, Shortfall, Timestamp};

/// Who caused a failed operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorClass {
    /// The request itself is malformed; resubmitting it unchanged fails again.
    Client,
    /// The request is well formed but the desk cannot honour it right now.
    Business,
    /// Storage or data fault inside the desk.
    System,
}

/// Errors that can occur while validating, applying or querying cash operations.
#[derive(Error, Debug)]
pub enum LedgerError {
    #[error("Invalid cashier: {0:?}. Must be one of: MARTINA, PETER, LINDA")]
    InvalidCashier(String),
    #[error("Invalid currency: {0:?}. Must be BGN or EUR")]
    InvalidCurrency(String),
    #[error("Invalid operation type: {0:?}. Must be DEPOSIT or WITHDRAWAL")]
    InvalidOperation(String),
    #[error("Invalid amount: {0:?}")]
    InvalidAmount(String),
    #[error("Amount must be positive, got {0}")]
    NonPositiveAmount(Decimal),
    #[error("Invalid denomination {face} for currency {currency}")]
    InvalidDenomination { face: u32, currency: Currency },
    #[error("Malformed denominations: {0:?}")]
    MalformedDenominations(String),
    #[error("Denominations sum ({actual}) does not match amount ({expected})")]
    AmountMismatch { expected: Decimal, actual: Decimal },
    #[error("Insufficient denominations for {currency} withdrawal: {}", describe_shortfalls(.shortfalls))]
    InsufficientFunds {
        currency: Currency,
        shortfalls: Vec<Shortfall>,
    },
    #[error("Note count overflow for face value {face}")]
    CountOverflow { face: u32 },
    #[error("Invalid timestamp: {0:?}")]
    InvalidTimestamp(String),
    #[error("Invalid date range: from {from} is after to {to}")]
    InvalidDateRange { from: Timestamp, to: Timestamp },
    #[error("Invalid idempotency key: {0}")]
    InvalidIdempotencyKey(String),
    #[error(transparent)]
    Storage(#[from] StorageError),
}

impl LedgerError {
    /// Classifies the error by its cause.
    pub fn class(&self) -> ErrorClass {
        match self {
            LedgerError::InsufficientFunds { .. } | LedgerError::CountOverflow { .. } => {
                ErrorClass::Business
            }
            LedgerError::Storage(_) => ErrorClass::System,
            _ => ErrorClass::Client,
        }
    }
}

fn describe_shortfalls(shortfalls: &[Shortfall]) -> String {
    shortfalls
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}

/// Failures of the persisted files.
#[derive(Error, Debug)]
pub enum StorageError {
    #[error("I/O error on {}: {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

impl StorageError {
    /// Wraps an I/O error with the path it happened on.
    pub fn io(path: impl AsRef<Path>, source: std::io::Error) -> Self {
        StorageError::Io {
            path: path.as_ref().to_path_buf(),
            source,
        }
    }
}

/// Reasons a persisted line could not be decoded.
#[derive(Error, Debug)]
pub enum RecordError {
    #[error("expected {expected} fields, got {got}")]
    FieldCount { expected: &'static str, got: usize },
    #[error("undecodable record: {0}")]
    Decode(#[from] csv::Error),
    #[error("record breaks ledger rules: {0}")]
    Rule(#[from] LedgerError),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_classes() {
        assert_eq!(
            LedgerError::InvalidCashier("BOB".into()).class(),
            ErrorClass::Client
        );
        assert_eq!(
            LedgerError::InsufficientFunds {
                currency: Currency::Bgn,
                shortfalls: vec![],
            }
            .class(),
            ErrorClass::Business
        );
        let io = std::io::Error::other("disk full");
        assert_eq!(
            LedgerError::from(StorageError::io("balances.txt", io)).class(),
            ErrorClass::System
        );
    }

    #[test]
    fn test_insufficient_funds_message_lists_shortfalls() {
        let err = LedgerError::InsufficientFunds {
            currency: Currency::Bgn,
            shortfalls: vec![Shortfall {
                face: 50,
                available: 10,
                required: 15,
            }],
        };
        assert_eq!(
            err.to_string(),
            "Insufficient denominations for BGN withdrawal: 50 notes: available=10, required=15, shortfall=5"
        );
    }
}
