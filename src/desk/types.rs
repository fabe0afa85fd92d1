//! Types used throughout the cash desk.
use chrono::{DateTime, Utc};

/// Face value of a single note, in whole currency units.
pub type FaceValue = u32;

/// Number of notes of one face value.
pub type NoteCount = u64;

/// Transaction ID type, a random UUID assigned when the transaction is created.
pub type TransactionId = uuid::Uuid;

/// Point in time used for transaction timestamps and period bounds.
pub type Timestamp = DateTime<Utc>;

/// Source of the current time.
pub trait Clock: Send + Sync {
    /// Returns the current instant.
    fn now(&self) -> Timestamp;
}

/// Wall clock backed by the system time.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> Timestamp {
        Utc::now()
    }
}

#[cfg(test)]
pub use test_clock::ManualClock;
