//! Cash desk ledger: note-level balances per cashier, the transaction history
//! behind them, and backups of both.
mod backup;
mod balance;
mod currency;
mod denominations;
mod error;
mod idempotency;
mod journal;
mod operations;
mod query;
mod records;
mod service;
mod store;
mod transaction;
mod types;

pub use backup::*;
pub use balance::*;
pub use currency::*;
pub use denominations::*;
pub use error::*;
pub use idempotency::*;
pub use journal::*;
pub use operations::*;
pub use query::*;
pub use service::*;
pub use store::*;
pub use transaction::*;
pub use types::*;
