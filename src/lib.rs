//! Cash desk ledger: note-level cash balances for a fixed roster of cashiers,
//! an append-only transaction log, balance queries over time windows and
//! file backups.
pub mod config;
pub mod desk;
