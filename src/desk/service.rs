//! The `CashDesk` ties the stores, the operation pipeline, the idempotency cache
//! and the backups together, and runs the request dispatch loop.
use std::{
    path::PathBuf,
    sync::Arc,
    time::Duration as StdDuration,
};

use chrono::Duration;
use serde::Serialize;
use tokio::{
    sync::{Semaphore, mpsc},
    task::{JoinHandle, JoinSet},
};
use tracing::{debug, error, info, warn};

use crate::desk::{
    BackupConfig, BackupError, BackupHandle, BackupManager, BalanceQuery, BalanceReport,
    BalanceStore, CashOperations, Clock, IdempotencyCache, LedgerError, OperationReceipt,
    OperationRequest, Seed, StorageError, Timestamp, TransactionLog, validate_key,
};

/// Everything needed to open a desk.
#[derive(Debug, Clone)]
pub struct DeskOptions {
    pub transaction_file: PathBuf,
    pub balance_file: PathBuf,
    pub seed: Seed,
    pub idempotency_ttl: Duration,
    pub idempotency_cleanup_threshold: usize,
    pub backup: BackupConfig,
}

/// A request waiting for the dispatch loop.
#[derive(Debug, Clone)]
pub struct Submission {
    /// Caller-chosen position, echoed in the outcome.
    pub sequence: u64,
    pub request: OperationRequest,
    pub idempotency_key: Option<String>,
}

/// The result of one submission.
#[derive(Debug)]
pub struct Outcome {
    pub sequence: u64,
    pub result: Result<OperationReceipt, LedgerError>,
}

/// A backup together with whether it passed verification.
#[derive(Serialize, Debug, Clone, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct BackupStatus {
    #[serde(flatten)]
    pub backup: BackupHandle,
    pub valid: bool,
}

/// Every backup, newest first.
#[derive(Serialize, Debug, Clone, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct BackupListing {
    pub latest: Option<String>,
    pub backups: Vec<BackupStatus>,
}

/// The cash desk.
pub struct CashDesk {
    store: Arc<BalanceStore>,
    log: Arc<TransactionLog>,
    operations: CashOperations,
    query: BalanceQuery,
    receipts: IdempotencyCache<OperationReceipt>,
    backups: BackupManager,
}

impl CashDesk {
    /// Opens both persisted files, creating them if needed.
    pub fn open(options: DeskOptions, clock: Arc<dyn Clock>) -> Result<Self, StorageError> {
        let log = Arc::new(TransactionLog::open(&options.transaction_file)?);
        let store = Arc::new(BalanceStore::open(&options.balance_file, options.seed)?);
        info!(
            transactions = log.len(),
            log = %options.transaction_file.display(),
            balances = %options.balance_file.display(),
            "cash desk opened"
        );
        Ok(CashDesk {
            operations: CashOperations::new(store.clone(), log.clone(), clock.clone()),
            query: BalanceQuery::new(store.clone(), log.clone()),
            receipts: IdempotencyCache::new(
                clock.clone(),
                options.idempotency_ttl,
                options.idempotency_cleanup_threshold,
            ),
            backups: BackupManager::new(
                options.backup,
                options.transaction_file,
                options.balance_file,
                clock,
            ),
            store,
            log,
        })
    }

    /// Applies a cash operation.
    ///
    /// With a key, a repeated request within the cache lifetime returns the first
    /// result again instead of moving cash twice. Only accepted operations are remembered.
    pub fn submit(
        &self,
        request: &OperationRequest,
        idempotency_key: Option<&str>,
    ) -> Result<OperationReceipt, LedgerError> {
        let key = idempotency_key.map(str::trim).filter(|key| !key.is_empty());
        if let Some(key) = key {
            validate_key(key)?;
            if let Some(receipt) = self.receipts.get(key) {
                info!(key, id = %receipt.transaction_id, "duplicate request, returning previous result");
                return Ok(receipt);
            }
        }

        let tx = self.operations.apply(request)?;
        let receipt = OperationReceipt::from(&tx);
        if let Some(key) = key {
            self.receipts.put(key, receipt.clone());
        }
        Ok(receipt)
    }

    /// Current balances, or balances over a window when either bound is given.
    pub fn balances(
        &self,
        cashier: Option<&str>,
        from: Option<Timestamp>,
        to: Option<Timestamp>,
    ) -> Result<BalanceReport, LedgerError> {
        self.query.query(cashier, from, to)
    }

    /// Backs up both files while every writer is held off.
    pub fn create_backup(&self) -> Result<BackupHandle, BackupError> {
        let _frozen = self.store.read_all();
        self.backups.create()
    }

    pub fn list_backups(&self) -> Result<BackupListing, BackupError> {
        let backups: Vec<_> = self
            .backups
            .list()?
            .into_iter()
            .map(|backup| BackupStatus {
                valid: self.backups.verify(&backup),
                backup,
            })
            .collect();
        Ok(BackupListing {
            latest: backups.first().map(|status| status.backup.name.clone()),
            backups,
        })
    }

    pub fn verify_backup(&self, name: &str) -> Result<bool, BackupError> {
        let backup = self.backups.find(name)?;
        Ok(self.backups.verify(&backup))
    }

    /// Restores both files from a backup and reloads them.
    ///
    /// Every cashier is locked for the whole swap. Returns the number of transactions now logged.
    pub fn restore_backup(&self, name: &str) -> Result<usize, BackupError> {
        let backup = self.backups.find(name)?;
        let mut exclusive = self.store.lock_all();
        let restored = self.backups.restore(&backup);
        // Reload even after a failed restore so memory matches whatever is on disk.
        let transactions = self.log.reload()?;
        exclusive.reload()?;
        if let Err(err) = restored {
            warn!(
                backup = %backup.name,
                error = %err,
                "restore failed, stores reloaded from current files"
            );
            return Err(err);
        }
        // Remembered results may name transactions the restored log does not hold.
        self.receipts.clear();
        info!(backup = %backup.name, transactions, "stores reloaded from backup");
        Ok(transactions)
    }

    pub fn prune_backups(&self) -> Result<usize, BackupError> {
        self.backups.prune()
    }

    /// Runs create-then-prune every `period` until the returned task is aborted.
    pub fn spawn_backup_schedule(self: &Arc<Self>, period: StdDuration) -> JoinHandle<()> {
        let desk = Arc::clone(self);
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            // The first tick completes immediately.
            interval.tick().await;
            loop {
                interval.tick().await;
                let desk = desk.clone();
                let run = tokio::task::spawn_blocking(move || {
                    info!("starting scheduled backup");
                    let backup = desk.create_backup()?;
                    let deleted = desk.prune_backups()?;
                    Ok::<_, BackupError>((backup, deleted))
                })
                .await;
                match run {
                    Ok(Ok((backup, deleted))) => {
                        info!(backup = %backup.name, deleted, "scheduled backup completed")
                    }
                    Ok(Err(err)) => error!(error = %err, "scheduled backup failed"),
                    Err(err) => error!(error = %err, "scheduled backup task failed"),
                }
            }
        })
    }

    /// Runs the dispatch loop: every submission gets its own blocking worker, at
    /// most `workers` at a time, and its outcome is sent on `outcomes`.
    ///
    /// Returns once `receiver` is closed and every worker has finished.
    pub async fn run(
        self: Arc<Self>,
        mut receiver: mpsc::Receiver<Submission>,
        outcomes: mpsc::Sender<Outcome>,
        workers: usize,
    ) {
        let permits = Arc::new(Semaphore::new(workers.max(1)));
        let mut tasks = JoinSet::new();

        while let Some(submission) = receiver.recv().await {
            let Ok(permit) = permits.clone().acquire_owned().await else {
                break;
            };
            let desk = self.clone();
            let outcomes = outcomes.clone();
            tasks.spawn_blocking(move || {
                let _permit = permit;
                let result = desk.submit(&submission.request, submission.idempotency_key.as_deref());
                let outcome = Outcome {
                    sequence: submission.sequence,
                    result,
                };
                if outcomes.blocking_send(outcome).is_err() {
                    debug!(sequence = submission.sequence, "outcome receiver closed");
                }
            });
            while let Some(finished) = tasks.try_join_next() {
                report_join(finished);
            }
        }

        while let Some(finished) = tasks.join_next().await {
            report_join(finished);
        }
    }
}

fn report_join(finished: Result<(), tokio::task::JoinError>) {
    if let Err(err) = finished {
        warn!(error = %err, "request worker failed");
    }
}
