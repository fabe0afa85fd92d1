//! Applies deposits and withdrawals to a cashier's balance and records them.
use std::sync::Arc;

use tracing::{error, info, info_span, warn};

use crate::desk::{
    BalanceStore, CashBalance, Clock, LedgerError, Operation, OperationKind, OperationRequest,
    Transaction, TransactionLog,
};

/// Moves cash in and out of cashier balances.
///
/// For one cashier, reading the balance, computing the new one, saving it and
/// appending the transaction all happen under that cashier's write lock.
pub struct CashOperations {
    store: Arc<BalanceStore>,
    log: Arc<TransactionLog>,
    clock: Arc<dyn Clock>,
}

impl CashOperations {
    pub fn new(store: Arc<BalanceStore>, log: Arc<TransactionLog>, clock: Arc<dyn Clock>) -> Self {
        CashOperations { store, log, clock }
    }

    /// Validates a raw request and applies it.
    pub fn apply(&self, request: &OperationRequest) -> Result<Transaction, LedgerError> {
        let operation = request.validate()?;
        self.execute(operation)
    }

    /// Applies a validated operation.
    ///
    /// Nothing changes unless the balance is saved and the transaction is logged.
    pub fn execute(&self, operation: Operation) -> Result<Transaction, LedgerError> {
        let span = info_span!(
            "cash_operation",
            cashier = %operation.cashier,
            kind = %operation.kind,
            currency = %operation.currency,
            amount = %operation.amount,
        );
        let _entered = span.enter();

        let mut guard = self.store.lock(operation.cashier);
        let before = guard.balances().clone();
        let mut after = before.clone();
        let balance = after
            .entry(operation.currency)
            .or_insert_with(|| CashBalance::new(operation.currency));

        let applied = match operation.kind {
            OperationKind::Deposit => balance.deposit(&operation.notes),
            OperationKind::Withdrawal => balance.withdraw(&operation.notes),
        };
        if let Err(err) = applied {
            warn!(error = %err, "operation rejected");
            return Err(err);
        }

        let tx = Transaction::record(operation, self.clock.now());
        if let Err(err) = guard.commit(after) {
            error!(error = %err, "failed to save balance");
            return Err(err.into());
        }

        if let Err(err) = self.log.append(&tx) {
            error!(id = %tx.get_id(), error = %err, "failed to log transaction, restoring balance");
            if let Err(restore_err) = guard.commit(before) {
                error!(
                    id = %tx.get_id(),
                    error = %restore_err,
                    "failed to restore balance, balance file and transaction log have diverged"
                );
            }
            return Err(err.into());
        }

        info!(id = %tx.get_id(), "operation accepted");
        Ok(tx)
    }

    pub fn store(&self) -> &Arc<BalanceStore> {
        &self.store
    }

    pub fn log(&self) -> &Arc<TransactionLog> {
        &self.log
    }
}

#[cfg(test)]
mod tests {
    use std::{collections::BTreeMap, fs, sync::Barrier, thread};

    use chrono::{TimeZone, Utc};
    use proptest::prelude::*;
    use rust_decimal::Decimal;
    use tempfile::{TempDir, tempdir};

    use super::*;
    use crate::desk::{Cashier, Currency, Denominations, ManualClock, Seed, SystemClock};

    fn desk(seed: Seed) -> (TempDir, CashOperations) {
        let dir = tempdir().unwrap();
        let store = BalanceStore::open(dir.path().join("balances.txt"), seed).unwrap();
        let log = TransactionLog::open(dir.path().join("transactions.txt")).unwrap();
        let clock = ManualClock::new(Utc.with_ymd_and_hms(2025, 1, 1, 9, 0, 0).unwrap());
        let operations = CashOperations::new(Arc::new(store), Arc::new(log), Arc::new(clock));
        (dir, operations)
    }

    fn operation(
        kind: OperationKind,
        cashier: Cashier,
        currency: Currency,
        notes: Denominations,
    ) -> Operation {
        Operation::new(kind, cashier, currency, notes.total(), notes).unwrap()
    }

    #[test]
    fn test_deposit_into_zero_balance() {
        let (_dir, operations) = desk(Seed::new([]).unwrap());
        let tx = operations
            .execute(operation(
                OperationKind::Deposit,
                Cashier::Martina,
                Currency::Bgn,
                Denominations::from([(10, 10), (50, 10)]),
            ))
            .unwrap();

        let balance = &operations.store().get(Cashier::Martina)[&Currency::Bgn];
        assert_eq!(balance.counts(), &Denominations::from([(10, 10), (50, 10)]));
        assert_eq!(balance.total(), Decimal::from(600));
        assert_eq!(operations.log().all(), vec![tx]);
    }

    #[test]
    fn test_withdraw_from_seeded_balance() {
        let (_dir, operations) = desk(Seed::default());
        let tx = operations
            .execute(operation(
                OperationKind::Withdrawal,
                Cashier::Peter,
                Currency::Bgn,
                Denominations::from([(10, 10)]),
            ))
            .unwrap();
        assert_eq!(tx.get_amount(), Decimal::from(100));
        assert_eq!(
            tx.get_timestamp(),
            Utc.with_ymd_and_hms(2025, 1, 1, 9, 0, 0).unwrap()
        );

        let balance = &operations.store().get(Cashier::Peter)[&Currency::Bgn];
        assert_eq!(balance.counts(), &Denominations::from([(10, 40), (50, 10)]));
        assert_eq!(balance.total(), Decimal::from(900));
    }

    #[test]
    fn test_withdraw_more_notes_than_held() {
        let (_dir, operations) = desk(Seed::default());
        let result = operations.execute(operation(
            OperationKind::Withdrawal,
            Cashier::Linda,
            Currency::Bgn,
            Denominations::from([(50, 15)]),
        ));
        assert!(matches!(
            result,
            Err(LedgerError::InsufficientFunds { ref shortfalls, .. })
                if shortfalls.len() == 1 && shortfalls[0].missing() == 5
        ));
        assert_eq!(operations.store().get(Cashier::Linda), Seed::default().balances());
        assert!(operations.log().is_empty());
    }

    #[test]
    fn test_deposit_that_overflows_a_count_is_rejected() {
        let (_dir, operations) = desk(Seed::default());
        let result = operations.execute(operation(
            OperationKind::Deposit,
            Cashier::Peter,
            Currency::Bgn,
            Denominations::from([(10, u64::MAX)]),
        ));
        assert!(matches!(result, Err(LedgerError::CountOverflow { face: 10 })));
        assert_eq!(operations.store().get(Cashier::Peter), Seed::default().balances());
        assert!(operations.log().is_empty());
    }

    #[test]
    fn test_apply_rejects_invalid_request() {
        let (_dir, operations) = desk(Seed::default());
        let request = OperationRequest {
            kind: "DEPOSIT".to_string(),
            cashier: "PETER".to_string(),
            currency: "BGN".to_string(),
            amount: "100".to_string(),
            denominations: "10:1".to_string(),
        };
        assert!(matches!(
            operations.apply(&request),
            Err(LedgerError::AmountMismatch { .. })
        ));
        assert!(operations.log().is_empty());
    }

    #[test]
    fn test_concurrent_withdrawals_cannot_overdraw() {
        let (_dir, operations) = desk(Seed::default());
        let barrier = Barrier::new(2);

        let results: Vec<_> = thread::scope(|scope| {
            let handles: Vec<_> = (0..2)
                .map(|_| {
                    scope.spawn(|| {
                        barrier.wait();
                        operations.execute(operation(
                            OperationKind::Withdrawal,
                            Cashier::Martina,
                            Currency::Bgn,
                            Denominations::from([(50, 6)]),
                        ))
                    })
                })
                .collect();
            handles.into_iter().map(|h| h.join().unwrap()).collect()
        });

        assert_eq!(results.iter().filter(|result| result.is_ok()).count(), 1);
        assert!(results.iter().any(|result| matches!(
            result,
            Err(LedgerError::InsufficientFunds { .. })
        )));
        assert_eq!(
            operations.store().get(Cashier::Martina)[&Currency::Bgn].count(50),
            4
        );
        assert_eq!(operations.log().len(), 1);
    }

    #[test]
    fn test_failed_log_append_restores_balance() {
        let (dir, operations) = desk(Seed::default());
        let log_path = dir.path().join("transactions.txt");
        fs::remove_file(&log_path).unwrap();
        fs::create_dir(&log_path).unwrap();

        let result = operations.execute(operation(
            OperationKind::Deposit,
            Cashier::Peter,
            Currency::Eur,
            Denominations::from([(20, 1)]),
        ));
        assert!(matches!(result, Err(LedgerError::Storage(_))));
        assert_eq!(operations.store().get(Cashier::Peter), Seed::default().balances());

        let reopened =
            BalanceStore::open(dir.path().join("balances.txt"), Seed::default()).unwrap();
        assert_eq!(reopened.get(Cashier::Peter), Seed::default().balances());
    }

    /// Seed plus every logged transaction, per cashier and currency.
    fn replay(seed: &Seed, log: &TransactionLog) -> BTreeMap<(Cashier, Currency), Denominations> {
        let mut replayed = BTreeMap::new();
        for cashier in Cashier::ALL {
            for currency in Currency::ALL {
                replayed.insert((cashier, currency), seed.counts(currency));
            }
        }
        for tx in log.all() {
            let Some(counts) = replayed.get_mut(&(tx.get_cashier(), tx.get_currency())) else {
                continue;
            };
            match tx.get_kind() {
                OperationKind::Deposit => counts.add(tx.get_denominations()).unwrap(),
                OperationKind::Withdrawal => {
                    assert!(counts.remove_clamped(tx.get_denominations()).is_empty());
                }
            }
        }
        replayed
    }

    fn arbitrary_operation() -> impl Strategy<Value = Operation> {
        (
            0..Cashier::COUNT,
            any::<bool>(),
            0..Currency::ALL.len(),
            any::<prop::sample::Index>(),
            1u64..40,
        )
            .prop_map(|(cashier, deposit, currency, face, count)| {
                let currency = Currency::ALL[currency];
                let face = *face.get(currency.denominations());
                let kind = if deposit {
                    OperationKind::Deposit
                } else {
                    OperationKind::Withdrawal
                };
                operation(
                    kind,
                    Cashier::ALL[cashier],
                    currency,
                    Denominations::from([(face, count)]),
                )
            })
    }

    proptest! {
        #![proptest_config(ProptestConfig {
            cases: 32,
            ..ProptestConfig::default()
        })]

        /// Property: the live balance always equals the seed replayed through the log.
        #[test]
        fn test_balance_equals_seed_plus_logged_transactions(
            operations in prop::collection::vec(arbitrary_operation(), 1..20)
        ) {
            let dir = tempdir().unwrap();
            let store = Arc::new(
                BalanceStore::open(dir.path().join("balances.txt"), Seed::default()).unwrap(),
            );
            let log = Arc::new(TransactionLog::open(dir.path().join("transactions.txt")).unwrap());
            let desk = CashOperations::new(store.clone(), log.clone(), Arc::new(SystemClock));

            for operation in operations {
                let _ = desk.execute(operation);
            }

            let replayed = replay(store.seed(), &log);
            for (cashier, balances) in store.all() {
                for (currency, balance) in balances {
                    prop_assert_eq!(balance.counts(), &replayed[&(cashier, currency)]);
                }
            }
        }
    }
}
