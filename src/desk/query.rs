//! Current balances, and balances over a time window rebuilt from the transaction log.
use std::{collections::BTreeMap, sync::Arc};

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::Serialize;
use tracing::{debug, warn};

use crate::desk::{
    BalanceStore, Cashier, Currency, Denominations, FaceValue, LedgerError, NoteCount,
    OperationKind, Timestamp, Transaction, TransactionLog,
};

/// Balance of one currency as it is now.
#[derive(Serialize, Debug, Clone, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct CurrencyBalance {
    pub currency: Currency,
    pub total: Decimal,
    pub denomination_counts: BTreeMap<FaceValue, NoteCount>,
}

/// Movement of one currency over a time window.
#[derive(Serialize, Debug, Clone, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct PeriodSummary {
    pub currency: Currency,
    pub starting_total: Decimal,
    pub starting_denominations: BTreeMap<FaceValue, NoteCount>,
    pub ending_total: Decimal,
    pub ending_denominations: BTreeMap<FaceValue, NoteCount>,
    pub net_change: Decimal,
    /// Transactions inside the window, oldest first.
    pub transactions: Vec<Transaction>,
}

/// One cashier's balances, one entry per currency.
#[derive(Serialize, Debug, Clone, PartialEq, Eq)]
pub struct CashierReport<T> {
    pub cashier: Cashier,
    pub currencies: Vec<T>,
}

/// Answer to a balance query.
#[derive(Serialize, Debug, Clone, PartialEq, Eq)]
#[serde(tag = "view", rename_all = "lowercase")]
pub enum BalanceReport {
    Current {
        cashiers: Vec<CashierReport<CurrencyBalance>>,
    },
    Period {
        from: Option<Timestamp>,
        to: Option<Timestamp>,
        cashiers: Vec<CashierReport<PeriodSummary>>,
    },
}

/// Read-only view over the balance store and the transaction log.
pub struct BalanceQuery {
    store: Arc<BalanceStore>,
    log: Arc<TransactionLog>,
}

impl BalanceQuery {
    pub fn new(store: Arc<BalanceStore>, log: Arc<TransactionLog>) -> Self {
        BalanceQuery { store, log }
    }

    /// Answers a query from client input. Without bounds the live balances are
    /// returned; with either bound the balances are rebuilt from the log.
    pub fn query(
        &self,
        cashier: Option<&str>,
        from: Option<Timestamp>,
        to: Option<Timestamp>,
    ) -> Result<BalanceReport, LedgerError> {
        let cashier = cashier.map(str::parse::<Cashier>).transpose()?;
        if from.is_none() && to.is_none() {
            return Ok(BalanceReport::Current {
                cashiers: self.current(cashier),
            });
        }
        Ok(BalanceReport::Period {
            from,
            to,
            cashiers: self.period(cashier, from, to)?,
        })
    }

    /// Live balances of one cashier, or of every cashier in roster order.
    pub fn current(&self, cashier: Option<Cashier>) -> Vec<CashierReport<CurrencyBalance>> {
        selected(cashier)
            .map(|cashier| CashierReport {
                cashier,
                currencies: self
                    .store
                    .get(cashier)
                    .into_values()
                    .map(|balance| CurrencyBalance {
                        currency: balance.currency(),
                        total: balance.total(),
                        denomination_counts: balance.denominations(),
                    })
                    .collect(),
            })
            .collect()
    }

    /// Balances over `[from, to]`, both bounds inclusive and optional.
    ///
    /// The starting balance is the seed replayed through every transaction before
    /// `from`; the window's transactions are then applied in timestamp order.
    pub fn period(
        &self,
        cashier: Option<Cashier>,
        from: Option<Timestamp>,
        to: Option<Timestamp>,
    ) -> Result<Vec<CashierReport<PeriodSummary>>, LedgerError> {
        if let (Some(from), Some(to)) = (from, to) {
            if from > to {
                return Err(LedgerError::InvalidDateRange { from, to });
            }
        }

        let mut history = self.log.by_cashier_and_range(cashier, None, to);
        // Stable, so transactions sharing a timestamp keep their append order.
        history.sort_by_key(Transaction::get_timestamp);
        debug!(transactions = history.len(), "replaying transaction history");

        Ok(selected(cashier)
            .map(|cashier| CashierReport {
                cashier,
                currencies: Currency::ALL
                    .into_iter()
                    .map(|currency| self.summarize(cashier, currency, &history, from))
                    .collect(),
            })
            .collect())
    }

    fn summarize(
        &self,
        cashier: Cashier,
        currency: Currency,
        history: &[Transaction],
        from: Option<Timestamp>,
    ) -> PeriodSummary {
        let (before, window): (Vec<&Transaction>, Vec<&Transaction>) = history
            .iter()
            .filter(|tx| tx.get_cashier() == cashier && tx.get_currency() == currency)
            .partition(|tx| from.is_some_and(|from| tx.get_timestamp() < from));

        let mut counts = self.store.seed().counts(currency);
        for tx in before {
            replay(&mut counts, tx);
        }
        let starting_total = counts.total();
        let starting_denominations = counts.dense(currency);

        let mut net_change = Decimal::ZERO;
        for tx in &window {
            replay(&mut counts, tx);
            net_change += tx.signed_amount();
        }

        PeriodSummary {
            currency,
            starting_total,
            starting_denominations,
            ending_total: counts.total(),
            ending_denominations: counts.dense(currency),
            net_change,
            transactions: window.into_iter().cloned().collect(),
        }
    }
}

/// Applies a logged transaction without re-checking sufficiency.
fn replay(counts: &mut Denominations, tx: &Transaction) {
    match tx.get_kind() {
        OperationKind::Deposit => {
            if let Err(err) = counts.add(tx.get_denominations()) {
                warn!(id = %tx.get_id(), error = %err, "deposit overflows replayed balance, skipping it");
            }
        }
        OperationKind::Withdrawal => {
            let clamped = counts.remove_clamped(tx.get_denominations());
            if !clamped.is_empty() {
                warn!(id = %tx.get_id(), "withdrawal exceeds replayed balance, clamping at zero");
            }
        }
    }
}

fn selected(cashier: Option<Cashier>) -> impl Iterator<Item = Cashier> {
    Cashier::ALL
        .into_iter()
        .filter(move |candidate| cashier.is_none_or(|cashier| cashier == *candidate))
}

/// Parses an RFC 3339 instant, converting it to UTC.
pub fn parse_instant(value: &str) -> Result<Timestamp, LedgerError> {
    DateTime::parse_from_rfc3339(value.trim())
        .map(|at| at.with_timezone(&Utc))
        .map_err(|_| LedgerError::InvalidTimestamp(value.to_string()))
}

#[cfg(test)]
mod tests {
    use chrono::{Duration, TimeZone};
    use tempfile::{TempDir, tempdir};

    use super::*;
    use crate::desk::{CashOperations, ManualClock, Operation, Seed};

    struct Fixture {
        _dir: TempDir,
        clock: Arc<ManualClock>,
        operations: CashOperations,
        query: BalanceQuery,
    }

    fn fixture() -> Fixture {
        let dir = tempdir().unwrap();
        let store =
            Arc::new(BalanceStore::open(dir.path().join("balances.txt"), Seed::default()).unwrap());
        let log = Arc::new(TransactionLog::open(dir.path().join("transactions.txt")).unwrap());
        let clock = Arc::new(ManualClock::new(at(8)));
        Fixture {
            _dir: dir,
            operations: CashOperations::new(store.clone(), log.clone(), clock.clone()),
            query: BalanceQuery::new(store, log),
            clock,
        }
    }

    fn at(hour: u32) -> Timestamp {
        Utc.with_ymd_and_hms(2025, 6, 2, hour, 0, 0).unwrap()
    }

    impl Fixture {
        fn run(&self, hour: u32, kind: OperationKind, cashier: Cashier, notes: Denominations) {
            self.clock.set(at(hour));
            let operation = Operation::new(kind, cashier, Currency::Bgn, notes.total(), notes).unwrap();
            self.operations.execute(operation).unwrap();
        }
    }

    fn bgn(report: &[CashierReport<PeriodSummary>]) -> &PeriodSummary {
        report[0]
            .currencies
            .iter()
            .find(|summary| summary.currency == Currency::Bgn)
            .unwrap()
    }

    #[test]
    fn test_period_with_deposit_and_withdrawal() {
        let fixture = fixture();
        fixture.run(10, OperationKind::Deposit, Cashier::Martina, Denominations::from([(10, 10), (50, 10)]));
        fixture.run(11, OperationKind::Withdrawal, Cashier::Martina, Denominations::from([(10, 10)]));

        let report = fixture
            .query
            .period(Some(Cashier::Martina), Some(at(9)), Some(at(12)))
            .unwrap();
        let summary = bgn(&report);
        assert_eq!(summary.starting_total, Decimal::from(1000));
        assert_eq!(summary.net_change, Decimal::from(500));
        assert_eq!(summary.ending_total, Decimal::from(1500));
        assert_eq!(summary.ending_denominations, BTreeMap::from([(10, 50), (50, 20)]));
        assert_eq!(summary.transactions.len(), 2);
    }

    #[test]
    fn test_period_starts_after_earlier_transactions() {
        let fixture = fixture();
        fixture.run(9, OperationKind::Deposit, Cashier::Peter, Denominations::from([(50, 1)]));
        fixture.run(10, OperationKind::Withdrawal, Cashier::Peter, Denominations::from([(10, 5)]));
        fixture.run(12, OperationKind::Deposit, Cashier::Peter, Denominations::from([(10, 1)]));

        let report = fixture
            .query
            .period(Some(Cashier::Peter), Some(at(10)), Some(at(11)))
            .unwrap();
        let summary = bgn(&report);
        assert_eq!(summary.starting_total, Decimal::from(1050));
        assert_eq!(summary.starting_denominations, BTreeMap::from([(10, 50), (50, 11)]));
        assert_eq!(summary.net_change, Decimal::from(-50));
        assert_eq!(summary.ending_total, Decimal::from(1000));
        assert_eq!(summary.transactions.len(), 1);
    }

    #[test]
    fn test_open_ended_period() {
        let fixture = fixture();
        fixture.run(9, OperationKind::Deposit, Cashier::Linda, Denominations::from([(50, 1)]));
        fixture.run(10, OperationKind::Deposit, Cashier::Linda, Denominations::from([(10, 1)]));

        let report = fixture.query.period(Some(Cashier::Linda), None, Some(at(9))).unwrap();
        let summary = bgn(&report);
        assert_eq!(summary.starting_total, Decimal::from(1000));
        assert_eq!(summary.ending_total, Decimal::from(1050));

        let report = fixture.query.period(Some(Cashier::Linda), Some(at(10)), None).unwrap();
        let summary = bgn(&report);
        assert_eq!(summary.starting_total, Decimal::from(1050));
        assert_eq!(summary.ending_total, Decimal::from(1060));
    }

    #[test]
    fn test_same_timestamp_keeps_append_order() {
        let fixture = fixture();
        fixture.run(10, OperationKind::Deposit, Cashier::Martina, Denominations::from([(50, 1)]));
        fixture.run(10, OperationKind::Deposit, Cashier::Martina, Denominations::from([(10, 1)]));

        let report = fixture.query.period(Some(Cashier::Martina), Some(at(10)), Some(at(10))).unwrap();
        let amounts: Vec<_> = bgn(&report).transactions.iter().map(Transaction::get_amount).collect();
        assert_eq!(amounts, vec![Decimal::from(50), Decimal::from(10)]);
    }

    #[test]
    fn test_reversed_range_is_rejected() {
        let fixture = fixture();
        assert!(matches!(
            fixture.query.period(None, Some(at(12)), Some(at(9))),
            Err(LedgerError::InvalidDateRange { .. })
        ));
    }

    #[test]
    fn test_query_dispatch() {
        let fixture = fixture();
        fixture.run(10, OperationKind::Deposit, Cashier::Peter, Denominations::from([(10, 1)]));

        let report = fixture.query.query(Some("peter"), None, None).unwrap();
        let BalanceReport::Current { cashiers } = report else {
            panic!("expected current balances");
        };
        assert_eq!(cashiers.len(), 1);
        assert_eq!(cashiers[0].cashier, Cashier::Peter);
        assert_eq!(cashiers[0].currencies[0].total, Decimal::from(1010));

        let report = fixture.query.query(None, Some(at(0)), None).unwrap();
        let BalanceReport::Period { cashiers, .. } = report else {
            panic!("expected a period report");
        };
        assert_eq!(
            cashiers.iter().map(|report| report.cashier).collect::<Vec<_>>(),
            Cashier::ALL.to_vec()
        );

        assert!(matches!(
            fixture.query.query(Some("BOB"), None, None),
            Err(LedgerError::InvalidCashier(_))
        ));
    }

    #[test]
    fn test_current_report_serializes_camel_case() {
        let fixture = fixture();
        let report = fixture.query.query(Some("LINDA"), None, None).unwrap();
        let json = serde_json::to_value(&report).unwrap();
        assert_eq!(json["view"], "current");
        assert_eq!(json["cashiers"][0]["cashier"], "LINDA");
        assert_eq!(json["cashiers"][0]["currencies"][1]["denominationCounts"]["20"], 0);
    }

    #[test]
    fn test_parse_instant() {
        assert_eq!(parse_instant("2025-06-02T10:00:00Z").unwrap(), at(10));
        assert_eq!(parse_instant("2025-06-02T12:00:00+02:00").unwrap(), at(10));
        assert_eq!(
            parse_instant("2025-06-02T10:00:00.5Z").unwrap(),
            at(10) + Duration::milliseconds(500)
        );
        assert!(matches!(
            parse_instant("yesterday"),
            Err(LedgerError::InvalidTimestamp(_))
        ));
    }
}
