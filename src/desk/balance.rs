//! Cash held by one cashier in one currency.
use std::collections::BTreeMap;

use rust_decimal::Decimal;

use crate::desk::{Currency, Denominations, FaceValue, LedgerError, NoteCount};

/// The notes one cashier holds in one currency.
///
/// Every stored face value is legal for the currency; counts are never negative.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CashBalance {
    currency: Currency,
    counts: Denominations,
}

impl CashBalance {
    /// Creates an empty balance.
    pub fn new(currency: Currency) -> Self {
        CashBalance {
            currency,
            counts: Denominations::new(),
        }
    }

    /// Creates a balance holding `counts`. Fails if any face value is illegal for the currency.
    pub fn with_counts(currency: Currency, counts: Denominations) -> Result<Self, LedgerError> {
        currency.validate_faces(counts.faces())?;
        Ok(CashBalance { currency, counts })
    }

    pub fn currency(&self) -> Currency {
        self.currency
    }

    /// Current counts.
    pub fn counts(&self) -> &Denominations {
        &self.counts
    }

    /// Every legal face value with its count, zeros included.
    pub fn denominations(&self) -> BTreeMap<FaceValue, NoteCount> {
        self.counts.dense(self.currency)
    }

    pub fn count(&self, face: FaceValue) -> NoteCount {
        self.counts.count(face)
    }

    /// Sets one face value's count.
    pub fn set_count(&mut self, face: FaceValue, count: NoteCount) -> Result<(), LedgerError> {
        self.currency.validate_faces([face])?;
        self.counts.set(face, count);
        Ok(())
    }

    /// Total value held.
    pub fn total(&self) -> Decimal {
        self.counts.total()
    }

    /// Adds deposited notes. Leaves the balance untouched on failure.
    pub fn deposit(&mut self, notes: &Denominations) -> Result<(), LedgerError> {
        self.currency.validate_faces(notes.faces())?;
        self.counts.add(notes)
    }

    /// Removes withdrawn notes. Leaves the balance untouched on failure.
    pub fn withdraw(&mut self, notes: &Denominations) -> Result<(), LedgerError> {
        self.currency.validate_faces(notes.faces())?;
        self.counts
            .checked_remove(notes)
            .map_err(|shortfalls| LedgerError::InsufficientFunds {
                currency: self.currency,
                shortfalls,
            })
    }
}

/// Balances of one cashier, one entry per currency.
pub type CashierBalances = BTreeMap<Currency, CashBalance>;

/// Balance every cashier starts with before any transaction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Seed(BTreeMap<Currency, Denominations>);

impl Seed {
    /// Builds a seed; currencies not listed start empty.
    pub fn new(
        counts: impl IntoIterator<Item = (Currency, Denominations)>,
    ) -> Result<Self, LedgerError> {
        let counts: BTreeMap<_, _> = counts.into_iter().collect();
        for (currency, notes) in &counts {
            currency.validate_faces(notes.faces())?;
        }
        Ok(Seed(counts))
    }

    /// Starting notes for one currency.
    pub fn counts(&self, currency: Currency) -> Denominations {
        self.0.get(&currency).cloned().unwrap_or_default()
    }

    /// Starting balance for one currency.
    pub fn balance(&self, currency: Currency) -> CashBalance {
        CashBalance {
            currency,
            counts: self.counts(currency),
        }
    }

    /// Starting balances of one cashier.
    pub fn balances(&self) -> CashierBalances {
        Currency::ALL
            .into_iter()
            .map(|currency| (currency, self.balance(currency)))
            .collect()
    }
}

impl Default for Seed {
    /// BGN 1000 as 50x10 + 10x50; EUR 2000 as 100x10 + 20x50.
    fn default() -> Self {
        Seed(BTreeMap::from([
            (Currency::Bgn, Denominations::from([(10, 50), (50, 10)])),
            (Currency::Eur, Denominations::from([(10, 100), (20, 0), (50, 20)])),
        ]))
    }
}

/// Checks that `notes` add up to exactly `amount`.
pub fn validate_sum(notes: &Denominations, amount: Decimal) -> Result<(), LedgerError> {
    let actual = notes.total();
    if actual != amount {
        return Err(LedgerError::AmountMismatch {
            expected: amount,
            actual,
        });
    }
    Ok(())
}
