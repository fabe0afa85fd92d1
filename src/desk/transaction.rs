//! Cash operations and the immutable transactions they produce.
use std::{fmt, str::FromStr};

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::desk::{
    Cashier, Currency, Denominations, LedgerError, Timestamp, TransactionId, validate_sum,
};

/// Enum representing the type of cash operation.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[serde(rename_all = "UPPERCASE")]
pub enum OperationKind {
    Deposit,
    Withdrawal,
}

impl OperationKind {
    pub fn as_str(self) -> &'static str {
        match self {
            OperationKind::Deposit => "DEPOSIT",
            OperationKind::Withdrawal => "WITHDRAWAL",
        }
    }
}

impl fmt::Display for OperationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for OperationKind {
    type Err = LedgerError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().as_str() {
            "DEPOSIT" => Ok(OperationKind::Deposit),
            "WITHDRAWAL" => Ok(OperationKind::Withdrawal),
            _ => Err(LedgerError::InvalidOperation(s.to_string())),
        }
    }
}

/// A cash operation as submitted by a client, before validation.
#[derive(Deserialize, Debug, Clone)]
pub struct OperationRequest {
    /// DEPOSIT or WITHDRAWAL, any case.
    #[serde(rename = "type")]
    pub kind: String,

    /// Cashier name, any case.
    pub cashier: String,

    /// Currency code, any case.
    pub currency: String,

    /// Decimal amount.
    pub amount: String,

    /// Notes as `face:count,face:count`.
    pub denominations: String,
}

impl OperationRequest {
    /// Parses and validates every field.
    pub fn validate(&self) -> Result<Operation, LedgerError> {
        let cashier = self.cashier.parse::<Cashier>()?;
        let kind = self.kind.parse::<OperationKind>()?;
        let currency = self.currency.parse::<Currency>()?;
        let amount = self
            .amount
            .trim()
            .parse::<Decimal>()
            .map_err(|_| LedgerError::InvalidAmount(self.amount.clone()))?;
        let notes = self.denominations.parse::<Denominations>()?;
        Operation::new(kind, cashier, currency, amount, notes)
    }
}

/// A validated cash operation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Operation {
    pub kind: OperationKind,
    pub cashier: Cashier,
    pub currency: Currency,
    pub amount: Decimal,
    pub notes: Denominations,
}

impl Operation {
    /// Builds an operation, checking the amount and the notes against each other.
    pub fn new(
        kind: OperationKind,
        cashier: Cashier,
        currency: Currency,
        amount: Decimal,
        notes: Denominations,
    ) -> Result<Self, LedgerError> {
        validate_payload(currency, amount, &notes)?;
        Ok(Operation {
            kind,
            cashier,
            currency,
            amount,
            notes,
        })
    }
}

/// Amount must be positive, every face value legal and the notes must add up to the amount.
fn validate_payload(
    currency: Currency,
    amount: Decimal,
    notes: &Denominations,
) -> Result<(), LedgerError> {
    if amount <= Decimal::ZERO {
        return Err(LedgerError::NonPositiveAmount(amount));
    }
    currency.validate_faces(notes.faces())?;
    validate_sum(notes, amount)
}

/// An accepted cash movement. Never changes once created.
#[derive(Serialize, Debug, Clone)]
#[serde(rename_all = "camelCase")]
pub struct Transaction {
    /// The unique identifier for this transaction.
    id: TransactionId,

    /// When the transaction was accepted.
    timestamp: Timestamp,

    /// The cashier whose balance moved.
    cashier: Cashier,

    /// Deposit or withdrawal.
    kind: OperationKind,

    /// The currency of the notes.
    currency: Currency,

    /// The amount moved; always equal to the value of the notes.
    amount: Decimal,

    /// The notes moved.
    denominations: Denominations,
}

impl Transaction {
    /// Creates a transaction, enforcing a positive amount that the notes sum to exactly.
    pub fn new(
        id: TransactionId,
        timestamp: Timestamp,
        cashier: Cashier,
        kind: OperationKind,
        currency: Currency,
        amount: Decimal,
        denominations: Denominations,
    ) -> Result<Self, LedgerError> {
        validate_payload(currency, amount, &denominations)?;
        Ok(Transaction {
            id,
            timestamp,
            cashier,
            kind,
            currency,
            amount,
            denominations,
        })
    }

    /// Records a validated operation under a fresh id.
    pub fn record(operation: Operation, timestamp: Timestamp) -> Self {
        Transaction {
            id: TransactionId::new_v4(),
            timestamp,
            cashier: operation.cashier,
            kind: operation.kind,
            currency: operation.currency,
            amount: operation.amount,
            denominations: operation.notes,
        }
    }

    /// Gets the transaction ID.
    pub fn get_id(&self) -> TransactionId {
        self.id
    }

    /// Gets the time the transaction was accepted.
    pub fn get_timestamp(&self) -> Timestamp {
        self.timestamp
    }

    /// Gets the cashier associated with this transaction.
    pub fn get_cashier(&self) -> Cashier {
        self.cashier
    }

    /// Gets the type of the transaction.
    pub fn get_kind(&self) -> OperationKind {
        self.kind
    }

    pub fn get_currency(&self) -> Currency {
        self.currency
    }

    pub fn get_amount(&self) -> Decimal {
        self.amount
    }

    /// Gets the notes moved by this transaction.
    pub fn get_denominations(&self) -> &Denominations {
        &self.denominations
    }

    /// Amount with the sign of its effect on the balance.
    pub fn signed_amount(&self) -> Decimal {
        match self.kind {
            OperationKind::Deposit => self.amount,
            OperationKind::Withdrawal => -self.amount,
        }
    }

    /// True if the timestamp lies within the inclusive bounds. A missing bound is open.
    pub fn is_within(&self, from: Option<Timestamp>, to: Option<Timestamp>) -> bool {
        from.is_none_or(|from| self.timestamp >= from) && to.is_none_or(|to| self.timestamp <= to)
    }
}

impl PartialEq for Transaction {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for Transaction {}

/// Result of an accepted operation, as returned to the client.
#[derive(Serialize, Debug, Clone, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct OperationReceipt {
    pub transaction_id: TransactionId,
    pub timestamp: Timestamp,
    pub cashier: Cashier,
    pub kind: OperationKind,
    pub currency: Currency,
    pub amount: Decimal,
    pub denomination_counts: Denominations,
    pub message: String,
}

impl From<&Transaction> for OperationReceipt {
    fn from(tx: &Transaction) -> Self {
        OperationReceipt {
            transaction_id: tx.id,
            timestamp: tx.timestamp,
            cashier: tx.cashier,
            kind: tx.kind,
            currency: tx.currency,
            amount: tx.amount,
            denomination_counts: tx.denominations.clone(),
            message: format!("{} successful", tx.kind),
        }
    }
}

#[cfg(test)]
mod tests {
    use chrono::{TimeZone, Utc};

    use super::*;

    fn request(kind: &str, cashier: &str, currency: &str, amount: &str, notes: &str) -> OperationRequest {
        OperationRequest {
            kind: kind.to_string(),
            cashier: cashier.to_string(),
            currency: currency.to_string(),
            amount: amount.to_string(),
            denominations: notes.to_string(),
        }
    }

    #[test]
    fn test_validate_request() {
        let operation = request("deposit", "martina", "bgn", "600", "10:10,50:10")
            .validate()
            .unwrap();
        assert_eq!(operation.kind, OperationKind::Deposit);
        assert_eq!(operation.cashier, Cashier::Martina);
        assert_eq!(operation.currency, Currency::Bgn);
        assert_eq!(operation.amount, Decimal::from(600));
    }

    #[test]
    fn test_validate_request_errors() {
        assert!(matches!(
            request("DEPOSIT", "BOB", "BGN", "10", "10:1").validate(),
            Err(LedgerError::InvalidCashier(_))
        ));
        assert!(matches!(
            request("REFUND", "PETER", "BGN", "10", "10:1").validate(),
            Err(LedgerError::InvalidOperation(_))
        ));
        assert!(matches!(
            request("DEPOSIT", "PETER", "USD", "10", "10:1").validate(),
            Err(LedgerError::InvalidCurrency(_))
        ));
        assert!(matches!(
            request("DEPOSIT", "PETER", "BGN", "ten", "10:1").validate(),
            Err(LedgerError::InvalidAmount(_))
        ));
        assert!(matches!(
            request("DEPOSIT", "PETER", "BGN", "0", "").validate(),
            Err(LedgerError::NonPositiveAmount(_))
        ));
        assert!(matches!(
            request("DEPOSIT", "PETER", "BGN", "20", "20:1").validate(),
            Err(LedgerError::InvalidDenomination { face: 20, .. })
        ));
        assert!(matches!(
            request("DEPOSIT", "PETER", "BGN", "100", "10:1").validate(),
            Err(LedgerError::AmountMismatch { .. })
        ));
    }

    #[test]
    fn test_transaction_requires_exact_sum() {
        let at = Utc.with_ymd_and_hms(2025, 1, 1, 10, 0, 0).unwrap();
        let result = Transaction::new(
            TransactionId::new_v4(),
            at,
            Cashier::Linda,
            OperationKind::Withdrawal,
            Currency::Eur,
            Decimal::from(70),
            Denominations::from([(20, 1), (50, 1)]),
        );
        assert!(result.is_ok());

        let result = Transaction::new(
            TransactionId::new_v4(),
            at,
            Cashier::Linda,
            OperationKind::Withdrawal,
            Currency::Eur,
            Decimal::from(71),
            Denominations::from([(20, 1), (50, 1)]),
        );
        assert!(matches!(result, Err(LedgerError::AmountMismatch { .. })));
    }

    #[test]
    fn test_equality_by_id() {
        let at = Utc.with_ymd_and_hms(2025, 1, 1, 10, 0, 0).unwrap();
        let id = TransactionId::new_v4();
        let make = |amount: i64, notes: Denominations| {
            Transaction::new(
                id,
                at,
                Cashier::Peter,
                OperationKind::Deposit,
                Currency::Bgn,
                Decimal::from(amount),
                notes,
            )
            .unwrap()
        };
        assert_eq!(make(10, Denominations::from([(10, 1)])), make(50, Denominations::from([(50, 1)])));
    }

    #[test]
    fn test_is_within_inclusive_bounds() {
        let at = Utc.with_ymd_and_hms(2025, 1, 1, 10, 0, 0).unwrap();
        let operation = Operation::new(
            OperationKind::Deposit,
            Cashier::Peter,
            Currency::Bgn,
            Decimal::from(10),
            Denominations::from([(10, 1)]),
        )
        .unwrap();
        let tx = Transaction::record(operation, at);
        assert!(tx.is_within(None, None));
        assert!(tx.is_within(Some(at), Some(at)));
        assert!(!tx.is_within(Some(at + chrono::Duration::seconds(1)), None));
        assert!(!tx.is_within(None, Some(at - chrono::Duration::seconds(1))));
    }

    #[test]
    fn test_receipt_message() {
        let at = Utc.with_ymd_and_hms(2025, 1, 1, 10, 0, 0).unwrap();
        let operation = Operation::new(
            OperationKind::Withdrawal,
            Cashier::Peter,
            Currency::Bgn,
            Decimal::from(10),
            Denominations::from([(10, 1)]),
        )
        .unwrap();
        let tx = Transaction::record(operation, at);
        let receipt = OperationReceipt::from(&tx);
        assert_eq!(receipt.transaction_id, tx.get_id());
        assert_eq!(receipt.message, "WITHDRAWAL successful");
        assert_eq!(tx.signed_amount(), Decimal::from(-10));
    }
}
