//! Append-only transaction log, the history every balance can be replayed from.
//!
//! One `|`-separated record per line:
//! `id|timestamp|cashier|kind|currency|amount|face:count,face:count`.
use std::{
    fs::{self, OpenOptions},
    io::Write,
    path::{Path, PathBuf},
};

use chrono::SecondsFormat;
use csv::StringRecord;
use parking_lot::Mutex;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize, Serializer};
use tracing::{debug, info, warn};

use crate::desk::{
    Cashier, Currency, Denominations, OperationKind, RecordError, StorageError, Timestamp,
    Transaction, TransactionId,
    records::{deserialize_parsed, record_reader, record_writer, serialize_display},
};

/// Durable, ordered record of every accepted transaction, mirrored in memory.
pub struct TransactionLog {
    path: PathBuf,
    /// In-memory copy of the file, in append order. The lock also serializes appends.
    entries: Mutex<Vec<Transaction>>,
}

impl TransactionLog {
    /// Opens the log at `path`, creating the file if it does not exist.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self, StorageError> {
        let path = path.into();
        let entries = load(&path)?;
        Ok(TransactionLog {
            path,
            entries: Mutex::new(entries),
        })
    }

    /// Appends a transaction. The line is synced to disk before this returns.
    pub fn append(&self, tx: &Transaction) -> Result<(), StorageError> {
        let line = encode_line(tx).map_err(|err| StorageError::io(&self.path, err.into()))?;

        let mut entries = self.entries.lock();
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .map_err(|err| StorageError::io(&self.path, err))?;
        let length = file
            .metadata()
            .map_err(|err| StorageError::io(&self.path, err))?
            .len();

        if let Err(err) = file.write_all(&line).and_then(|_| file.sync_data()) {
            // Drop any partial line so the next append starts on a fresh line.
            if let Err(truncate_err) = file.set_len(length) {
                warn!(path = %self.path.display(), error = %truncate_err, "failed to truncate partial transaction record");
            }
            return Err(StorageError::io(&self.path, err));
        }

        entries.push(tx.clone());
        debug!(id = %tx.get_id(), "appended transaction");
        Ok(())
    }

    /// Every transaction, in append order.
    pub fn all(&self) -> Vec<Transaction> {
        self.entries.lock().clone()
    }

    /// Transactions of one cashier (or all cashiers) within inclusive bounds, in append order.
    pub fn by_cashier_and_range(
        &self,
        cashier: Option<Cashier>,
        from: Option<Timestamp>,
        to: Option<Timestamp>,
    ) -> Vec<Transaction> {
        self.entries
            .lock()
            .iter()
            .filter(|tx| cashier.is_none_or(|cashier| tx.get_cashier() == cashier))
            .filter(|tx| tx.is_within(from, to))
            .cloned()
            .collect()
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }

    /// Re-reads the file, replacing the in-memory copy. Returns the number of transactions loaded.
    pub fn reload(&self) -> Result<usize, StorageError> {
        let mut entries = self.entries.lock();
        *entries = load(&self.path)?;
        Ok(entries.len())
    }
}

/// Reads every well-formed record of the log, skipping and reporting malformed ones.
fn load(path: &Path) -> Result<Vec<Transaction>, StorageError> {
    if !path.exists() {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(|err| StorageError::io(parent, err))?;
        }
        fs::File::create(path).map_err(|err| StorageError::io(path, err))?;
        info!(path = %path.display(), "created transaction log");
        return Ok(Vec::new());
    }

    let file = fs::File::open(path).map_err(|err| StorageError::io(path, err))?;
    let mut entries = Vec::new();
    for result in record_reader(file).records() {
        let position = match &result {
            Ok(record) => record.position(),
            Err(err) => err.position(),
        };
        let line = position.map_or(0, |position| position.line());
        let decoded = match result {
            Ok(record) => decode_record(&record),
            Err(err) if err.is_io_error() => return Err(StorageError::io(path, err.into())),
            Err(err) => Err(RecordError::from(err)),
        };
        match decoded {
            Ok(tx) => entries.push(tx),
            Err(err) => warn!(
                path = %path.display(),
                line,
                error = %err,
                "skipping malformed transaction record"
            ),
        }
    }
    info!(path = %path.display(), count = entries.len(), "loaded transactions");
    Ok(entries)
}

/// One line of the log.
#[derive(Serialize, Deserialize)]
struct LogRecord {
    id: TransactionId,
    #[serde(
        serialize_with = "serialize_timestamp",
        deserialize_with = "deserialize_parsed"
    )]
    timestamp: Timestamp,
    cashier: Cashier,
    kind: OperationKind,
    currency: Currency,
    #[serde(serialize_with = "serialize_display", deserialize_with = "deserialize_parsed")]
    amount: Decimal,
    #[serde(serialize_with = "serialize_display", deserialize_with = "deserialize_parsed")]
    denominations: Denominations,
}

/// A line written before transactions carried an id.
#[derive(Deserialize)]
struct LegacyLogRecord {
    #[serde(deserialize_with = "deserialize_parsed")]
    timestamp: Timestamp,
    cashier: Cashier,
    kind: OperationKind,
    currency: Currency,
    #[serde(deserialize_with = "deserialize_parsed")]
    amount: Decimal,
    #[serde(deserialize_with = "deserialize_parsed")]
    denominations: Denominations,
}

impl From<&Transaction> for LogRecord {
    fn from(tx: &Transaction) -> Self {
        LogRecord {
            id: tx.get_id(),
            timestamp: tx.get_timestamp(),
            cashier: tx.get_cashier(),
            kind: tx.get_kind(),
            currency: tx.get_currency(),
            amount: tx.get_amount(),
            denominations: tx.get_denominations().clone(),
        }
    }
}

impl LegacyLogRecord {
    fn with_id(self, id: TransactionId) -> LogRecord {
        LogRecord {
            id,
            timestamp: self.timestamp,
            cashier: self.cashier,
            kind: self.kind,
            currency: self.currency,
            amount: self.amount,
            denominations: self.denominations,
        }
    }
}

impl LogRecord {
    /// Rebuilds the transaction, re-checking that the notes add up to the amount.
    fn into_transaction(self) -> Result<Transaction, RecordError> {
        Ok(Transaction::new(
            self.id,
            self.timestamp,
            self.cashier,
            self.kind,
            self.currency,
            self.amount,
            self.denominations,
        )?)
    }
}

fn serialize_timestamp<S: Serializer>(at: &Timestamp, serializer: S) -> Result<S::Ok, S::Error> {
    serializer.serialize_str(&at.to_rfc3339_opts(SecondsFormat::AutoSi, true))
}

/// Encodes a transaction as one `\n`-terminated log line.
fn encode_line(tx: &Transaction) -> Result<Vec<u8>, csv::Error> {
    let mut writer = record_writer(Vec::new());
    writer.serialize(LogRecord::from(tx))?;
    writer
        .into_inner()
        .map_err(|err| csv::Error::from(err.into_error()))
}

/// Decodes one log record. Six-field records predate ids and get a fresh one.
fn decode_record(record: &StringRecord) -> Result<Transaction, RecordError> {
    let entry = match record.len() {
        7 => record.deserialize::<LogRecord>(None)?,
        6 => {
            let legacy = record.deserialize::<LegacyLogRecord>(None)?;
            warn!(
                timestamp = %legacy.timestamp,
                cashier = %legacy.cashier,
                "transaction record without id, assigning a new one"
            );
            legacy.with_id(TransactionId::new_v4())
        }
        got => {
            return Err(RecordError::FieldCount {
                expected: "6 or 7",
                got,
            });
        }
    };
    entry.into_transaction()
}

#[cfg(test)]
mod tests {
    use chrono::{TimeZone, Utc};
    use tempfile::tempdir;

    use super::*;
    use crate::desk::Operation;

    fn format_line(tx: &Transaction) -> String {
        let line = String::from_utf8(encode_line(tx).unwrap()).unwrap();
        line.trim_end().to_string()
    }

    fn parse_line(line: &str) -> Result<Transaction, RecordError> {
        let record = record_reader(line.as_bytes()).records().next().unwrap()?;
        decode_record(&record)
    }

    fn deposit(cashier: Cashier, amount: i64, notes: Denominations, at: Timestamp) -> Transaction {
        let operation = Operation::new(
            OperationKind::Deposit,
            cashier,
            Currency::Bgn,
            Decimal::from(amount),
            notes,
        )
        .unwrap();
        Transaction::record(operation, at)
    }

    fn at(hour: u32) -> Timestamp {
        Utc.with_ymd_and_hms(2025, 3, 1, hour, 0, 0).unwrap()
    }

    #[test]
    fn test_open_creates_missing_file() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("data").join("transactions.txt");
        let log = TransactionLog::open(&path).unwrap();
        assert!(path.exists());
        assert!(log.is_empty());
    }

    #[test]
    fn test_append_is_persisted() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("transactions.txt");
        let log = TransactionLog::open(&path).unwrap();
        let tx = deposit(Cashier::Martina, 600, Denominations::from([(10, 10), (50, 10)]), at(9));
        log.append(&tx).unwrap();

        let reopened = TransactionLog::open(&path).unwrap();
        let all = reopened.all();
        assert_eq!(all.len(), 1);
        assert_eq!(all[0], tx);
        assert_eq!(all[0].get_timestamp(), tx.get_timestamp());
        assert_eq!(all[0].get_denominations(), tx.get_denominations());
    }

    #[test]
    fn test_format_line() {
        let tx = deposit(Cashier::Peter, 60, Denominations::from([(50, 1), (10, 1)]), at(9));
        let encoded = encode_line(&tx).unwrap();
        assert_eq!(encoded.last(), Some(&b'\n'));
        let line = format_line(&tx);
        assert_eq!(
            line,
            format!("{}|2025-03-01T09:00:00Z|PETER|DEPOSIT|BGN|60|10:1,50:1", tx.get_id())
        );
        let parsed = parse_line(&line).unwrap();
        assert_eq!(parsed.get_amount(), Decimal::from(60));
        assert_eq!(parsed.get_kind(), OperationKind::Deposit);
    }

    #[test]
    fn test_parse_legacy_line_without_id() {
        let tx = parse_line("2025-03-01T09:00:00.250Z|LINDA|WITHDRAWAL|EUR|70.00|20:1,50:1").unwrap();
        assert_eq!(tx.get_cashier(), Cashier::Linda);
        assert_eq!(tx.get_amount(), Decimal::new(7000, 2));
        assert_eq!(
            tx.get_timestamp(),
            at(9) + chrono::Duration::milliseconds(250)
        );
    }

    #[test]
    fn test_parse_rejects_bad_records() {
        assert!(matches!(
            parse_line("a|b|c"),
            Err(RecordError::FieldCount { got: 3, .. })
        ));
        assert!(matches!(
            parse_line("not-a-uuid|2025-03-01T09:00:00Z|PETER|DEPOSIT|BGN|10|10:1"),
            Err(RecordError::Decode(_))
        ));
        assert!(matches!(
            parse_line("2025-03-01T09:00:00Z|PETER|DEPOSIT|BGN|20|10:1"),
            Err(RecordError::Rule(_))
        ));
    }

    #[test]
    fn test_malformed_lines_are_skipped() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("transactions.txt");
        let good = deposit(Cashier::Linda, 10, Denominations::from([(10, 1)]), at(9));
        let contents = format!(
            "{}\ngarbage line\n\n2025-03-01T09:00:00Z|NOBODY|DEPOSIT|BGN|10|10:1\n\
             2025-03-01T10:00:00Z|PETER|DEPOSIT|BGN|50|50:1\n",
            format_line(&good)
        );
        fs::write(&path, contents).unwrap();

        let all = TransactionLog::open(&path).unwrap().all();
        assert_eq!(all.len(), 2);
        assert_eq!(all[0], good);
        assert_eq!(all[1].get_cashier(), Cashier::Peter);
        assert_eq!(all[1].get_amount(), Decimal::from(50));
    }

    #[test]
    fn test_by_cashier_and_range() {
        let dir = tempdir().unwrap();
        let log = TransactionLog::open(dir.path().join("transactions.txt")).unwrap();
        let first = deposit(Cashier::Martina, 10, Denominations::from([(10, 1)]), at(9));
        let second = deposit(Cashier::Peter, 10, Denominations::from([(10, 1)]), at(10));
        let third = deposit(Cashier::Martina, 50, Denominations::from([(50, 1)]), at(11));
        for tx in [&first, &second, &third] {
            log.append(tx).unwrap();
        }

        assert_eq!(log.by_cashier_and_range(None, None, None).len(), 3);
        assert_eq!(
            log.by_cashier_and_range(Some(Cashier::Martina), None, None),
            vec![first.clone(), third.clone()]
        );
        assert_eq!(
            log.by_cashier_and_range(None, Some(at(10)), Some(at(11))),
            vec![second.clone(), third.clone()]
        );
        assert_eq!(
            log.by_cashier_and_range(Some(Cashier::Martina), None, Some(at(10))),
            vec![first]
        );
    }

    #[test]
    fn test_append_failure_is_reported() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("transactions.txt");
        let log = TransactionLog::open(&path).unwrap();
        fs::remove_file(&path).unwrap();
        fs::create_dir(&path).unwrap();

        let tx = deposit(Cashier::Linda, 10, Denominations::from([(10, 1)]), at(9));
        assert!(matches!(log.append(&tx), Err(StorageError::Io { .. })));
        assert!(log.is_empty());
    }

    #[test]
    fn test_reload() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("transactions.txt");
        let log = TransactionLog::open(&path).unwrap();
        log.append(&deposit(Cashier::Linda, 10, Denominations::from([(10, 1)]), at(9)))
            .unwrap();
        fs::write(&path, "").unwrap();
        assert_eq!(log.reload().unwrap(), 0);
        assert!(log.is_empty());
    }
}
