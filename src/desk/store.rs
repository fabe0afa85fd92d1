//! Current balances per cashier, guarded by one reader-writer lock per cashier
//! and persisted as a flat snapshot file.
//!
//! The snapshot holds one `cashier|currency|face|count` line per legal face
//! value of every currency of every cashier. It is rewritten in full on every
//! change, to a temporary file that then replaces the previous file by rename.
use std::{
    collections::BTreeMap,
    fs,
    io::BufWriter,
    path::{Path, PathBuf},
};

use csv::StringRecord;
use parking_lot::{Mutex, RwLock, RwLockReadGuard, RwLockWriteGuard};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::desk::{
    CashBalance, Cashier, CashierBalances, Currency, FaceValue, NoteCount, RecordError, Seed,
    StorageError,
    records::{record_reader, record_writer},
};

/// Live balances of every cashier, mirrored to the snapshot file.
pub struct BalanceStore {
    path: PathBuf,
    seed: Seed,
    /// One lock per cashier, indexed by [`Cashier::index`].
    slots: [RwLock<CashierBalances>; Cashier::COUNT],
    /// What the snapshot file holds. Locked only while a cashier lock is held, never the other way round.
    persisted: Mutex<[CashierBalances; Cashier::COUNT]>,
}

impl BalanceStore {
    /// Opens the snapshot at `path`, creating it from `seed` if it does not exist.
    pub fn open(path: impl Into<PathBuf>, seed: Seed) -> Result<Self, StorageError> {
        let path = path.into();
        let loaded = load(&path, &seed)?;
        Ok(BalanceStore {
            slots: std::array::from_fn(|index| RwLock::new(loaded[index].clone())),
            persisted: Mutex::new(loaded),
            path,
            seed,
        })
    }

    pub fn seed(&self) -> &Seed {
        &self.seed
    }

    /// Copy of one cashier's balances.
    pub fn get(&self, cashier: Cashier) -> CashierBalances {
        self.slots[cashier.index()].read().clone()
    }

    /// Copy of every cashier's balances, in roster order.
    pub fn all(&self) -> Vec<(Cashier, CashierBalances)> {
        Cashier::ALL
            .into_iter()
            .map(|cashier| (cashier, self.get(cashier)))
            .collect()
    }

    /// Replaces one cashier's balances and persists them.
    pub fn put(&self, cashier: Cashier, balances: CashierBalances) -> Result<(), StorageError> {
        self.lock(cashier).commit(balances)
    }

    /// Takes the cashier's write lock. Everything done through the guard is one critical section.
    pub fn lock(&self, cashier: Cashier) -> BalanceGuard<'_> {
        BalanceGuard {
            store: self,
            cashier,
            balances: self.slots[cashier.index()].write(),
        }
    }

    /// Takes every cashier's read lock, in roster order, holding off all writers.
    pub fn read_all(&self) -> Vec<RwLockReadGuard<'_, CashierBalances>> {
        self.slots.iter().map(|slot| slot.read()).collect()
    }

    /// Takes every cashier's write lock, in roster order.
    pub fn lock_all(&self) -> ExclusiveStore<'_> {
        ExclusiveStore {
            store: self,
            slots: self.slots.iter().map(|slot| slot.write()).collect(),
        }
    }

    /// Re-reads the snapshot file into memory.
    pub fn reload(&self) -> Result<(), StorageError> {
        self.lock_all().reload()
    }

    fn persist(&self, cashier: Cashier, balances: &CashierBalances) -> Result<(), StorageError> {
        let mut image = self.persisted.lock();
        let previous = std::mem::replace(&mut image[cashier.index()], balances.clone());
        if let Err(err) = write_snapshot(&self.path, &image[..]) {
            image[cashier.index()] = previous;
            return Err(err);
        }
        debug!(%cashier, "saved balances");
        Ok(())
    }
}

/// Exclusive access to one cashier's balances.
pub struct BalanceGuard<'a> {
    store: &'a BalanceStore,
    cashier: Cashier,
    balances: RwLockWriteGuard<'a, CashierBalances>,
}

impl BalanceGuard<'_> {
    /// Balances as currently committed.
    pub fn balances(&self) -> &CashierBalances {
        &self.balances
    }

    /// Persists `balances` and installs them. On failure the committed balances are unchanged.
    pub fn commit(&mut self, balances: CashierBalances) -> Result<(), StorageError> {
        self.store.persist(self.cashier, &balances)?;
        *self.balances = balances;
        Ok(())
    }
}

/// Every cashier's write lock at once.
pub struct ExclusiveStore<'a> {
    store: &'a BalanceStore,
    slots: Vec<RwLockWriteGuard<'a, CashierBalances>>,
}

impl ExclusiveStore<'_> {
    /// Re-reads the snapshot file into memory.
    pub fn reload(&mut self) -> Result<(), StorageError> {
        let mut image = self.store.persisted.lock();
        let loaded = load(&self.store.path, &self.store.seed)?;
        for (slot, balances) in self.slots.iter_mut().zip(loaded.iter()) {
            **slot = balances.clone();
        }
        *image = loaded;
        Ok(())
    }
}

fn load(path: &Path, seed: &Seed) -> Result<[CashierBalances; Cashier::COUNT], StorageError> {
    if !path.exists() {
        let seeded = std::array::from_fn(|_| seed.balances());
        write_snapshot(path, &seeded)?;
        info!(path = %path.display(), "created balance snapshot from seed");
        return Ok(seeded);
    }

    let file = fs::File::open(path).map_err(|err| StorageError::io(path, err))?;
    let mut loaded: [CashierBalances; Cashier::COUNT] = std::array::from_fn(|_| BTreeMap::new());
    for result in record_reader(file).records() {
        let record = match result {
            Ok(record) => record,
            Err(err) if err.is_io_error() => return Err(StorageError::io(path, err.into())),
            Err(err) => {
                warn!(path = %path.display(), error = %err, "skipping unreadable balance record");
                continue;
            }
        };
        let applied = decode_record(&record).and_then(|entry| {
            loaded[entry.cashier.index()]
                .entry(entry.currency)
                .or_insert_with(|| CashBalance::new(entry.currency))
                .set_count(entry.face, entry.count)
                .map_err(RecordError::from)
        });
        if let Err(err) = applied {
            warn!(
                path = %path.display(),
                line = record.position().map_or(0, |position| position.line()),
                error = %err,
                "skipping malformed balance record"
            );
        }
    }

    for cashier in Cashier::ALL {
        for currency in Currency::ALL {
            loaded[cashier.index()].entry(currency).or_insert_with(|| {
                info!(%cashier, %currency, "no persisted balance, starting from seed");
                seed.balance(currency)
            });
        }
    }
    info!(path = %path.display(), "loaded balances");
    Ok(loaded)
}

/// One line of the snapshot.
#[derive(Serialize, Deserialize, Debug)]
struct SnapshotRecord {
    cashier: Cashier,
    currency: Currency,
    face: FaceValue,
    count: NoteCount,
}

/// Decodes one snapshot record, rejecting face values illegal for its currency.
fn decode_record(record: &StringRecord) -> Result<SnapshotRecord, RecordError> {
    if record.len() != 4 {
        return Err(RecordError::FieldCount {
            expected: "4",
            got: record.len(),
        });
    }
    let entry: SnapshotRecord = record.deserialize(None)?;
    entry.currency.validate_faces([entry.face])?;
    Ok(entry)
}

/// Writes every balance to a temporary file, then renames it over `path`.
fn write_snapshot(path: &Path, balances: &[CashierBalances]) -> Result<(), StorageError> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).map_err(|err| StorageError::io(parent, err))?;
    }
    let temp = temp_path(path);
    let written = write_lines(&temp, balances).and_then(|_| fs::rename(&temp, path));
    if let Err(err) = written {
        if temp.exists() {
            let _ = fs::remove_file(&temp);
        }
        return Err(StorageError::io(path, err));
    }
    Ok(())
}

fn write_lines(temp: &Path, balances: &[CashierBalances]) -> std::io::Result<()> {
    let mut writer = record_writer(BufWriter::new(fs::File::create(temp)?));
    for (cashier, cashier_balances) in Cashier::ALL.into_iter().zip(balances) {
        for balance in cashier_balances.values() {
            for (face, count) in balance.denominations() {
                writer.serialize(SnapshotRecord {
                    cashier,
                    currency: balance.currency(),
                    face,
                    count,
                })?;
            }
        }
    }
    let buffered = writer.into_inner().map_err(|err| err.into_error())?;
    let file = buffered.into_inner().map_err(|err| err.into_error())?;
    file.sync_all()
}

/// Sibling of `path` used while rewriting it.
pub(crate) fn temp_path(path: &Path) -> PathBuf {
    let mut name = path
        .file_name()
        .map(|name| name.to_os_string())
        .unwrap_or_default();
    name.push(".tmp");
    path.with_file_name(name)
}
