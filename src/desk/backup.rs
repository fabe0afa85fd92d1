//! Timestamped copies of the transaction log and the balance snapshot.
//!
//! Each backup is a directory `backup_<yyyyMMdd_HHmmssSSS>` holding
//! `transactions.txt`, `balances.txt` (each optionally gzip-compressed, with a
//! `.gz` suffix) and a `metadata.txt` describing how it was written.
use std::{
    fs::{self, File},
    io::{self, BufRead, BufReader, Read, Write},
    path::{Path, PathBuf},
    sync::Arc,
};

use chrono::{DateTime, Duration, NaiveDateTime, SecondsFormat};
use flate2::{Compression, read::GzDecoder, write::GzEncoder};
use serde::Serialize;
use thiserror::Error;
use tracing::{debug, error, info, warn};

use crate::desk::{Clock, StorageError, Timestamp, store::temp_path};

const PREFIX: &str = "backup_";
const NAME_FORMAT: &str = "%Y%m%d_%H%M%S%3f";
/// Length of a formatted [`NAME_FORMAT`] timestamp.
const NAME_TIMESTAMP_LEN: usize = 18;
const TRANSACTIONS: &str = "transactions.txt";
const BALANCES: &str = "balances.txt";
const METADATA: &str = "metadata.txt";
const METADATA_HEADER: &str = "Backup Metadata";

/// Errors that can occur while managing backups.
#[derive(Error, Debug)]
pub enum BackupError {
    #[error("Backup not found: {0}")]
    NotFound(String),
    #[error("Backup verification failed for {name}: {reason}")]
    Invalid { name: String, reason: String },
    #[error("Failed to create backup: {0}")]
    Create(#[source] StorageError),
    #[error("Failed to restore backup {name}: {source}")]
    Restore {
        name: String,
        #[source]
        source: StorageError,
    },
    #[error(transparent)]
    Storage(#[from] StorageError),
}

/// Where backups go and how long they are kept.
#[derive(Debug, Clone)]
pub struct BackupConfig {
    pub directory: PathBuf,
    /// Gzip each data file.
    pub compression: bool,
    /// Newest backups kept by [`BackupManager::prune`].
    pub max_backups: usize,
    /// Backups older than this are pruned.
    pub max_age: Duration,
}

impl Default for BackupConfig {
    fn default() -> Self {
        BackupConfig {
            directory: PathBuf::from("./backups"),
            compression: true,
            max_backups: 30,
            max_age: Duration::days(90),
        }
    }
}

/// A backup directory.
#[derive(Serialize, Debug, Clone, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct BackupHandle {
    pub name: String,
    pub path: PathBuf,
    pub created_at: Timestamp,
}

/// Creates, checks, restores and prunes backups of the two persisted files.
///
/// The manager only touches files. Callers keep the live stores still while it runs.
pub struct BackupManager {
    config: BackupConfig,
    transaction_file: PathBuf,
    balance_file: PathBuf,
    clock: Arc<dyn Clock>,
}

impl BackupManager {
    pub fn new(
        config: BackupConfig,
        transaction_file: impl Into<PathBuf>,
        balance_file: impl Into<PathBuf>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        BackupManager {
            config,
            transaction_file: transaction_file.into(),
            balance_file: balance_file.into(),
            clock,
        }
    }

    /// Copies both files into a new backup directory.
    ///
    /// A missing source file is backed up as an empty one. On failure the partial directory is removed.
    pub fn create(&self) -> Result<BackupHandle, BackupError> {
        let created_at = self.clock.now();
        let path = self.reserve(created_at).map_err(BackupError::Create)?;
        let name = file_name(&path);

        if let Err(err) = self.write_backup(&path, created_at) {
            if let Err(cleanup_err) = fs::remove_dir_all(&path) {
                warn!(backup = %name, error = %cleanup_err, "failed to remove partial backup");
            }
            return Err(BackupError::Create(err));
        }

        info!(backup = %name, compression = self.config.compression, "backup created");
        Ok(BackupHandle {
            name,
            path,
            created_at,
        })
    }

    /// Every backup, newest first.
    pub fn list(&self) -> Result<Vec<BackupHandle>, BackupError> {
        let directory = &self.config.directory;
        if !directory.exists() {
            return Ok(Vec::new());
        }
        let entries = fs::read_dir(directory).map_err(|err| StorageError::io(directory, err))?;

        let mut backups = Vec::new();
        for entry in entries {
            let entry = entry.map_err(|err| StorageError::io(directory, err))?;
            let path = entry.path();
            let name = file_name(&path);
            if !path.is_dir() || !name.starts_with(PREFIX) {
                continue;
            }
            let created_at = match name_timestamp(&name) {
                Some(at) => at,
                None => modified_at(&path),
            };
            backups.push(BackupHandle {
                name,
                path,
                created_at,
            });
        }
        backups.sort_by(|a, b| {
            b.created_at
                .cmp(&a.created_at)
                .then_with(|| collision_suffix(&b.name).cmp(&collision_suffix(&a.name)))
                .then_with(|| b.name.cmp(&a.name))
        });
        Ok(backups)
    }

    /// The newest backup, if any.
    pub fn latest(&self) -> Result<Option<BackupHandle>, BackupError> {
        Ok(self.list()?.into_iter().next())
    }

    /// Looks a backup up by directory name.
    pub fn find(&self, name: &str) -> Result<BackupHandle, BackupError> {
        self.list()?
            .into_iter()
            .find(|backup| backup.name == name)
            .ok_or_else(|| BackupError::NotFound(name.to_string()))
    }

    /// True if the backup is complete and its compressed files decode.
    pub fn verify(&self, backup: &BackupHandle) -> bool {
        match check(backup) {
            Ok(_) => true,
            Err(reason) => {
                warn!(backup = %backup.name, %reason, "backup failed verification");
                false
            }
        }
    }

    /// Replaces both live files with the backup's copies.
    ///
    /// A safety backup of the current files is taken first; failing to take it is only logged.
    pub fn restore(&self, backup: &BackupHandle) -> Result<(), BackupError> {
        let compressed = check(backup).map_err(|reason| BackupError::Invalid {
            name: backup.name.clone(),
            reason,
        })?;
        warn!(backup = %backup.name, "restoring from backup");

        match self.create() {
            Ok(safety) => info!(backup = %safety.name, "created pre-restore backup"),
            Err(err) => warn!(error = %err, "failed to create pre-restore backup"),
        }

        let files = [
            (TRANSACTIONS, &self.transaction_file),
            (BALANCES, &self.balance_file),
        ]
        .map(|(file, destination)| {
            let source = backup.path.join(data_file_name(file, compressed));
            (source, destination)
        });
        restore_files(&files, compressed).map_err(|source| BackupError::Restore {
            name: backup.name.clone(),
            source,
        })?;
        info!(backup = %backup.name, "restore completed");
        Ok(())
    }

    /// Deletes backups beyond the newest `max_backups` or older than `max_age`.
    /// Returns how many were deleted.
    pub fn prune(&self) -> Result<usize, BackupError> {
        let cutoff = self.clock.now() - self.config.max_age;
        let mut deleted = 0;
        for (position, backup) in self.list()?.into_iter().enumerate() {
            let reason = if position >= self.config.max_backups {
                "count exceeded"
            } else if backup.created_at < cutoff {
                "age exceeded"
            } else {
                continue;
            };
            match fs::remove_dir_all(&backup.path) {
                Ok(()) => {
                    deleted += 1;
                    info!(backup = %backup.name, reason, "deleted old backup");
                }
                Err(err) => warn!(backup = %backup.name, error = %err, "failed to delete backup"),
            }
        }
        Ok(deleted)
    }

    /// Creates a fresh backup directory, adding a numeric suffix if the name is taken.
    fn reserve(&self, created_at: Timestamp) -> Result<PathBuf, StorageError> {
        let directory = &self.config.directory;
        fs::create_dir_all(directory).map_err(|err| StorageError::io(directory, err))?;

        let base = format!("{PREFIX}{}", created_at.format(NAME_FORMAT));
        let mut attempt = 0;
        loop {
            let name = match attempt {
                0 => base.clone(),
                n => format!("{base}_{n}"),
            };
            let path = directory.join(name);
            match fs::create_dir(&path) {
                Ok(()) => return Ok(path),
                Err(err) if err.kind() == io::ErrorKind::AlreadyExists => attempt += 1,
                Err(err) => return Err(StorageError::io(&path, err)),
            }
        }
    }

    fn write_backup(&self, path: &Path, created_at: Timestamp) -> Result<(), StorageError> {
        let compression = self.config.compression;
        for (source, file) in [
            (&self.transaction_file, TRANSACTIONS),
            (&self.balance_file, BALANCES),
        ] {
            let destination = path.join(data_file_name(file, compression));
            backup_file(source, &destination, compression)
                .map_err(|err| StorageError::io(&destination, err))?;
        }

        let metadata = path.join(METADATA);
        let contents = format!(
            "{METADATA_HEADER}\n================\nTimestamp: {}\nCompression: {}\nTransaction file: {}\nBalance file: {}\n",
            created_at.to_rfc3339_opts(SecondsFormat::Millis, true),
            compression,
            self.transaction_file.display(),
            self.balance_file.display(),
        );
        fs::write(&metadata, contents).map_err(|err| StorageError::io(&metadata, err))
    }
}

/// Checks the backup and returns whether its data files are compressed.
fn check(backup: &BackupHandle) -> Result<bool, String> {
    if !backup.path.is_dir() {
        return Err("not a directory".to_string());
    }
    let compressed = read_compression(&backup.path.join(METADATA))?;
    for file in [TRANSACTIONS, BALANCES] {
        let path = backup.path.join(data_file_name(file, compressed));
        if !path.is_file() {
            return Err(format!("missing {}", file_name(&path)));
        }
        if compressed {
            let decoded = File::open(&path)
                .and_then(|file| io::copy(&mut GzDecoder::new(file), &mut io::sink()));
            if let Err(err) = decoded {
                return Err(format!("{} does not decode: {err}", file_name(&path)));
            }
        }
    }
    Ok(compressed)
}

/// Reads the compression flag from a metadata file.
fn read_compression(path: &Path) -> Result<bool, String> {
    let file = File::open(path).map_err(|err| format!("missing {METADATA}: {err}"))?;
    let mut lines = BufReader::new(file).lines();
    match lines.next() {
        Some(Ok(header)) if header.trim() == METADATA_HEADER => {}
        _ => return Err(format!("{METADATA} has no header")),
    }
    for line in lines {
        let line = line.map_err(|err| format!("unreadable {METADATA}: {err}"))?;
        if let Some(flag) = line.strip_prefix("Compression:") {
            return flag
                .trim()
                .parse()
                .map_err(|_| format!("bad compression flag {:?}", flag.trim()));
        }
    }
    Err(format!("{METADATA} has no compression flag"))
}

fn backup_file(source: &Path, destination: &Path, compress: bool) -> io::Result<()> {
    let mut reader: Box<dyn Read> = match File::open(source) {
        Ok(file) => Box::new(file),
        Err(err) if err.kind() == io::ErrorKind::NotFound => {
            warn!(path = %source.display(), "source file does not exist, backing up an empty file");
            Box::new(io::empty())
        }
        Err(err) => return Err(err),
    };

    let file = File::create(destination)?;
    let file = if compress {
        let mut encoder = GzEncoder::new(file, Compression::default());
        io::copy(&mut reader, &mut encoder)?;
        encoder.finish()?
    } else {
        let mut file = file;
        io::copy(&mut reader, &mut file)?;
        file
    };
    file.sync_all()
}

/// Replaces every destination with its decoded backup copy, or none of them.
///
/// All copies are staged next to their destinations first. Each live file is then
/// moved aside and the staged copy renamed in; if any swap fails, the swaps already
/// made are undone.
fn restore_files(files: &[(PathBuf, &PathBuf)], compressed: bool) -> Result<(), StorageError> {
    let mut staged = Vec::new();
    for (source, destination) in files {
        let temp = temp_path(destination);
        let written = stage_file(source, compressed, destination, &temp);
        staged.push(temp);
        if let Err(err) = written {
            remove_staged(&staged);
            return Err(err);
        }
    }

    let mut swapped: Vec<(&Path, Option<PathBuf>)> = Vec::new();
    for ((source, destination), temp) in files.iter().zip(&staged) {
        match swap_in(temp, destination) {
            Ok(aside) => {
                debug!(from = %source.display(), to = %destination.display(), "restored file");
                swapped.push((destination.as_path(), aside));
            }
            Err(err) => {
                undo_swaps(&swapped);
                remove_staged(&staged);
                return Err(err);
            }
        }
    }

    for aside in swapped.into_iter().filter_map(|(_, aside)| aside) {
        if let Err(err) = fs::remove_file(&aside) {
            warn!(path = %aside.display(), error = %err, "failed to remove replaced file");
        }
    }
    Ok(())
}

fn stage_file(
    source: &Path,
    compressed: bool,
    destination: &Path,
    temp: &Path,
) -> Result<(), StorageError> {
    if let Some(parent) = destination.parent() {
        fs::create_dir_all(parent).map_err(|err| StorageError::io(parent, err))?;
    }
    write_decoded(source, compressed, temp).map_err(|err| StorageError::io(temp, err))
}

/// Moves the live file aside, if there is one, and renames `temp` over it.
/// Returns where the live file went.
fn swap_in(temp: &Path, destination: &Path) -> Result<Option<PathBuf>, StorageError> {
    let aside = if destination.exists() {
        let aside = aside_path(destination);
        fs::rename(destination, &aside).map_err(|err| StorageError::io(destination, err))?;
        Some(aside)
    } else {
        None
    };
    if let Err(err) = fs::rename(temp, destination) {
        undo_swaps(&[(destination, aside)]);
        return Err(StorageError::io(destination, err));
    }
    Ok(aside)
}

/// Puts moved-aside live files back, newest swap first.
fn undo_swaps(swapped: &[(&Path, Option<PathBuf>)]) {
    for (destination, aside) in swapped.iter().rev() {
        let undone = match aside {
            Some(aside) => fs::rename(aside, destination),
            None => fs::remove_file(destination),
        };
        match undone {
            Ok(()) => debug!(path = %destination.display(), "undid restore of file"),
            Err(err) => error!(
                path = %destination.display(),
                error = %err,
                "failed to undo restore, file may not match the rest of the data"
            ),
        }
    }
}

fn remove_staged(staged: &[PathBuf]) {
    for temp in staged {
        if temp.exists() {
            let _ = fs::remove_file(temp);
        }
    }
}

/// Sibling of `path` holding the live file while a restore swaps it.
fn aside_path(path: &Path) -> PathBuf {
    let mut name = path
        .file_name()
        .map(|name| name.to_os_string())
        .unwrap_or_default();
    name.push(".old");
    path.with_file_name(name)
}

fn write_decoded(source: &Path, compressed: bool, target: &Path) -> io::Result<()> {
    let file = File::open(source)?;
    let mut reader: Box<dyn Read> = if compressed {
        Box::new(GzDecoder::new(file))
    } else {
        Box::new(file)
    };
    let mut out = File::create(target)?;
    io::copy(&mut reader, &mut out)?;
    out.flush()?;
    out.sync_all()
}

fn data_file_name(file: &str, compressed: bool) -> String {
    if compressed {
        format!("{file}.gz")
    } else {
        file.to_string()
    }
}

fn file_name(path: &Path) -> String {
    path.file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_default()
}

/// Creation time encoded in a backup name, ignoring any collision suffix.
fn name_timestamp(name: &str) -> Option<Timestamp> {
    let stamp = name.strip_prefix(PREFIX)?.get(..NAME_TIMESTAMP_LEN)?;
    NaiveDateTime::parse_from_str(stamp, NAME_FORMAT)
        .ok()
        .map(|at| at.and_utc())
}

/// The `_<n>` suffix [`BackupManager::create`] adds to a name already taken; zero if absent.
fn collision_suffix(name: &str) -> u32 {
    name.strip_prefix(PREFIX)
        .and_then(|rest| rest.get(NAME_TIMESTAMP_LEN..))
        .and_then(|suffix| suffix.strip_prefix('_'))
        .and_then(|n| n.parse().ok())
        .unwrap_or(0)
}

fn modified_at(path: &Path) -> Timestamp {
    fs::metadata(path)
        .and_then(|metadata| metadata.modified())
        .map(DateTime::from)
        .unwrap_or_default()
}
