//! Desk configuration.
//!
//! Sources, later ones winning: an explicit file, `config/default`,
//! `config/local`, then `CASHDESK__SECTION__KEY` environment variables
//! (a `.env` file is read first).
use std::{
    path::{Path, PathBuf},
    time::Duration as StdDuration,
};

use anyhow::{Context, ensure};
use chrono::Duration;
use serde::{Deserialize, Serialize};

use crate::desk::{
    BackupConfig, Currency, DEFAULT_CLEANUP_THRESHOLD, DEFAULT_TTL_HOURS, Denominations,
    DeskOptions, Seed,
};

/// Desk configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeskConfig {
    /// Where the persisted files live
    #[serde(default)]
    pub storage: StorageConfig,

    /// Starting balance of every cashier
    #[serde(default)]
    pub seed: SeedConfig,

    #[serde(default)]
    pub idempotency: IdempotencyConfig,

    #[serde(default)]
    pub backup: BackupSettings,

    #[serde(default)]
    pub logging: LoggingConfig,

    /// Requests processed at the same time
    #[serde(default = "default_workers")]
    pub workers: usize,
}

impl Default for DeskConfig {
    fn default() -> Self {
        Self {
            storage: StorageConfig::default(),
            seed: SeedConfig::default(),
            idempotency: IdempotencyConfig::default(),
            backup: BackupSettings::default(),
            logging: LoggingConfig::default(),
            workers: default_workers(),
        }
    }
}

/// Persisted file locations
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,

    /// Transaction log file name, relative to `data_dir`
    #[serde(default = "default_transaction_file")]
    pub transaction_file: String,

    /// Balance snapshot file name, relative to `data_dir`
    #[serde(default = "default_balance_file")]
    pub balance_file: String,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
            transaction_file: default_transaction_file(),
            balance_file: default_balance_file(),
        }
    }
}

impl StorageConfig {
    pub fn transaction_path(&self) -> PathBuf {
        self.data_dir.join(&self.transaction_file)
    }

    pub fn balance_path(&self) -> PathBuf {
        self.data_dir.join(&self.balance_file)
    }
}

/// Seed notes per currency, as `face:count,face:count`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SeedConfig {
    #[serde(default = "default_seed_bgn")]
    pub bgn: String,

    #[serde(default = "default_seed_eur")]
    pub eur: String,
}

impl Default for SeedConfig {
    fn default() -> Self {
        Self {
            bgn: default_seed_bgn(),
            eur: default_seed_eur(),
        }
    }
}

impl SeedConfig {
    /// Parses and validates both currencies.
    pub fn to_seed(&self) -> anyhow::Result<Seed> {
        let mut counts = Vec::new();
        for (currency, notes) in [(Currency::Bgn, &self.bgn), (Currency::Eur, &self.eur)] {
            let notes: Denominations = notes
                .parse()
                .with_context(|| format!("invalid {currency} seed"))?;
            counts.push((currency, notes));
        }
        Ok(Seed::new(counts)?)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IdempotencyConfig {
    /// How long a result is remembered
    #[serde(default = "default_ttl_hours")]
    pub ttl_hours: i64,

    /// Cache size that triggers a sweep of expired entries
    #[serde(default = "default_cleanup_threshold")]
    pub cleanup_threshold: usize,
}

impl Default for IdempotencyConfig {
    fn default() -> Self {
        Self {
            ttl_hours: default_ttl_hours(),
            cleanup_threshold: default_cleanup_threshold(),
        }
    }
}

/// Backup settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackupSettings {
    /// Run scheduled backups while processing
    #[serde(default = "default_true")]
    pub enabled: bool,

    #[serde(default = "default_backup_dir")]
    pub directory: PathBuf,

    /// Gzip backed up files
    #[serde(default = "default_true")]
    pub compression: bool,

    #[serde(default = "default_max_backups")]
    pub max_backups: usize,

    #[serde(default = "default_max_age_days")]
    pub max_age_days: i64,

    /// Seconds between scheduled backups
    #[serde(default = "default_interval_secs")]
    pub interval_secs: u64,
}

impl Default for BackupSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            directory: default_backup_dir(),
            compression: true,
            max_backups: default_max_backups(),
            max_age_days: default_max_age_days(),
            interval_secs: default_interval_secs(),
        }
    }
}

impl BackupSettings {
    pub fn interval(&self) -> StdDuration {
        StdDuration::from_secs(self.interval_secs)
    }
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Output format (pretty, json)
    #[serde(default = "default_log_format")]
    pub format: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
        }
    }
}

fn default_workers() -> usize {
    4
}

fn default_data_dir() -> PathBuf {
    PathBuf::from("./data")
}

fn default_transaction_file() -> String {
    "transactions.txt".to_string()
}

fn default_balance_file() -> String {
    "balances.txt".to_string()
}

fn default_seed_bgn() -> String {
    "10:50,50:10".to_string()
}

fn default_seed_eur() -> String {
    "10:100,20:0,50:20".to_string()
}

fn default_ttl_hours() -> i64 {
    DEFAULT_TTL_HOURS
}

fn default_cleanup_threshold() -> usize {
    DEFAULT_CLEANUP_THRESHOLD
}

fn default_backup_dir() -> PathBuf {
    PathBuf::from("./backups")
}

fn default_max_backups() -> usize {
    30
}

fn default_max_age_days() -> i64 {
    90
}

fn default_interval_secs() -> u64 {
    86_400 // daily
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "pretty".to_string()
}

fn default_true() -> bool {
    true
}

impl DeskConfig {
    /// Load configuration from an optional file, the default locations and the environment
    pub fn load(config_path: Option<&Path>) -> anyhow::Result<Self> {
        // Load .env file if present
        let _ = dotenvy::dotenv();

        let mut builder = config::Config::builder();
        if let Some(path) = config_path {
            builder = builder.add_source(config::File::from(path).required(true));
        }
        builder = builder
            .add_source(config::File::with_name("config/default").required(false))
            .add_source(config::File::with_name("config/local").required(false))
            .add_source(
                config::Environment::with_prefix("CASHDESK")
                    .separator("__")
                    .try_parsing(true),
            );

        let config: DeskConfig = builder
            .build()
            .context("failed to read configuration")?
            .try_deserialize()
            .context("invalid configuration")?;
        config.validate()?;
        Ok(config)
    }

    /// Rejects values the desk cannot run with.
    pub fn validate(&self) -> anyhow::Result<()> {
        ensure!(self.workers > 0, "workers must be at least 1");
        ensure!(self.idempotency.ttl_hours > 0, "idempotency.ttl_hours must be positive");
        ensure!(
            Duration::try_hours(self.idempotency.ttl_hours).is_some(),
            "idempotency.ttl_hours is too large"
        );
        ensure!(self.backup.max_backups > 0, "backup.max_backups must be at least 1");
        ensure!(self.backup.max_age_days > 0, "backup.max_age_days must be positive");
        ensure!(
            Duration::try_days(self.backup.max_age_days).is_some(),
            "backup.max_age_days is too large"
        );
        ensure!(self.backup.interval_secs > 0, "backup.interval_secs must be positive");
        self.seed.to_seed()?;
        Ok(())
    }

    /// Everything needed to open the desk.
    pub fn desk_options(&self) -> anyhow::Result<DeskOptions> {
        Ok(DeskOptions {
            transaction_file: self.storage.transaction_path(),
            balance_file: self.storage.balance_path(),
            seed: self.seed.to_seed()?,
            idempotency_ttl: Duration::try_hours(self.idempotency.ttl_hours)
                .context("idempotency.ttl_hours is too large")?,
            idempotency_cleanup_threshold: self.idempotency.cleanup_threshold,
            backup: BackupConfig {
                directory: self.backup.directory.clone(),
                compression: self.backup.compression,
                max_backups: self.backup.max_backups,
                max_age: Duration::try_days(self.backup.max_age_days)
                    .context("backup.max_age_days is too large")?,
            },
        })
    }
}
