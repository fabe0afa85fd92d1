use std::{
    fs::File,
    io::{self, Read, Write},
    path::PathBuf,
    sync::Arc,
};

use anyhow::{Context, bail};
use cashdesk::{
    config::{DeskConfig, LoggingConfig},
    desk::{self, CashDesk, OperationRequest, Outcome, Submission, SystemClock},
};
use clap::{Parser, Subcommand};
use csv::{ReaderBuilder, Trim};
use serde::Deserialize;
use serde_json::json;
use tokio::sync::mpsc;
use tracing::{info, warn};
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

/// The size of the channels feeding the desk and reporting outcomes.
const CHANNEL_SIZE: usize = 100;

/// Cash desk: deposits, withdrawals, balances and backups.
#[derive(Parser, Debug)]
#[command(name = "cashdesk")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to configuration file (TOML, JSON, or YAML)
    #[arg(short, long, env = "CASHDESK_CONFIG", global = true)]
    config: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, env = "CASHDESK_LOG_LEVEL", global = true)]
    log_level: Option<String>,

    /// Log format (json, pretty)
    #[arg(long, env = "CASHDESK_LOG_FORMAT", global = true)]
    log_format: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Apply the operations of a CSV file, `-` for stdin
    Process { input: String },
    /// Print balances, over a period when --from or --to is given
    Balance {
        #[arg(long)]
        cashier: Option<String>,
        /// RFC 3339 start, inclusive
        #[arg(long)]
        from: Option<String>,
        /// RFC 3339 end, inclusive
        #[arg(long)]
        to: Option<String>,
    },
    /// Manage backups
    Backup {
        #[command(subcommand)]
        action: BackupAction,
    },
}

#[derive(Subcommand, Debug)]
enum BackupAction {
    Create,
    List,
    Verify { name: String },
    Restore { name: String },
    /// Delete backups beyond the retention limits
    Prune,
}

/// One CSV row: `type,cashier,currency,amount,denominations,idempotency_key`.
#[derive(Deserialize, Debug)]
struct OperationRow {
    #[serde(rename = "type")]
    kind: String,
    cashier: String,
    currency: String,
    amount: String,
    denominations: String,
    #[serde(default)]
    idempotency_key: Option<String>,
}

impl OperationRow {
    fn into_submission(self, sequence: u64) -> Submission {
        Submission {
            sequence,
            request: OperationRequest {
                kind: self.kind,
                cashier: self.cashier,
                currency: self.currency,
                amount: self.amount,
                denominations: self.denominations,
            },
            idempotency_key: self.idempotency_key,
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let mut config = DeskConfig::load(args.config.as_deref())?;
    if let Some(level) = args.log_level {
        config.logging.level = level;
    }
    if let Some(format) = args.log_format {
        config.logging.format = format;
    }
    init_logging(&config.logging)?;

    let desk = Arc::new(
        CashDesk::open(config.desk_options()?, Arc::new(SystemClock))
            .context("failed to open the cash desk")?,
    );

    match args.command {
        Command::Process { input } => process(desk, &config, &input).await,
        Command::Balance { cashier, from, to } => {
            let from = from.as_deref().map(desk::parse_instant).transpose()?;
            let to = to.as_deref().map(desk::parse_instant).transpose()?;
            let report = desk.balances(cashier.as_deref(), from, to)?;
            print_json(&report)
        }
        Command::Backup { action } => backup(&desk, action),
    }
}

/// Feeds every CSV row to the desk and prints one JSON line per outcome.
async fn process(desk: Arc<CashDesk>, config: &DeskConfig, input: &str) -> anyhow::Result<()> {
    let source: Box<dyn Read> = if input == "-" {
        Box::new(io::stdin())
    } else {
        Box::new(File::open(input).with_context(|| format!("failed to open {input}"))?)
    };
    let mut reader = ReaderBuilder::new().trim(Trim::All).from_reader(source);

    let schedule = config
        .backup
        .enabled
        .then(|| desk.spawn_backup_schedule(config.backup.interval()));

    let (sender, receiver) = mpsc::channel(CHANNEL_SIZE);
    let (outcome_sender, mut outcome_receiver) = mpsc::channel(CHANNEL_SIZE);
    let runner = tokio::spawn(desk.clone().run(receiver, outcome_sender, config.workers));
    let printer = tokio::spawn(async move {
        let mut rejected = 0usize;
        while let Some(outcome) = outcome_receiver.recv().await {
            if outcome.result.is_err() {
                rejected += 1;
            }
            if let Err(err) = print_line(&outcome_json(&outcome)) {
                warn!(error = %err, "failed to write outcome");
            }
        }
        rejected
    });

    let mut submitted = 0u64;
    for (index, row) in reader.deserialize::<OperationRow>().enumerate() {
        // Data rows are numbered from 1, after the header.
        let sequence = index as u64 + 1;
        match row {
            Ok(row) => {
                sender
                    .send(row.into_submission(sequence))
                    .await
                    .context("the desk stopped accepting requests")?;
                submitted += 1;
            }
            Err(err) => {
                warn!(row = sequence, error = %err, "skipping unreadable row");
                print_line(&json!({ "row": sequence, "status": "unreadable", "error": err.to_string() }))?;
            }
        }
    }

    drop(sender); // No more requests
    runner.await.context("the dispatch loop failed")?;
    let rejected = printer.await.context("the outcome printer failed")?;
    if let Some(schedule) = schedule {
        schedule.abort();
    }
    info!(submitted, rejected, "processing finished");
    Ok(())
}

fn backup(desk: &CashDesk, action: BackupAction) -> anyhow::Result<()> {
    match action {
        BackupAction::Create => print_json(&desk.create_backup()?),
        BackupAction::List => print_json(&desk.list_backups()?),
        BackupAction::Verify { name } => {
            let valid = desk.verify_backup(&name)?;
            print_json(&json!({ "name": name, "valid": valid }))?;
            if !valid {
                bail!("backup {name} failed verification");
            }
            Ok(())
        }
        BackupAction::Restore { name } => {
            let transactions = desk.restore_backup(&name)?;
            print_json(&json!({ "restored": name, "transactions": transactions }))
        }
        BackupAction::Prune => {
            let deleted = desk.prune_backups()?;
            print_json(&json!({ "deleted": deleted }))
        }
    }
}

fn outcome_json(outcome: &Outcome) -> serde_json::Value {
    match &outcome.result {
        Ok(receipt) => json!({ "row": outcome.sequence, "status": "accepted", "receipt": receipt }),
        Err(err) => json!({
            "row": outcome.sequence,
            "status": "rejected",
            "errorClass": err.class(),
            "error": err.to_string(),
        }),
    }
}

fn print_line(value: &serde_json::Value) -> anyhow::Result<()> {
    let line = serde_json::to_string(value)?;
    writeln!(io::stdout().lock(), "{line}")?;
    Ok(())
}

fn print_json<T: serde::Serialize>(value: &T) -> anyhow::Result<()> {
    let text = serde_json::to_string_pretty(value)?;
    writeln!(io::stdout().lock(), "{text}")?;
    Ok(())
}

/// Logs go to stderr so stdout carries only JSON.
fn init_logging(config: &LoggingConfig) -> anyhow::Result<()> {
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.level));
    let subscriber = tracing_subscriber::registry().with(env_filter);

    match config.format.as_str() {
        "json" => subscriber
            .with(fmt::layer().json().with_target(true).with_writer(io::stderr))
            .try_init()?,
        _ => subscriber
            .with(fmt::layer().pretty().with_target(true).with_writer(io::stderr))
            .try_init()?,
    }
    Ok(())
}
