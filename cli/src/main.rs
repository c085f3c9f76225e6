use std::collections::BTreeSet;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use futures::future::try_join_all;
use serde::{Deserialize, Serialize};
use tracing::info;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;
use uuid::Uuid;

use ledgerline_kernel::log::partition::partition_for;
use ledgerline_kernel::log::{EventLogBackend, InMemoryEventLog, LogRow, Version};
use ledgerline_kernel::simulate::{simulate_accounts, SimulationPlan};
use ledgerline_kernel::testing::{account_codec, MemoryHarness, SoleWriter};
use ledgerline_kernel::EngineConfig;

/// Ledgerline event-sourcing engine CLI
#[derive(Parser, Debug)]
#[command(name = "ledgerline")]
#[command(about = "Drive the ledgerline engine against in-memory storage", long_about = None)]
struct Cli {
    /// Path to engine config JSON
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run concurrent appends across many accounts and verify recovery
    Simulate {
        #[arg(long, default_value_t = 16)]
        aggregates: usize,

        #[arg(long, default_value_t = 100)]
        events: usize,

        /// Re-send every k-th event with the previous token
        #[arg(long)]
        duplicate_every: Option<usize>,
    },

    /// Load a JSON event log and print each account's recovered state
    Replay {
        #[arg(long)]
        log: PathBuf,
    },
}

/// One row of a replay input file.
#[derive(Debug, Deserialize)]
struct InputRow {
    aggregate_id: Uuid,
    version: Version,
    timestamp: i64,
    type_code: String,
    payload: serde_json::Value,
    #[serde(default)]
    token: String,
}

#[derive(Debug, Serialize)]
struct RecoveredAccount {
    aggregate_id: Uuid,
    version: Version,
    balance: i64,
    deposits: u32,
    withdrawals: u32,
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("ledgerline=info,ledgerline_kernel=info"));
    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();
}

fn load_config(path: Option<&PathBuf>) -> Result<EngineConfig> {
    match path {
        Some(path) => EngineConfig::from_json_file(path)
            .with_context(|| format!("loading {}", path.display())),
        None => Ok(EngineConfig::default()),
    }
}

async fn simulate(
    config: EngineConfig,
    aggregates: usize,
    events: usize,
    duplicate_every: Option<usize>,
) -> Result<()> {
    let plan = SimulationPlan {
        aggregates,
        events,
        duplicate_every,
    };
    let report = simulate_accounts(config, plan).await?;
    info!(
        committed = report.committed,
        duplicates = report.duplicates,
        batches = report.pipeline.batches,
        "simulation finished"
    );

    println!("{}", serde_json::to_string_pretty(&report)?);
    if !report.is_consistent() {
        bail!("recovered state diverged for {} aggregates", report.mismatches.len());
    }
    Ok(())
}

async fn replay(config: EngineConfig, path: &Path) -> Result<()> {
    let data = fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
    let rows: Vec<InputRow> = serde_json::from_str(&data)?;

    let codec = account_codec();
    let log = Arc::new(InMemoryEventLog::new());
    let mut ids = BTreeSet::new();
    for row in rows {
        if !codec.contains(&row.type_code) {
            bail!("unknown event type `{}` at version {}", row.type_code, row.version);
        }
        let partition = partition_for(row.timestamp, &config.partition);
        log.create_partition(&partition).await?;
        log.insert(
            &partition,
            &LogRow {
                aggregate_id: row.aggregate_id.to_string(),
                token: row.token,
                type_code: row.type_code,
                payload: serde_json::to_vec(&row.payload)?,
                version: row.version,
                timestamp: row.timestamp,
            },
        )
        .await?;
        ids.insert(row.aggregate_id);
    }
    info!(aggregates = ids.len(), rows = log.row_count(), "log loaded");

    let harness = MemoryHarness::with_log(config, log);
    let entities = try_join_all(
        ids.into_iter()
            .map(|id| harness.engine.activate(id, Box::new(SoleWriter))),
    )
    .await?;

    let accounts: Vec<_> = entities
        .iter()
        .map(|entity| {
            let state = entity.state();
            RecoveredAccount {
                aggregate_id: *entity.id(),
                version: state.version(),
                balance: state.data.balance,
                deposits: state.data.deposits,
                withdrawals: state.data.withdrawals,
            }
        })
        .collect();

    println!("{}", serde_json::to_string_pretty(&accounts)?);
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    let cli = Cli::parse();
    let config = load_config(cli.config.as_ref())?;

    match cli.command {
        Command::Simulate {
            aggregates,
            events,
            duplicate_every,
        } => simulate(config, aggregates, events, duplicate_every).await,
        Command::Replay { log } => replay(config, &log).await,
    }
}
