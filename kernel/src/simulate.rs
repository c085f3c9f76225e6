// End-to-End Engine Simulation
//
// Drives the reference account aggregate through the full engine against
// in-memory backends:
// activate → concurrent raises → deactivate → re-activate → compare

use serde::Serialize;
use tokio::task::JoinSet;
use uuid::Uuid;

use crate::config::EngineConfig;
use crate::entity::IdempotencyToken;
use crate::error::EngineError;
use crate::log::{PipelineStats, Version};
use crate::testing::{deposit, withdraw, MemoryHarness, SoleWriter};

/// What to run.
#[derive(Debug, Clone, Copy)]
pub struct SimulationPlan {
    pub aggregates: usize,
    pub events: usize,
    /// Re-send every k-th event with the token of the event before it.
    pub duplicate_every: Option<usize>,
}

#[derive(Debug, Clone, Serialize)]
pub struct AccountSummary {
    pub aggregate_id: String,
    pub version: Version,
    pub balance: i64,
    pub snapshot_version: Version,
}

#[derive(Debug, Serialize)]
pub struct SimulationReport {
    pub aggregates: usize,
    pub raised: usize,
    pub committed: usize,
    pub duplicates: usize,
    pub log_rows: usize,
    pub snapshot_writes: usize,
    /// Aggregates whose recovered state differs from their live state.
    pub mismatches: Vec<String>,
    pub pipeline: PipelineStats,
    pub accounts: Vec<AccountSummary>,
}

impl SimulationReport {
    pub fn is_consistent(&self) -> bool {
        self.mismatches.is_empty() && self.log_rows == self.committed
    }
}

#[derive(Debug, thiserror::Error)]
pub enum SimulationError {
    #[error("engine failed: {0}")]
    Engine(#[from] EngineError),

    #[error("simulation task failed: {0}")]
    Task(#[from] tokio::task::JoinError),
}

struct Outcome {
    summary: AccountSummary,
    committed: usize,
    duplicates: usize,
    consistent: bool,
}

/// Run `plan` on a fresh in-memory engine.
///
/// Every aggregate runs on its own task so appends from different
/// aggregates share commit batches.
pub async fn simulate_accounts(
    config: EngineConfig,
    plan: SimulationPlan,
) -> Result<SimulationReport, SimulationError> {
    let harness = MemoryHarness::new(config);

    let mut tasks = JoinSet::new();
    for _ in 0..plan.aggregates {
        let engine = harness.engine.clone();
        tasks.spawn(async move {
            let id = Uuid::new_v4();
            let mut entity = engine.activate(id, Box::new(SoleWriter)).await?;

            let mut committed = 0;
            let mut duplicates = 0;
            for n in 0..plan.events {
                let payload = if n % 3 == 2 { withdraw(1) } else { deposit(2) };
                let resend = plan
                    .duplicate_every
                    .is_some_and(|every| every > 0 && n > 0 && n % every == 0);
                let uid = if resend { n - 1 } else { n };
                let token = IdempotencyToken::new(format!("{id}-{uid}"));

                if entity.raise(payload, Some(token)).await? {
                    committed += 1;
                } else {
                    duplicates += 1;
                }
            }

            let live = entity.state().clone();
            entity.deactivate().await?;

            let reloaded = engine.activate(id, Box::new(SoleWriter)).await?;
            let summary = AccountSummary {
                aggregate_id: id.to_string(),
                version: reloaded.state().version(),
                balance: reloaded.state().data.balance,
                snapshot_version: reloaded.snapshot_manager().last_snapshot_version(),
            };

            Ok::<_, EngineError>(Outcome {
                consistent: reloaded.state() == &live,
                summary,
                committed,
                duplicates,
            })
        });
    }

    let mut report = SimulationReport {
        aggregates: plan.aggregates,
        raised: plan.aggregates * plan.events,
        committed: 0,
        duplicates: 0,
        log_rows: 0,
        snapshot_writes: 0,
        mismatches: Vec::new(),
        pipeline: PipelineStats::default(),
        accounts: Vec::with_capacity(plan.aggregates),
    };
    while let Some(joined) = tasks.join_next().await {
        let outcome = joined??;
        report.committed += outcome.committed;
        report.duplicates += outcome.duplicates;
        if !outcome.consistent {
            report.mismatches.push(outcome.summary.aggregate_id.clone());
        }
        report.accounts.push(outcome.summary);
    }
    report.accounts.sort_by(|a, b| a.aggregate_id.cmp(&b.aggregate_id));

    report.log_rows = harness.log.row_count();
    report.snapshot_writes = harness.snapshots.writes().len();
    report.pipeline = harness.engine.log().stats();
    Ok(report)
}
