//! Per-agent trust scores.
//!
//! Each reported failure lowers an agent's score by the configured penalty,
//! floored at zero. Agents with no row carry the configured initial score.
//! Scores feed arbitration as a tie-break inside a priority tier.
//!
//! `TrustWorker` applies failures off a channel on a background thread so the
//! decision path never waits on trust bookkeeping.

use crate::core::broker::DbBroker;
use crate::core::error::CanonryError;
use crate::core::locks::LEDGER_KEY;
use crate::core::model::{Failure, LedgerPayload, TrustRecord, TrustScore};
use crate::core::schemas;
use crate::core::store::Store;
use crate::core::time::command_envelope;
use crate::plugins::ledger;
use clap::{Parser, Subcommand};
use rusqlite::{Connection, OptionalExtension, params};
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::mpsc::{self, Receiver, Sender};
use std::thread::{self, JoinHandle};
use tracing::{debug, info, warn};

pub fn initialize_trust_db(store: &Store) -> Result<(), CanonryError> {
    let broker = DbBroker::new(store);
    broker.with_conn("canonry", None, "trust.init", |conn| {
        conn.execute_batch(schemas::TRUST_DB_SCHEMA_SCORES)?;
        Ok(())
    })
}

fn stored_score_in(conn: &Connection, agent_id: &str) -> Result<Option<(f64, i64)>, CanonryError> {
    Ok(conn
        .query_row(
            "SELECT score, failures FROM trust_scores WHERE agent_id = ?1",
            params![agent_id],
            |row| Ok((row.get(0)?, row.get(1)?)),
        )
        .optional()?)
}

/// Scores for a set of agents, defaulting missing ones to the initial score.
pub(crate) fn scores_for_in(
    conn: &Connection,
    initial: f64,
    agents: &[String],
) -> Result<BTreeMap<String, f64>, CanonryError> {
    let mut out = BTreeMap::new();
    for agent in agents {
        let score = stored_score_in(conn, agent)?.map_or(initial, |(s, _)| s);
        out.insert(agent.clone(), score);
    }
    Ok(out)
}

/// Apply a batch of failures in one transaction. Returns the updated score of
/// every agent touched, in agent-id order.
pub fn apply_failures(
    store: &Store,
    failures: &[Failure],
) -> Result<Vec<TrustScore>, CanonryError> {
    if failures.is_empty() {
        return Ok(Vec::new());
    }
    for failure in failures {
        failure.validate()?;
    }

    let policy = store.config().trust.clone();
    let now = store.now_ms();
    let broker = DbBroker::new(store);

    let updated = store.locks().with_lock(LEDGER_KEY, || {
        broker.with_tx("canonry", None, "trust.apply_failures", |tx| {
            let mut updated: BTreeMap<String, f64> = BTreeMap::new();
            for failure in failures {
                let (current, count) =
                    stored_score_in(tx, &failure.agent_id)?.unwrap_or((policy.initial, 0));
                let next = (current - policy.penalty).max(0.0);
                tx.execute(
                    "INSERT INTO trust_scores(agent_id, score, failures, updated_at)
                     VALUES(?1, ?2, ?3, ?4)
                     ON CONFLICT(agent_id) DO UPDATE SET
                        score = excluded.score,
                        failures = excluded.failures,
                        updated_at = excluded.updated_at",
                    params![failure.agent_id, next, count + 1, now],
                )?;
                ledger::append_in(
                    tx,
                    &LedgerPayload::Trust(TrustRecord {
                        agent_id: failure.agent_id.clone(),
                        score: next,
                        reason: failure.reason.clone(),
                        timestamp: now,
                    }),
                    now,
                )?;
                updated.insert(failure.agent_id.clone(), next);
            }
            Ok(updated)
        })
    })?;

    for (agent, score) in &updated {
        info!(agent = %agent, score, "trust lowered");
    }
    Ok(updated
        .into_iter()
        .map(|(agent_id, score)| TrustScore { agent_id, score })
        .collect())
}

pub fn score(store: &Store, agent_id: &str) -> Result<f64, CanonryError> {
    let initial = store.config().trust.initial;
    let broker = DbBroker::new(store);
    broker.with_conn("canonry", None, "trust.score", |conn| {
        Ok(stored_score_in(conn, agent_id)?.map_or(initial, |(s, _)| s))
    })
}

/// Every agent with a recorded score.
pub fn scores(store: &Store) -> Result<Vec<TrustScore>, CanonryError> {
    let broker = DbBroker::new(store);
    broker.with_conn("canonry", None, "trust.scores", |conn| {
        let mut stmt =
            conn.prepare("SELECT agent_id, score FROM trust_scores ORDER BY agent_id ASC")?;
        let rows = stmt.query_map([], |row| {
            Ok(TrustScore {
                agent_id: row.get(0)?,
                score: row.get(1)?,
            })
        })?;
        let mut out = Vec::new();
        for r in rows {
            out.push(r?);
        }
        Ok(out)
    })
}

// --- Background worker ---

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct WorkerReport {
    pub applied: usize,
    /// Failures dropped because they named no agent.
    pub rejected: usize,
    pub failed_batches: usize,
}

/// Consumes failures from a channel and applies them in batches.
pub struct TrustWorker {
    sender: Option<Sender<Failure>>,
    handle: Option<JoinHandle<WorkerReport>>,
}

impl TrustWorker {
    pub fn spawn(store: Store) -> Self {
        let (sender, receiver) = mpsc::channel();
        let handle = thread::spawn(move || run_worker(&store, receiver));
        Self {
            sender: Some(sender),
            handle: Some(handle),
        }
    }

    /// A sender that can be handed to other components.
    pub fn sender(&self) -> Result<Sender<Failure>, CanonryError> {
        self.sender
            .clone()
            .ok_or_else(|| CanonryError::WorkerStopped("trust worker".to_string()))
    }

    pub fn submit(&self, failure: Failure) -> Result<(), CanonryError> {
        failure.validate()?;
        self.sender
            .as_ref()
            .ok_or_else(|| CanonryError::WorkerStopped("trust worker".to_string()))?
            .send(failure)
            .map_err(|_| CanonryError::WorkerStopped("trust worker".to_string()))
    }

    /// Close the channel and wait for every queued failure to be applied.
    pub fn shutdown(mut self) -> Result<WorkerReport, CanonryError> {
        self.join()
    }

    fn join(&mut self) -> Result<WorkerReport, CanonryError> {
        drop(self.sender.take());
        match self.handle.take() {
            Some(handle) => handle
                .join()
                .map_err(|_| CanonryError::WorkerStopped("trust worker panicked".to_string())),
            None => Ok(WorkerReport::default()),
        }
    }
}

impl Drop for TrustWorker {
    fn drop(&mut self) {
        if let Err(e) = self.join() {
            warn!(error = %e, "trust worker did not shut down cleanly");
        }
    }
}

fn run_worker(store: &Store, receiver: Receiver<Failure>) -> WorkerReport {
    let mut report = WorkerReport::default();
    while let Ok(first) = receiver.recv() {
        // Raw senders skip `submit` validation. Bad items are dropped alone.
        let mut batch = Vec::new();
        for failure in std::iter::once(first).chain(receiver.try_iter()) {
            match failure.validate() {
                Ok(()) => batch.push(failure),
                Err(e) => {
                    report.rejected += 1;
                    warn!(error = %e, "trust failure rejected");
                }
            }
        }
        if batch.is_empty() {
            continue;
        }
        debug!(count = batch.len(), "applying trust failures");
        match apply_failures(store, &batch) {
            Ok(_) => report.applied += batch.len(),
            Err(e) => {
                report.failed_batches += 1;
                warn!(error = %e, count = batch.len(), "trust update failed");
            }
        }
    }
    report
}

// --- CLI ---

#[derive(Parser, Debug)]
#[clap(name = "trust", about = "Report failures and inspect agent trust scores")]
pub struct TrustCli {
    #[clap(subcommand)]
    pub command: TrustCommand,
}

#[derive(Subcommand, Debug)]
pub enum TrustCommand {
    /// Record a failure against an agent
    Fail {
        #[clap(long)]
        agent: String,
        #[clap(long, default_value = "")]
        reason: String,
    },
    /// Show one agent's score, or all recorded scores
    Show {
        #[clap(long)]
        agent: Option<String>,
    },
}

pub fn schema() -> serde_json::Value {
    serde_json::json!({
        "name": "trust",
        "version": "0.2.0",
        "description": "Per-agent trust scores lowered by reported failures",
        "commands": [
            { "name": "fail", "description": "Record a failure", "parameters": ["agent", "reason"] },
            { "name": "show", "description": "Show trust scores", "parameters": ["agent"] }
        ],
        "storage": ["governance.db:trust_scores"]
    })
}

pub fn run_trust_cli(store: &Store, cli: TrustCli) -> Result<(), CanonryError> {
    let envelope = match cli.command {
        TrustCommand::Fail { agent, reason } => {
            let updated = apply_failures(store, &[Failure::new(agent, reason)])?;
            command_envelope("trust.fail", "ok", serde_json::json!({ "scores": updated }))
        }
        TrustCommand::Show { agent: Some(agent) } => {
            let s = score(store, &agent)?;
            command_envelope(
                "trust.show",
                "ok",
                serde_json::json!({ "score": TrustScore { agent_id: agent, score: s } }),
            )
        }
        TrustCommand::Show { agent: None } => {
            let all = scores(store)?;
            command_envelope("trust.show", "ok", serde_json::json!({ "scores": all }))
        }
    };
    println!("{}", serde_json::to_string_pretty(&envelope)?);
    Ok(())
}
