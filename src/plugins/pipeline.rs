//! The governance pipeline: decide, ledger, arbitrate, and feed failures to
//! the trust worker.
//!
//! `Governor` is the single entry point a host embeds. It owns a decision
//! engine and a running `TrustWorker`; every denial with a known acting
//! agent becomes a trust failure for that agent.

use crate::core::error::CanonryError;
use crate::core::model::{Failure, Intent, PromotionTests, Vote, VoteChoice};
use crate::core::store::Store;
use crate::core::time::command_envelope;
use crate::plugins::arbitration::{self, Arbitrator, Resolution};
use crate::plugins::decide::{DecisionEngine, Judgement, Verdict};
use crate::plugins::ledger;
use crate::plugins::promotion::{self, GuardedPromotion, PromotionOutcome};
use crate::plugins::quorum;
use crate::plugins::trust::{TrustWorker, WorkerReport};
use clap::Args;
use colored::Colorize;
use serde::Serialize;
use std::collections::BTreeSet;
use std::fs;
use std::path::PathBuf;
use tracing::{info, warn};

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Submission {
    pub verdict: Verdict,
    /// One resolution per changed scope with more than one declared writer.
    pub arbitration: Vec<Resolution>,
}

pub struct Governor {
    store: Store,
    engine: DecisionEngine,
    trust: TrustWorker,
}

impl Governor {
    pub fn new(store: &Store) -> Self {
        Self::with_engine(store, DecisionEngine::new(store))
    }

    pub fn with_engine(store: &Store, engine: DecisionEngine) -> Self {
        Self {
            store: store.clone(),
            engine,
            trust: TrustWorker::spawn(store.clone()),
        }
    }

    pub fn store(&self) -> &Store {
        &self.store
    }

    /// Decide `intent`; if allowed, arbitrate every changed scope that more
    /// than one agent writes.
    ///
    /// An allowed decision and its arbitration commit together: if any
    /// scope cannot be arbitrated, neither the decision nor any lock is
    /// written.
    pub fn submit(
        &self,
        intent: &Intent,
        changed_scopes: &[String],
    ) -> Result<Submission, CanonryError> {
        for scope in changed_scopes {
            arbitration::validate_scope(scope)?;
        }
        let judgement = self.engine.judge(intent)?;
        let payload = judgement.payload();

        if let Judgement::Deny(denial) = &judgement {
            let entry = ledger::append(&self.store, &payload)?;
            if let Some(agent) = &intent.authority {
                self.trust
                    .submit(Failure::new(agent.clone(), denial.reason.clone()))?;
            }
            return Ok(Submission {
                verdict: judgement.into_verdict(entry),
                arbitration: Vec::new(),
            });
        }

        let scopes: Vec<String> = changed_scopes
            .iter()
            .cloned()
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect();
        let (entry, resolutions) = Arbitrator::new(&self.store)
            .resolve_each_with(&scopes, |conn, now| ledger::append_in(conn, &payload, now))?;
        let arbitration = resolutions
            .into_iter()
            .filter(|r| matches!(r, Resolution::Resolved { .. }))
            .collect();

        Ok(Submission {
            verdict: judgement.into_verdict(entry),
            arbitration,
        })
    }

    /// Submit intents in order, stopping at the first error.
    pub fn submit_all(
        &self,
        intents: &[(Intent, Vec<String>)],
    ) -> Result<Vec<Submission>, CanonryError> {
        let mut out = Vec::with_capacity(intents.len());
        for (intent, scopes) in intents {
            match self.submit(intent, scopes) {
                Ok(s) => out.push(s),
                Err(e) => {
                    if e.halts_pipeline() {
                        warn!(intent = %intent.id, error = %e, "pipeline halted");
                    }
                    return Err(e);
                }
            }
        }
        Ok(out)
    }

    pub fn vote(
        &self,
        agent_id: &str,
        proposal_id: &str,
        choice: VoteChoice,
    ) -> Result<Vote, CanonryError> {
        quorum::record_vote(&self.store, agent_id, proposal_id, choice)
    }

    pub fn promote(&self, rule_id: &str) -> Result<PromotionOutcome, CanonryError> {
        promotion::advance(&self.store, rule_id)
    }

    pub fn promote_with_tests(
        &self,
        rule_id: &str,
        tests: &PromotionTests,
    ) -> Result<PromotionOutcome, CanonryError> {
        promotion::advance_with_tests(&self.store, rule_id, tests)
    }

    pub fn promote_guarded<F>(
        &self,
        rule_id: &str,
        check: F,
    ) -> Result<GuardedPromotion, CanonryError>
    where
        F: FnOnce(&PromotionOutcome) -> Result<(), String>,
    {
        promotion::promote_guarded(&self.store, rule_id, check)
    }

    /// Stop the trust worker after it drains queued failures.
    pub fn shutdown(self) -> Result<WorkerReport, CanonryError> {
        let report = self.trust.shutdown()?;
        info!(applied = report.applied, "governor shut down");
        Ok(report)
    }
}

// --- CLI ---

#[derive(Args, Debug)]
pub struct DecideArgs {
    /// Path to an intent JSON document
    #[clap(long)]
    pub intent: PathBuf,
    /// Scopes the action changes
    #[clap(long = "changed")]
    pub changed: Vec<String>,
}

pub fn run_decide(store: &Store, args: DecideArgs) -> Result<(), CanonryError> {
    let raw = fs::read_to_string(&args.intent)?;
    let intent: Intent = serde_json::from_str(&raw)
        .map_err(|e| CanonryError::ValidationError(format!("intent document: {}", e)))?;

    let governor = Governor::new(store);
    let submission = governor.submit(&intent, &args.changed)?;
    governor.shutdown()?;

    let status = match &submission.verdict {
        Verdict::Allow { .. } => {
            eprintln!("{} {}", "ALLOW".green().bold(), intent.id);
            "allow"
        }
        Verdict::Deny { denial, .. } => {
            eprintln!("{} {}: {}", "DENY".red().bold(), intent.id, denial.reason);
            "deny"
        }
    };
    let envelope = command_envelope(
        "decide",
        status,
        serde_json::json!({ "submission": submission }),
    );
    println!("{}", serde_json::to_string_pretty(&envelope)?);
    Ok(())
}
