//! Canon promotion state machine.
//!
//! The canon document is one JSON object `{ruleId: "STATE"}` stored as a
//! single text blob and overwritten whole. Snapshots keep exact copies of
//! that text plus the ledger head at capture time, so a rollback restores
//! the document byte-for-byte.
//!
//! ```text
//! DRAFT ──advance──▶ CANDIDATE ──advance [tests, quorum]──▶ STABLE
//!                        │                                     │
//!                        └──────────revoke─────────────────────┴──▶ ROLLED_BACK
//! ```

use crate::core::broker::DbBroker;
use crate::core::canonical;
use crate::core::error::CanonryError;
use crate::core::locks::{LEDGER_KEY, promotion_key};
use crate::core::model::{
    CanonStage, CanonState, LedgerPayload, PromotionRecord, PromotionTests, RollbackRecord,
};
use crate::core::schemas;
use crate::core::store::Store;
use crate::core::time::{command_envelope, prefixed_id};
use crate::plugins::ledger::{self, LedgerEntry};
use crate::plugins::quorum::{self, Tally};
use clap::{Parser, Subcommand};
use colored::Colorize;
use rusqlite::{Connection, OptionalExtension, params};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;
use tracing::{info, warn};

pub type CanonDocument = BTreeMap<String, CanonStage>;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SnapshotRef {
    pub snapshot_id: String,
    pub rule_id: String,
    /// Sequence of the last ledger entry when the snapshot was taken.
    pub ledger_head: Option<u64>,
    pub created_at: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "outcome", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PromotionOutcome {
    Advanced { state: CanonState },
    QuorumNotMet { state: CanonState, tally: Tally },
    /// Quorum may hold, but the evidence gate did not.
    TestsFailed {
        state: CanonState,
        tests: PromotionTests,
        failed: Vec<String>,
    },
}

impl PromotionOutcome {
    pub fn state(&self) -> &CanonState {
        match self {
            PromotionOutcome::Advanced { state } => state,
            PromotionOutcome::QuorumNotMet { state, .. } => state,
            PromotionOutcome::TestsFailed { state, .. } => state,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RollbackResult {
    pub rule_id: String,
    pub snapshot: SnapshotRef,
    pub document: CanonDocument,
    /// The ledger as it stood when the snapshot was taken.
    pub ledger_view: Vec<LedgerEntry>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "result", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum GuardedPromotion {
    Promoted { outcome: PromotionOutcome },
    RolledBack { reason: String, rollback: RollbackResult },
}

pub fn initialize_promotion_db(store: &Store) -> Result<(), CanonryError> {
    let broker = DbBroker::new(store);
    broker.with_conn("canonry", None, "promotion.init", |conn| {
        conn.execute_batch(schemas::PROMOTION_DB_SCHEMA_CANON)?;
        conn.execute_batch(schemas::PROMOTION_DB_SEED_CANON)?;
        conn.execute_batch(schemas::PROMOTION_DB_SCHEMA_SNAPSHOTS)?;
        conn.execute_batch(schemas::PROMOTION_DB_INDEX_SNAPSHOTS_RULE)?;
        Ok(())
    })
}

fn require_rule_id(rule_id: &str) -> Result<(), CanonryError> {
    if rule_id.trim().is_empty() || rule_id.chars().any(char::is_whitespace) {
        return Err(CanonryError::ValidationError(format!(
            "invalid rule id '{}'",
            rule_id
        )));
    }
    Ok(())
}

// --- Document access ---

fn parse_document(text: &str) -> Result<CanonDocument, CanonryError> {
    serde_json::from_str(text).map_err(|e| CanonryError::Corrupt {
        table: "canon_document",
        detail: e.to_string(),
    })
}

fn read_text_in(conn: &Connection) -> Result<String, CanonryError> {
    conn.query_row("SELECT body FROM canon_document WHERE id = 1", [], |row| {
        row.get(0)
    })
    .optional()?
    .ok_or_else(|| CanonryError::Corrupt {
        table: "canon_document",
        detail: "document row missing".to_string(),
    })
}

pub(crate) fn read_document_in(conn: &Connection) -> Result<CanonDocument, CanonryError> {
    parse_document(&read_text_in(conn)?)
}

fn write_text_in(conn: &Connection, text: &str, now: i64) -> Result<(), CanonryError> {
    conn.execute(
        "UPDATE canon_document SET body = ?1, updated_at = ?2 WHERE id = 1",
        params![text, now],
    )?;
    Ok(())
}

fn write_document_in(conn: &Connection, doc: &CanonDocument, now: i64) -> Result<(), CanonryError> {
    write_text_in(conn, &canonical::canonicalize(doc)?, now)
}

fn latest_snapshot_in(
    conn: &Connection,
    rule_id: &str,
) -> Result<Option<(SnapshotRef, String)>, CanonryError> {
    let row = conn
        .query_row(
            "SELECT snapshot_id, rule_id, ledger_head, created_at, body FROM canon_snapshots
             WHERE rule_id = ?1 ORDER BY ordinal DESC LIMIT 1",
            params![rule_id],
            |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, Option<i64>>(2)?,
                    row.get::<_, i64>(3)?,
                    row.get::<_, String>(4)?,
                ))
            },
        )
        .optional()?;
    let Some((snapshot_id, rule_id, head, created_at, body)) = row else {
        return Ok(None);
    };
    let ledger_head = head
        .map(|h| {
            u64::try_from(h).map_err(|_| CanonryError::Corrupt {
                table: "canon_snapshots",
                detail: format!("snapshot {} has negative ledger head", snapshot_id),
            })
        })
        .transpose()?;
    Ok(Some((
        SnapshotRef {
            snapshot_id,
            rule_id,
            ledger_head,
            created_at,
        },
        body,
    )))
}

fn state_in(conn: &Connection, rule_id: &str) -> Result<Option<CanonState>, CanonryError> {
    let doc = read_document_in(conn)?;
    let Some(stage) = doc.get(rule_id).copied() else {
        return Ok(None);
    };
    let snapshot_ref = latest_snapshot_in(conn, rule_id)?.map(|(s, _)| s.snapshot_id);
    Ok(Some(CanonState {
        rule_id: rule_id.to_string(),
        state: stage,
        snapshot_ref,
    }))
}

fn require_state_in(conn: &Connection, rule_id: &str) -> Result<CanonState, CanonryError> {
    state_in(conn, rule_id)?
        .ok_or_else(|| CanonryError::NotFound(format!("canon rule '{}'", rule_id)))
}

fn transition_in(
    conn: &Connection,
    rule_id: &str,
    from: Option<CanonStage>,
    to: CanonStage,
    tests: Option<&PromotionTests>,
    now: i64,
) -> Result<CanonState, CanonryError> {
    let mut doc = read_document_in(conn)?;
    doc.insert(rule_id.to_string(), to);
    write_document_in(conn, &doc, now)?;
    ledger::append_in(
        conn,
        &LedgerPayload::Promotion(PromotionRecord {
            rule_id: rule_id.to_string(),
            from,
            to,
            timestamp: now,
            tests: tests.cloned(),
        }),
        now,
    )?;
    require_state_in(conn, rule_id)
}

/// Run `f` in one write transaction holding the rule's promotion key and
/// the ledger key, in that order.
fn with_rule_tx<F, R>(store: &Store, rule_id: &str, op: &str, f: F) -> Result<R, CanonryError>
where
    F: FnOnce(&Connection, i64) -> Result<R, CanonryError>,
{
    require_rule_id(rule_id)?;
    let broker = DbBroker::new(store);
    let now = store.now_ms();
    store.locks().with_lock(&promotion_key(rule_id), || {
        store.locks().with_lock(LEDGER_KEY, || {
            broker.with_tx("canonry", Some(rule_id), op, |tx| f(&**tx, now))
        })
    })
}

// --- Operations (connection level) ---

fn propose_in(conn: &Connection, rule_id: &str, now: i64) -> Result<CanonState, CanonryError> {
    match state_in(conn, rule_id)? {
        Some(existing) if existing.state == CanonStage::Draft => Ok(existing),
        Some(existing) => Err(CanonryError::ValidationError(format!(
            "rule '{}' already exists in state {}",
            rule_id, existing.state
        ))),
        None => transition_in(conn, rule_id, None, CanonStage::Draft, None, now),
    }
}

fn advance_in(
    conn: &Connection,
    store: &Store,
    rule_id: &str,
    tests: Option<&PromotionTests>,
    now: i64,
) -> Result<PromotionOutcome, CanonryError> {
    let current = require_state_in(conn, rule_id)?;
    match current.state {
        CanonStage::Draft => {
            let state = transition_in(
                conn,
                rule_id,
                Some(CanonStage::Draft),
                CanonStage::Candidate,
                None,
                now,
            )?;
            Ok(PromotionOutcome::Advanced { state })
        }
        CanonStage::Candidate => {
            if let Some(tests) = tests.filter(|t| !t.all_passed()) {
                return Ok(PromotionOutcome::TestsFailed {
                    state: current,
                    failed: tests.failed().into_iter().map(String::from).collect(),
                    tests: tests.clone(),
                });
            }
            let votes = quorum::votes_in(conn, rule_id)?;
            let tally = quorum::tally_votes(&store.config().quorum, rule_id, &votes);
            if !tally.met {
                return Ok(PromotionOutcome::QuorumNotMet {
                    state: current,
                    tally,
                });
            }
            let state = transition_in(
                conn,
                rule_id,
                Some(CanonStage::Candidate),
                CanonStage::Stable,
                tests,
                now,
            )?;
            Ok(PromotionOutcome::Advanced { state })
        }
        terminal => Err(CanonryError::ValidationError(format!(
            "rule '{}' is {} and has no forward transition",
            rule_id, terminal
        ))),
    }
}

fn snapshot_in(conn: &Connection, rule_id: &str, now: i64) -> Result<SnapshotRef, CanonryError> {
    require_state_in(conn, rule_id)?;
    let body = read_text_in(conn)?;
    let ledger_head = ledger::head_sequence_in(conn)?;
    let ordinal: i64 = conn.query_row(
        "SELECT COALESCE(MAX(ordinal), 0) + 1 FROM canon_snapshots",
        [],
        |row| row.get(0),
    )?;
    let snapshot = SnapshotRef {
        snapshot_id: prefixed_id("SNAP"),
        rule_id: rule_id.to_string(),
        ledger_head,
        created_at: now,
    };
    let head_sql = ledger_head
        .map(|h| {
            i64::try_from(h).map_err(|_| {
                CanonryError::ValidationError(format!("ledger head {} out of range", h))
            })
        })
        .transpose()?;
    conn.execute(
        "INSERT INTO canon_snapshots(snapshot_id, rule_id, body, ledger_head, created_at, ordinal)
         VALUES(?1, ?2, ?3, ?4, ?5, ?6)",
        params![snapshot.snapshot_id, rule_id, body, head_sql, now, ordinal],
    )?;
    Ok(snapshot)
}

fn rollback_in(conn: &Connection, rule_id: &str, now: i64) -> Result<RollbackResult, CanonryError> {
    let current = require_state_in(conn, rule_id)?;
    if current.state == CanonStage::Draft {
        return Err(CanonryError::ValidationError(format!(
            "rule '{}' is DRAFT; nothing to roll back",
            rule_id
        )));
    }
    let Some((snapshot, body)) = latest_snapshot_in(conn, rule_id)? else {
        return Err(CanonryError::RollbackUnavailable(rule_id.to_string()));
    };
    let document = parse_document(&body)?;
    write_text_in(conn, &body, now)?;
    let ledger_view = match snapshot.ledger_head {
        Some(head) => ledger::view_in(conn, head)?,
        None => Vec::new(),
    };
    ledger::append_in(
        conn,
        &LedgerPayload::Rollback(RollbackRecord {
            rule_id: rule_id.to_string(),
            snapshot_id: snapshot.snapshot_id.clone(),
            ledger_head: snapshot.ledger_head,
            timestamp: now,
        }),
        now,
    )?;
    Ok(RollbackResult {
        rule_id: rule_id.to_string(),
        snapshot,
        document,
        ledger_view,
    })
}

fn revoke_in(conn: &Connection, rule_id: &str, now: i64) -> Result<CanonState, CanonryError> {
    let current = require_state_in(conn, rule_id)?;
    match current.state {
        CanonStage::Candidate | CanonStage::Stable => transition_in(
            conn,
            rule_id,
            Some(current.state),
            CanonStage::RolledBack,
            None,
            now,
        ),
        other => Err(CanonryError::ValidationError(format!(
            "rule '{}' is {}; only CANDIDATE or STABLE rules can be revoked",
            rule_id, other
        ))),
    }
}

// --- Public API ---

/// Create `rule_id` in DRAFT. Proposing an existing DRAFT rule is a no-op.
pub fn propose(store: &Store, rule_id: &str) -> Result<CanonState, CanonryError> {
    let state = with_rule_tx(store, rule_id, "promotion.propose", |conn, now| {
        propose_in(conn, rule_id, now)
    })?;
    info!(rule = rule_id, "canon rule proposed");
    Ok(state)
}

/// DRAFT → CANDIDATE, or CANDIDATE → STABLE when quorum holds.
pub fn advance(store: &Store, rule_id: &str) -> Result<PromotionOutcome, CanonryError> {
    advance_checked(store, rule_id, None)
}

/// `advance` with the evidence gate: CANDIDATE → STABLE also needs every
/// test in `tests` to pass, and the tests are ledgered with the step.
/// Other stages ignore them.
pub fn advance_with_tests(
    store: &Store,
    rule_id: &str,
    tests: &PromotionTests,
) -> Result<PromotionOutcome, CanonryError> {
    advance_checked(store, rule_id, Some(tests))
}

fn advance_checked(
    store: &Store,
    rule_id: &str,
    tests: Option<&PromotionTests>,
) -> Result<PromotionOutcome, CanonryError> {
    let outcome = with_rule_tx(store, rule_id, "promotion.advance", |conn, now| {
        advance_in(conn, store, rule_id, tests, now)
    })?;
    match &outcome {
        PromotionOutcome::Advanced { state } => {
            info!(rule = rule_id, state = %state.state, "canon rule advanced")
        }
        PromotionOutcome::QuorumNotMet { tally, .. } => info!(
            rule = rule_id,
            approvals = tally.counted_approvals,
            required = tally.required,
            "quorum not met"
        ),
        PromotionOutcome::TestsFailed { failed, .. } => {
            info!(rule = rule_id, failed = ?failed, "promotion tests failed")
        }
    }
    Ok(outcome)
}

pub fn snapshot(store: &Store, rule_id: &str) -> Result<SnapshotRef, CanonryError> {
    let snap = with_rule_tx(store, rule_id, "promotion.snapshot", |conn, now| {
        snapshot_in(conn, rule_id, now)
    })?;
    info!(rule = rule_id, snapshot = %snap.snapshot_id, "canon snapshot taken");
    Ok(snap)
}

/// Restore the document from the rule's latest snapshot.
pub fn rollback(store: &Store, rule_id: &str) -> Result<RollbackResult, CanonryError> {
    let result = with_rule_tx(store, rule_id, "promotion.rollback", |conn, now| {
        rollback_in(conn, rule_id, now)
    })?;
    warn!(rule = rule_id, snapshot = %result.snapshot.snapshot_id, "canon rolled back");
    Ok(result)
}

/// Move a CANDIDATE or STABLE rule to ROLLED_BACK.
pub fn revoke(store: &Store, rule_id: &str) -> Result<CanonState, CanonryError> {
    let state = with_rule_tx(store, rule_id, "promotion.revoke", |conn, now| {
        revoke_in(conn, rule_id, now)
    })?;
    warn!(rule = rule_id, "canon rule revoked");
    Ok(state)
}

/// Snapshot, advance, then run `check` on the result. A failed check rolls
/// the document back inside the same transaction; if that rollback cannot
/// happen the transaction aborts and nothing changes.
pub fn promote_guarded<F>(
    store: &Store,
    rule_id: &str,
    check: F,
) -> Result<GuardedPromotion, CanonryError>
where
    F: FnOnce(&PromotionOutcome) -> Result<(), String>,
{
    let result = with_rule_tx(store, rule_id, "promotion.guarded", |conn, now| {
        snapshot_in(conn, rule_id, now)?;
        let outcome = advance_in(conn, store, rule_id, None, now)?;
        match check(&outcome) {
            Ok(()) => Ok(GuardedPromotion::Promoted { outcome }),
            Err(reason) => {
                let rollback = rollback_in(conn, rule_id, now)?;
                Ok(GuardedPromotion::RolledBack { reason, rollback })
            }
        }
    })?;
    if let GuardedPromotion::RolledBack { reason, .. } = &result {
        warn!(rule = rule_id, reason = %reason, "post-promotion check failed; rolled back");
    }
    Ok(result)
}

pub fn state(store: &Store, rule_id: &str) -> Result<Option<CanonState>, CanonryError> {
    let broker = DbBroker::new(store);
    broker.with_conn("canonry", Some(rule_id), "promotion.state", |conn| {
        state_in(conn, rule_id)
    })
}

pub fn document(store: &Store) -> Result<CanonDocument, CanonryError> {
    let broker = DbBroker::new(store);
    broker.with_conn("canonry", None, "promotion.document", read_document_in)
}

/// The stored document text, exactly as persisted.
pub fn document_text(store: &Store) -> Result<String, CanonryError> {
    let broker = DbBroker::new(store);
    broker.with_conn("canonry", None, "promotion.document", read_text_in)
}

/// Rule ids from `required` that are not STABLE.
pub fn missing_stable(doc: &CanonDocument, required: &[String]) -> Vec<String> {
    required
        .iter()
        .filter(|id| doc.get(id.as_str()) != Some(&CanonStage::Stable))
        .cloned()
        .collect()
}

// --- CLI ---

#[derive(Parser, Debug)]
#[clap(name = "canon", about = "Promote, snapshot and roll back canon rules")]
pub struct CanonCli {
    #[clap(subcommand)]
    pub command: CanonCommand,
}

#[derive(Subcommand, Debug)]
pub enum CanonCommand {
    /// Create a rule in DRAFT
    Propose {
        #[clap(long)]
        rule: String,
    },
    /// Move a rule one stage forward
    Advance {
        #[clap(long)]
        rule: String,
        /// JSON file with promotion test results for CANDIDATE -> STABLE
        #[clap(long)]
        tests: Option<PathBuf>,
    },
    /// Capture the document and ledger head
    Snapshot {
        #[clap(long)]
        rule: String,
    },
    /// Restore the document from the rule's latest snapshot
    Rollback {
        #[clap(long)]
        rule: String,
    },
    /// Mark a CANDIDATE or STABLE rule ROLLED_BACK
    Revoke {
        #[clap(long)]
        rule: String,
    },
    /// Print the document, or one rule's state
    Show {
        #[clap(long)]
        rule: Option<String>,
    },
}

pub fn schema() -> serde_json::Value {
    serde_json::json!({
        "name": "promotion",
        "version": "0.1.0",
        "description": "Quorum- and evidence-gated canon promotion with snapshot rollback",
        "commands": [
            { "name": "propose", "parameters": ["rule"] },
            { "name": "advance", "parameters": ["rule", "tests"] },
            { "name": "snapshot", "parameters": ["rule"] },
            { "name": "rollback", "parameters": ["rule"] },
            { "name": "revoke", "parameters": ["rule"] },
            { "name": "show", "parameters": ["rule"] }
        ],
        "states": ["DRAFT", "CANDIDATE", "STABLE", "ROLLED_BACK"],
        "storage": ["governance.db:canon_document", "governance.db:canon_snapshots"]
    })
}

pub fn run_canon_cli(store: &Store, cli: CanonCli) -> Result<(), CanonryError> {
    let envelope = match cli.command {
        CanonCommand::Propose { rule } => {
            let state = propose(store, &rule)?;
            command_envelope("canon.propose", "ok", serde_json::json!({ "state": state }))
        }
        CanonCommand::Advance { rule, tests } => {
            let outcome = match tests {
                Some(path) => {
                    let raw = std::fs::read_to_string(&path)?;
                    let tests: PromotionTests = serde_json::from_str(&raw).map_err(|e| {
                        CanonryError::ValidationError(format!("promotion tests: {}", e))
                    })?;
                    advance_with_tests(store, &rule, &tests)?
                }
                None => advance(store, &rule)?,
            };
            let status = match &outcome {
                PromotionOutcome::Advanced { state } => {
                    eprintln!("{} {} -> {}", "advanced".green().bold(), rule, state.state);
                    "ok"
                }
                PromotionOutcome::QuorumNotMet { tally, .. } => {
                    eprintln!(
                        "{} {}/{} approvals",
                        "quorum not met:".yellow().bold(),
                        tally.counted_approvals,
                        tally.required
                    );
                    "quorum_not_met"
                }
                PromotionOutcome::TestsFailed { failed, .. } => {
                    eprintln!("{} {}", "tests failed:".yellow().bold(), failed.join(", "));
                    "tests_failed"
                }
            };
            command_envelope("canon.advance", status, serde_json::json!({ "result": outcome }))
        }
        CanonCommand::Snapshot { rule } => {
            let snap = snapshot(store, &rule)?;
            command_envelope("canon.snapshot", "ok", serde_json::json!({ "snapshot": snap }))
        }
        CanonCommand::Rollback { rule } => {
            let result = rollback(store, &rule)?;
            command_envelope("canon.rollback", "ok", serde_json::json!({ "rollback": result }))
        }
        CanonCommand::Revoke { rule } => {
            let state = revoke(store, &rule)?;
            command_envelope("canon.revoke", "ok", serde_json::json!({ "state": state }))
        }
        CanonCommand::Show { rule } => match rule {
            Some(rule) => {
                let state = state(store, &rule)?
                    .ok_or_else(|| CanonryError::NotFound(format!("canon rule '{}'", rule)))?;
                command_envelope("canon.show", "ok", serde_json::json!({ "state": state }))
            }
            None => {
                let doc = document(store)?;
                command_envelope("canon.show", "ok", serde_json::json!({ "document": doc }))
            }
        },
    };
    println!("{}", serde_json::to_string_pretty(&envelope)?);
    Ok(())
}
