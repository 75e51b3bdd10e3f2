//! Vote collection and the N-of-M quorum predicate.
//!
//! One live vote per `(proposal, agent)`; a later vote replaces the earlier
//! one. With `ledger.record_votes` on, every cast vote is also appended to
//! the ledger, which keeps the full history.

use crate::core::broker::DbBroker;
use crate::core::config::QuorumPolicy;
use crate::core::error::CanonryError;
use crate::core::locks::LEDGER_KEY;
use crate::core::model::{LedgerPayload, Vote, VoteChoice};
use crate::core::schemas;
use crate::core::store::Store;
use crate::core::time::command_envelope;
use crate::plugins::ledger;
use clap::{Parser, Subcommand};
use rusqlite::{Connection, params};
use serde::{Deserialize, Serialize};
use tracing::info;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Tally {
    pub proposal_id: String,
    pub approve: usize,
    pub reject: usize,
    /// Approvals that count toward quorum under the eligibility list.
    pub counted_approvals: usize,
    pub required: usize,
    pub met: bool,
}

pub fn initialize_quorum_db(store: &Store) -> Result<(), CanonryError> {
    let broker = DbBroker::new(store);
    broker.with_conn("canonry", None, "quorum.init", |conn| {
        conn.execute_batch(schemas::QUORUM_DB_SCHEMA_VOTES)?;
        Ok(())
    })
}

/// Parse a raw choice. A missing choice is as invalid as an unknown one.
pub fn parse_choice(raw: Option<&str>) -> Result<VoteChoice, CanonryError> {
    match raw {
        Some(s) => s.parse(),
        None => Err(CanonryError::InvalidVote("choice is required".to_string())),
    }
}

fn counts(policy: &QuorumPolicy, vote: &Vote) -> bool {
    vote.choice == VoteChoice::Approve
        && (policy.eligible.is_empty() || policy.eligible.contains(&vote.agent_id))
}

/// `required` counted approvals among the live votes.
pub fn quorum_met(policy: &QuorumPolicy, votes: &[Vote]) -> bool {
    votes.iter().filter(|v| counts(policy, v)).count() >= policy.required
}

pub fn tally_votes(policy: &QuorumPolicy, proposal_id: &str, votes: &[Vote]) -> Tally {
    let approve = votes
        .iter()
        .filter(|v| v.choice == VoteChoice::Approve)
        .count();
    let counted_approvals = votes.iter().filter(|v| counts(policy, v)).count();
    Tally {
        proposal_id: proposal_id.to_string(),
        approve,
        reject: votes.len() - approve,
        counted_approvals,
        required: policy.required,
        met: counted_approvals >= policy.required,
    }
}

pub(crate) fn votes_in(conn: &Connection, proposal_id: &str) -> Result<Vec<Vote>, CanonryError> {
    let mut stmt = conn.prepare(
        "SELECT agent_id, proposal_id, choice, ts FROM votes
         WHERE proposal_id = ?1 ORDER BY agent_id ASC",
    )?;
    let rows = stmt.query_map(params![proposal_id], |row| {
        Ok((
            row.get::<_, String>(0)?,
            row.get::<_, String>(1)?,
            row.get::<_, String>(2)?,
            row.get::<_, i64>(3)?,
        ))
    })?;
    let mut out = Vec::new();
    for r in rows {
        let (agent_id, proposal_id, choice, timestamp) = r?;
        let choice = choice.parse().map_err(|_| CanonryError::Corrupt {
            table: "votes",
            detail: format!("agent {} on {}: choice '{}'", agent_id, proposal_id, choice),
        })?;
        out.push(Vote {
            agent_id,
            proposal_id,
            choice,
            timestamp,
        });
    }
    Ok(out)
}

fn upsert_in(conn: &Connection, vote: &Vote) -> Result<(), CanonryError> {
    conn.execute(
        "INSERT INTO votes(proposal_id, agent_id, choice, ts) VALUES(?1, ?2, ?3, ?4)
         ON CONFLICT(proposal_id, agent_id) DO UPDATE SET choice = excluded.choice, ts = excluded.ts",
        params![vote.proposal_id, vote.agent_id, vote.choice.as_str(), vote.timestamp],
    )?;
    Ok(())
}

/// Cast or replace `agent_id`'s vote on `proposal_id`.
pub fn record_vote(
    store: &Store,
    agent_id: &str,
    proposal_id: &str,
    choice: VoteChoice,
) -> Result<Vote, CanonryError> {
    if agent_id.trim().is_empty() {
        return Err(CanonryError::InvalidVote("agent id is required".to_string()));
    }
    if proposal_id.trim().is_empty() {
        return Err(CanonryError::InvalidVote(
            "proposal id is required".to_string(),
        ));
    }

    let vote = Vote {
        agent_id: agent_id.to_string(),
        proposal_id: proposal_id.to_string(),
        choice,
        timestamp: store.now_ms(),
    };
    let broker = DbBroker::new(store);

    if store.config().ledger.record_votes {
        store.locks().with_lock(LEDGER_KEY, || {
            broker.with_tx(agent_id, Some(proposal_id), "quorum.vote", |tx| {
                upsert_in(tx, &vote)?;
                ledger::append_in(tx, &LedgerPayload::Vote(vote.clone()), vote.timestamp)?;
                Ok(())
            })
        })?;
    } else {
        broker.with_tx(agent_id, Some(proposal_id), "quorum.vote", |tx| {
            upsert_in(tx, &vote)
        })?;
    }

    info!(agent = agent_id, proposal = proposal_id, choice = %choice, "vote recorded");
    Ok(vote)
}

/// Live votes on a proposal, ordered by agent id.
pub fn votes(store: &Store, proposal_id: &str) -> Result<Vec<Vote>, CanonryError> {
    let broker = DbBroker::new(store);
    broker.with_conn("canonry", Some(proposal_id), "quorum.votes", |conn| {
        votes_in(conn, proposal_id)
    })
}

pub fn tally(store: &Store, proposal_id: &str) -> Result<Tally, CanonryError> {
    let live = votes(store, proposal_id)?;
    Ok(tally_votes(&store.config().quorum, proposal_id, &live))
}

// --- CLI ---

#[derive(Parser, Debug)]
#[clap(name = "vote", about = "Cast and inspect votes on canon proposals")]
pub struct VoteCli {
    #[clap(subcommand)]
    pub command: VoteCommand,
}

#[derive(Subcommand, Debug)]
pub enum VoteCommand {
    /// Cast (or replace) a vote
    Cast {
        #[clap(long)]
        agent: String,
        /// Proposal id; for canon promotion this is the rule id
        #[clap(long)]
        proposal: String,
        /// approve | reject
        #[clap(long)]
        choice: Option<String>,
    },
    /// List live votes on a proposal
    List {
        #[clap(long)]
        proposal: String,
    },
    /// Count votes against the configured quorum
    Tally {
        #[clap(long)]
        proposal: String,
    },
}

pub fn schema() -> serde_json::Value {
    serde_json::json!({
        "name": "quorum",
        "version": "0.1.0",
        "description": "Last-write-wins votes and the N-of-M quorum predicate",
        "commands": [
            { "name": "cast", "description": "Cast a vote", "parameters": ["agent", "proposal", "choice"] },
            { "name": "list", "description": "List live votes", "parameters": ["proposal"] },
            { "name": "tally", "description": "Tally votes against quorum", "parameters": ["proposal"] }
        ],
        "storage": ["governance.db:votes"]
    })
}

pub fn run_vote_cli(store: &Store, cli: VoteCli) -> Result<(), CanonryError> {
    let envelope = match cli.command {
        VoteCommand::Cast {
            agent,
            proposal,
            choice,
        } => {
            let choice = parse_choice(choice.as_deref())?;
            let vote = record_vote(store, &agent, &proposal, choice)?;
            command_envelope("vote.cast", "ok", serde_json::json!({ "vote": vote }))
        }
        VoteCommand::List { proposal } => {
            let live = votes(store, &proposal)?;
            command_envelope("vote.list", "ok", serde_json::json!({ "votes": live }))
        }
        VoteCommand::Tally { proposal } => {
            let t = tally(store, &proposal)?;
            command_envelope("vote.tally", "ok", serde_json::json!({ "tally": t }))
        }
    };
    println!("{}", serde_json::to_string_pretty(&envelope)?);
    Ok(())
}
