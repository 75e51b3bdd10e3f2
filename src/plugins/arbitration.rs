//! Write-scope conflict detection and priority arbitration.
//!
//! Agents declare the scopes they write. When a change touches scopes held
//! by more than one agent, a winner is chosen from the configured priority
//! tiers. Inside the first tier that intersects the conflict set, trust
//! breaks ties; trust never lifts an agent above a higher tier.

use crate::core::broker::DbBroker;
use crate::core::error::CanonryError;
use crate::core::locks::{LEDGER_KEY, arbitration_key};
use crate::core::model::{ArbitrationLock, LedgerPayload};
use crate::core::schemas;
use crate::core::store::Store;
use crate::core::time::command_envelope;
use crate::plugins::ledger::{self, LedgerEntry};
use crate::plugins::trust;
use clap::{Args, Parser, Subcommand};
use colored::Colorize;
use regex::Regex;
use rusqlite::{Connection, OptionalExtension, params};
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::LazyLock;
use tracing::info;

static SCOPE_PATTERN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^[A-Za-z0-9][A-Za-z0-9_.:/@-]*$").expect("scope pattern compiles")
});

pub fn validate_scope(scope: &str) -> Result<(), CanonryError> {
    if SCOPE_PATTERN.is_match(scope) {
        Ok(())
    } else {
        Err(CanonryError::ValidationError(format!(
            "invalid scope '{}': must match {}",
            scope,
            SCOPE_PATTERN.as_str()
        )))
    }
}

pub fn initialize_arbitration_db(store: &Store) -> Result<(), CanonryError> {
    let broker = DbBroker::new(store);
    broker.with_conn("canonry", None, "arbitration.init", |conn| {
        conn.execute_batch(schemas::ARBITRATION_DB_SCHEMA_SCOPES)?;
        conn.execute_batch(schemas::ARBITRATION_DB_INDEX_SCOPE)?;
        conn.execute_batch(schemas::ARBITRATION_DB_SCHEMA_LOCKS)?;
        Ok(())
    })
}

/// Register `agent_id` as a writer of each scope. Re-declaring is harmless.
pub fn declare_scopes(
    store: &Store,
    agent_id: &str,
    scopes: &[String],
) -> Result<Vec<String>, CanonryError> {
    if agent_id.trim().is_empty() {
        return Err(CanonryError::ValidationError(
            "agent id is required".to_string(),
        ));
    }
    for scope in scopes {
        validate_scope(scope)?;
    }
    let now = store.now_ms();
    let broker = DbBroker::new(store);
    broker.with_tx(agent_id, None, "arbitration.declare", |tx| {
        for scope in scopes {
            tx.execute(
                "INSERT OR IGNORE INTO write_scopes(agent_id, scope, declared_at) VALUES(?1, ?2, ?3)",
                params![agent_id, scope, now],
            )?;
        }
        Ok(())
    })?;
    info!(agent = agent_id, count = scopes.len(), "write scopes declared");
    Ok(scopes.to_vec())
}

fn conflicts_in(
    conn: &Connection,
    changed_scopes: &[String],
) -> Result<BTreeSet<String>, CanonryError> {
    let mut stmt = conn.prepare("SELECT agent_id FROM write_scopes WHERE scope = ?1")?;
    let mut agents = BTreeSet::new();
    for scope in changed_scopes {
        let rows = stmt.query_map(params![scope], |row| row.get::<_, String>(0))?;
        for r in rows {
            agents.insert(r?);
        }
    }
    Ok(agents)
}

/// Agents with a declared write scope among `changed_scopes`.
pub fn detect_conflicts(
    store: &Store,
    changed_scopes: &[String],
) -> Result<BTreeSet<String>, CanonryError> {
    for scope in changed_scopes {
        validate_scope(scope)?;
    }
    let broker = DbBroker::new(store);
    broker.with_conn("canonry", None, "arbitration.detect", |conn| {
        conflicts_in(conn, changed_scopes)
    })
}

/// First agent in `priority_order` that is also in `conflicts`.
pub fn arbitrate(
    conflicts: &BTreeSet<String>,
    priority_order: &[String],
) -> Result<String, CanonryError> {
    priority_order
        .iter()
        .find(|agent| conflicts.contains(*agent))
        .cloned()
        .ok_or_else(|| CanonryError::NoArbitrationWinner(conflicts.iter().cloned().collect()))
}

/// Tier-ranked arbitration with trust as the tie-break inside a tier.
///
/// Equal trust keeps the tier's listed order. Agents missing from `trust`
/// count as fully trusted.
pub fn arbitrate_tiered(
    conflicts: &BTreeSet<String>,
    tiers: &[Vec<String>],
    trust: &BTreeMap<String, f64>,
) -> Result<String, CanonryError> {
    for tier in tiers {
        let mut best: Option<(&String, f64)> = None;
        for agent in tier.iter().filter(|a| conflicts.contains(*a)) {
            let score = trust.get(agent).copied().unwrap_or(1.0);
            match best {
                Some((_, top)) if score.total_cmp(&top).is_le() => {}
                _ => best = Some((agent, score)),
            }
        }
        if let Some((winner, _)) = best {
            return Ok(winner.clone());
        }
    }
    Err(CanonryError::NoArbitrationWinner(
        conflicts.iter().cloned().collect(),
    ))
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "resolution", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Resolution {
    Uncontested {
        scope: String,
        conflicts: Vec<String>,
    },
    Resolved {
        lock: ArbitrationLock,
        conflicts: Vec<String>,
        entry: LedgerEntry,
    },
}

impl Resolution {
    pub fn winner(&self) -> Option<&str> {
        match self {
            Resolution::Resolved { lock, .. } => Some(&lock.owner),
            Resolution::Uncontested { .. } => None,
        }
    }
}

/// Runs detection and arbitration for one scope under its keyed lock.
pub struct Arbitrator<'a> {
    store: &'a Store,
    tiers: Vec<Vec<String>>,
}

impl<'a> Arbitrator<'a> {
    /// Uses the tiers from configuration.
    pub fn new(store: &'a Store) -> Self {
        Self {
            store,
            tiers: store.config().arbitration.tiers.clone(),
        }
    }

    /// Flat priority: each agent is its own tier.
    pub fn with_priority(store: &'a Store, order: &[String]) -> Self {
        Self {
            store,
            tiers: order.iter().map(|a| vec![a.clone()]).collect(),
        }
    }

    pub fn tiers(&self) -> &[Vec<String>] {
        &self.tiers
    }

    /// Detect conflicts on `changed_scopes`; if more than one agent is
    /// involved, pick a winner, overwrite `scope`'s lock and ledger it.
    pub fn resolve(
        &self,
        scope: &str,
        changed_scopes: &[String],
    ) -> Result<Resolution, CanonryError> {
        validate_scope(scope)?;
        for s in changed_scopes {
            validate_scope(s)?;
        }
        let store = self.store;
        let now = store.now_ms();
        let broker = DbBroker::new(store);

        let resolution = store.locks().with_lock(&arbitration_key(scope), || {
            store.locks().with_lock(LEDGER_KEY, || {
                broker.with_tx("canonry", Some(scope), "arbitration.resolve", |tx| {
                    self.resolve_in(tx, scope, changed_scopes, now)
                })
            })
        })?;
        log_resolution(&resolution);
        Ok(resolution)
    }

    /// Resolve each scope against itself in one transaction. Any failure,
    /// including a contested scope with no ranked agent, writes nothing.
    pub fn resolve_each(&self, scopes: &[String]) -> Result<Vec<Resolution>, CanonryError> {
        let ((), resolutions) = self.resolve_each_with(scopes, |_, _| Ok(()))?;
        Ok(resolutions)
    }

    /// `resolve_each` with `before` run first inside the same transaction.
    pub(crate) fn resolve_each_with<T, F>(
        &self,
        scopes: &[String],
        before: F,
    ) -> Result<(T, Vec<Resolution>), CanonryError>
    where
        F: FnOnce(&Connection, i64) -> Result<T, CanonryError>,
    {
        for scope in scopes {
            validate_scope(scope)?;
        }
        let store = self.store;
        let now = store.now_ms();
        let broker = DbBroker::new(store);
        let keys: Vec<String> = scopes.iter().map(|s| arbitration_key(s)).collect();

        let (value, resolutions) = store.locks().with_locks(&keys, || {
            store.locks().with_lock(LEDGER_KEY, || {
                broker.with_tx("canonry", None, "arbitration.resolve_each", |tx| {
                    let value = before(&**tx, now)?;
                    let resolutions = scopes
                        .iter()
                        .map(|scope| {
                            self.resolve_in(tx, scope, std::slice::from_ref(scope), now)
                        })
                        .collect::<Result<Vec<_>, CanonryError>>()?;
                    Ok((value, resolutions))
                })
            })
        })?;
        resolutions.iter().for_each(log_resolution);
        Ok((value, resolutions))
    }

    fn resolve_in(
        &self,
        conn: &Connection,
        scope: &str,
        changed_scopes: &[String],
        now: i64,
    ) -> Result<Resolution, CanonryError> {
        let conflicts = conflicts_in(conn, changed_scopes)?;
        let listed: Vec<String> = conflicts.iter().cloned().collect();
        if conflicts.len() <= 1 {
            return Ok(Resolution::Uncontested {
                scope: scope.to_string(),
                conflicts: listed,
            });
        }
        let initial = self.store.config().trust.initial;
        let trust = trust::scores_for_in(conn, initial, &listed)?;
        let owner = arbitrate_tiered(&conflicts, &self.tiers, &trust)?;
        let lock = ArbitrationLock {
            scope: scope.to_string(),
            owner,
            timestamp: now,
        };
        conn.execute(
            "INSERT INTO arbitration_locks(scope, owner, ts) VALUES(?1, ?2, ?3)
             ON CONFLICT(scope) DO UPDATE SET owner = excluded.owner, ts = excluded.ts",
            params![lock.scope, lock.owner, lock.timestamp],
        )?;
        let entry = ledger::append_in(conn, &LedgerPayload::Arbitration(lock.clone()), now)?;
        Ok(Resolution::Resolved {
            lock,
            conflicts: listed,
            entry,
        })
    }
}

fn log_resolution(resolution: &Resolution) {
    if let Resolution::Resolved { lock, .. } = resolution {
        info!(scope = %lock.scope, winner = %lock.owner, "arbitration resolved");
    }
}

pub fn current_lock(store: &Store, scope: &str) -> Result<Option<ArbitrationLock>, CanonryError> {
    let broker = DbBroker::new(store);
    broker.with_conn("canonry", Some(scope), "arbitration.lock", |conn| {
        Ok(conn
            .query_row(
                "SELECT scope, owner, ts FROM arbitration_locks WHERE scope = ?1",
                params![scope],
                |row| {
                    Ok(ArbitrationLock {
                        scope: row.get(0)?,
                        owner: row.get(1)?,
                        timestamp: row.get(2)?,
                    })
                },
            )
            .optional()?)
    })
}

// --- CLI ---

#[derive(Parser, Debug)]
#[clap(name = "scope", about = "Declare agent write scopes")]
pub struct ScopeCli {
    #[clap(subcommand)]
    pub command: ScopeCommand,
}

#[derive(Subcommand, Debug)]
pub enum ScopeCommand {
    /// Register the scopes an agent writes
    Declare {
        #[clap(long)]
        agent: String,
        #[clap(long = "scope", required = true)]
        scopes: Vec<String>,
    },
}

#[derive(Args, Debug)]
pub struct ArbitrateArgs {
    /// Scope whose lock is decided
    #[clap(long)]
    pub scope: String,
    /// Scopes touched by the change
    #[clap(long = "changed", required = true)]
    pub changed: Vec<String>,
    /// Flat priority order; overrides the configured tiers
    #[clap(long, value_delimiter = ',')]
    pub priority: Vec<String>,
}

pub fn schema() -> serde_json::Value {
    serde_json::json!({
        "name": "arbitration",
        "version": "0.1.0",
        "description": "Write-scope conflict detection and tiered priority arbitration",
        "commands": [
            { "name": "scope declare", "parameters": ["agent", "scope"] },
            { "name": "arbitrate", "parameters": ["scope", "changed", "priority"] }
        ],
        "scope_pattern": SCOPE_PATTERN.as_str(),
        "storage": ["governance.db:write_scopes", "governance.db:arbitration_locks"]
    })
}

pub fn run_scope_cli(store: &Store, cli: ScopeCli) -> Result<(), CanonryError> {
    match cli.command {
        ScopeCommand::Declare { agent, scopes } => {
            let declared = declare_scopes(store, &agent, &scopes)?;
            let envelope = command_envelope(
                "scope.declare",
                "ok",
                serde_json::json!({ "agent": agent, "scopes": declared }),
            );
            println!("{}", serde_json::to_string_pretty(&envelope)?);
        }
    }
    Ok(())
}

pub fn run_arbitrate(store: &Store, args: ArbitrateArgs) -> Result<(), CanonryError> {
    let arbitrator = if args.priority.is_empty() {
        Arbitrator::new(store)
    } else {
        Arbitrator::with_priority(store, &args.priority)
    };
    let resolution = arbitrator.resolve(&args.scope, &args.changed)?;
    match resolution.winner() {
        Some(winner) => eprintln!("{} {} owns {}", "resolved:".green().bold(), winner, args.scope),
        None => eprintln!("{} {}", "uncontested:".cyan().bold(), args.scope),
    }
    let envelope = command_envelope(
        "arbitrate",
        "ok",
        serde_json::json!({ "resolution": resolution }),
    );
    println!("{}", serde_json::to_string_pretty(&envelope)?);
    Ok(())
}
