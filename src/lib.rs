//! Canonry: execution governance for cooperating agents.
//!
//! Agents propose actions as intents. Each intent is planned (OPTR path
//! selection), gated (canon prerequisites, risk/cost bounds,
//! non-interference), and answered with a verdict that is appended to a
//! SHA-256 hash-chained ledger. When an admitted change touches write scopes
//! held by several agents, arbitration picks an owner. Rules are promoted
//! into canon once a quorum of agents approves, and any promotion can be
//! rolled back to an exact snapshot.
//!
//! # The Thin Waist
//!
//! All state access routes through `DbBroker`:
//! - Reads on a fresh WAL connection
//! - Writes in a `BEGIN IMMEDIATE` transaction, all-or-nothing
//! - Audit logging (`broker.events.jsonl`)
//!
//! Keyed in-process locks (`ledger`, `arbitration:<scope>`,
//! `promotion:<rule>`) live on the `Store` handle, so nothing is global.
//!
//! # Subsystems (Plugins)
//!
//! - `interference`: ∀ i ≠ j, ΔE[TTV_j] ≤ 0
//! - `optr`: candidate path enumeration, scoring and selection
//! - `decide`: gates and verdicts
//! - `ledger`: append-only hash chain, verification, JSONL export
//! - `arbitration`: write-scope conflicts and tiered priority
//! - `quorum`: last-write-wins votes and the N-of-M predicate
//! - `promotion`: DRAFT → CANDIDATE → STABLE, snapshots, rollback
//! - `trust`: failure-driven trust scores and the background worker
//! - `pipeline`: the `Governor` facade wiring it all together
//!
//! # Examples
//!
//! ```bash
//! canonry init --write-config
//! canonry scope declare --agent pkg-a --scope src/db
//! canonry decide --intent intent.json --changed src/db
//! canonry vote cast --agent a1 --proposal rule-x --choice approve
//! canonry canon advance --rule rule-x
//! canonry ledger verify --strict
//! ```
//!
//! # Crate Structure
//!
//! - [`core`]: store, broker, schemas, configuration, data model, hashing
//! - [`plugins`]: the governance subsystems

pub mod core;
pub mod plugins;

mod cli;
mod subsystems;

use crate::cli::{Cli, Command, InitCli};
use crate::core::config::{self, GovernanceConfig};
use crate::core::error::CanonryError;
use crate::core::store::Store;
use crate::core::time::command_envelope;
use crate::plugins::{arbitration, decide, ledger, pipeline, promotion, quorum, trust};

use clap::Parser;
use colored::Colorize;
use std::fs;
use tracing_subscriber::EnvFilter;

/// Environment variable holding the log filter, e.g. `CANONRY_LOG=canonry=debug`.
pub const LOG_ENV: &str = "CANONRY_LOG";

/// Install the stderr tracing subscriber. Safe to call more than once.
pub fn init_tracing() {
    let filter = EnvFilter::try_from_env(LOG_ENV).unwrap_or_else(|_| EnvFilter::new("warn"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .try_init();
}

fn run_init(store: &Store, init: InitCli) -> Result<(), CanonryError> {
    let config_path = store.root().join(config::CONFIG_FILE_NAME);
    let mut wrote_config = false;
    if init.write_config && !config_path.exists() {
        let body = toml::to_string(&GovernanceConfig::default())
            .map_err(|e| CanonryError::Config(e.to_string()))?;
        fs::write(&config_path, body)?;
        wrote_config = true;
    }
    eprintln!(
        "{} {}",
        "initialized".green().bold(),
        store.root().display()
    );
    let envelope = command_envelope(
        "init",
        "ok",
        serde_json::json!({
            "root": store.root().display().to_string(),
            "subsystems": subsystems::subsystem_names(),
            "config_written": wrote_config,
        }),
    );
    println!("{}", serde_json::to_string_pretty(&envelope)?);
    Ok(())
}

fn all_schemas() -> serde_json::Value {
    serde_json::json!({
        "version": env!("CARGO_PKG_VERSION"),
        "subsystems": [
            decide::schema(),
            ledger::schema(),
            arbitration::schema(),
            quorum::schema(),
            promotion::schema(),
            trust::schema(),
        ]
    })
}

pub fn run() -> Result<(), CanonryError> {
    init_tracing();
    let cli = Cli::parse();

    if let Command::Schema = cli.command {
        println!("{}", serde_json::to_string_pretty(&all_schemas())?);
        return Ok(());
    }

    let store = Store::open(&cli.root)?;
    tracing::debug!(root = %store.root().display(), "store opened");

    match cli.command {
        Command::Init(init) => run_init(&store, init),
        Command::Decide(args) => pipeline::run_decide(&store, args),
        Command::Ledger(cmd) => ledger::run_ledger_cli(&store, cmd),
        Command::Scope(cmd) => arbitration::run_scope_cli(&store, cmd),
        Command::Arbitrate(args) => arbitration::run_arbitrate(&store, args),
        Command::Vote(cmd) => quorum::run_vote_cli(&store, cmd),
        Command::Canon(cmd) => promotion::run_canon_cli(&store, cmd),
        Command::Trust(cmd) => trust::run_trust_cli(&store, cmd),
        Command::Schema => Ok(()),
    }
}
