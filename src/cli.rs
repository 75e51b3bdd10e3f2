//! CLI struct definitions for the canonry command-line interface.
//!
//! Subsystem argument types live next to their subsystem; this file only
//! groups them. Dispatch lives in `lib.rs`.

use crate::plugins::{arbitration, ledger, pipeline, promotion, quorum, trust};

use clap::{Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[clap(
    name = "canonry",
    version = env!("CARGO_PKG_VERSION"),
    about = "Execution governance: gate agent actions, ledger every verdict, promote canon by quorum."
)]
pub(crate) struct Cli {
    /// Store root holding governance.db and canonry.toml
    #[clap(long, global = true, env = "CANONRY_ROOT", default_value = ".canonry")]
    pub root: PathBuf,

    #[clap(subcommand)]
    pub command: Command,
}

#[derive(clap::Args, Debug)]
pub(crate) struct InitCli {
    /// Also write a canonry.toml with the default settings if none exists.
    #[clap(long)]
    pub write_config: bool,
}

#[derive(Subcommand, Debug)]
pub(crate) enum Command {
    /// Create the store and its tables
    Init(InitCli),

    /// Decide an intent and arbitrate the scopes it changes
    Decide(pipeline::DecideArgs),

    /// Inspect, verify and export the ledger
    Ledger(ledger::LedgerCli),

    /// Declare agent write scopes
    Scope(arbitration::ScopeCli),

    /// Resolve a contested scope
    Arbitrate(arbitration::ArbitrateArgs),

    /// Cast and inspect votes
    Vote(quorum::VoteCli),

    /// Canon promotion and rollback
    Canon(promotion::CanonCli),

    /// Agent trust scores
    Trust(trust::TrustCli),

    /// Print every subsystem's schema
    Schema,
}
