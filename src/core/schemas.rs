//! Centralized database schema definitions.
//!
//! All governance state lives in a single SQLite bin, `governance.db`, under
//! the store root. Each subsystem owns its tables below and creates them from
//! its `initialize_*` function (see `subsystems.rs`).

pub const GOVERNANCE_DB_NAME: &str = "governance.db";
pub const BROKER_EVENTS_NAME: &str = "broker.events.jsonl";

/// Genesis `previous_hash` for sequence 0.
pub const GENESIS_HASH: &str = "0000000000000000000000000000000000000000000000000000000000000000";

// --- Ledger ---

pub const LEDGER_DB_SCHEMA_ENTRIES: &str = "
    CREATE TABLE IF NOT EXISTS ledger_entries (
        sequence INTEGER PRIMARY KEY,
        previous_hash TEXT NOT NULL UNIQUE,
        current_hash TEXT NOT NULL,
        ts INTEGER NOT NULL,
        kind TEXT NOT NULL,
        payload TEXT NOT NULL -- canonical JSON, exactly the bytes that were hashed
    )
";
pub const LEDGER_DB_INDEX_KIND: &str =
    "CREATE INDEX IF NOT EXISTS idx_ledger_kind ON ledger_entries(kind)";

// --- Arbitration ---

pub const ARBITRATION_DB_SCHEMA_SCOPES: &str = "
    CREATE TABLE IF NOT EXISTS write_scopes (
        agent_id TEXT NOT NULL,
        scope TEXT NOT NULL,
        declared_at INTEGER NOT NULL,
        PRIMARY KEY(agent_id, scope)
    )
";
pub const ARBITRATION_DB_INDEX_SCOPE: &str =
    "CREATE INDEX IF NOT EXISTS idx_write_scopes_scope ON write_scopes(scope)";

pub const ARBITRATION_DB_SCHEMA_LOCKS: &str = "
    CREATE TABLE IF NOT EXISTS arbitration_locks (
        scope TEXT PRIMARY KEY,
        owner TEXT NOT NULL,
        ts INTEGER NOT NULL
    )
";

// --- Quorum ---

pub const QUORUM_DB_SCHEMA_VOTES: &str = "
    CREATE TABLE IF NOT EXISTS votes (
        proposal_id TEXT NOT NULL,
        agent_id TEXT NOT NULL,
        choice TEXT NOT NULL CHECK(choice IN ('approve', 'reject')),
        ts INTEGER NOT NULL,
        PRIMARY KEY(proposal_id, agent_id)
    )
";

// --- Promotion ---

/// Single-row table holding the whole canon document.
pub const PROMOTION_DB_SCHEMA_CANON: &str = "
    CREATE TABLE IF NOT EXISTS canon_document (
        id INTEGER PRIMARY KEY CHECK(id = 1),
        body TEXT NOT NULL,
        updated_at INTEGER NOT NULL
    )
";
pub const PROMOTION_DB_SEED_CANON: &str =
    "INSERT OR IGNORE INTO canon_document(id, body, updated_at) VALUES(1, '{}', 0)";

pub const PROMOTION_DB_SCHEMA_SNAPSHOTS: &str = "
    CREATE TABLE IF NOT EXISTS canon_snapshots (
        snapshot_id TEXT PRIMARY KEY,
        rule_id TEXT NOT NULL,
        body TEXT NOT NULL,
        ledger_head INTEGER, -- sequence of the last ledger entry at capture, NULL if empty
        created_at INTEGER NOT NULL,
        ordinal INTEGER NOT NULL
    )
";
pub const PROMOTION_DB_INDEX_SNAPSHOTS_RULE: &str =
    "CREATE INDEX IF NOT EXISTS idx_canon_snapshots_rule ON canon_snapshots(rule_id, ordinal)";

// --- Trust ---

pub const TRUST_DB_SCHEMA_SCORES: &str = "
    CREATE TABLE IF NOT EXISTS trust_scores (
        agent_id TEXT PRIMARY KEY,
        score REAL NOT NULL CHECK(score >= 0.0 AND score <= 1.0),
        failures INTEGER NOT NULL DEFAULT 0,
        updated_at INTEGER NOT NULL
    )
";
