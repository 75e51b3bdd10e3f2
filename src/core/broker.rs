use crate::core::db;
use crate::core::error;
use crate::core::schemas;
use crate::core::store::Store;
use rusqlite::{Connection, Transaction, TransactionBehavior};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::{debug, warn};
use ulid::Ulid;

/// The DB Broker is the "Thin Waist" for state access.
///
/// Reads get a fresh connection (WAL allows concurrent readers). Writes run
/// inside a `BEGIN IMMEDIATE` transaction that commits only if the closure
/// succeeds, so a failed operation never leaves partial state behind. Every
/// call is recorded in the audit log.
pub struct DbBroker {
    db_path: PathBuf,
    audit_log_path: PathBuf,
    now_ms: i64,
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct BrokerEvent {
    pub ts: i64,
    pub event_id: String,
    pub actor: String,
    pub intent_ref: Option<String>,
    pub op: String,
    pub db_id: String,
    pub status: String,
}

impl DbBroker {
    pub fn new(store: &Store) -> Self {
        Self {
            db_path: db::governance_db_path(store.root()),
            audit_log_path: store.root().join(schemas::BROKER_EVENTS_NAME),
            now_ms: store.now_ms(),
        }
    }

    pub fn db_path(&self) -> &Path {
        &self.db_path
    }

    /// Execute a read-only closure with a fresh connection.
    pub fn with_conn<F, R>(
        &self,
        actor: &str,
        intent_ref: Option<&str>,
        op_name: &str,
        f: F,
    ) -> Result<R, error::CanonryError>
    where
        F: FnOnce(&Connection) -> Result<R, error::CanonryError>,
    {
        let conn = db::db_connect(&self.db_path.to_string_lossy())?;
        let result = f(&conn);
        self.finish(actor, intent_ref, op_name, result)
    }

    /// Execute a closure inside an immediate write transaction.
    pub fn with_tx<F, R>(
        &self,
        actor: &str,
        intent_ref: Option<&str>,
        op_name: &str,
        f: F,
    ) -> Result<R, error::CanonryError>
    where
        F: FnOnce(&Transaction<'_>) -> Result<R, error::CanonryError>,
    {
        let mut conn = db::db_connect(&self.db_path.to_string_lossy())?;
        let result = conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .map_err(error::CanonryError::RusqliteError)
            .and_then(|tx| {
                let value = f(&tx)?;
                tx.commit()?;
                Ok(value)
            });
        self.finish(actor, intent_ref, op_name, result)
    }

    fn finish<R>(
        &self,
        actor: &str,
        intent_ref: Option<&str>,
        op_name: &str,
        result: Result<R, error::CanonryError>,
    ) -> Result<R, error::CanonryError> {
        let status = match &result {
            Ok(_) => "success",
            Err(e) => {
                warn!(op = op_name, actor, error = %e, "brokered operation failed");
                "error"
            }
        };
        // The operation has already committed or rolled back; its result stands.
        if let Err(e) = self.log_event(actor, intent_ref, op_name, status) {
            warn!(op = op_name, actor, error = %e, "audit log write failed");
        }
        debug!(op = op_name, actor, status, "brokered operation");
        result
    }

    fn log_event(
        &self,
        actor: &str,
        intent_ref: Option<&str>,
        op: &str,
        status: &str,
    ) -> Result<(), error::CanonryError> {
        use std::fs::OpenOptions;
        use std::io::Write;

        let ev = BrokerEvent {
            ts: self.now_ms,
            event_id: Ulid::new().to_string(),
            actor: actor.to_string(),
            intent_ref: intent_ref.map(|s| s.to_string()),
            op: op.to_string(),
            db_id: schemas::GOVERNANCE_DB_NAME.to_string(),
            status: status.to_string(),
        };

        let mut line = serde_json::to_string(&ev)?;
        line.push('\n');
        let mut f = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.audit_log_path)
            .map_err(error::CanonryError::IoError)?;
        // One write per event so concurrent appenders never interleave.
        f.write_all(line.as_bytes())
            .map_err(error::CanonryError::IoError)?;
        Ok(())
    }
}

/// Read the audit log. Lines that fail to parse are reported, not skipped.
pub fn read_audit_log(store: &Store) -> Result<Vec<BrokerEvent>, error::CanonryError> {
    let path = store.root().join(schemas::BROKER_EVENTS_NAME);
    if !path.exists() {
        return Ok(Vec::new());
    }
    let content = std::fs::read_to_string(&path)?;
    content
        .lines()
        .filter(|l| !l.trim().is_empty())
        .enumerate()
        .map(|(i, line)| {
            serde_json::from_str(line).map_err(|e| error::CanonryError::Corrupt {
                table: "broker.events.jsonl",
                detail: format!("line {}: {}", i + 1, e),
            })
        })
        .collect()
}
