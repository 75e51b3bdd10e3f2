//! Append-only, hash-chained decision ledger.
//!
//! Every entry stores the exact canonical payload text it was hashed over,
//! so verification never depends on re-serializing a parsed record.
//! `current_hash = SHA256(previous_hash ‖ payload_text)`, starting from the
//! all-zero genesis hash at sequence 0.

use crate::core::broker::DbBroker;
use crate::core::canonical;
use crate::core::error::CanonryError;
use crate::core::locks::LEDGER_KEY;
use crate::core::model::LedgerPayload;
use crate::core::schemas;
use crate::core::store::Store;
use crate::core::time::command_envelope;
use clap::{Parser, Subcommand};
use colored::Colorize;
use rayon::prelude::*;
use rusqlite::{Connection, OptionalExtension, params};
use serde::{Deserialize, Serialize};
use std::fs::{self, File};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use tracing::{info, warn};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LedgerEntry {
    pub sequence: u64,
    pub previous_hash: String,
    pub current_hash: String,
    pub timestamp: i64,
    pub payload: LedgerPayload,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LedgerVerification {
    pub valid: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub first_bad_index: Option<u64>,
    pub length: u64,
}

/// A row as stored, before the payload is parsed.
struct StoredEntry {
    sequence: i64,
    previous_hash: String,
    current_hash: String,
    ts: i64,
    payload: String,
}

pub fn initialize_ledger_db(store: &Store) -> Result<(), CanonryError> {
    let broker = DbBroker::new(store);
    broker.with_conn("canonry", None, "ledger.init", |conn| {
        conn.execute_batch(schemas::LEDGER_DB_SCHEMA_ENTRIES)?;
        conn.execute_batch(schemas::LEDGER_DB_INDEX_KIND)?;
        Ok(())
    })
}

fn to_sequence(raw: i64) -> Result<u64, CanonryError> {
    u64::try_from(raw).map_err(|_| CanonryError::Corrupt {
        table: "ledger_entries",
        detail: format!("negative sequence {}", raw),
    })
}

fn to_sql_sequence(seq: u64) -> Result<i64, CanonryError> {
    i64::try_from(seq)
        .map_err(|_| CanonryError::ValidationError(format!("sequence {} out of range", seq)))
}

/// Append one entry using an open connection or transaction.
///
/// Callers must hold the `ledger` key and be inside a write transaction; the
/// broker-level helpers below and the subsystems that ledger their own
/// records take care of both.
pub(crate) fn append_in(
    conn: &Connection,
    payload: &LedgerPayload,
    ts: i64,
) -> Result<LedgerEntry, CanonryError> {
    let tail: Option<(i64, String)> = conn
        .query_row(
            "SELECT sequence, current_hash FROM ledger_entries ORDER BY sequence DESC LIMIT 1",
            [],
            |row| Ok((row.get(0)?, row.get(1)?)),
        )
        .optional()?;

    let (sequence, previous_hash) = match tail {
        Some((seq, hash)) => (to_sequence(seq)? + 1, hash),
        None => (0, schemas::GENESIS_HASH.to_string()),
    };

    let text = canonical::canonicalize(payload)?;
    // Non-finite floats render as `null`; such an entry could never be read back.
    let decoded: LedgerPayload = serde_json::from_str(&text).map_err(|e| {
        CanonryError::ValidationError(format!(
            "{} record is not ledgerable: {}",
            payload.kind(),
            e
        ))
    })?;
    if decoded != *payload {
        return Err(CanonryError::ValidationError(format!(
            "{} record does not survive canonical encoding",
            payload.kind()
        )));
    }
    let current_hash = canonical::chain_hash(&previous_hash, &text);

    conn.execute(
        "INSERT INTO ledger_entries(sequence, previous_hash, current_hash, ts, kind, payload)
         VALUES(?1, ?2, ?3, ?4, ?5, ?6)",
        params![
            to_sql_sequence(sequence)?,
            previous_hash,
            current_hash,
            ts,
            payload.kind(),
            text
        ],
    )?;

    Ok(LedgerEntry {
        sequence,
        previous_hash,
        current_hash,
        timestamp: ts,
        payload: payload.clone(),
    })
}

pub(crate) fn head_sequence_in(conn: &Connection) -> Result<Option<u64>, CanonryError> {
    let seq: Option<i64> = conn
        .query_row("SELECT MAX(sequence) FROM ledger_entries", [], |row| {
            row.get(0)
        })?;
    seq.map(to_sequence).transpose()
}

/// Append a payload as the next entry in the chain.
pub fn append(store: &Store, payload: &LedgerPayload) -> Result<LedgerEntry, CanonryError> {
    let broker = DbBroker::new(store);
    let ts = store.now_ms();
    let entry = store.locks().with_lock(LEDGER_KEY, || {
        broker.with_tx("canonry", None, "ledger.append", |tx| {
            append_in(tx, payload, ts)
        })
    })?;
    info!(
        sequence = entry.sequence,
        kind = entry.payload.kind(),
        "ledger entry appended"
    );
    Ok(entry)
}

fn load_stored(conn: &Connection, until: Option<i64>) -> Result<Vec<StoredEntry>, CanonryError> {
    let mut stmt = conn.prepare(
        "SELECT sequence, previous_hash, current_hash, ts, payload FROM ledger_entries
         WHERE ?1 IS NULL OR sequence <= ?1
         ORDER BY sequence ASC",
    )?;
    let rows = stmt.query_map(params![until], |row| {
        Ok(StoredEntry {
            sequence: row.get(0)?,
            previous_hash: row.get(1)?,
            current_hash: row.get(2)?,
            ts: row.get(3)?,
            payload: row.get(4)?,
        })
    })?;
    let mut out = Vec::new();
    for r in rows {
        out.push(r?);
    }
    Ok(out)
}

fn parse_stored(stored: StoredEntry) -> Result<LedgerEntry, CanonryError> {
    let payload = serde_json::from_str(&stored.payload).map_err(|e| CanonryError::Corrupt {
        table: "ledger_entries",
        detail: format!("sequence {}: {}", stored.sequence, e),
    })?;
    Ok(LedgerEntry {
        sequence: to_sequence(stored.sequence)?,
        previous_hash: stored.previous_hash,
        current_hash: stored.current_hash,
        timestamp: stored.ts,
        payload,
    })
}

/// All entries in sequence order.
pub fn list(store: &Store) -> Result<Vec<LedgerEntry>, CanonryError> {
    let broker = DbBroker::new(store);
    broker.with_conn("canonry", None, "ledger.list", |conn| {
        load_stored(conn, None)?
            .into_iter()
            .map(parse_stored)
            .collect()
    })
}

pub(crate) fn view_in(conn: &Connection, until: u64) -> Result<Vec<LedgerEntry>, CanonryError> {
    load_stored(conn, Some(to_sql_sequence(until)?))?
        .into_iter()
        .map(parse_stored)
        .collect()
}

/// The prefix of the ledger up to and including `until`.
pub fn view(store: &Store, until: u64) -> Result<Vec<LedgerEntry>, CanonryError> {
    let broker = DbBroker::new(store);
    broker.with_conn("canonry", None, "ledger.view", |conn| view_in(conn, until))
}

pub fn head(store: &Store) -> Result<Option<LedgerEntry>, CanonryError> {
    let broker = DbBroker::new(store);
    broker.with_conn("canonry", None, "ledger.head", |conn| {
        let stored = conn
            .query_row(
                "SELECT sequence, previous_hash, current_hash, ts, payload FROM ledger_entries
                 ORDER BY sequence DESC LIMIT 1",
                [],
                |row| {
                    Ok(StoredEntry {
                        sequence: row.get(0)?,
                        previous_hash: row.get(1)?,
                        current_hash: row.get(2)?,
                        ts: row.get(3)?,
                        payload: row.get(4)?,
                    })
                },
            )
            .optional()?;
        stored.map(parse_stored).transpose()
    })
}

/// Check a chain of `(sequence, previous_hash, current_hash, payload_text)`.
///
/// Hashes are recomputed in parallel; each one depends only on the stored
/// predecessor hash and payload. The linkage scan is sequential.
fn verify_chain(rows: &[(u64, &str, &str, &str)]) -> LedgerVerification {
    let recomputed: Vec<String> = rows
        .par_iter()
        .map(|(_, prev, _, text)| canonical::chain_hash(prev, text))
        .collect();

    let mut running = schemas::GENESIS_HASH;
    for (i, ((seq, prev, cur, _), expected)) in rows.iter().zip(&recomputed).enumerate() {
        let index = i as u64;
        if *seq != index || *prev != running || expected != cur {
            return LedgerVerification {
                valid: false,
                first_bad_index: Some(index),
                length: rows.len() as u64,
            };
        }
        running = cur;
    }
    LedgerVerification {
        valid: true,
        first_bad_index: None,
        length: rows.len() as u64,
    }
}

/// Recompute the whole chain from genesis over the stored payload text.
/// Reports the first bad index; never repairs.
pub fn verify(store: &Store) -> Result<LedgerVerification, CanonryError> {
    let broker = DbBroker::new(store);
    let stored = broker.with_conn("canonry", None, "ledger.verify", |conn| {
        load_stored(conn, None)
    })?;

    // A negative sequence can never equal its index.
    let rows: Vec<(u64, &str, &str, &str)> = stored
        .iter()
        .map(|s| {
            (
                u64::try_from(s.sequence).unwrap_or(u64::MAX),
                s.previous_hash.as_str(),
                s.current_hash.as_str(),
                s.payload.as_str(),
            )
        })
        .collect();
    let result = verify_chain(&rows);
    if let Some(index) = result.first_bad_index {
        warn!(index, "ledger chain verification failed");
    }
    Ok(result)
}

/// Like `verify`, but an invalid chain is an error.
pub fn verify_strict(store: &Store) -> Result<LedgerVerification, CanonryError> {
    let result = verify(store)?;
    match result.first_bad_index {
        Some(index) => Err(CanonryError::LedgerTamperDetected { index }),
        None => Ok(result),
    }
}

/// Verify an exported chain without a database.
pub fn verify_entries(entries: &[LedgerEntry]) -> Result<LedgerVerification, CanonryError> {
    let texts: Vec<String> = entries
        .iter()
        .map(|e| canonical::canonicalize(&e.payload))
        .collect::<Result<_, _>>()?;
    let rows: Vec<(u64, &str, &str, &str)> = entries
        .iter()
        .zip(&texts)
        .map(|(e, text)| {
            (
                e.sequence,
                e.previous_hash.as_str(),
                e.current_hash.as_str(),
                text.as_str(),
            )
        })
        .collect();
    Ok(verify_chain(&rows))
}

/// Write every entry as one JSON line. Returns the number of entries written.
pub fn export_jsonl(store: &Store, path: &Path) -> Result<usize, CanonryError> {
    let entries = list(store)?;
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent)?;
    }
    let mut out = BufWriter::new(File::create(path)?);
    for entry in &entries {
        writeln!(out, "{}", serde_json::to_string(entry)?)?;
    }
    out.flush()?;
    info!(count = entries.len(), path = %path.display(), "ledger exported");
    Ok(entries.len())
}

/// Read a JSONL export back into entries.
pub fn read_jsonl(path: &Path) -> Result<Vec<LedgerEntry>, CanonryError> {
    let content = fs::read_to_string(path)?;
    content
        .lines()
        .filter(|l| !l.trim().is_empty())
        .enumerate()
        .map(|(i, line)| {
            serde_json::from_str(line).map_err(|e| CanonryError::Corrupt {
                table: "ledger export",
                detail: format!("line {}: {}", i + 1, e),
            })
        })
        .collect()
}

// --- CLI ---

#[derive(Parser, Debug)]
#[clap(name = "ledger", about = "Inspect and verify the decision ledger")]
pub struct LedgerCli {
    #[clap(subcommand)]
    pub command: LedgerCommand,
}

#[derive(Subcommand, Debug)]
pub enum LedgerCommand {
    /// List entries in sequence order
    List {
        /// Only entries of this kind (decision, denial, vote, ...)
        #[clap(long)]
        kind: Option<String>,
    },
    /// Recompute the hash chain
    Verify {
        /// Verify a JSONL export instead of the store
        #[clap(long)]
        file: Option<PathBuf>,
        /// Exit non-zero on a broken chain
        #[clap(long)]
        strict: bool,
    },
    /// Export the ledger as JSON Lines
    Export {
        #[clap(long)]
        out: PathBuf,
    },
}

pub fn schema() -> serde_json::Value {
    serde_json::json!({
        "name": "ledger",
        "version": "0.1.0",
        "description": "Append-only SHA-256 hash-chained record of every governance outcome",
        "commands": [
            { "name": "list", "description": "List entries", "parameters": ["kind"] },
            { "name": "verify", "description": "Recompute the chain from genesis", "parameters": ["file", "strict"] },
            { "name": "export", "description": "Write entries as JSON Lines", "parameters": ["out"] }
        ],
        "storage": ["governance.db:ledger_entries"]
    })
}

pub fn run_ledger_cli(store: &Store, cli: LedgerCli) -> Result<(), CanonryError> {
    match cli.command {
        LedgerCommand::List { kind } => {
            let entries: Vec<LedgerEntry> = list(store)?
                .into_iter()
                .filter(|e| kind.as_deref().is_none_or(|k| e.payload.kind() == k))
                .collect();
            let envelope = command_envelope(
                "ledger.list",
                "ok",
                serde_json::json!({ "entries": entries }),
            );
            println!("{}", serde_json::to_string_pretty(&envelope)?);
        }
        LedgerCommand::Verify { file, strict } => {
            let result = match &file {
                Some(path) => verify_entries(&read_jsonl(path)?)?,
                None => verify(store)?,
            };
            if result.valid {
                eprintln!("{} {} entries", "chain ok:".green().bold(), result.length);
            } else {
                eprintln!(
                    "{} first bad index {}",
                    "chain broken:".red().bold(),
                    result.first_bad_index.unwrap_or_default()
                );
            }
            let status = if result.valid { "ok" } else { "invalid" };
            let envelope = command_envelope(
                "ledger.verify",
                status,
                serde_json::json!({ "verification": result }),
            );
            println!("{}", serde_json::to_string_pretty(&envelope)?);
            if let (true, Some(index)) = (strict, result.first_bad_index) {
                return Err(CanonryError::LedgerTamperDetected { index });
            }
        }
        LedgerCommand::Export { out } => {
            let count = export_jsonl(store, &out)?;
            let envelope = command_envelope(
                "ledger.export",
                "ok",
                serde_json::json!({ "count": count, "path": out.display().to_string() }),
            );
            println!("{}", serde_json::to_string_pretty(&envelope)?);
        }
    }
    Ok(())
}
