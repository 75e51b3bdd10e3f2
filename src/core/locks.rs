//! Keyed in-process mutual exclusion.
//!
//! Each key (`ledger`, `arbitration:<scope>`, `promotion:<rule>`) gets its own
//! mutex, created on first use and kept for the life of the table. Work on
//! distinct keys never contends; work on the same key is serialized.
//!
//! The table is owned by a `Store` handle, so two stores opened on different
//! roots never share locks. Cross-process exclusion is left to SQLite's
//! `BEGIN IMMEDIATE` in the broker.

use crate::core::error::CanonryError;
use rustc_hash::FxHashMap;
use std::sync::{Arc, Mutex};

pub const LEDGER_KEY: &str = "ledger";

pub fn arbitration_key(scope: &str) -> String {
    format!("arbitration:{}", scope)
}

pub fn promotion_key(rule_id: &str) -> String {
    format!("promotion:{}", rule_id)
}

#[derive(Debug, Default)]
pub struct LockTable {
    entries: Mutex<FxHashMap<String, Arc<Mutex<()>>>>,
}

impl LockTable {
    pub fn new() -> Self {
        Self::default()
    }

    fn entry(&self, key: &str) -> Result<Arc<Mutex<()>>, CanonryError> {
        let mut entries = self
            .entries
            .lock()
            .map_err(|_| CanonryError::LockPoisoned("lock table".to_string()))?;
        Ok(entries
            .entry(key.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone())
    }

    /// Run `f` while holding the mutex for `key`. Blocks until the key is free.
    pub fn with_lock<F, R>(&self, key: &str, f: F) -> Result<R, CanonryError>
    where
        F: FnOnce() -> Result<R, CanonryError>,
    {
        let entry = self.entry(key)?;
        let _guard = entry
            .lock()
            .map_err(|_| CanonryError::LockPoisoned(key.to_string()))?;
        f()
    }

    /// Run `f` while holding every key in `keys`. Keys are taken in sorted
    /// order with duplicates collapsed, so overlapping sets cannot deadlock.
    pub fn with_locks<F, R>(&self, keys: &[String], f: F) -> Result<R, CanonryError>
    where
        F: FnOnce() -> Result<R, CanonryError>,
    {
        let mut sorted: Vec<&str> = keys.iter().map(String::as_str).collect();
        sorted.sort_unstable();
        sorted.dedup();
        let entries = sorted
            .iter()
            .map(|key| self.entry(key))
            .collect::<Result<Vec<_>, _>>()?;
        let mut guards = Vec::with_capacity(entries.len());
        for (key, entry) in sorted.iter().zip(&entries) {
            guards.push(
                entry
                    .lock()
                    .map_err(|_| CanonryError::LockPoisoned(key.to_string()))?,
            );
        }
        let result = f();
        drop(guards);
        result
    }

    /// True if some caller currently holds `key`.
    pub fn is_held(&self, key: &str) -> Result<bool, CanonryError> {
        let entry = self.entry(key)?;
        Ok(entry.try_lock().is_err())
    }
}
