//! Store handle for governance state.
//!
//! A `Store` is the explicit handle every component receives. It owns the
//! state root (where `governance.db`, the broker audit log and `canonry.toml`
//! live), the loaded configuration, the clock, and the keyed lock table that
//! serializes ledger appends, arbitration rounds and promotions.
//!
//! Cloning a `Store` shares the clock and locks, so clones handed to worker
//! threads still serialize against each other.

use crate::core::config::{self, GovernanceConfig};
use crate::core::error::CanonryError;
use crate::core::locks::LockTable;
use crate::core::time::{Clock, SystemClock};
use crate::subsystems;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

#[derive(Debug, Clone)]
pub struct Store {
    /// Absolute path to the store root directory
    pub root: PathBuf,
    config: Arc<GovernanceConfig>,
    clock: Arc<dyn Clock>,
    locks: Arc<LockTable>,
}

impl Store {
    /// Open (creating if needed) the store at `root` with the system clock and
    /// the configuration found in `root/canonry.toml`.
    pub fn open(root: impl Into<PathBuf>) -> Result<Self, CanonryError> {
        let root = root.into();
        fs::create_dir_all(&root).map_err(CanonryError::IoError)?;
        let config = config::load_config(&root)?;
        Self::open_with(root, config, Arc::new(SystemClock))
    }

    /// Open with an explicit configuration and clock.
    pub fn open_with(
        root: impl Into<PathBuf>,
        config: GovernanceConfig,
        clock: Arc<dyn Clock>,
    ) -> Result<Self, CanonryError> {
        let root = root.into();
        config.validate()?;
        fs::create_dir_all(&root).map_err(CanonryError::IoError)?;
        let store = Self {
            root,
            config: Arc::new(config),
            clock,
            locks: Arc::new(LockTable::new()),
        };
        subsystems::initialize_all_dbs(&store)?;
        Ok(store)
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn config(&self) -> &GovernanceConfig {
        &self.config
    }

    pub fn now_ms(&self) -> i64 {
        self.clock.now_ms()
    }

    pub fn locks(&self) -> &LockTable {
        &self.locks
    }
}
