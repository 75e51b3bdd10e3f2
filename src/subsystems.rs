//! Subsystem registration. Centralizes all table initialization functions.
//!
//! Adding a new subsystem: append one entry to `SUBSYSTEMS`.

use crate::core::error;
use crate::core::store::Store;
use crate::plugins::{arbitration, ledger, promotion, quorum, trust};

pub(crate) struct SubsystemInit {
    pub name: &'static str,
    pub initialize_db: fn(&Store) -> Result<(), error::CanonryError>,
}

/// All subsystems that own tables in `governance.db`.
/// Sequential execution avoids SQLite contention during first start.
pub(crate) const SUBSYSTEMS: &[SubsystemInit] = &[
    SubsystemInit { name: "ledger", initialize_db: ledger::initialize_ledger_db },
    SubsystemInit { name: "arbitration", initialize_db: arbitration::initialize_arbitration_db },
    SubsystemInit { name: "quorum", initialize_db: quorum::initialize_quorum_db },
    SubsystemInit { name: "promotion", initialize_db: promotion::initialize_promotion_db },
    SubsystemInit { name: "trust", initialize_db: trust::initialize_trust_db },
];

/// Initialize all subsystem tables sequentially.
pub(crate) fn initialize_all_dbs(store: &Store) -> Result<(), error::CanonryError> {
    for sub in SUBSYSTEMS {
        tracing::debug!(subsystem = sub.name, "initializing tables");
        (sub.initialize_db)(store)?;
    }
    Ok(())
}

/// Names of the registered subsystems, in initialization order.
pub fn subsystem_names() -> Vec<&'static str> {
    SUBSYSTEMS.iter().map(|s| s.name).collect()
}
