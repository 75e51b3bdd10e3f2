use rusqlite;
use std::io;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum CanonryError {
    #[error("SQLite error: {0}")]
    RusqliteError(#[from] rusqlite::Error),
    #[error("I/O error: {0}")]
    IoError(#[from] io::Error),
    #[error("JSON error: {0}")]
    JsonError(#[from] serde_json::Error),
    #[error("Configuration error: {0}")]
    Config(String),
    #[error("Validation error: {0}")]
    ValidationError(String),
    #[error("Not found: {0}")]
    NotFound(String),
    #[error("Corrupt record in {table}: {detail}")]
    Corrupt { table: &'static str, detail: String },
    #[error("Lock poisoned: {0}")]
    LockPoisoned(String),
    #[error("Plan empty: {0}")]
    PlanEmpty(String),
    #[error("No arbitration winner: priority order shares no agent with conflicts {0:?}")]
    NoArbitrationWinner(Vec<String>),
    #[error("Invalid vote: {0}")]
    InvalidVote(String),
    #[error("Ledger tamper detected at index {index}")]
    LedgerTamperDetected { index: u64 },
    #[error("Rollback unavailable: no snapshot recorded for rule '{0}'")]
    RollbackUnavailable(String),
    #[error("Worker stopped: {0}")]
    WorkerStopped(String),
}

impl CanonryError {
    /// Process exit code handed to an external orchestrator. Zero is never returned.
    pub fn exit_code(&self) -> i32 {
        match self {
            CanonryError::ValidationError(_) | CanonryError::InvalidVote(_) => 2,
            CanonryError::PlanEmpty(_) => 3,
            CanonryError::NoArbitrationWinner(_) => 4,
            CanonryError::LedgerTamperDetected { .. } => 5,
            CanonryError::RollbackUnavailable(_) => 6,
            CanonryError::Config(_) => 7,
            CanonryError::NotFound(_) => 8,
            CanonryError::Corrupt { .. } => 9,
            _ => 1,
        }
    }

    /// Fatal kinds that must reach the top-level caller and halt a larger pipeline.
    pub fn halts_pipeline(&self) -> bool {
        matches!(
            self,
            CanonryError::LedgerTamperDetected { .. }
                | CanonryError::RollbackUnavailable(_)
                | CanonryError::Corrupt { .. }
        )
    }
}

pub type CanonryResult<T> = Result<T, CanonryError>;
