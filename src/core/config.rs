//! Governance configuration loaded from `canonry.toml` in the store root.
//!
//! Every section is optional; a missing file yields the defaults.

use crate::core::error::CanonryError;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fs;
use std::path::Path;

pub const CONFIG_FILE_NAME: &str = "canonry.toml";

#[derive(Debug, Clone, Default, Deserialize, Serialize, PartialEq)]
#[serde(default)]
pub struct GovernanceConfig {
    pub quorum: QuorumPolicy,
    pub trust: TrustPolicy,
    pub optr: OptrConfig,
    pub arbitration: ArbitrationConfig,
    pub ledger: LedgerConfig,
}

/// N-of-M approval requirement for `CANDIDATE -> STABLE`.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
#[serde(default)]
pub struct QuorumPolicy {
    pub required: usize,
    pub of: usize,
    /// When non-empty, only approvals from these agents count.
    pub eligible: BTreeSet<String>,
}

impl Default for QuorumPolicy {
    fn default() -> Self {
        Self {
            required: 2,
            of: 3,
            eligible: BTreeSet::new(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
#[serde(default)]
pub struct TrustPolicy {
    pub penalty: f64,
    pub initial: f64,
}

impl Default for TrustPolicy {
    fn default() -> Self {
        Self {
            penalty: 0.1,
            initial: 1.0,
        }
    }
}

/// OPTR objective weights and optional admissibility bounds.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
#[serde(default)]
pub struct OptrConfig {
    pub lambda_cost: f64,
    pub lambda_risk: f64,
    pub lambda_prob: f64,
    pub max_risk: Option<f64>,
    pub max_cost: Option<f64>,
    /// Minimum joint success probability of an admissible path.
    pub min_success_prob: Option<f64>,
    /// Every admissible path must cite at least one STABLE canon rule.
    pub require_canon_refs: bool,
}

impl Default for OptrConfig {
    fn default() -> Self {
        Self {
            lambda_cost: 0.1,
            lambda_risk: 0.2,
            lambda_prob: 0.05,
            max_risk: None,
            max_cost: None,
            min_success_prob: None,
            require_canon_refs: false,
        }
    }
}

/// Static arbitration ranking, highest priority first. Agents sharing a tier
/// are tie-broken by trust score.
#[derive(Debug, Clone, Default, Deserialize, Serialize, PartialEq)]
#[serde(default)]
pub struct ArbitrationConfig {
    pub tiers: Vec<Vec<String>>,
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
#[serde(default)]
pub struct LedgerConfig {
    pub record_votes: bool,
}

impl Default for LedgerConfig {
    fn default() -> Self {
        Self { record_votes: true }
    }
}

impl GovernanceConfig {
    pub fn from_toml_str(content: &str) -> Result<Self, CanonryError> {
        let config: GovernanceConfig =
            toml::from_str(content).map_err(|e| CanonryError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), CanonryError> {
        let q = &self.quorum;
        if q.required == 0 {
            return Err(CanonryError::Config(
                "quorum.required must be at least 1".to_string(),
            ));
        }
        if q.required > q.of {
            return Err(CanonryError::Config(format!(
                "quorum.required ({}) exceeds quorum.of ({})",
                q.required, q.of
            )));
        }
        if !q.eligible.is_empty() && q.eligible.len() != q.of {
            return Err(CanonryError::Config(format!(
                "quorum.eligible lists {} agents but quorum.of is {}",
                q.eligible.len(),
                q.of
            )));
        }
        for (name, value) in [
            ("trust.penalty", self.trust.penalty),
            ("trust.initial", self.trust.initial),
        ] {
            if !(0.0..=1.0).contains(&value) {
                return Err(CanonryError::Config(format!(
                    "{} must be within [0, 1], got {}",
                    name, value
                )));
            }
        }
        if let Some(p) = self.optr.min_success_prob
            && !(0.0..=1.0).contains(&p)
        {
            return Err(CanonryError::Config(format!(
                "optr.min_success_prob must be within [0, 1], got {}",
                p
            )));
        }
        let mut seen = BTreeSet::new();
        for agent in self.arbitration.tiers.iter().flatten() {
            if !seen.insert(agent.as_str()) {
                return Err(CanonryError::Config(format!(
                    "agent '{}' appears in more than one arbitration tier slot",
                    agent
                )));
            }
        }
        Ok(())
    }
}

/// Load `canonry.toml` from the store root. No file means defaults.
pub fn load_config(root: &Path) -> Result<GovernanceConfig, CanonryError> {
    let config_path = root.join(CONFIG_FILE_NAME);
    if !config_path.exists() {
        return Ok(GovernanceConfig::default());
    }
    let content = fs::read_to_string(&config_path).map_err(CanonryError::IoError)?;
    GovernanceConfig::from_toml_str(&content)
}
