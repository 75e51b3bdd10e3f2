//! Data shapes flowing through the governance pipeline.
//!
//! Wire records use camelCase field names; these are the exact shapes written
//! to the ledger and to JSONL exports.

use crate::core::error::CanonryError;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

// --- Intent / Action ---

/// A caller's proposal. Immutable once submitted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Intent {
    pub id: String,
    pub action: Action,
    pub timestamp: i64,
    /// Acting agent id.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub authority: Option<String>,
    #[serde(default)]
    pub metadata: Map<String, Value>,
}

impl Intent {
    pub fn new(id: impl Into<String>, action: Action, timestamp: i64) -> Self {
        Self {
            id: id.into(),
            action,
            timestamp,
            authority: None,
            metadata: Map::new(),
        }
    }

    pub fn with_authority(mut self, agent_id: impl Into<String>) -> Self {
        self.authority = Some(agent_id.into());
        self
    }

    pub fn with_metadata(mut self, key: &str, value: Value) -> Self {
        self.metadata.insert(key.to_string(), value);
        self
    }

    pub fn validate(&self) -> Result<(), CanonryError> {
        if self.id.trim().is_empty() {
            return Err(CanonryError::ValidationError(
                "intent id is required".to_string(),
            ));
        }
        if matches!(&self.authority, Some(a) if a.trim().is_empty()) {
            return Err(CanonryError::ValidationError(format!(
                "intent '{}' names an empty authority",
                self.id
            )));
        }
        self.action.validate()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Action {
    pub id: String,
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub payload: Value,
}

impl Action {
    pub fn new(id: impl Into<String>, kind: impl Into<String>, payload: Value) -> Self {
        Self {
            id: id.into(),
            kind: kind.into(),
            payload,
        }
    }

    pub fn validate(&self) -> Result<(), CanonryError> {
        if self.id.trim().is_empty() {
            return Err(CanonryError::ValidationError(
                "action id is required".to_string(),
            ));
        }
        if self.kind.trim().is_empty() {
            return Err(CanonryError::ValidationError(format!(
                "action '{}' has no type",
                self.id
            )));
        }
        self.features().map(|_| ())
    }

    /// Typed view of the governance-relevant payload fields.
    pub fn features(&self) -> Result<ActionFeatures, CanonryError> {
        if self.payload.is_null() {
            return Ok(ActionFeatures::default());
        }
        serde_json::from_value(self.payload.clone()).map_err(|e| {
            CanonryError::ValidationError(format!("action '{}' payload: {}", self.id, e))
        })
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct ActionFeatures {
    pub ttv: f64,
    pub cost: f64,
    pub risk: f64,
    pub success_prob: f64,
    /// Declared ΔE[TTV] this action imposes on other agents.
    pub ttv_delta: BTreeMap<String, f64>,
    pub resources_used: Vec<String>,
    pub shared_state_modified: Vec<String>,
    /// Canon rules that must be STABLE before this action is admissible.
    pub requires_canon: Vec<String>,
    /// Canon rules the action cites as its authority.
    pub canon_refs: Vec<String>,
}

impl Default for ActionFeatures {
    fn default() -> Self {
        Self {
            ttv: 0.0,
            cost: 0.0,
            risk: 0.0,
            success_prob: 1.0,
            ttv_delta: BTreeMap::new(),
            resources_used: Vec::new(),
            shared_state_modified: Vec::new(),
            requires_canon: Vec::new(),
            canon_refs: Vec::new(),
        }
    }
}

/// One candidate plan. Produced per evaluation, never persisted.
#[derive(Debug, Clone, PartialEq)]
pub struct ExecutionPath {
    pub id: String,
    pub actions: Vec<Action>,
    pub score: f64,
}

// --- Decisions ---

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Outcome {
    Allow,
    Deny,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ReasonCode {
    NonInterferenceViolation,
    MissingCanonPrereqs,
    RiskBoundExceeded,
    CostBoundExceeded,
    AuthorityBoundaryFail,
    SuccessProbTooLow,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Decision {
    pub id: String,
    pub intent_id: String,
    pub action_id: String,
    pub timestamp: i64,
    pub outcome: Outcome,
    /// Score of the selected path.
    pub score: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Denial {
    pub id: String,
    pub intent_id: String,
    pub action_id: String,
    /// Human-readable explanation.
    pub reason: String,
    pub reason_codes: Vec<ReasonCode>,
    #[serde(default)]
    pub violations: Vec<Violation>,
    pub timestamp: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Violation {
    pub agent_id: String,
    pub delta: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NonInterferenceResult {
    pub ok: bool,
    pub violations: Vec<Violation>,
}

// --- Arbitration / votes ---

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ArbitrationLock {
    pub scope: String,
    pub owner: String,
    pub timestamp: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VoteChoice {
    Approve,
    Reject,
}

impl VoteChoice {
    pub fn as_str(&self) -> &'static str {
        match self {
            VoteChoice::Approve => "approve",
            VoteChoice::Reject => "reject",
        }
    }
}

impl FromStr for VoteChoice {
    type Err = CanonryError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "approve" => Ok(VoteChoice::Approve),
            "reject" => Ok(VoteChoice::Reject),
            other => Err(CanonryError::InvalidVote(format!(
                "choice must be 'approve' or 'reject', got '{}'",
                other
            ))),
        }
    }
}

impl fmt::Display for VoteChoice {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Vote {
    pub agent_id: String,
    pub proposal_id: String,
    pub choice: VoteChoice,
    pub timestamp: i64,
}

// --- Canon ---

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CanonStage {
    Draft,
    Candidate,
    Stable,
    RolledBack,
}

impl CanonStage {
    pub fn as_str(&self) -> &'static str {
        match self {
            CanonStage::Draft => "DRAFT",
            CanonStage::Candidate => "CANDIDATE",
            CanonStage::Stable => "STABLE",
            CanonStage::RolledBack => "ROLLED_BACK",
        }
    }
}

impl FromStr for CanonStage {
    type Err = CanonryError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "DRAFT" => Ok(CanonStage::Draft),
            "CANDIDATE" => Ok(CanonStage::Candidate),
            "STABLE" => Ok(CanonStage::Stable),
            "ROLLED_BACK" => Ok(CanonStage::RolledBack),
            other => Err(CanonryError::ValidationError(format!(
                "unknown canon state '{}'",
                other
            ))),
        }
    }
}

impl fmt::Display for CanonStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CanonState {
    pub rule_id: String,
    pub state: CanonStage,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub snapshot_ref: Option<String>,
}

// --- Trust ---

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TrustScore {
    pub agent_id: String,
    pub score: f64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Failure {
    pub agent_id: String,
    #[serde(default)]
    pub reason: String,
}

impl Failure {
    pub fn new(agent_id: impl Into<String>, reason: impl Into<String>) -> Self {
        Self {
            agent_id: agent_id.into(),
            reason: reason.into(),
        }
    }

    pub fn validate(&self) -> Result<(), CanonryError> {
        if self.agent_id.trim().is_empty() {
            return Err(CanonryError::ValidationError(format!(
                "failure without agent id (reason '{}')",
                self.reason
            )));
        }
        Ok(())
    }
}

// --- Ledger payloads ---

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PromotionRecord {
    pub rule_id: String,
    /// `None` when the rule was just proposed.
    pub from: Option<CanonStage>,
    pub to: CanonStage,
    pub timestamp: i64,
    /// Evidence presented for a CANDIDATE → STABLE step.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tests: Option<PromotionTests>,
}

/// Evidence gate for CANDIDATE → STABLE. Every flag must hold.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct PromotionTests {
    /// The rule could have failed and did not.
    pub resistance: bool,
    /// Results held across repeated trials.
    pub reproducible: bool,
    /// No invariant was violated.
    pub invariant_safe: bool,
    /// Promotion changes the admissible set.
    pub feasibility_impact: bool,
    pub evidence_refs: Vec<String>,
}

impl PromotionTests {
    pub fn all_passed(&self) -> bool {
        self.failed().is_empty()
    }

    /// Names of the failing tests, in declaration order.
    pub fn failed(&self) -> Vec<&'static str> {
        [
            ("resistance", self.resistance),
            ("reproducible", self.reproducible),
            ("invariantSafe", self.invariant_safe),
            ("feasibilityImpact", self.feasibility_impact),
        ]
        .into_iter()
        .filter(|(_, ok)| !ok)
        .map(|(name, _)| name)
        .collect()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RollbackRecord {
    pub rule_id: String,
    pub snapshot_id: String,
    pub ledger_head: Option<u64>,
    pub timestamp: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TrustRecord {
    pub agent_id: String,
    pub score: f64,
    pub reason: String,
    pub timestamp: i64,
}

/// Everything the ledger can hold, tagged by `kind`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "record", rename_all = "lowercase")]
pub enum LedgerPayload {
    Decision(Decision),
    Denial(Denial),
    Vote(Vote),
    Arbitration(ArbitrationLock),
    Promotion(PromotionRecord),
    Rollback(RollbackRecord),
    Trust(TrustRecord),
}

impl LedgerPayload {
    pub fn kind(&self) -> &'static str {
        match self {
            LedgerPayload::Decision(_) => "decision",
            LedgerPayload::Denial(_) => "denial",
            LedgerPayload::Vote(_) => "vote",
            LedgerPayload::Arbitration(_) => "arbitration",
            LedgerPayload::Promotion(_) => "promotion",
            LedgerPayload::Rollback(_) => "rollback",
            LedgerPayload::Trust(_) => "trust",
        }
    }
}
