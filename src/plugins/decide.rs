//! Decision engine: turns an intent into exactly one ledgered verdict.
//!
//! Every candidate path is scored and run through the path gates (canon
//! prerequisites, authority citations, risk and cost bounds, joint success
//! probability). A path failing any gate is inadmissible; the cheapest
//! admissible path is selected and checked for non-interference. When no
//! candidate is admissible the denial lists every candidate's failures plus
//! the non-interference check of the cheapest one. Either way one ledger
//! entry is appended.

use crate::core::config::OptrConfig;
use crate::core::error::CanonryError;
use crate::core::model::{
    ActionFeatures, Decision, Denial, ExecutionPath, Intent, LedgerPayload, Outcome, ReasonCode,
    Violation,
};
use crate::core::store::Store;
use crate::core::time::prefixed_id;
use crate::plugins::interference::{self, DeclaredEffects, EffectProjector};
use crate::plugins::ledger::{self, LedgerEntry};
use crate::plugins::optr::{
    self, IntentPathEnumerator, PathEnumerator, PathScorer, WeightedScorer,
};
use crate::plugins::promotion::{self, CanonDocument};
use serde::Serialize;
use std::collections::BTreeMap;
use tracing::{debug, info};

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "verdict", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Verdict {
    Allow { decision: Decision, entry: LedgerEntry },
    Deny { denial: Denial, entry: LedgerEntry },
}

impl Verdict {
    pub fn is_allowed(&self) -> bool {
        matches!(self, Verdict::Allow { .. })
    }

    pub fn entry(&self) -> &LedgerEntry {
        match self {
            Verdict::Allow { entry, .. } | Verdict::Deny { entry, .. } => entry,
        }
    }

    pub fn intent_id(&self) -> &str {
        match self {
            Verdict::Allow { decision, .. } => &decision.intent_id,
            Verdict::Deny { denial, .. } => &denial.intent_id,
        }
    }
}

/// One failed gate.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GateFailure {
    pub code: ReasonCode,
    pub message: String,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub violations: Vec<Violation>,
}

impl GateFailure {
    fn new(code: ReasonCode, message: String) -> Self {
        Self {
            code,
            message,
            violations: Vec::new(),
        }
    }
}

/// Union of a per-action list field over a path, first occurrence order.
fn collect_ids(
    path: &ExecutionPath,
    field: fn(ActionFeatures) -> Vec<String>,
) -> Result<Vec<String>, CanonryError> {
    let mut out: Vec<String> = Vec::new();
    for action in &path.actions {
        for id in field(action.features()?) {
            if !out.contains(&id) {
                out.push(id);
            }
        }
    }
    Ok(out)
}

/// Gates that decide whether a candidate path is admissible at all.
fn path_gates(
    path: &ExecutionPath,
    canon: &CanonDocument,
    bounds: &OptrConfig,
) -> Result<Vec<GateFailure>, CanonryError> {
    let mut failures = Vec::new();

    let required = collect_ids(path, |f| f.requires_canon)?;
    let missing = promotion::missing_stable(canon, &required);
    if !missing.is_empty() {
        failures.push(GateFailure::new(
            ReasonCode::MissingCanonPrereqs,
            format!("missing prerequisite canon: {}", missing.join(", ")),
        ));
    }

    let cited = collect_ids(path, |f| f.canon_refs)?;
    if cited.is_empty() && bounds.require_canon_refs {
        failures.push(GateFailure::new(
            ReasonCode::AuthorityBoundaryFail,
            "cites zero canon refs".to_string(),
        ));
    } else {
        let not_stable = promotion::missing_stable(canon, &cited);
        if !not_stable.is_empty() {
            failures.push(GateFailure::new(
                ReasonCode::AuthorityBoundaryFail,
                format!("cited canon is not STABLE: {}", not_stable.join(", ")),
            ));
        }
    }

    let (risk, cost) = optr::path_totals(path)?;
    if let Some(max_risk) = bounds.max_risk.filter(|max| risk > *max) {
        failures.push(GateFailure::new(
            ReasonCode::RiskBoundExceeded,
            format!("risk {:.2} exceeds bound {:.2}", risk, max_risk),
        ));
    }
    if let Some(max_cost) = bounds.max_cost.filter(|max| cost > *max) {
        failures.push(GateFailure::new(
            ReasonCode::CostBoundExceeded,
            format!("cost {:.2} exceeds bound {:.2}", cost, max_cost),
        ));
    }
    if let Some(min_p) = bounds.min_success_prob {
        let p = optr::path_success_prob(path)?;
        if p < min_p {
            failures.push(GateFailure::new(
                ReasonCode::SuccessProbTooLow,
                format!("success probability {:.3} below {:.3}", p, min_p),
            ));
        }
    }

    Ok(failures)
}

fn interference_gate(
    intent: &Intent,
    deltas: &BTreeMap<String, f64>,
) -> Result<Option<GateFailure>, CanonryError> {
    if let Some((agent, delta)) = deltas.iter().find(|(_, d)| !d.is_finite()) {
        return Err(CanonryError::ValidationError(format!(
            "projected delta for '{}' is not finite ({})",
            agent, delta
        )));
    }
    let check = interference::evaluate_for(intent.authority.as_deref(), deltas);
    if check.ok {
        return Ok(None);
    }
    Ok(Some(GateFailure {
        code: ReasonCode::NonInterferenceViolation,
        message: format!(
            "increases time-to-value for {} other agent(s)",
            check.violations.len()
        ),
        violations: check.violations,
    }))
}

/// A scored candidate and the path gates it failed.
#[derive(Debug, Clone, PartialEq)]
pub struct Candidate {
    pub path: ExecutionPath,
    pub failures: Vec<GateFailure>,
}

impl Candidate {
    pub fn is_admissible(&self) -> bool {
        self.failures.is_empty()
    }
}

/// Every candidate for an intent, in enumeration order.
#[derive(Debug, Clone, PartialEq)]
pub struct Plan {
    pub candidates: Vec<Candidate>,
}

impl Plan {
    /// Cheapest admissible path; first on a tie.
    pub fn selected(&self) -> Option<&ExecutionPath> {
        optr::cheapest(
            self.candidates
                .iter()
                .filter(|c| c.is_admissible())
                .map(|c| &c.path),
        )
    }

    /// Cheapest path regardless of admissibility.
    pub fn cheapest(&self) -> Option<&ExecutionPath> {
        optr::cheapest(self.candidates.iter().map(|c| &c.path))
    }
}

/// A verdict that has not been ledgered yet.
#[derive(Debug, Clone, PartialEq)]
pub(crate) enum Judgement {
    Allow(Decision),
    Deny(Denial),
}

impl Judgement {
    pub(crate) fn payload(&self) -> LedgerPayload {
        match self {
            Judgement::Allow(d) => LedgerPayload::Decision(d.clone()),
            Judgement::Deny(d) => LedgerPayload::Denial(d.clone()),
        }
    }

    pub(crate) fn into_verdict(self, entry: LedgerEntry) -> Verdict {
        match self {
            Judgement::Allow(decision) => {
                info!(intent = %decision.intent_id, decision = %decision.id, "intent allowed");
                Verdict::Allow { decision, entry }
            }
            Judgement::Deny(denial) => {
                info!(
                    intent = %denial.intent_id,
                    denial = %denial.id,
                    codes = ?denial.reason_codes,
                    "intent denied"
                );
                Verdict::Deny { denial, entry }
            }
        }
    }
}

pub struct DecisionEngine {
    store: Store,
    enumerator: Box<dyn PathEnumerator>,
    scorer: Box<dyn PathScorer>,
    projector: Box<dyn EffectProjector>,
}

impl DecisionEngine {
    /// Default enumerator, scorer weights from configuration, declared effects.
    pub fn new(store: &Store) -> Self {
        Self {
            store: store.clone(),
            enumerator: Box::new(IntentPathEnumerator),
            scorer: Box::new(WeightedScorer::from_config(&store.config().optr)),
            projector: Box::new(DeclaredEffects),
        }
    }

    pub fn with_enumerator(mut self, enumerator: impl PathEnumerator + 'static) -> Self {
        self.enumerator = Box::new(enumerator);
        self
    }

    pub fn with_scorer(mut self, scorer: impl PathScorer + 'static) -> Self {
        self.scorer = Box::new(scorer);
        self
    }

    pub fn with_projector(mut self, projector: impl EffectProjector + 'static) -> Self {
        self.projector = Box::new(projector);
        self
    }

    /// Enumerate, score and gate every candidate without ledgering anything.
    pub fn plan(&self, intent: &Intent) -> Result<Plan, CanonryError> {
        intent.validate()?;
        let mut paths = self.enumerator.enumerate(intent)?;
        if paths.is_empty() {
            return Err(CanonryError::PlanEmpty(format!(
                "no candidate execution paths for intent '{}'",
                intent.id
            )));
        }
        optr::score_all(self.scorer.as_ref(), intent, &mut paths)?;
        let canon = promotion::document(&self.store)?;
        let bounds = &self.store.config().optr;
        let candidates = paths
            .into_iter()
            .map(|path| {
                let failures = path_gates(&path, &canon, bounds)?;
                Ok(Candidate { path, failures })
            })
            .collect::<Result<Vec<_>, CanonryError>>()?;
        let plan = Plan { candidates };
        if let Some(path) = plan.selected() {
            debug!(intent = %intent.id, path = %path.id, score = path.score, "path selected");
        }
        Ok(plan)
    }

    /// Judge `intent` without writing. Errors mean nothing may be ledgered.
    pub(crate) fn judge(&self, intent: &Intent) -> Result<Judgement, CanonryError> {
        let plan = self.plan(intent)?;
        let now = self.store.now_ms();

        let failures = match plan.selected() {
            Some(path) => {
                let deltas = self.projector.project(intent, path)?;
                match interference_gate(intent, &deltas)? {
                    None => {
                        return Ok(Judgement::Allow(Decision {
                            id: prefixed_id("DEC"),
                            intent_id: intent.id.clone(),
                            action_id: intent.action.id.clone(),
                            timestamp: now,
                            outcome: Outcome::Allow,
                            score: path.score,
                        }));
                    }
                    Some(failure) => vec![failure],
                }
            }
            None => {
                let several = plan.candidates.len() > 1;
                let mut failures: Vec<GateFailure> = Vec::new();
                for candidate in &plan.candidates {
                    for f in &candidate.failures {
                        let mut f = f.clone();
                        if several {
                            f.message = format!("path {}: {}", candidate.path.id, f.message);
                        }
                        failures.push(f);
                    }
                }
                if let Some(path) = plan.cheapest() {
                    let deltas = self.projector.project(intent, path)?;
                    failures.extend(interference_gate(intent, &deltas)?);
                }
                failures
            }
        };

        let mut reason_codes = Vec::new();
        let mut messages = Vec::new();
        let mut violations = Vec::new();
        for f in failures {
            if !reason_codes.contains(&f.code) {
                reason_codes.push(f.code);
            }
            messages.push(f.message);
            violations.extend(f.violations);
        }
        Ok(Judgement::Deny(Denial {
            id: prefixed_id("DEN"),
            intent_id: intent.id.clone(),
            action_id: intent.action.id.clone(),
            reason: format!("Denied: {}", messages.join("; ")),
            reason_codes,
            violations,
            timestamp: now,
        }))
    }

    pub fn decide(&self, intent: &Intent) -> Result<Verdict, CanonryError> {
        let judgement = self.judge(intent)?;
        let entry = ledger::append(&self.store, &judgement.payload())?;
        Ok(judgement.into_verdict(entry))
    }
}

pub fn schema() -> serde_json::Value {
    serde_json::json!({
        "name": "decide",
        "version": "0.2.0",
        "description": "Per-path gates and OPTR selection, one ledgered verdict per intent",
        "commands": [
            { "name": "decide", "description": "Decide an intent read from a JSON file", "parameters": ["intent", "changed"] }
        ],
        "reason_codes": [
            "NON_INTERFERENCE_VIOLATION",
            "MISSING_CANON_PREREQS",
            "RISK_BOUND_EXCEEDED",
            "COST_BOUND_EXCEEDED",
            "AUTHORITY_BOUNDARY_FAIL",
            "SUCCESS_PROB_TOO_LOW"
        ],
        "storage": ["governance.db:ledger_entries"]
    })
}
