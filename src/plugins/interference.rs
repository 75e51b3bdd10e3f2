//! Non-interference: an action is admissible only if it does not increase
//! any other agent's expected time-to-value.
//!
//! `evaluate` is the pure law over a map of projected deltas. The projectors
//! below produce those deltas for a selected execution path.

use crate::core::error::CanonryError;
use crate::core::model::{Action, ExecutionPath, Intent, NonInterferenceResult, Violation};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Penalty per shared resource the action uses that another agent depends on.
pub const RESOURCE_CONFLICT_MS: f64 = 50.0;
/// Penalty per piece of shared state the action modifies that another agent reads.
pub const STATE_CONFLICT_MS: f64 = 100.0;

/// Violations are every agent with a strictly positive delta, in agent-id order.
pub fn evaluate(deltas: &BTreeMap<String, f64>) -> NonInterferenceResult {
    let violations: Vec<Violation> = deltas
        .iter()
        .filter(|(_, delta)| **delta > 0.0)
        .map(|(agent_id, delta)| Violation {
            agent_id: agent_id.clone(),
            delta: *delta,
        })
        .collect();
    NonInterferenceResult {
        ok: violations.is_empty(),
        violations,
    }
}

/// `evaluate` with the acting agent's own entry removed.
pub fn evaluate_for(
    acting_agent: Option<&str>,
    deltas: &BTreeMap<String, f64>,
) -> NonInterferenceResult {
    match acting_agent {
        Some(me) if deltas.contains_key(me) => {
            let mut others = deltas.clone();
            others.remove(me);
            evaluate(&others)
        }
        _ => evaluate(deltas),
    }
}

/// Projects the ΔE[TTV] a path imposes on each other agent.
pub trait EffectProjector: Send + Sync {
    fn project(
        &self,
        intent: &Intent,
        path: &ExecutionPath,
    ) -> Result<BTreeMap<String, f64>, CanonryError>;
}

/// Sums the `ttvDelta` maps the path's actions declare.
#[derive(Debug, Default, Clone, Copy)]
pub struct DeclaredEffects;

impl EffectProjector for DeclaredEffects {
    fn project(
        &self,
        _intent: &Intent,
        path: &ExecutionPath,
    ) -> Result<BTreeMap<String, f64>, CanonryError> {
        let mut total: BTreeMap<String, f64> = BTreeMap::new();
        for action in &path.actions {
            for (agent, delta) in action.features()?.ttv_delta {
                *total.entry(agent).or_insert(0.0) += delta;
            }
        }
        Ok(total)
    }
}

/// What another agent depends on, plus what it plans to do.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct AgentProfile {
    pub id: String,
    pub depends_on_resources: Vec<String>,
    pub depends_on_state: Vec<String>,
    pub planned_actions: Vec<Action>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PairConflict {
    /// Agent whose action interferes.
    pub source: String,
    /// Agent whose time-to-value grows.
    pub affected: String,
    pub action_id: String,
    pub delta: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EquilibriumReport {
    pub equilibrium: bool,
    pub conflicts: Vec<PairConflict>,
}

/// Estimates deltas from declared resource and shared-state contention.
#[derive(Debug, Clone, Default)]
pub struct ContentionEstimator {
    agents: Vec<AgentProfile>,
}

impl ContentionEstimator {
    pub fn new(agents: Vec<AgentProfile>) -> Self {
        Self { agents }
    }

    fn impact_on(action: &Action, other: &AgentProfile) -> Result<f64, CanonryError> {
        let features = action.features()?;
        let resource_hits = features
            .resources_used
            .iter()
            .filter(|r| other.depends_on_resources.contains(r))
            .count();
        let state_hits = features
            .shared_state_modified
            .iter()
            .filter(|s| other.depends_on_state.contains(s))
            .count();
        Ok(resource_hits as f64 * RESOURCE_CONFLICT_MS + state_hits as f64 * STATE_CONFLICT_MS)
    }

    /// Delta for every known agent from a single action.
    pub fn estimate(&self, action: &Action) -> Result<BTreeMap<String, f64>, CanonryError> {
        let mut impacts = BTreeMap::new();
        for agent in &self.agents {
            impacts.insert(agent.id.clone(), Self::impact_on(action, agent)?);
        }
        Ok(impacts)
    }
}

impl EffectProjector for ContentionEstimator {
    fn project(
        &self,
        _intent: &Intent,
        path: &ExecutionPath,
    ) -> Result<BTreeMap<String, f64>, CanonryError> {
        let mut total: BTreeMap<String, f64> = BTreeMap::new();
        for action in &path.actions {
            for (agent, delta) in self.estimate(action)? {
                *total.entry(agent).or_insert(0.0) += delta;
            }
        }
        Ok(total)
    }
}

/// Check every pair of agents' planned actions against each other.
pub fn check_equilibrium(agents: &[AgentProfile]) -> Result<EquilibriumReport, CanonryError> {
    let mut conflicts = Vec::new();
    for (i, a) in agents.iter().enumerate() {
        for b in &agents[i + 1..] {
            for (source, affected) in [(a, b), (b, a)] {
                for action in &source.planned_actions {
                    let delta = ContentionEstimator::impact_on(action, affected)?;
                    if delta > 0.0 {
                        conflicts.push(PairConflict {
                            source: source.id.clone(),
                            affected: affected.id.clone(),
                            action_id: action.id.clone(),
                            delta,
                        });
                    }
                }
            }
        }
    }
    Ok(EquilibriumReport {
        equilibrium: conflicts.is_empty(),
        conflicts,
    })
}
