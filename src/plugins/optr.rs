//! OPTR: enumerate candidate execution paths, score them, pick the cheapest.
//!
//! Score per path is `Σ ttv + λC·cost + λR·risk − λP·ln(max(p, 1e-9))`
//! over its actions. Lower is better.

use crate::core::config::OptrConfig;
use crate::core::error::CanonryError;
use crate::core::model::{Action, ExecutionPath, Intent};

/// Floor applied to success probabilities before taking the log.
pub const MIN_SUCCESS_PROB: f64 = 1e-9;

/// Metadata key holding alternative plans: an array of arrays of actions.
pub const PATHS_METADATA_KEY: &str = "paths";

pub trait PathEnumerator: Send + Sync {
    /// Finite, deterministic candidate list. May be empty.
    fn enumerate(&self, intent: &Intent) -> Result<Vec<ExecutionPath>, CanonryError>;
}

pub trait PathScorer: Send + Sync {
    fn score(&self, path: &ExecutionPath, intent: &Intent) -> Result<f64, CanonryError>;
}

/// Uses `metadata.paths` when present, otherwise the direct path
/// `[intent.action]`.
#[derive(Debug, Default, Clone, Copy)]
pub struct IntentPathEnumerator;

impl PathEnumerator for IntentPathEnumerator {
    fn enumerate(&self, intent: &Intent) -> Result<Vec<ExecutionPath>, CanonryError> {
        let Some(raw) = intent.metadata.get(PATHS_METADATA_KEY) else {
            return Ok(vec![ExecutionPath {
                id: format!("{}:direct", intent.id),
                actions: vec![intent.action.clone()],
                score: 0.0,
            }]);
        };
        let plans: Vec<Vec<Action>> = serde_json::from_value(raw.clone()).map_err(|e| {
            CanonryError::ValidationError(format!(
                "intent '{}' metadata.paths must be an array of action arrays: {}",
                intent.id, e
            ))
        })?;
        plans
            .into_iter()
            .enumerate()
            .map(|(i, actions)| {
                for action in &actions {
                    action.validate()?;
                }
                Ok(ExecutionPath {
                    id: format!("{}:{}", intent.id, i),
                    actions,
                    score: 0.0,
                })
            })
            .collect()
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct WeightedScorer {
    pub lambda_cost: f64,
    pub lambda_risk: f64,
    pub lambda_prob: f64,
}

impl Default for WeightedScorer {
    fn default() -> Self {
        Self::from_config(&OptrConfig::default())
    }
}

impl WeightedScorer {
    pub fn from_config(cfg: &OptrConfig) -> Self {
        Self {
            lambda_cost: cfg.lambda_cost,
            lambda_risk: cfg.lambda_risk,
            lambda_prob: cfg.lambda_prob,
        }
    }

    pub fn score_action(&self, action: &Action) -> Result<f64, CanonryError> {
        let f = action.features()?;
        Ok(f.ttv + self.lambda_cost * f.cost + self.lambda_risk * f.risk
            - self.lambda_prob * f.success_prob.max(MIN_SUCCESS_PROB).ln())
    }
}

impl PathScorer for WeightedScorer {
    fn score(&self, path: &ExecutionPath, _intent: &Intent) -> Result<f64, CanonryError> {
        path.actions
            .iter()
            .map(|a| self.score_action(a))
            .sum()
    }
}

/// Score every path in place. A score that is not a finite number (an
/// overflowing sum, a NaN from a custom scorer) rejects the intent.
pub fn score_all(
    scorer: &dyn PathScorer,
    intent: &Intent,
    paths: &mut [ExecutionPath],
) -> Result<(), CanonryError> {
    for path in paths.iter_mut() {
        let score = scorer.score(path, intent)?;
        if !score.is_finite() {
            return Err(CanonryError::ValidationError(format!(
                "path '{}' of intent '{}' has non-finite score {}",
                path.id, intent.id, score
            )));
        }
        path.score = score;
    }
    Ok(())
}

/// Minimum score wins; on a tie the first path encountered is kept.
pub fn cheapest<'a, I>(paths: I) -> Option<&'a ExecutionPath>
where
    I: IntoIterator<Item = &'a ExecutionPath>,
{
    let mut best: Option<&ExecutionPath> = None;
    for path in paths {
        match best {
            Some(current) if path.score.total_cmp(&current.score).is_ge() => {}
            _ => best = Some(path),
        }
    }
    best
}

/// Owning form of `cheapest`. Empty input is `PlanEmpty`.
pub fn select(paths: Vec<ExecutionPath>) -> Result<ExecutionPath, CanonryError> {
    cheapest(&paths)
        .cloned()
        .ok_or_else(|| CanonryError::PlanEmpty("no candidate execution paths".to_string()))
}

/// Summed risk and cost over a path, for bound checks.
pub fn path_totals(path: &ExecutionPath) -> Result<(f64, f64), CanonryError> {
    let mut risk = 0.0;
    let mut cost = 0.0;
    for action in &path.actions {
        let f = action.features()?;
        risk += f.risk;
        cost += f.cost;
    }
    if !risk.is_finite() || !cost.is_finite() {
        return Err(CanonryError::ValidationError(format!(
            "path '{}' totals overflow (risk {}, cost {})",
            path.id, risk, cost
        )));
    }
    Ok((risk, cost))
}

/// Joint success probability of a path: the product over its actions.
pub fn path_success_prob(path: &ExecutionPath) -> Result<f64, CanonryError> {
    let mut p = 1.0;
    for action in &path.actions {
        p *= action.features()?.success_prob;
    }
    Ok(p)
}
