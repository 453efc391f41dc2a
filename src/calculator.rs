//! # Score Calculator
//! Pure aggregation of per-model perspective scores into one composite.
//! No I/O and no shared state: identical inputs give bit-identical output.
//!
//! Policy: pick one representative score per perspective, then take the plain
//! arithmetic mean on the original [-1, +1] scale. Missing perspectives are
//! handled by [`MissingPerspectivePolicy`]. Confidence is the mean of the
//! selected scores' embedded confidences; a score without one contributes
//! `present / configured` instead.

use std::borrow::Cow;
use std::cmp::Ordering;
use std::collections::{BTreeMap, BTreeSet};

use tracing::{debug, warn};

use crate::config::{
    CompositeScoreConfig, InvalidScorePolicy, MissingPerspectivePolicy, SelectionStrategy,
};
use crate::error::{Result, ScoreError};
use crate::model::{Perspective, PerspectiveScore, ScoreResult};

/// Aggregation capability. The manager only sees this trait, so tests and
/// alternative strategies can be plugged in without touching it.
pub trait ScoreCalculator: Send + Sync {
    fn calculate(&self, scores: &[PerspectiveScore], cfg: &CompositeScoreConfig)
        -> Result<ScoreResult>;

    fn name(&self) -> &'static str;
}

/// Mean-of-representatives calculator.
#[derive(Debug, Default, Clone, Copy)]
pub struct DefaultScoreCalculator;

impl DefaultScoreCalculator {
    pub fn new() -> Self {
        Self
    }
}

impl ScoreCalculator for DefaultScoreCalculator {
    fn calculate(
        &self,
        scores: &[PerspectiveScore],
        cfg: &CompositeScoreConfig,
    ) -> Result<ScoreResult> {
        if scores.is_empty() {
            return Err(ScoreError::InvalidInput("no scores provided".into()));
        }
        cfg.validate()
            .map_err(|e| ScoreError::InvalidInput(format!("invalid composite config: {e}")))?;

        // 1) Bucket by perspective, dropping unmapped models and handling
        //    invalid scores per policy.
        let mut grouped: BTreeMap<Perspective, Vec<Cow<'_, PerspectiveScore>>> = BTreeMap::new();
        for s in scores {
            let s = if cfg.in_bounds(s.score) {
                Cow::Borrowed(s)
            } else {
                match cfg.invalid_scores {
                    InvalidScorePolicy::Reject => {
                        return Err(ScoreError::InvalidInput(format!(
                            "score {} from model '{}' is outside [{}, {}]",
                            s.score, s.model, cfg.min_score, cfg.max_score
                        )));
                    }
                    InvalidScorePolicy::Ignore => {
                        debug!(model = %s.model, score = s.score, "ignoring out-of-range score");
                        continue;
                    }
                    InvalidScorePolicy::Substitute => {
                        debug!(
                            model = %s.model,
                            score = s.score,
                            substitute = cfg.default_missing,
                            "substituting out-of-range score"
                        );
                        let mut owned = s.clone();
                        owned.score = cfg.default_missing;
                        Cow::Owned(owned)
                    }
                }
            };
            let Some(perspective) = cfg.perspective_for(&s.model) else {
                warn!(model = %s.model, "model not mapped to a perspective, skipping");
                continue;
            };
            grouped.entry(perspective).or_default().push(s);
        }

        if grouped.is_empty() {
            return Err(ScoreError::InvalidInput(
                "no usable scores: every model was unmapped or out of range".into(),
            ));
        }

        // 2) One representative per perspective.
        let selected: BTreeMap<Perspective, &PerspectiveScore> = grouped
            .iter()
            .filter_map(|(p, candidates)| {
                select(candidates.iter().map(|c| &**c), cfg.selection).map(|s| (*p, s))
            })
            .collect();

        let present: BTreeSet<Perspective> = selected.keys().copied().collect();
        let configured = cfg.configured_perspectives();
        let missing: Vec<Perspective> = configured.difference(&present).copied().collect();

        // 3) Composite = plain mean; the policy only decides the denominator.
        let denominator = match cfg.missing_perspective_policy {
            MissingPerspectivePolicy::RequireAll if !missing.is_empty() => {
                return Err(ScoreError::IncompleteInput { missing });
            }
            MissingPerspectivePolicy::TreatAsZero => present.union(&configured).count(),
            MissingPerspectivePolicy::Exclude | MissingPerspectivePolicy::RequireAll => {
                present.len()
            }
        };
        let sum: f64 = selected.values().map(|s| s.score).sum();
        let composite_score = (sum / denominator as f64).clamp(cfg.min_score, cfg.max_score);

        // 4) Confidence = mean of embedded confidences, with coverage as fallback.
        let coverage =
            present.intersection(&configured).count() as f64 / configured.len().max(1) as f64;
        let conf_sum: f64 = selected
            .values()
            .map(|s| s.embedded_confidence().unwrap_or(coverage))
            .sum();
        let confidence = (conf_sum / selected.len() as f64).clamp(0.0, 1.0);

        debug!(
            composite_score,
            confidence,
            used = present.len(),
            missing = missing.len(),
            policy = ?cfg.missing_perspective_policy,
            "composite score calculated"
        );

        Ok(ScoreResult {
            composite_score,
            confidence,
            perspectives_used: present,
        })
    }

    fn name(&self) -> &'static str {
        "average"
    }
}

/// Deterministic pick among scores sharing a perspective.
fn select<'a>(
    candidates: impl IntoIterator<Item = &'a PerspectiveScore>,
    strategy: SelectionStrategy,
) -> Option<&'a PerspectiveScore> {
    candidates.into_iter().min_by(|a, b| rank(a, b, strategy))
}

/// `Less` means `a` is preferred. A missing timestamp sorts after any
/// present one, and two missing timestamps tie.
fn rank(a: &PerspectiveScore, b: &PerspectiveScore, strategy: SelectionStrategy) -> Ordering {
    let conf = |s: &PerspectiveScore| s.embedded_confidence().unwrap_or(-1.0);
    let by_confidence = || conf(b).total_cmp(&conf(a));
    let by_recency = || b.created_at.cmp(&a.created_at);

    let primary = match strategy {
        SelectionStrategy::HighestConfidence => by_confidence().then_with(by_recency),
        SelectionStrategy::MostRecent => by_recency().then_with(by_confidence),
    };
    primary
        .then_with(|| a.model.cmp(&b.model))
        .then_with(|| a.score.total_cmp(&b.score))
}
