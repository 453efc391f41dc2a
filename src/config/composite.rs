// src/config/composite.rs
//! Composite score policy: score bounds, model → perspective mapping and the
//! strategies for missing, duplicate and invalid inputs.
//!
//! JSON shape (TOML mirrors it):
//! {
//!   "min_score": -1.0,
//!   "max_score": 1.0,
//!   "models": [{ "model_name": "gpt-4o", "perspective": "center" }],
//!   "missing_perspective_policy": "treat_as_zero",
//!   "selection": "highest_confidence",
//!   "invalid_scores": "ignore",
//!   "default_missing": 0.0
//! }

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};

use crate::model::Perspective;

fn default_min_score() -> f64 {
    -1.0
}
fn default_max_score() -> f64 {
    1.0
}

/// How absent perspectives enter the average.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MissingPerspectivePolicy {
    /// Absent perspectives add 0.0 to the numerator and count in the denominator.
    #[default]
    TreatAsZero,
    /// Average only over the perspectives present.
    Exclude,
    /// Fail with `IncompleteInput` unless every configured perspective is present.
    RequireAll,
}

/// Picks one representative when several models map to the same perspective.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SelectionStrategy {
    /// Highest embedded confidence, then newest, then model name.
    #[default]
    HighestConfidence,
    /// Newest `created_at`, then highest confidence, then model name.
    MostRecent,
}

/// Treatment of NaN, infinite or out-of-range raw scores.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InvalidScorePolicy {
    /// Drop the offending score and keep going.
    #[default]
    Ignore,
    /// Fail the whole calculation with `InvalidInput`.
    Reject,
    /// Replace the raw score with `default_missing`; the model still counts.
    Substitute,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModelPerspective {
    pub model_name: String,
    pub perspective: Perspective,
}

impl ModelPerspective {
    pub fn new(model_name: impl Into<String>, perspective: Perspective) -> Self {
        Self {
            model_name: model_name.into(),
            perspective,
        }
    }
}

/// Read-only once loaded; passed into every calculation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompositeScoreConfig {
    #[serde(default = "default_min_score")]
    pub min_score: f64,
    #[serde(default = "default_max_score")]
    pub max_score: f64,
    #[serde(default)]
    pub models: Vec<ModelPerspective>,
    #[serde(default)]
    pub missing_perspective_policy: MissingPerspectivePolicy,
    #[serde(default)]
    pub selection: SelectionStrategy,
    #[serde(default)]
    pub invalid_scores: InvalidScorePolicy,
    /// Stand-in value under [`InvalidScorePolicy::Substitute`].
    #[serde(default)]
    pub default_missing: f64,
}

impl Default for CompositeScoreConfig {
    fn default() -> Self {
        Self {
            min_score: default_min_score(),
            max_score: default_max_score(),
            models: Vec::new(),
            missing_perspective_policy: MissingPerspectivePolicy::default(),
            selection: SelectionStrategy::default(),
            invalid_scores: InvalidScorePolicy::default(),
            default_missing: 0.0,
        }
    }
}

impl CompositeScoreConfig {
    pub fn with_models<I>(mut self, models: I) -> Self
    where
        I: IntoIterator<Item = ModelPerspective>,
    {
        self.models = models.into_iter().collect();
        self
    }

    pub fn with_policy(mut self, policy: MissingPerspectivePolicy) -> Self {
        self.missing_perspective_policy = policy;
        self
    }

    pub fn with_selection(mut self, selection: SelectionStrategy) -> Self {
        self.selection = selection;
        self
    }

    pub fn with_invalid_scores(mut self, policy: InvalidScorePolicy) -> Self {
        self.invalid_scores = policy;
        self
    }

    pub fn with_default_missing(mut self, value: f64) -> Self {
        self.default_missing = value;
        self
    }

    /// Bounds must be finite and ordered; `default_missing` must lie within them.
    pub fn validate(&self) -> Result<(), String> {
        if !self.min_score.is_finite() || !self.max_score.is_finite() {
            return Err("min_score and max_score must be finite".into());
        }
        if self.min_score >= self.max_score {
            return Err(format!(
                "min_score ({}) must be below max_score ({})",
                self.min_score, self.max_score
            ));
        }
        if !self.in_bounds(self.default_missing) {
            return Err(format!(
                "default_missing ({}) must lie in [{}, {}]",
                self.default_missing, self.min_score, self.max_score
            ));
        }
        Ok(())
    }

    /// Resolve a model identifier to its perspective.
    ///
    /// Order: exact match on the normalized name, then prefix match against
    /// configured names (first match wins), then the legacy perspective labels.
    pub fn perspective_for(&self, model: &str) -> Option<Perspective> {
        let wanted = normalize_model_name(model);
        if wanted.is_empty() {
            return None;
        }

        let configured = || {
            self.models
                .iter()
                .map(|m| (normalize_model_name(&m.model_name), m.perspective))
                .filter(|(name, _)| !name.is_empty())
        };

        if let Some((_, p)) = configured().find(|(name, _)| *name == wanted) {
            return Some(p);
        }
        if let Some((_, p)) = configured().find(|(name, _)| wanted.starts_with(name.as_str())) {
            return Some(p);
        }
        Perspective::from_label(&wanted)
    }

    /// Perspectives the configuration expects. An empty mapping means the
    /// legacy labels are in use, so all three are expected.
    pub fn configured_perspectives(&self) -> BTreeSet<Perspective> {
        if self.models.is_empty() {
            return Perspective::ALL.into_iter().collect();
        }
        self.models.iter().map(|m| m.perspective).collect()
    }

    pub fn in_bounds(&self, score: f64) -> bool {
        score.is_finite() && score >= self.min_score && score <= self.max_score
    }
}

/// Lowercase, trim, and drop a `:tag` suffix (`model:free` → `model`).
fn normalize_model_name(name: &str) -> String {
    let lowered = name.trim().to_ascii_lowercase();
    match lowered.split_once(':') {
        Some((head, _)) => head.trim().to_string(),
        None => lowered,
    }
}
