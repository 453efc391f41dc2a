//! Core data model: per-model judgments, calculation output and the two
//! persisted shapes (article state + ensemble audit row).

use std::collections::BTreeSet;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Political-leaning bucket a model's raw score belongs to.
///
/// `Ord` follows declaration order so iteration over perspective-keyed
/// `BTreeMap`s is stable (left, center, right).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Perspective {
    Left,
    Center,
    Right,
}

impl Perspective {
    pub const ALL: [Perspective; 3] = [Perspective::Left, Perspective::Center, Perspective::Right];

    pub fn as_str(self) -> &'static str {
        match self {
            Perspective::Left => "left",
            Perspective::Center => "center",
            Perspective::Right => "right",
        }
    }

    /// Parse a label, accepting the legacy aliases older model configs used.
    pub fn from_label(label: &str) -> Option<Self> {
        match label.trim().to_ascii_lowercase().as_str() {
            "left" | "left_leaning" | "liberal" => Some(Perspective::Left),
            "center" | "centre" | "centrist" | "neutral" => Some(Perspective::Center),
            "right" | "right_leaning" | "conservative" => Some(Perspective::Right),
            _ => None,
        }
    }
}

impl fmt::Display for Perspective {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One model's judgment of an article.
///
/// The perspective is not stored here; it is derived from `model` through
/// the configured mapping at calculation time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PerspectiveScore {
    /// Model identifier, e.g. `"meta-llama/llama-3-8b:free"`.
    pub model: String,
    /// Raw bias score on the [-1.0, +1.0] scale.
    pub score: f64,
    /// Opaque blob from the analysis; may carry `{"confidence": <0..1>}`.
    #[serde(default)]
    pub metadata: Value,
    /// When the analysis produced the score. Absent timestamps never win a
    /// recency comparison.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_at: Option<DateTime<Utc>>,
}

impl PerspectiveScore {
    pub fn new(model: impl Into<String>, score: f64) -> Self {
        Self {
            model: model.into(),
            score,
            metadata: Value::Null,
            created_at: None,
        }
    }

    /// Embed a per-model confidence in the metadata blob.
    pub fn with_confidence(mut self, confidence: f64) -> Self {
        match self.metadata {
            Value::Object(ref mut map) => {
                map.insert("confidence".to_string(), Value::from(confidence));
            }
            _ => self.metadata = serde_json::json!({ "confidence": confidence }),
        }
        self
    }

    pub fn with_metadata(mut self, metadata: Value) -> Self {
        self.metadata = metadata;
        self
    }

    pub fn at(mut self, created_at: DateTime<Utc>) -> Self {
        self.created_at = Some(created_at);
        self
    }

    /// Confidence embedded in `metadata`, if present and usable.
    ///
    /// Accepts a JSON number or a numeric string; values are clamped into
    /// [0, 1]. Non-finite values count as absent.
    pub fn embedded_confidence(&self) -> Option<f64> {
        let raw = self.metadata.get("confidence")?;
        let v = match raw {
            Value::Number(n) => n.as_f64()?,
            Value::String(s) => s.trim().parse::<f64>().ok()?,
            _ => return None,
        };
        v.is_finite().then(|| v.clamp(0.0, 1.0))
    }
}

/// Output of a calculation. Only the two scalars are persisted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScoreResult {
    pub composite_score: f64,
    pub confidence: f64,
    pub perspectives_used: BTreeSet<Perspective>,
}

/// Persisted per-article composite. Written only inside the manager's
/// transaction.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ArticleScoreState {
    pub article_id: i64,
    pub composite_score: f64,
    pub confidence: f64,
    pub last_updated: DateTime<Utc>,
}

/// Append-only audit row for one scoring run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EnsembleRecord {
    /// Assigned by the store on insert; `None` before that.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<i64>,
    pub article_id: i64,
    pub perspective_scores: Vec<PerspectiveScore>,
    pub composite_score: f64,
    pub confidence: f64,
    pub perspectives_used: BTreeSet<Perspective>,
    pub created_at: DateTime<Utc>,
}
