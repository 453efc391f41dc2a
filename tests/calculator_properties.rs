//! Calculator properties against the documented worked examples.
//!
//! Covered:
//! - full coverage: composite and confidence are plain means
//! - `treat_as_zero` vs `exclude` when `right` is missing
//! - `require_all` lists the missing perspectives
//! - empty input → InvalidInput
//! - repeat calls are bit-identical, including over shuffled input
//! - duplicates without timestamps resolve the same way in either order

use chrono::{Duration, Utc};
use news_bias_scorer::config::{ModelPerspective, SelectionStrategy};
use news_bias_scorer::{
    CompositeScoreConfig, DefaultScoreCalculator, MissingPerspectivePolicy, Perspective,
    PerspectiveScore, ScoreCalculator, ScoreError,
};
use rand::seq::SliceRandom;
use serde_json::json;

const EPS: f64 = 1e-4;

fn example() -> Vec<PerspectiveScore> {
    vec![
        PerspectiveScore::new("left", -0.8).with_confidence(0.9),
        PerspectiveScore::new("center", 0.0).with_confidence(0.8),
        PerspectiveScore::new("right", 0.6).with_confidence(0.7),
    ]
}

fn without_right() -> Vec<PerspectiveScore> {
    example().into_iter().filter(|s| s.model != "right").collect()
}

#[test]
fn all_perspectives_mean_of_scores_and_confidences() {
    let r = DefaultScoreCalculator::new()
        .calculate(&example(), &CompositeScoreConfig::default())
        .unwrap();
    assert!((r.composite_score - (-0.0667)).abs() < EPS, "{}", r.composite_score);
    assert!((r.confidence - 0.8).abs() < 1e-9);
    assert_eq!(r.perspectives_used.len(), 3);
}

#[test]
fn missing_right_treat_as_zero_vs_exclude() {
    let calc = DefaultScoreCalculator::new();

    let zero = calc
        .calculate(
            &without_right(),
            &CompositeScoreConfig::default().with_policy(MissingPerspectivePolicy::TreatAsZero),
        )
        .unwrap();
    assert!((zero.composite_score - (-0.2667)).abs() < EPS);
    assert!(!zero.perspectives_used.contains(&Perspective::Right));

    let excl = calc
        .calculate(
            &without_right(),
            &CompositeScoreConfig::default().with_policy(MissingPerspectivePolicy::Exclude),
        )
        .unwrap();
    assert!((excl.composite_score - (-0.4)).abs() < 1e-9);
}

#[test]
fn require_all_reports_missing() {
    let err = DefaultScoreCalculator::new()
        .calculate(
            &without_right(),
            &CompositeScoreConfig::default().with_policy(MissingPerspectivePolicy::RequireAll),
        )
        .unwrap_err();
    match err {
        ScoreError::IncompleteInput { missing } => assert_eq!(missing, vec![Perspective::Right]),
        other => panic!("expected IncompleteInput, got {other:?}"),
    }
}

#[test]
fn empty_input_is_invalid() {
    let err = DefaultScoreCalculator::new()
        .calculate(&[], &CompositeScoreConfig::default())
        .unwrap_err();
    assert!(matches!(err, ScoreError::InvalidInput(_)));
    assert!(err.is_client_error());
}

#[test]
fn configured_models_with_tags_and_duplicates() {
    let cfg = CompositeScoreConfig::default()
        .with_models([
            ModelPerspective::new("meta-llama/llama-4-maverick", Perspective::Left),
            ModelPerspective::new("google/gemini-2.0-flash", Perspective::Center),
            ModelPerspective::new("openai/gpt-4.1-nano", Perspective::Right),
        ])
        .with_selection(SelectionStrategy::MostRecent);

    let now = Utc::now();
    let scores = vec![
        PerspectiveScore::new("meta-llama/llama-4-maverick:free", -0.8).with_confidence(0.9),
        PerspectiveScore::new("google/gemini-2.0-flash-001", 0.0).with_confidence(0.8),
        // Two right-leaning runs: the newer one wins under most_recent.
        PerspectiveScore::new("openai/gpt-4.1-nano", 0.9)
            .with_confidence(0.99)
            .at(now - Duration::minutes(10)),
        PerspectiveScore::new("OpenAI/GPT-4.1-nano", 0.6)
            .with_confidence(0.7)
            .at(now),
    ];

    let r = DefaultScoreCalculator::new().calculate(&scores, &cfg).unwrap();
    assert!((r.composite_score - (-0.0667)).abs() < EPS);
    assert!((r.confidence - 0.8).abs() < 1e-9);
}

#[test]
fn deterministic_and_order_independent() {
    let calc = DefaultScoreCalculator::new();
    let cfg = CompositeScoreConfig::default();
    let base = example();
    let first = calc.calculate(&base, &cfg).unwrap();
    let again = calc.calculate(&base, &cfg).unwrap();
    assert_eq!(first.composite_score.to_bits(), again.composite_score.to_bits());
    assert_eq!(first.confidence.to_bits(), again.confidence.to_bits());

    let mut rng = rand::rng();
    for _ in 0..20 {
        let mut shuffled = base.clone();
        shuffled.shuffle(&mut rng);
        let r = calc.calculate(&shuffled, &cfg).unwrap();
        assert_eq!(r, first);
    }
}

#[test]
fn untimestamped_duplicates_resolve_independent_of_order() {
    let forward = json!([
        { "model": "left",    "score": -0.9, "metadata": { "confidence": 0.5 } },
        { "model": "liberal", "score": -0.1, "metadata": { "confidence": 0.5 } }
    ]);
    let mut reversed = forward.clone();
    reversed.as_array_mut().unwrap().reverse();

    let cfg = CompositeScoreConfig::default().with_policy(MissingPerspectivePolicy::Exclude);
    let calc = DefaultScoreCalculator::new();
    let run = |v: serde_json::Value| {
        let scores: Vec<PerspectiveScore> = serde_json::from_value(v).unwrap();
        assert!(scores.iter().all(|s| s.created_at.is_none()));
        calc.calculate(&scores, &cfg).unwrap()
    };

    let a = run(forward);
    let b = run(reversed);
    assert_eq!(a, b);
    // Equal confidence and no timestamps: "left" sorts before "liberal".
    assert!((a.composite_score - (-0.9)).abs() < 1e-9);
}
