// tests/scoring.rs
//
// Scoring invariants: overall in [0,1], deterministic strategies,
// degraded results on zero weights, neutral fallback for missing features.

use std::collections::BTreeMap;

use chrono::{Duration, TimeZone, Utc};
use proptest::prelude::*;

use confidence_engine::dimensions::NEUTRAL_SCORE;
use confidence_engine::features::{CategorySignal, FileKind, StructuralFeatures};
use confidence_engine::scoring::{combine, ScoringEngine};
use confidence_engine::{Dimension, FeatureSet, ScoringStrategy, WeightVector};

fn full_features() -> FeatureSet {
    let now = Utc.with_ymd_and_hms(2025, 9, 1, 12, 0, 0).unwrap();
    FeatureSet::empty(now)
        .with_embedding(vec![0.05, -0.03, 0.08, 0.01, -0.07, 0.02])
        .with_categories(vec![
            CategorySignal::new("guides", 0.9),
            CategorySignal::new("reference", 0.7),
            CategorySignal::new("api", 0.8),
        ])
        .with_structure(StructuralFeatures {
            sections: 4,
            lists: 2,
            code_blocks: 1,
            has_title: true,
            formatting: 6,
            file_kind: FileKind::Markdown,
        })
        .with_timestamps(now - Duration::days(30), Some(now - Duration::days(2)))
}

#[test]
fn weighted_average_scenario() {
    let dims = BTreeMap::from([
        (Dimension::Semantic, 0.8),
        (Dimension::Categorical, 0.6),
        (Dimension::Structural, 0.7),
        (Dimension::Temporal, 0.5),
    ]);
    let overall = combine(&ScoringStrategy::WeightedAverage, &dims, &WeightVector::default()).unwrap();
    assert!((overall - 0.66).abs() < 1e-12, "got {overall}");
}

#[test]
fn zero_total_weight_gives_degraded_result() {
    let engine = ScoringEngine::default();
    let zero = WeightVector::from_pairs([]);
    let r = engine.score("doc", &full_features(), &zero);
    assert!(r.degraded);
    assert_eq!(r.overall, 0.0);
    assert_eq!(r.dimensions.len(), 4);
}

#[test]
fn missing_features_score_neutral() {
    let engine = ScoringEngine::default();
    let r = engine.score("doc", &FeatureSet::empty(Utc::now()), &WeightVector::default());
    assert!(!r.degraded);
    assert_eq!(r.missing.len(), 4);
    for d in Dimension::ALL {
        assert_eq!(r.dimensions[&d], NEUTRAL_SCORE);
    }
    assert!((r.overall - NEUTRAL_SCORE).abs() < 1e-12);
}

#[test]
fn full_features_use_every_scorer() {
    let engine = ScoringEngine::default();
    let r = engine.score("doc", &full_features(), &WeightVector::default());
    assert!(r.missing.is_empty(), "missing: {:?}", r.missing);
    assert_eq!(r.timestamp, full_features().observed_at);
    assert_eq!(r.strategy, "weighted_average");
}

#[test]
fn scoring_is_idempotent_for_every_strategy() {
    let f = full_features();
    let w = WeightVector::default();
    for label in ["weighted_average", "bagging", "boosting", "perceptron"] {
        let engine = ScoringEngine::new(ScoringStrategy::from_label(label).unwrap());
        let a = engine.score("doc", &f, &w);
        let b = engine.score("doc", &f, &w);
        assert_eq!(a.overall.to_bits(), b.overall.to_bits(), "{label}");
        assert_eq!(a, b);
    }
}

fn arb_features() -> impl Strategy<Value = FeatureSet> {
    (
        proptest::option::of(proptest::collection::vec(-2.0f64..2.0, 0..32)),
        proptest::collection::vec(("[a-z]{1,6}", 0.0f64..=1.0), 0..8),
        proptest::option::of((0u32..20, 0u32..20, 0u32..20, any::<bool>(), 0u32..40)),
        proptest::option::of((0i64..3650, 0i64..3650)),
    )
        .prop_map(|(embedding, cats, structure, ages)| {
            let now = Utc.with_ymd_and_hms(2025, 1, 1, 0, 0, 0).unwrap();
            let mut f = FeatureSet::empty(now);
            if let Some(e) = embedding {
                f = f.with_embedding(e);
            }
            f = f.with_categories(cats.into_iter().map(|(n, c)| CategorySignal::new(n, c)).collect());
            if let Some((sections, lists, code_blocks, has_title, formatting)) = structure {
                f = f.with_structure(StructuralFeatures {
                    sections,
                    lists,
                    code_blocks,
                    has_title,
                    formatting,
                    file_kind: FileKind::PlainText,
                });
            }
            if let Some((created, modified)) = ages {
                let created_at = now - Duration::days(created.max(modified));
                f = f.with_timestamps(created_at, Some(now - Duration::days(created.min(modified))));
            }
            f
        })
}

proptest! {
    #[test]
    fn overall_always_in_unit_interval(
        features in arb_features(),
        strategy in prop_oneof![
            Just("weighted_average"),
            Just("bagging"),
            Just("boosting"),
            Just("perceptron"),
        ],
        ws in proptest::collection::vec(0.0f64..1.0, 4),
    ) {
        let engine = ScoringEngine::new(ScoringStrategy::from_label(strategy).unwrap());
        let weights = WeightVector::from_pairs(Dimension::ALL.iter().copied().zip(ws));
        let r = engine.score("doc", &features, &weights);
        prop_assert!((0.0..=1.0).contains(&r.overall), "overall {}", r.overall);
        for v in r.dimensions.values() {
            prop_assert!((0.0..=1.0).contains(v));
        }
    }
}
