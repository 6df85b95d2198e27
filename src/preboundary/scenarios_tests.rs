//! Scenario Builder Tests
//!
//! - Quantile-to-scenario mapping and derivation
//! - Cross-scenario ordering over random histories
//! - Validation warnings and flagged candidates

use crate::preboundary::config::{PreboundaryConfig, UpliftMode};
use crate::preboundary::proxies::ProxyEstimator;
use crate::preboundary::scenarios::*;
use crate::preboundary::types::*;
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;

fn episode(id: &str, d_now: f64, n_now: f64, d_final: f64, n_final: f64) -> HistoricalEpisode {
    HistoricalEpisode::new(id, DecisionWindow::Day, d_now, n_now, d_final, n_final)
}

/// Six episodes with drifts 0.00..0.25 and relative uplifts 0.0..0.5.
fn ladder(id: &str) -> Vec<HistoricalEpisode> {
    (0..6)
        .map(|i| {
            let i = i as f64;
            episode(id, 1_000.0, 100.0, 1_000.0 * (1.0 + 0.05 * i), 100.0 * (1.0 + 0.1 * i))
        })
        .collect()
}

fn build(
    config: &PreboundaryConfig,
    snapshots: &[CandidateSnapshot],
    episodes: &[HistoricalEpisode],
) -> ScenarioSet {
    let proxies = ProxyEstimator::new(config)
        .estimate_window(DecisionWindow::Day, snapshots, episodes)
        .unwrap();
    build_scenarios(DecisionWindow::Day, snapshots, &proxies, config)
}

// =============================================================================
// MAPPING
// =============================================================================

#[test]
fn test_quantile_mapping_and_derivation() {
    let config = PreboundaryConfig::default();
    let snapshots = vec![CandidateSnapshot::new("a", 2_000.0, 50.0, DecisionWindow::Day)];
    let set = build(&config, &snapshots, &ladder("a"));

    let t = set.triple("a").unwrap();
    // drift quartiles 0.0625 / 0.125 / 0.1875, uplift 0.125 / 0.25 / 0.375
    assert!((t.conservative.drift - 0.1875).abs() < 1e-12);
    assert!((t.conservative.uplift - 0.125).abs() < 1e-12);
    assert!((t.base.drift - 0.125).abs() < 1e-12);
    assert!((t.base.uplift - 0.25).abs() < 1e-12);
    assert!((t.aggressive.drift - 0.0625).abs() < 1e-12);
    assert!((t.aggressive.uplift - 0.375).abs() < 1e-12);

    assert!((t.base.final_denominator - 2_000.0 * 1.125).abs() < 1e-9);
    assert!((t.base.final_numerator - 50.0 * 1.25).abs() < 1e-9);
    assert_eq!(t.base.source_tier, SourceTier::Candidate);
    assert_eq!(t.base.scenario, ScenarioName::Base);

    let validation = validate_scenarios(&set);
    assert!(validation.is_valid, "{:?}", validation.warnings);
}

#[test]
fn test_absolute_uplift_is_additive() {
    let config = PreboundaryConfig {
        uplift_mode: UpliftMode::Absolute,
        ..Default::default()
    };
    let snapshots = vec![CandidateSnapshot::new("a", 2_000.0, 50.0, DecisionWindow::Day)];
    let set = build(&config, &snapshots, &ladder("a"));
    let t = set.triple("a").unwrap();
    // absolute uplifts 0..50 step 10: p50 = 25
    assert!((t.base.final_numerator - 75.0).abs() < 1e-9);
}

#[test]
fn test_snapshot_without_proxies_is_skipped() {
    let config = PreboundaryConfig::default();
    let snapshots = vec![CandidateSnapshot::new("a", 2_000.0, 50.0, DecisionWindow::Day)];
    let proxies = ProxyEstimator::new(&config)
        .estimate_window(DecisionWindow::Day, &snapshots, &ladder("a"))
        .unwrap();

    let mut wider = snapshots.clone();
    wider.push(CandidateSnapshot::new("new", 500.0, 5.0, DecisionWindow::Day));
    let set = build_scenarios(DecisionWindow::Day, &wider, &proxies, &config);
    assert_eq!(set.len(), 1);
    assert!(set.triple("new").is_none());
}

#[test]
fn test_marginal_returns_bps() {
    let config = PreboundaryConfig::default();
    let snapshots = vec![CandidateSnapshot::new("a", 999.0, 100.0, DecisionWindow::Day)];
    let episodes: Vec<_> = (0..6)
        .map(|_| episode("a", 1_000.0, 100.0, 1_000.0, 100.0))
        .collect();
    let set = build(&config, &snapshots, &episodes);
    let bps = set.marginal_returns_bps();
    // 100 / (999 + 1) = 0.1
    assert!((bps.base["a"] - 1_000.0).abs() < 1e-9);
    assert_eq!(bps.conservative["a"], bps.aggressive["a"]);
}

// =============================================================================
// ORDERING PROPERTY
// =============================================================================

#[test]
fn test_ordering_holds_for_random_histories() {
    let config = PreboundaryConfig::default();
    for seed in 0..20 {
        let mut rng = ChaCha8Rng::seed_from_u64(seed);
        let mut snapshots = Vec::new();
        let mut episodes = Vec::new();
        for i in 0..20 {
            let id = format!("g{:02}", i);
            snapshots.push(CandidateSnapshot::new(
                &id,
                rng.gen_range(10.0..1e6),
                rng.gen_range(0.0..1e4),
                DecisionWindow::Day,
            ));
            for _ in 0..rng.gen_range(0..9) {
                let d = rng.gen_range(10.0..1e6);
                let n = rng.gen_range(1.0..1e4);
                episodes.push(episode(
                    &id,
                    d,
                    n,
                    d * rng.gen_range(0.7..1.8),
                    n * rng.gen_range(0.2..3.0),
                ));
            }
        }
        episodes.push(episode("anchor", 100.0, 10.0, 120.0, 11.0));

        let set = build(&config, &snapshots, &episodes);
        for id in set.candidate_ids() {
            let t = set.triple(&id).unwrap();
            assert!(t.conservative.final_denominator >= t.base.final_denominator);
            assert!(t.base.final_denominator >= t.aggressive.final_denominator);
            assert!(t.conservative.final_numerator <= t.base.final_numerator);
            assert!(t.base.final_numerator <= t.aggressive.final_numerator);
            assert!(t.aggressive.final_denominator > 0.0);
            assert!(t.conservative.final_numerator >= 0.0);
        }
        let validation = validate_scenarios(&set);
        assert!(validation.is_valid, "seed {}: {:?}", seed, validation.warnings);
    }
}

// =============================================================================
// VALIDATION
// =============================================================================

fn forecast(scenario: ScenarioName, id: &str, d: f64, n: f64) -> ForecastScenario {
    ForecastScenario {
        scenario,
        candidate_id: id.to_string(),
        decision_window: DecisionWindow::Day,
        drift: 0.0,
        uplift: 0.0,
        final_denominator: d,
        final_numerator: n,
        source_tier: SourceTier::Global,
        confidence_penalty: 0.1,
    }
}

fn set_of(rows: &[(&str, [(f64, f64); 3])]) -> ScenarioSet {
    let mut set = ScenarioSet::new(DecisionWindow::Day);
    for (id, values) in rows {
        for (name, (d, n)) in ScenarioName::ALL.iter().zip(values.iter()) {
            set.insert(forecast(*name, id, *d, *n));
        }
    }
    set
}

#[test]
fn test_validation_flags_each_violation() {
    let set = set_of(&[
        ("good", [(120.0, 8.0), (110.0, 10.0), (100.0, 12.0)]),
        ("swapped_d", [(100.0, 8.0), (110.0, 10.0), (120.0, 12.0)]),
        ("swapped_n", [(120.0, 12.0), (110.0, 10.0), (100.0, 8.0)]),
        ("negative_n", [(120.0, -1.0), (110.0, 10.0), (100.0, 12.0)]),
        ("zero_d", [(120.0, 8.0), (110.0, 10.0), (0.0, 12.0)]),
        ("nan", [(120.0, f64::NAN), (110.0, 10.0), (100.0, 12.0)]),
    ]);
    let validation = validate_scenarios(&set);

    assert!(!validation.is_valid);
    let flagged: Vec<&str> = validation.flagged.iter().map(|s| s.as_str()).collect();
    assert_eq!(
        flagged,
        vec!["nan", "negative_n", "swapped_d", "swapped_n", "zero_d"]
    );
    assert!(validation.warnings.iter().any(|w| w.contains("NaN/Inf")));
    assert!(validation.warnings.iter().any(|w| w.contains("denominator ordering")));
    assert!(validation.warnings.iter().any(|w| w.contains("numerator ordering")));
    assert!(validation.warnings.iter().any(|w| w.contains("final_numerator")));
    assert!(validation.warnings.iter().any(|w| w.contains("final_denominator")));
}

#[test]
fn test_validation_is_pure() {
    let set = set_of(&[("a", [(100.0, 8.0), (110.0, 10.0), (120.0, 12.0)])]);
    let before = set.clone();
    let first = validate_scenarios(&set);
    let second = validate_scenarios(&set);
    assert_eq!(set, before);
    assert_eq!(first, second);
}
