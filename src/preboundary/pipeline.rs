//! Decision Pipeline
//!
//! Estimator → Builder → Optimizer → Validator for one decision window.
//! Pure function of (snapshots, episodes, config); no I/O.

use crate::preboundary::config::{InvalidCandidatePolicy, PreboundaryConfig};
use crate::preboundary::error::{PreboundaryError, Result};
use crate::preboundary::guardrails::{validate_allocation, ValidationReport};
use crate::preboundary::optimizer::{AllocationResult, PortfolioOptimizer};
use crate::preboundary::proxies::{validate_proxies, ProxyEstimator, WindowProxies};
use crate::preboundary::scenarios::{build_scenarios, validate_scenarios, ScenarioSet, ScenarioValidation};
use crate::preboundary::types::{CandidateId, CandidateSnapshot, DecisionWindow, HistoricalEpisode};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use tracing::warn;

/// Everything produced for one decision window.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DecisionOutcome {
    pub window: DecisionWindow,
    /// Proxy quartiles passed the consistency checks.
    pub proxy_consistent: bool,
    pub proxy_warnings: Vec<String>,
    /// Scenarios as built, before any exclusion.
    pub scenarios: ScenarioSet,
    pub scenario_validation: ScenarioValidation,
    /// Candidates dropped by the exclude policy.
    pub excluded: BTreeSet<CandidateId>,
    pub allocation: AllocationResult,
    pub report: ValidationReport,
}

impl DecisionOutcome {
    /// Scenario set the optimizer actually saw.
    pub fn optimized_scenarios(&self) -> ScenarioSet {
        self.scenarios.excluding(&self.excluded)
    }
}

/// Build scenarios from existing proxies, optimize and validate.
pub fn run_decision(
    config: &PreboundaryConfig,
    window: DecisionWindow,
    snapshots: &[CandidateSnapshot],
    proxies: &WindowProxies,
) -> Result<DecisionOutcome> {
    config.validate()?;

    let (proxy_consistent, proxy_warnings) = validate_proxies(proxies);
    let scenarios = build_scenarios(window, snapshots, proxies, config);
    let scenario_validation = validate_scenarios(&scenarios);

    let excluded = if scenario_validation.is_valid {
        BTreeSet::new()
    } else {
        match config.invalid_candidate_policy {
            InvalidCandidatePolicy::Abort => {
                return Err(PreboundaryError::ScenarioValidationFailed {
                    window,
                    warnings: scenario_validation.warnings,
                });
            }
            InvalidCandidatePolicy::Exclude => {
                warn!(
                    "Excluding {} flagged candidates from window {}: {:?}",
                    scenario_validation.flagged.len(),
                    window,
                    scenario_validation.flagged
                );
                scenario_validation.flagged.clone()
            }
        }
    };

    let usable = scenarios.excluding(&excluded);
    let allocation = PortfolioOptimizer::new(config).optimize(&usable);
    let report = validate_allocation(&allocation, &usable.candidate_ids(), config);

    Ok(DecisionOutcome {
        window,
        proxy_consistent,
        proxy_warnings,
        scenarios,
        scenario_validation,
        excluded,
        allocation,
        report,
    })
}

/// Full run for one window: estimate proxies from history, then decide.
pub fn run_pipeline(
    config: &PreboundaryConfig,
    window: DecisionWindow,
    snapshots: &[CandidateSnapshot],
    episodes: &[HistoricalEpisode],
) -> Result<DecisionOutcome> {
    config.validate()?;
    let proxies = ProxyEstimator::new(config).estimate_window(window, snapshots, episodes)?;
    run_decision(config, window, snapshots, &proxies)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn inputs() -> (Vec<CandidateSnapshot>, Vec<HistoricalEpisode>) {
        let snapshots = vec![
            CandidateSnapshot::new("a", 1_000.0, 50.0, DecisionWindow::Day),
            CandidateSnapshot::new("b", 2_000.0, 40.0, DecisionWindow::Day),
        ];
        let episodes = ["a", "b"]
            .iter()
            .flat_map(|id| {
                (0..6).map(move |i| {
                    HistoricalEpisode::new(
                        *id,
                        DecisionWindow::Day,
                        1_000.0,
                        50.0,
                        1_000.0 * (1.0 + 0.02 * i as f64),
                        50.0 * (1.0 + 0.05 * i as f64),
                    )
                })
            })
            .collect();
        (snapshots, episodes)
    }

    fn config() -> PreboundaryConfig {
        PreboundaryConfig {
            budget: 1_000.0,
            min_allocation_threshold: 0.0,
            ..Default::default()
        }
    }

    #[test]
    fn test_consistent_proxies_are_flagged_consistent() {
        let (snapshots, episodes) = inputs();
        let outcome = run_pipeline(&config(), DecisionWindow::Day, &snapshots, &episodes).unwrap();
        assert!(outcome.proxy_consistent);
        assert!(outcome.proxy_warnings.is_empty());
    }

    #[test]
    fn test_inconsistent_proxies_reported_without_parsing_warnings() {
        let config = config();
        let (snapshots, episodes) = inputs();
        let mut proxies = ProxyEstimator::new(&config)
            .estimate_window(DecisionWindow::Day, &snapshots, &episodes)
            .unwrap();
        if let Some(a) = proxies.candidates.get_mut("a") {
            a.drift.p25 = a.drift.p75 + 0.1;
        }

        let outcome = run_decision(&config, DecisionWindow::Day, &snapshots, &proxies).unwrap();
        assert!(!outcome.proxy_consistent);
        assert_eq!(outcome.proxy_warnings.len(), 1);
    }

    #[test]
    fn test_abort_policy_fails_on_flagged_candidates() {
        let config = PreboundaryConfig {
            invalid_candidate_policy: InvalidCandidatePolicy::Abort,
            ..config()
        };
        let (snapshots, episodes) = inputs();
        let mut proxies = ProxyEstimator::new(&config)
            .estimate_window(DecisionWindow::Day, &snapshots, &episodes)
            .unwrap();
        if let Some(a) = proxies.candidates.get_mut("a") {
            a.uplift.p25 = f64::NAN;
        }

        let err = run_decision(&config, DecisionWindow::Day, &snapshots, &proxies).unwrap_err();
        assert!(matches!(err, PreboundaryError::ScenarioValidationFailed { .. }));
        assert!(!err.is_data_error());
    }
}
