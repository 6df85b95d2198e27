//! Scenario Builder
//!
//! Turns current candidate state plus learned proxies into three forecasts
//! per candidate:
//!
//! | scenario     | drift | uplift |
//! |--------------|-------|--------|
//! | conservative | p75   | p25    |
//! | base         | p50   | p50    |
//! | aggressive   | p25   | p75    |
//!
//! Derived values are never clamped. A bad candidate is flagged by
//! [`validate_scenarios`] and the caller decides to exclude it or abort.

use crate::preboundary::config::{PreboundaryConfig, UpliftMode};
use crate::preboundary::proxies::{CandidateProxies, WindowProxies};
use crate::preboundary::types::{
    CandidateId, CandidateSnapshot, DecisionWindow, ScenarioName, ScenarioValues, SourceTier,
};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use tracing::{debug, info, warn};

/// One candidate's forecast under one scenario.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ForecastScenario {
    pub scenario: ScenarioName,
    pub candidate_id: CandidateId,
    pub decision_window: DecisionWindow,
    pub drift: f64,
    pub uplift: f64,
    pub final_denominator: f64,
    pub final_numerator: f64,
    pub source_tier: SourceTier,
    pub confidence_penalty: f64,
}

impl ForecastScenario {
    /// Return per unit for the first unit allocated: `N / (D + 1)`.
    pub fn marginal_return(&self) -> f64 {
        if self.final_denominator <= 0.0 {
            return 0.0;
        }
        self.final_numerator / (self.final_denominator + 1.0)
    }

    fn is_finite(&self) -> bool {
        self.drift.is_finite()
            && self.uplift.is_finite()
            && self.final_denominator.is_finite()
            && self.final_numerator.is_finite()
    }
}

/// All forecasts of one decision window, keyed by scenario then candidate.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ScenarioSet {
    pub window: DecisionWindow,
    pub scenarios: ScenarioValues<BTreeMap<CandidateId, ForecastScenario>>,
}

impl ScenarioSet {
    pub fn new(window: DecisionWindow) -> Self {
        Self {
            window,
            scenarios: ScenarioValues::default(),
        }
    }

    pub fn insert(&mut self, forecast: ForecastScenario) {
        self.scenarios
            .get_mut(forecast.scenario)
            .insert(forecast.candidate_id.clone(), forecast);
    }

    /// Every candidate appearing in at least one scenario.
    pub fn candidate_ids(&self) -> BTreeSet<CandidateId> {
        self.scenarios
            .iter()
            .flat_map(|(_, by_id)| by_id.keys().cloned())
            .collect()
    }

    /// The three forecasts of a candidate, if it is present in all of them.
    pub fn triple(&self, candidate_id: &str) -> Option<ScenarioValues<&ForecastScenario>> {
        Some(ScenarioValues::new(
            self.scenarios.conservative.get(candidate_id)?,
            self.scenarios.base.get(candidate_id)?,
            self.scenarios.aggressive.get(candidate_id)?,
        ))
    }

    /// Copy of the set without `excluded` candidates.
    pub fn excluding(&self, excluded: &BTreeSet<CandidateId>) -> Self {
        Self {
            window: self.window,
            scenarios: self.scenarios.map(|_, by_id| {
                by_id
                    .iter()
                    .filter(|(id, _)| !excluded.contains(*id))
                    .map(|(id, f)| (id.clone(), f.clone()))
                    .collect()
            }),
        }
    }

    /// Per-candidate first-unit return in basis points, per scenario.
    pub fn marginal_returns_bps(&self) -> ScenarioValues<BTreeMap<CandidateId, f64>> {
        self.scenarios.map(|_, by_id| {
            by_id
                .iter()
                .map(|(id, f)| (id.clone(), f.marginal_return() * 10_000.0))
                .collect()
        })
    }

    pub fn len(&self) -> usize {
        self.candidate_ids().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

// =============================================================================
// BUILD
// =============================================================================

/// Build the three scenarios for every snapshot of `window` that has proxies.
///
/// Snapshots without proxies are skipped with a warning.
pub fn build_scenarios(
    window: DecisionWindow,
    snapshots: &[CandidateSnapshot],
    proxies: &WindowProxies,
    config: &PreboundaryConfig,
) -> ScenarioSet {
    let mut set = ScenarioSet::new(window);
    let mut skipped = 0usize;

    for snapshot in snapshots.iter().filter(|s| s.decision_window == window) {
        let Some(candidate) = proxies.get(&snapshot.id) else {
            warn!(
                "Missing proxy estimates for candidate {} ({})",
                snapshot.id, window
            );
            skipped += 1;
            continue;
        };
        for scenario in ScenarioName::ALL {
            set.insert(forecast(scenario, snapshot, candidate, config.uplift_mode));
        }
        debug!(
            "Scenarios {} ({}): D_final {:.1}/{:.1}/{:.1}",
            snapshot.id,
            window,
            set.scenarios.conservative[&snapshot.id].final_denominator,
            set.scenarios.base[&snapshot.id].final_denominator,
            set.scenarios.aggressive[&snapshot.id].final_denominator,
        );
    }

    info!(
        "Built scenarios for {} candidates in window {} ({} skipped)",
        set.scenarios.base.len(),
        window,
        skipped
    );
    set
}

fn forecast(
    scenario: ScenarioName,
    snapshot: &CandidateSnapshot,
    proxies: &CandidateProxies,
    mode: UpliftMode,
) -> ForecastScenario {
    let (drift, uplift) = match scenario {
        ScenarioName::Conservative => (proxies.drift.p75, proxies.uplift.p25),
        ScenarioName::Base => (proxies.drift.p50, proxies.uplift.p50),
        ScenarioName::Aggressive => (proxies.drift.p25, proxies.uplift.p75),
    };
    let final_numerator = match mode {
        UpliftMode::Relative => snapshot.numerator_now * (1.0 + uplift),
        UpliftMode::Absolute => snapshot.numerator_now + uplift,
    };
    ForecastScenario {
        scenario,
        candidate_id: snapshot.id.clone(),
        decision_window: snapshot.decision_window,
        drift,
        uplift,
        final_denominator: snapshot.denominator_now * (1.0 + drift),
        final_numerator,
        source_tier: proxies.source_tier(),
        confidence_penalty: proxies.confidence_penalty(),
    }
}

// =============================================================================
// VALIDATION
// =============================================================================

/// Outcome of [`validate_scenarios`].
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ScenarioValidation {
    pub is_valid: bool,
    pub warnings: Vec<String>,
    /// Candidates with at least one warning.
    pub flagged: BTreeSet<CandidateId>,
}

/// Check presence, finiteness, positivity and cross-scenario ordering.
///
/// Never fails; every violation becomes one warning and flags its candidate.
pub fn validate_scenarios(set: &ScenarioSet) -> ScenarioValidation {
    let mut warnings = Vec::new();
    let mut flagged = BTreeSet::new();

    for id in set.candidate_ids() {
        let before = warnings.len();

        let Some(t) = set.triple(&id) else {
            let missing: Vec<&str> = ScenarioName::ALL
                .iter()
                .filter(|name| !set.scenarios.get(**name).contains_key(&id))
                .map(|name| name.as_str())
                .collect();
            warnings.push(format!("{}: missing from scenarios {:?}", id, missing));
            flagged.insert(id);
            continue;
        };

        for (name, f) in t.iter() {
            if !f.is_finite() {
                warnings.push(format!("{}: NaN/Inf in {} scenario", id, name));
                continue;
            }
            if f.final_denominator <= 0.0 {
                warnings.push(format!(
                    "{}: {} final_denominator {:.4} <= 0",
                    id, name, f.final_denominator
                ));
            }
            if f.final_numerator < 0.0 {
                warnings.push(format!(
                    "{}: {} final_numerator {:.4} < 0",
                    id, name, f.final_numerator
                ));
            }
        }

        let (c, b, a) = (t.conservative, t.base, t.aggressive);
        if !(c.final_denominator >= b.final_denominator && b.final_denominator >= a.final_denominator) {
            warnings.push(format!(
                "{}: denominator ordering violated cons={:.4} base={:.4} aggr={:.4}",
                id, c.final_denominator, b.final_denominator, a.final_denominator
            ));
        }
        if !(c.final_numerator <= b.final_numerator && b.final_numerator <= a.final_numerator) {
            warnings.push(format!(
                "{}: numerator ordering violated cons={:.4} base={:.4} aggr={:.4}",
                id, c.final_numerator, b.final_numerator, a.final_numerator
            ));
        }

        if warnings.len() > before {
            flagged.insert(id);
        }
    }

    if !flagged.is_empty() {
        warn!(
            "Scenario validation for window {} flagged {} candidates ({} warnings)",
            set.window,
            flagged.len(),
            warnings.len()
        );
    }

    ScenarioValidation {
        is_valid: warnings.is_empty(),
        warnings,
        flagged,
    }
}
