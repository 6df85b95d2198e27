//! Core Value Types
//!
//! Candidate snapshots, resolved historical episodes, and the small enums
//! (decision window, scenario, source tier) shared by every stage.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Stable identifier of a candidate (e.g. a gauge address).
pub type CandidateId = String;

// =============================================================================
// DECISION WINDOWS
// =============================================================================

/// Named instant, relative to the resolution boundary, at which a forecast is made.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub enum DecisionWindow {
    /// 24 hours before the boundary.
    #[default]
    #[serde(rename = "day")]
    Day,
    /// 1 minute before the boundary.
    #[serde(rename = "T-1")]
    TMinus1,
    /// At the boundary timestamp.
    #[serde(rename = "boundary")]
    Boundary,
}

impl DecisionWindow {
    pub const ALL: [DecisionWindow; 3] = [
        DecisionWindow::Day,
        DecisionWindow::TMinus1,
        DecisionWindow::Boundary,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            DecisionWindow::Day => "day",
            DecisionWindow::TMinus1 => "T-1",
            DecisionWindow::Boundary => "boundary",
        }
    }

    pub fn seconds_before_boundary(&self) -> u64 {
        match self {
            DecisionWindow::Day => 86_400,
            DecisionWindow::TMinus1 => 60,
            DecisionWindow::Boundary => 0,
        }
    }
}

impl fmt::Display for DecisionWindow {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DecisionWindow {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "day" => Ok(DecisionWindow::Day),
            "T-1" | "t-1" => Ok(DecisionWindow::TMinus1),
            "boundary" => Ok(DecisionWindow::Boundary),
            other => Err(format!(
                "unknown decision window '{}' (expected day, T-1 or boundary)",
                other
            )),
        }
    }
}

// =============================================================================
// INPUTS
// =============================================================================

/// Staleness markers set by the fetch layer on a snapshot's inputs.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StalenessFlags {
    #[serde(default)]
    pub denominator: bool,
    #[serde(default)]
    pub numerator: bool,
    /// Token prices used to value the numerator are older than allowed.
    #[serde(default)]
    pub price: bool,
}

impl StalenessFlags {
    pub fn is_stale(&self) -> bool {
        self.denominator || self.numerator || self.price
    }
}

/// Current observed state of one candidate at a decision instant.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CandidateSnapshot {
    pub id: CandidateId,
    /// Competitive weight already committed by others.
    pub denominator_now: f64,
    /// Currently visible reward pool.
    pub numerator_now: f64,
    pub decision_window: DecisionWindow,
    #[serde(default, alias = "staleness_flags")]
    pub staleness: StalenessFlags,
}

impl CandidateSnapshot {
    pub fn new(
        id: impl Into<String>,
        denominator_now: f64,
        numerator_now: f64,
        decision_window: DecisionWindow,
    ) -> Self {
        Self {
            id: id.into(),
            denominator_now,
            numerator_now,
            decision_window,
            staleness: StalenessFlags::default(),
        }
    }

    pub fn with_staleness(mut self, staleness: StalenessFlags) -> Self {
        self.staleness = staleness;
        self
    }
}

/// One resolved (decision instant, resolution instant) pair for a candidate.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HistoricalEpisode {
    pub candidate_id: CandidateId,
    pub decision_window: DecisionWindow,
    pub denominator_now: f64,
    pub numerator_now: f64,
    pub final_denominator: f64,
    pub final_numerator: f64,
    /// Resolution epoch, when the source records one.
    #[serde(default)]
    pub epoch: Option<u64>,
}

impl HistoricalEpisode {
    pub fn new(
        candidate_id: impl Into<String>,
        decision_window: DecisionWindow,
        denominator_now: f64,
        numerator_now: f64,
        final_denominator: f64,
        final_numerator: f64,
    ) -> Self {
        Self {
            candidate_id: candidate_id.into(),
            decision_window,
            denominator_now,
            numerator_now,
            final_denominator,
            final_numerator,
            epoch: None,
        }
    }
}

// =============================================================================
// SCENARIOS
// =============================================================================

/// One of the three named forecasts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ScenarioName {
    Conservative,
    Base,
    Aggressive,
}

impl ScenarioName {
    pub const ALL: [ScenarioName; 3] = [
        ScenarioName::Conservative,
        ScenarioName::Base,
        ScenarioName::Aggressive,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ScenarioName::Conservative => "conservative",
            ScenarioName::Base => "base",
            ScenarioName::Aggressive => "aggressive",
        }
    }
}

impl fmt::Display for ScenarioName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One value per scenario, addressed by [`ScenarioName`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct ScenarioValues<T> {
    pub conservative: T,
    pub base: T,
    pub aggressive: T,
}

impl<T> ScenarioValues<T> {
    pub fn new(conservative: T, base: T, aggressive: T) -> Self {
        Self {
            conservative,
            base,
            aggressive,
        }
    }

    pub fn from_fn(mut f: impl FnMut(ScenarioName) -> T) -> Self {
        Self {
            conservative: f(ScenarioName::Conservative),
            base: f(ScenarioName::Base),
            aggressive: f(ScenarioName::Aggressive),
        }
    }

    pub fn get(&self, name: ScenarioName) -> &T {
        match name {
            ScenarioName::Conservative => &self.conservative,
            ScenarioName::Base => &self.base,
            ScenarioName::Aggressive => &self.aggressive,
        }
    }

    pub fn get_mut(&mut self, name: ScenarioName) -> &mut T {
        match name {
            ScenarioName::Conservative => &mut self.conservative,
            ScenarioName::Base => &mut self.base,
            ScenarioName::Aggressive => &mut self.aggressive,
        }
    }

    pub fn map<U>(&self, mut f: impl FnMut(ScenarioName, &T) -> U) -> ScenarioValues<U> {
        ScenarioValues {
            conservative: f(ScenarioName::Conservative, &self.conservative),
            base: f(ScenarioName::Base, &self.base),
            aggressive: f(ScenarioName::Aggressive, &self.aggressive),
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = (ScenarioName, &T)> {
        [
            (ScenarioName::Conservative, &self.conservative),
            (ScenarioName::Base, &self.base),
            (ScenarioName::Aggressive, &self.aggressive),
        ]
        .into_iter()
    }
}

// =============================================================================
// ESTIMATE PROVENANCE
// =============================================================================

/// Level of the fallback hierarchy that produced an estimate.
///
/// Ordered from weakest to strongest so `min` picks the weaker tier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SourceTier {
    Global,
    Cluster,
    Candidate,
}

impl SourceTier {
    pub fn as_str(&self) -> &'static str {
        match self {
            SourceTier::Global => "global",
            SourceTier::Cluster => "cluster",
            SourceTier::Candidate => "candidate",
        }
    }
}

impl fmt::Display for SourceTier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Quantity learned by the proxy estimator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Quantity {
    /// Relative change of the denominator between decision and resolution.
    Drift,
    /// Change of the numerator between decision and resolution.
    Uplift,
}

impl fmt::Display for Quantity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Quantity::Drift => f.write_str("drift"),
            Quantity::Uplift => f.write_str("uplift"),
        }
    }
}

/// Quartile bucket of current numerator magnitude used for cluster fallback.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NumeratorCluster {
    Low,
    MidLow,
    MidHigh,
    High,
}

impl NumeratorCluster {
    pub const ALL: [NumeratorCluster; 4] = [
        NumeratorCluster::Low,
        NumeratorCluster::MidLow,
        NumeratorCluster::MidHigh,
        NumeratorCluster::High,
    ];
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decision_window_serde_names() {
        let json = serde_json::to_string(&DecisionWindow::TMinus1).unwrap();
        assert_eq!(json, "\"T-1\"");
        let parsed: DecisionWindow = serde_json::from_str("\"boundary\"").unwrap();
        assert_eq!(parsed, DecisionWindow::Boundary);
        assert_eq!("day".parse::<DecisionWindow>().unwrap(), DecisionWindow::Day);
        assert!("week".parse::<DecisionWindow>().is_err());
    }

    #[test]
    fn test_source_tier_ordering_weakest_first() {
        assert!(SourceTier::Global < SourceTier::Cluster);
        assert!(SourceTier::Cluster < SourceTier::Candidate);
        assert_eq!(
            SourceTier::Candidate.min(SourceTier::Cluster),
            SourceTier::Cluster
        );
    }

    #[test]
    fn test_snapshot_accepts_staleness_flags_alias() {
        let json = r#"{
            "id": "g1",
            "denominator_now": 100.0,
            "numerator_now": 5.0,
            "decision_window": "day",
            "staleness_flags": { "price": true }
        }"#;
        let snap: CandidateSnapshot = serde_json::from_str(json).unwrap();
        assert!(snap.staleness.is_stale());
        assert!(snap.staleness.price);
        assert!(!snap.staleness.numerator);
    }

    #[test]
    fn test_scenario_values_accessors() {
        let mut values = ScenarioValues::new(1.0, 2.0, 3.0);
        assert_eq!(*values.get(ScenarioName::Base), 2.0);
        *values.get_mut(ScenarioName::Aggressive) = 4.0;
        let doubled = values.map(|_, v| v * 2.0);
        assert_eq!(doubled.aggressive, 8.0);
        let names: Vec<_> = values.iter().map(|(n, _)| n).collect();
        assert_eq!(names, ScenarioName::ALL.to_vec());
    }
}
