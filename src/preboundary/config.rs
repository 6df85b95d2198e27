//! Allocation Configuration
//!
//! One immutable value passed by reference into every stage. Loaded from
//! TOML; every field has a default so partial files are accepted.

use crate::preboundary::error::{PreboundaryError, Result};
use crate::preboundary::types::ScenarioName;
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Top-level configuration for estimation, scenario building and optimization.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PreboundaryConfig {
    /// Total units to allocate in one decision (V).
    #[serde(default = "default_budget")]
    pub budget: f64,

    /// Risk penalty on downside (λ_risk).
    #[serde(default = "default_lambda_risk")]
    pub lambda_risk: f64,

    /// Maximum number of candidates receiving a nonzero allocation.
    #[serde(default = "default_k_max")]
    pub k_max: usize,

    /// Minimum units for any candidate that receives a nonzero allocation.
    #[serde(default = "default_min_allocation_threshold")]
    pub min_allocation_threshold: f64,

    /// Episodes a candidate needs before its own quantiles are used.
    #[serde(default = "default_min_candidate_observations")]
    pub min_candidate_observations: usize,

    /// Pooled episodes a numerator cluster needs before cluster quantiles are used.
    #[serde(default = "default_min_cluster_observations")]
    pub min_cluster_observations: usize,

    /// Upper bound on the summed confidence penalty.
    #[serde(default = "default_confidence_penalty_cap")]
    pub confidence_penalty_cap: f64,

    #[serde(default)]
    pub uplift_mode: UpliftMode,

    #[serde(default)]
    pub invalid_candidate_policy: InvalidCandidatePolicy,

    // Tables last so the TOML writer never emits a value after a table.
    #[serde(default)]
    pub scenario_weights: ScenarioWeights,

    #[serde(default)]
    pub penalties: PenaltyWeights,

    #[serde(default)]
    pub solver: SolverConfig,
}

fn default_budget() -> f64 {
    1_000_000.0
}
fn default_lambda_risk() -> f64 {
    0.20
}
fn default_k_max() -> usize {
    5
}
fn default_min_allocation_threshold() -> f64 {
    50_000.0
}
fn default_min_candidate_observations() -> usize {
    6
}
fn default_min_cluster_observations() -> usize {
    4
}
fn default_confidence_penalty_cap() -> f64 {
    0.30
}

impl Default for PreboundaryConfig {
    fn default() -> Self {
        Self {
            budget: default_budget(),
            lambda_risk: default_lambda_risk(),
            k_max: default_k_max(),
            min_allocation_threshold: default_min_allocation_threshold(),
            min_candidate_observations: default_min_candidate_observations(),
            min_cluster_observations: default_min_cluster_observations(),
            confidence_penalty_cap: default_confidence_penalty_cap(),
            uplift_mode: UpliftMode::default(),
            invalid_candidate_policy: InvalidCandidatePolicy::default(),
            scenario_weights: ScenarioWeights::default(),
            penalties: PenaltyWeights::default(),
            solver: SolverConfig::default(),
        }
    }
}

impl PreboundaryConfig {
    /// Load from TOML file
    pub fn load(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        let config: Self = toml::from_str(&contents)?;
        config.validate()?;
        Ok(config)
    }

    /// Load from environment or default path
    pub fn from_env() -> Self {
        let path = std::env::var("PREBOUNDARY_CONFIG_PATH")
            .unwrap_or_else(|_| "preboundary.toml".to_string());

        Self::load(&path).unwrap_or_else(|e| {
            tracing::debug!("Using default preboundary config ({}): {}", path, e);
            Self::default()
        })
    }

    /// Save to TOML file
    pub fn save(&self, path: impl AsRef<Path>) -> anyhow::Result<()> {
        let contents = toml::to_string_pretty(self)?;
        std::fs::write(path, contents)?;
        Ok(())
    }

    /// Same config with a different budget.
    pub fn with_budget(&self, budget: f64) -> Self {
        Self {
            budget,
            ..self.clone()
        }
    }

    /// Check every documented bound.
    pub fn validate(&self) -> Result<()> {
        let invalid = |msg: String| Err(PreboundaryError::InvalidConfig(msg));

        self.scenario_weights.validate()?;

        if !self.budget.is_finite() || self.budget < 0.0 {
            return invalid(format!("budget must be finite and >= 0, got {}", self.budget));
        }
        if !self.lambda_risk.is_finite() || self.lambda_risk < 0.0 {
            return invalid(format!("lambda_risk must be >= 0, got {}", self.lambda_risk));
        }
        if self.k_max == 0 {
            return invalid("k_max must be a positive integer".to_string());
        }
        if !self.min_allocation_threshold.is_finite() || self.min_allocation_threshold < 0.0 {
            return invalid(format!(
                "min_allocation_threshold must be finite and >= 0, got {}",
                self.min_allocation_threshold
            ));
        }
        if self.min_candidate_observations == 0 || self.min_cluster_observations == 0 {
            return invalid("observation minimums must be >= 1".to_string());
        }
        if !(0.0..=1.0).contains(&self.confidence_penalty_cap) {
            return invalid(format!(
                "confidence_penalty_cap must be in [0, 1], got {}",
                self.confidence_penalty_cap
            ));
        }
        self.penalties.validate()?;
        self.solver.validate()?;
        Ok(())
    }
}

// =============================================================================
// SECTIONS
// =============================================================================

/// Probability weights of the three scenarios. Must sum to 1.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ScenarioWeights {
    pub conservative: f64,
    pub base: f64,
    pub aggressive: f64,
}

impl Default for ScenarioWeights {
    fn default() -> Self {
        Self {
            conservative: 0.25,
            base: 0.50,
            aggressive: 0.25,
        }
    }
}

impl ScenarioWeights {
    pub fn weight(&self, name: ScenarioName) -> f64 {
        match name {
            ScenarioName::Conservative => self.conservative,
            ScenarioName::Base => self.base,
            ScenarioName::Aggressive => self.aggressive,
        }
    }

    pub fn validate(&self) -> Result<()> {
        let all = [self.conservative, self.base, self.aggressive];
        if all.iter().any(|w| !w.is_finite() || *w < 0.0) {
            return Err(PreboundaryError::InvalidConfig(format!(
                "scenario weights must be finite and >= 0, got {:?}",
                all
            )));
        }
        let sum: f64 = all.iter().sum();
        if (sum - 1.0).abs() > 1e-9 {
            return Err(PreboundaryError::InvalidConfig(format!(
                "scenario weights must sum to 1, got {}",
                sum
            )));
        }
        Ok(())
    }
}

/// Additive confidence penalty weights (capped by `confidence_penalty_cap`).
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PenaltyWeights {
    /// Applied when an estimate does not come from the candidate's own history.
    #[serde(default = "default_sparse_history")]
    pub sparse_history: f64,
    /// Applied when the drift inter-quartile range exceeds `high_variance_iqr`.
    #[serde(default = "default_high_variance")]
    pub high_variance: f64,
    /// Applied when the caller flags the candidate's current inputs as stale.
    #[serde(default = "default_stale_input")]
    pub stale_input: f64,
    #[serde(default = "default_high_variance_iqr")]
    pub high_variance_iqr: f64,
}

fn default_sparse_history() -> f64 {
    0.10
}
fn default_high_variance() -> f64 {
    0.10
}
fn default_stale_input() -> f64 {
    0.15
}
fn default_high_variance_iqr() -> f64 {
    0.20
}

impl Default for PenaltyWeights {
    fn default() -> Self {
        Self {
            sparse_history: default_sparse_history(),
            high_variance: default_high_variance(),
            stale_input: default_stale_input(),
            high_variance_iqr: default_high_variance_iqr(),
        }
    }
}

impl PenaltyWeights {
    fn validate(&self) -> Result<()> {
        let all = [
            self.sparse_history,
            self.high_variance,
            self.stale_input,
            self.high_variance_iqr,
        ];
        if all.iter().any(|w| !w.is_finite() || *w < 0.0) {
            return Err(PreboundaryError::InvalidConfig(format!(
                "penalty weights must be finite and >= 0, got {:?}",
                all
            )));
        }
        Ok(())
    }
}

/// How numerator uplift is learned and applied.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UpliftMode {
    /// `uplift = (final - now) / now`, applied as `now * (1 + uplift)`.
    #[default]
    Relative,
    /// `uplift = final - now`, applied as `now + uplift`.
    Absolute,
}

/// What the pipeline does with candidates flagged by scenario validation.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InvalidCandidatePolicy {
    /// Drop flagged candidates and optimize over the rest.
    #[default]
    Exclude,
    /// Fail the decision with `ScenarioValidationFailed`.
    Abort,
}

/// Continuous allocation strategy.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SolverMode {
    /// Bisection on the common marginal level; greedy when it cannot apply.
    #[default]
    WaterFill,
    /// Discrete greedy marginal increments only.
    Greedy,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SolverConfig {
    #[serde(default)]
    pub mode: SolverMode,
    /// Bisection iterations for the water level.
    #[serde(default = "default_max_iterations")]
    pub max_iterations: usize,
    /// Relative budget residual accepted by water-filling.
    #[serde(default = "default_tolerance")]
    pub tolerance: f64,
    /// Number of discrete steps used by the greedy solver.
    #[serde(default = "default_greedy_increments")]
    pub greedy_increments: usize,
    /// Relative tolerance for the `sum(x) == V` guardrail.
    #[serde(default = "default_budget_epsilon")]
    pub budget_epsilon: f64,
}

fn default_max_iterations() -> usize {
    200
}
fn default_tolerance() -> f64 {
    1e-9
}
fn default_greedy_increments() -> usize {
    10_000
}
fn default_budget_epsilon() -> f64 {
    1e-6
}

impl Default for SolverConfig {
    fn default() -> Self {
        Self {
            mode: SolverMode::default(),
            max_iterations: default_max_iterations(),
            tolerance: default_tolerance(),
            greedy_increments: default_greedy_increments(),
            budget_epsilon: default_budget_epsilon(),
        }
    }
}

impl SolverConfig {
    fn validate(&self) -> Result<()> {
        if self.greedy_increments == 0 {
            return Err(PreboundaryError::InvalidConfig(
                "solver.greedy_increments must be >= 1".to_string(),
            ));
        }
        if !(self.tolerance > 0.0) || !(self.budget_epsilon > 0.0) {
            return Err(PreboundaryError::InvalidConfig(
                "solver tolerances must be > 0".to_string(),
            ));
        }
        Ok(())
    }
}
