//! Pre-Boundary Allocation
//!
//! Scenario-based proxy estimation and risk-aware allocation of a fixed
//! budget across competitive reward pools, decided before the resolution
//! boundary while the final state is still unknown.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────┐   ┌──────────────────────┐
//! │ HistoricalEpisode[]  │   │ CandidateSnapshot[]  │
//! │ (resolved history)   │   │ (current state)      │
//! └──────────┬───────────┘   └──────────┬───────────┘
//!            ▼                          │
//! ┌──────────────────────┐              │
//! │   ProxyEstimator     │              │
//! │ candidate → cluster  │              │
//! │   → global quartiles │              │
//! └──────────┬───────────┘              │
//!            ▼  (ProxyStore, ArcSwap)   │
//! ┌─────────────────────────────────────▼───────────┐
//! │              build_scenarios                    │
//! │  conservative / base / aggressive per candidate │
//! └──────────────────────┬──────────────────────────┘
//!                        ▼
//!               validate_scenarios ──▶ exclude / abort
//!                        ▼
//! ┌─────────────────────────────────────────────────┐
//! │              PortfolioOptimizer                 │
//! │  rank by N/D → top-k → water-fill (or greedy)   │
//! └──────────────────────┬──────────────────────────┘
//!                        ▼
//!               validate_allocation ──▶ AllocationResult
//!                        ▼
//!           forecast_rows ──▶ ForecastStore (SQLite)
//! ```
//!
//! # Determinism Guarantees
//!
//! - **Maps**: `BTreeMap`/`BTreeSet` everywhere; iteration is by id
//! - **Ranking**: descending marginal return, ties by ascending id
//! - **Clock**: only `ForecastStore` reads wall time, and only into its table
//! - **State**: one immutable `PreboundaryConfig`; no globals

pub mod config;
pub mod error;
pub mod evaluation;
pub mod forecast_store;
pub mod guardrails;
pub mod optimizer;
pub mod pipeline;
pub mod proxies;
pub mod proxy_store;
pub mod quantiles;
pub mod scenarios;
pub mod types;

#[cfg(test)]
mod scenarios_tests;
#[cfg(test)]
mod optimizer_tests;
#[cfg(test)]
mod guardrails_tests;

// Re-exports for convenience
pub use config::{
    InvalidCandidatePolicy, PenaltyWeights, PreboundaryConfig, ScenarioWeights, SolverConfig,
    SolverMode, UpliftMode,
};
pub use error::{PreboundaryError, Result};
pub use evaluation::{evaluate_realized, RealizedEvaluation, RealizedOutcome};
pub use forecast_store::{forecast_rows, ForecastRow, ForecastStore, ForecastStoreError};
pub use guardrails::{validate_allocation, ValidationReport};
pub use optimizer::{
    AllocationResult, AllocationStatus, PortfolioOptimizer, RankedCandidate, Selection, SolverKind,
};
pub use pipeline::{run_decision, run_pipeline, DecisionOutcome};
pub use proxies::{
    validate_proxies, CandidateProxies, ClusterBounds, ProxyDiagnostics, ProxyEstimator, ProxySet,
    QuantileEstimate, WindowProxies,
};
pub use proxy_store::ProxyStore;
pub use quantiles::Quartiles;
pub use scenarios::{
    build_scenarios, validate_scenarios, ForecastScenario, ScenarioSet, ScenarioValidation,
};
pub use types::{
    CandidateId, CandidateSnapshot, DecisionWindow, HistoricalEpisode, NumeratorCluster, Quantity,
    ScenarioName, ScenarioValues, SourceTier, StalenessFlags,
};
