//! Proxy Estimator
//!
//! Learns per-candidate quantiles of denominator drift and numerator uplift
//! from resolved historical episodes of one decision window.
//!
//! # Fallback hierarchy
//!
//! Each quantity resolves independently:
//!
//! 1. **Candidate**: the candidate has at least `min_candidate_observations`
//!    usable episodes of its own.
//! 2. **Cluster**: episodes pooled by quartile of decision-time numerator
//!    (boundaries taken from the current snapshot) reach
//!    `min_cluster_observations`.
//! 3. **Global**: every usable episode of the window. Always available once
//!    the window has any usable drift observation.
//!
//! A window without episodes is a fatal data error; nothing downstream can
//! be built without at least the global estimate.

use crate::preboundary::config::{PreboundaryConfig, UpliftMode};
use crate::preboundary::error::{PreboundaryError, Result};
use crate::preboundary::quantiles::{percentile_sorted, population_variance, quartiles, sorted_finite, Quartiles};
use crate::preboundary::types::{
    CandidateId, CandidateSnapshot, DecisionWindow, HistoricalEpisode, NumeratorCluster, Quantity,
    SourceTier,
};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use tracing::{debug, info, warn};

/// Penalty above which an estimate counts as low-confidence in diagnostics.
pub const HIGH_PENALTY_THRESHOLD: f64 = 0.15;

/// Drift spread (p75 - p25) above which proxy consistency checks warn.
pub const MAX_SANE_DRIFT_SPAN: f64 = 1.0;

// =============================================================================
// ESTIMATES
// =============================================================================

/// Quantiles of one quantity for one candidate, with provenance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QuantileEstimate {
    pub quantity: Quantity,
    pub p25: f64,
    pub p50: f64,
    pub p75: f64,
    /// Observations behind the quantiles (pool size for cluster/global tiers).
    pub sample_count: usize,
    pub sample_variance: f64,
    pub tier: SourceTier,
    pub confidence_penalty: f64,
}

impl QuantileEstimate {
    pub fn quartiles(&self) -> Quartiles {
        Quartiles {
            p25: self.p25,
            p50: self.p50,
            p75: self.p75,
        }
    }
}

/// Drift and uplift estimates of one candidate.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CandidateProxies {
    pub candidate_id: CandidateId,
    pub cluster: NumeratorCluster,
    /// Usable episodes of the candidate itself for this window.
    pub own_observations: usize,
    pub drift: QuantileEstimate,
    pub uplift: QuantileEstimate,
}

impl CandidateProxies {
    /// Weaker of the two tiers.
    pub fn source_tier(&self) -> SourceTier {
        self.drift.tier.min(self.uplift.tier)
    }

    /// Larger of the two penalties.
    pub fn confidence_penalty(&self) -> f64 {
        self.drift.confidence_penalty.max(self.uplift.confidence_penalty)
    }
}

/// Quartile boundaries of decision-time numerator used to assign clusters.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ClusterBounds {
    pub q25: f64,
    pub q50: f64,
    pub q75: f64,
}

impl ClusterBounds {
    pub fn from_numerators(values: &[f64]) -> Self {
        let q = quartiles(values).unwrap_or(Quartiles::ZERO);
        Self {
            q25: q.p25,
            q50: q.p50,
            q75: q.p75,
        }
    }

    pub fn assign(&self, numerator: f64) -> NumeratorCluster {
        if numerator <= self.q25 {
            NumeratorCluster::Low
        } else if numerator <= self.q50 {
            NumeratorCluster::MidLow
        } else if numerator <= self.q75 {
            NumeratorCluster::MidHigh
        } else {
            NumeratorCluster::High
        }
    }
}

/// All proxies learned for one decision window. Never mutated once built.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WindowProxies {
    pub window: DecisionWindow,
    pub episode_count: usize,
    pub cluster_bounds: ClusterBounds,
    pub global_drift: Quartiles,
    pub global_uplift: Quartiles,
    pub candidates: BTreeMap<CandidateId, CandidateProxies>,
}

impl WindowProxies {
    pub fn get(&self, candidate_id: &str) -> Option<&CandidateProxies> {
        self.candidates.get(candidate_id)
    }

    pub fn diagnostics(&self) -> ProxyDiagnostics {
        let mut diag = ProxyDiagnostics {
            window: self.window,
            candidates: self.candidates.len(),
            ..Default::default()
        };
        for proxies in self.candidates.values() {
            for estimate in [&proxies.drift, &proxies.uplift] {
                let counts = match estimate.quantity {
                    Quantity::Drift => &mut diag.drift_tiers,
                    Quantity::Uplift => &mut diag.uplift_tiers,
                };
                *counts.entry(estimate.tier).or_default() += 1;
            }
            if proxies.confidence_penalty() > HIGH_PENALTY_THRESHOLD {
                diag.high_penalty_count += 1;
            }
        }
        diag
    }
}

/// Coverage summary of a [`WindowProxies`].
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ProxyDiagnostics {
    pub window: DecisionWindow,
    pub candidates: usize,
    pub drift_tiers: BTreeMap<SourceTier, usize>,
    pub uplift_tiers: BTreeMap<SourceTier, usize>,
    pub high_penalty_count: usize,
}

/// Proxies for every window that had snapshots.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ProxySet {
    pub windows: BTreeMap<DecisionWindow, WindowProxies>,
}

impl ProxySet {
    pub fn get(&self, window: DecisionWindow) -> Option<&WindowProxies> {
        self.windows.get(&window)
    }
}

// =============================================================================
// ESTIMATOR
// =============================================================================

/// Cluster of every candidate seen in `snapshots` or `episodes`.
///
/// Snapshot candidates are clustered by their current numerator. Candidates
/// with history but no snapshot use the median decision-time numerator of
/// their own episodes. Every episode inherits its candidate's cluster.
fn candidate_clusters<'e>(
    bounds: &ClusterBounds,
    snapshots: &[&'e CandidateSnapshot],
    episodes: &[&'e HistoricalEpisode],
) -> BTreeMap<&'e str, NumeratorCluster> {
    let mut clusters: BTreeMap<&str, NumeratorCluster> = snapshots
        .iter()
        .map(|s| (s.id.as_str(), bounds.assign(s.numerator_now)))
        .collect();

    let mut absent: BTreeMap<&str, Vec<f64>> = BTreeMap::new();
    for episode in episodes {
        if !clusters.contains_key(episode.candidate_id.as_str()) {
            absent
                .entry(episode.candidate_id.as_str())
                .or_default()
                .push(episode.numerator_now);
        }
    }
    for (id, numerators) in absent {
        let median = quartiles(&numerators).map_or(0.0, |q| q.p50);
        clusters.insert(id, bounds.assign(median));
    }
    clusters
}

/// Observations of one quantity from one episode.
#[derive(Debug, Clone, Copy)]
struct Observation {
    cluster: NumeratorCluster,
    value: f64,
}

/// Learns [`WindowProxies`] from episode history.
pub struct ProxyEstimator<'a> {
    config: &'a PreboundaryConfig,
}

impl<'a> ProxyEstimator<'a> {
    pub fn new(config: &'a PreboundaryConfig) -> Self {
        Self { config }
    }

    /// Estimate every window present in `snapshots`.
    pub fn estimate_all(
        &self,
        snapshots: &[CandidateSnapshot],
        episodes: &[HistoricalEpisode],
    ) -> Result<ProxySet> {
        let windows: BTreeSet<DecisionWindow> =
            snapshots.iter().map(|s| s.decision_window).collect();
        let mut set = ProxySet::default();
        for window in windows {
            let proxies = self.estimate_window(window, snapshots, episodes)?;
            set.windows.insert(window, proxies);
        }
        Ok(set)
    }

    /// Estimate drift and uplift for every snapshot candidate of `window`.
    ///
    /// Snapshots and episodes of other windows are ignored.
    pub fn estimate_window(
        &self,
        window: DecisionWindow,
        snapshots: &[CandidateSnapshot],
        episodes: &[HistoricalEpisode],
    ) -> Result<WindowProxies> {
        let snapshots: Vec<&CandidateSnapshot> = snapshots
            .iter()
            .filter(|s| s.decision_window == window)
            .collect();
        let episodes: Vec<&HistoricalEpisode> = episodes
            .iter()
            .filter(|e| e.decision_window == window)
            .collect();

        if episodes.is_empty() {
            return Err(PreboundaryError::NoHistory { window });
        }

        let bounds = if snapshots.is_empty() {
            let values: Vec<f64> = episodes.iter().map(|e| e.numerator_now).collect();
            ClusterBounds::from_numerators(&values)
        } else {
            let values: Vec<f64> = snapshots.iter().map(|s| s.numerator_now).collect();
            ClusterBounds::from_numerators(&values)
        };

        // Per-candidate and pooled observations.
        let mut drift_by_candidate: BTreeMap<&str, Vec<Observation>> = BTreeMap::new();
        let mut uplift_by_candidate: BTreeMap<&str, Vec<Observation>> = BTreeMap::new();
        let mut drift_all = Vec::with_capacity(episodes.len());
        let mut uplift_all = Vec::with_capacity(episodes.len());

        let clusters = candidate_clusters(&bounds, &snapshots, &episodes);

        for episode in &episodes {
            let cluster = clusters
                .get(episode.candidate_id.as_str())
                .copied()
                .unwrap_or_else(|| bounds.assign(episode.numerator_now));
            if let Some(value) = drift_of(episode) {
                let obs = Observation { cluster, value };
                drift_by_candidate
                    .entry(episode.candidate_id.as_str())
                    .or_default()
                    .push(obs);
                drift_all.push(obs);
            }
            if let Some(value) = uplift_of(episode, self.config.uplift_mode) {
                let obs = Observation { cluster, value };
                uplift_by_candidate
                    .entry(episode.candidate_id.as_str())
                    .or_default()
                    .push(obs);
                uplift_all.push(obs);
            }
        }

        if drift_all.is_empty() {
            return Err(PreboundaryError::NoUsableHistory {
                window,
                episodes: episodes.len(),
            });
        }

        let drift_pool = Pool::new(&drift_all);
        let uplift_pool = Pool::new(&uplift_all);
        if uplift_all.is_empty() {
            warn!(
                "No usable uplift observations for window {} ({} episodes); using neutral uplift",
                window,
                episodes.len()
            );
        }

        let mut candidates = BTreeMap::new();
        for snapshot in &snapshots {
            let cluster = clusters
                .get(snapshot.id.as_str())
                .copied()
                .unwrap_or_else(|| bounds.assign(snapshot.numerator_now));
            let stale = snapshot.staleness.is_stale();
            let own_drift = values_of(drift_by_candidate.get(snapshot.id.as_str()));
            let own_uplift = values_of(uplift_by_candidate.get(snapshot.id.as_str()));

            let drift = self.resolve(Quantity::Drift, &own_drift, cluster, &drift_pool, stale);
            let uplift = self.resolve(Quantity::Uplift, &own_uplift, cluster, &uplift_pool, stale);

            debug!(
                "Proxies {} ({}): drift {}/{:.4} uplift {}/{:.4} penalty {:.2}",
                snapshot.id,
                window,
                drift.tier,
                drift.p50,
                uplift.tier,
                uplift.p50,
                drift.confidence_penalty.max(uplift.confidence_penalty)
            );

            candidates.insert(
                snapshot.id.clone(),
                CandidateProxies {
                    candidate_id: snapshot.id.clone(),
                    cluster,
                    own_observations: own_drift.len(),
                    drift,
                    uplift,
                },
            );
        }

        let proxies = WindowProxies {
            window,
            episode_count: episodes.len(),
            cluster_bounds: bounds,
            global_drift: drift_pool.global,
            global_uplift: uplift_pool.global,
            candidates,
        };

        let diag = proxies.diagnostics();
        info!(
            "Proxy estimates for window {}: {} candidates from {} episodes (drift tiers {:?}, uplift tiers {:?}, {} high-penalty)",
            window,
            diag.candidates,
            proxies.episode_count,
            diag.drift_tiers,
            diag.uplift_tiers,
            diag.high_penalty_count
        );

        Ok(proxies)
    }

    /// Walk the candidate → cluster → global hierarchy for one quantity.
    fn resolve(
        &self,
        quantity: Quantity,
        own: &[f64],
        cluster: NumeratorCluster,
        pool: &Pool,
        stale: bool,
    ) -> QuantileEstimate {
        let (q, sample_count, variance, tier) = if own.len() >= self.config.min_candidate_observations {
            // own is non-empty and finite here
            let q = quartiles(own).unwrap_or(Quartiles::ZERO);
            (q, own.len(), population_variance(own), SourceTier::Candidate)
        } else if let Some(members) = pool
            .clusters
            .get(&cluster)
            .filter(|m| m.len() >= self.config.min_cluster_observations)
        {
            let q = quartiles(members).unwrap_or(Quartiles::ZERO);
            (q, members.len(), population_variance(members), SourceTier::Cluster)
        } else {
            (pool.global, pool.size, pool.variance, SourceTier::Global)
        };

        let penalty = if pool.size == 0 {
            self.config.confidence_penalty_cap
        } else {
            self.confidence_penalty(quantity, tier, &q, stale)
        };

        QuantileEstimate {
            quantity,
            p25: q.p25,
            p50: q.p50,
            p75: q.p75,
            sample_count,
            sample_variance: variance,
            tier,
            confidence_penalty: penalty,
        }
    }

    /// Additive sparse / high-variance / stale penalty, capped.
    pub fn confidence_penalty(
        &self,
        quantity: Quantity,
        tier: SourceTier,
        q: &Quartiles,
        stale: bool,
    ) -> f64 {
        let weights = &self.config.penalties;
        let mut penalty = 0.0;
        if tier != SourceTier::Candidate {
            penalty += weights.sparse_history;
        }
        if quantity == Quantity::Drift && q.spread() > weights.high_variance_iqr {
            penalty += weights.high_variance;
        }
        if stale {
            penalty += weights.stale_input;
        }
        penalty.min(self.config.confidence_penalty_cap)
    }
}

/// Cluster and global pools of one quantity.
struct Pool {
    clusters: BTreeMap<NumeratorCluster, Vec<f64>>,
    global: Quartiles,
    variance: f64,
    size: usize,
}

impl Pool {
    fn new(observations: &[Observation]) -> Self {
        let mut clusters: BTreeMap<NumeratorCluster, Vec<f64>> = BTreeMap::new();
        for obs in observations {
            clusters.entry(obs.cluster).or_default().push(obs.value);
        }
        let all: Vec<f64> = observations.iter().map(|o| o.value).collect();
        let sorted = sorted_finite(&all);
        let global = if sorted.is_empty() {
            Quartiles::ZERO
        } else {
            Quartiles {
                p25: percentile_sorted(&sorted, 25.0),
                p50: percentile_sorted(&sorted, 50.0),
                p75: percentile_sorted(&sorted, 75.0),
            }
        };
        Self {
            clusters,
            global,
            variance: population_variance(&sorted),
            size: sorted.len(),
        }
    }
}

fn values_of(observations: Option<&Vec<Observation>>) -> Vec<f64> {
    observations
        .map(|obs| obs.iter().map(|o| o.value).collect())
        .unwrap_or_default()
}

/// `(final - now) / now`, for episodes with a positive decision-time denominator.
fn drift_of(episode: &HistoricalEpisode) -> Option<f64> {
    if !(episode.denominator_now > 0.0) {
        return None;
    }
    let drift = (episode.final_denominator - episode.denominator_now) / episode.denominator_now;
    drift.is_finite().then_some(drift)
}

fn uplift_of(episode: &HistoricalEpisode, mode: UpliftMode) -> Option<f64> {
    let uplift = match mode {
        UpliftMode::Relative => {
            if !(episode.numerator_now > 0.0) {
                return None;
            }
            (episode.final_numerator - episode.numerator_now) / episode.numerator_now
        }
        UpliftMode::Absolute => episode.final_numerator - episode.numerator_now,
    };
    uplift.is_finite().then_some(uplift)
}

// =============================================================================
// CONSISTENCY CHECKS
// =============================================================================

/// Cross-check learned proxies: quantile ordering, finiteness and drift span.
///
/// Returns `(is_consistent, warnings)`. A wide drift span is a warning only.
pub fn validate_proxies(proxies: &WindowProxies) -> (bool, Vec<String>) {
    let mut warnings = Vec::new();
    let mut is_consistent = true;

    for (id, candidate) in &proxies.candidates {
        for estimate in [&candidate.drift, &candidate.uplift] {
            let q = estimate.quartiles();
            if !q.is_finite() {
                warnings.push(format!(
                    "{} ({}): non-finite {} quantiles",
                    id, proxies.window, estimate.quantity
                ));
                is_consistent = false;
                continue;
            }
            if !q.is_ordered() {
                warnings.push(format!(
                    "{} ({}): {} ordering violated p25={:.4} p50={:.4} p75={:.4}",
                    id, proxies.window, estimate.quantity, q.p25, q.p50, q.p75
                ));
                is_consistent = false;
            }
        }
        if candidate.drift.quartiles().spread() > MAX_SANE_DRIFT_SPAN {
            warnings.push(format!(
                "{} ({}): drift span {:.3} exceeds {:.1}",
                id,
                proxies.window,
                candidate.drift.quartiles().spread(),
                MAX_SANE_DRIFT_SPAN
            ));
        }
    }

    (is_consistent, warnings)
}
