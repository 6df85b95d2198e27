//! Shared Proxy State
//!
//! Readers take an `Arc<ProxySet>` snapshot and keep it for the whole
//! decision. A refresh builds a complete new set and swaps it in; no quantile
//! is ever updated in place.

use crate::preboundary::config::PreboundaryConfig;
use crate::preboundary::error::Result;
use crate::preboundary::proxies::{ProxyEstimator, ProxySet, WindowProxies};
use crate::preboundary::types::{CandidateSnapshot, DecisionWindow, HistoricalEpisode};
use arc_swap::ArcSwap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::info;

pub struct ProxyStore {
    current: ArcSwap<ProxySet>,
    generation: AtomicU64,
}

impl Default for ProxyStore {
    fn default() -> Self {
        Self::new(ProxySet::default())
    }
}

impl ProxyStore {
    pub fn new(initial: ProxySet) -> Self {
        Self {
            current: ArcSwap::new(Arc::new(initial)),
            generation: AtomicU64::new(0),
        }
    }

    /// Current snapshot. Unaffected by later swaps.
    pub fn load(&self) -> Arc<ProxySet> {
        self.current.load_full()
    }

    /// Proxies of one window from the current snapshot.
    pub fn window(&self, window: DecisionWindow) -> Option<WindowProxies> {
        self.current.load().get(window).cloned()
    }

    /// Number of swaps since construction.
    pub fn generation(&self) -> u64 {
        self.generation.load(Ordering::Acquire)
    }

    /// Swap in a new set, returning the previous one.
    pub fn replace(&self, next: ProxySet) -> Arc<ProxySet> {
        self.swap_in(Arc::new(next)).0
    }

    /// Re-estimate from fresh history and swap the result in.
    ///
    /// Returns the set this call installed, even if another refresh has
    /// replaced it since. On error the current set stays in place.
    pub fn refresh(
        &self,
        config: &PreboundaryConfig,
        snapshots: &[CandidateSnapshot],
        episodes: &[HistoricalEpisode],
    ) -> Result<Arc<ProxySet>> {
        let next = Arc::new(ProxyEstimator::new(config).estimate_all(snapshots, episodes)?);
        let (_, generation) = self.swap_in(Arc::clone(&next));
        info!(
            "Proxy store refreshed: {} windows from {} episodes (generation {})",
            next.windows.len(),
            episodes.len(),
            generation
        );
        Ok(next)
    }

    /// Previous set and the generation number of this swap.
    fn swap_in(&self, next: Arc<ProxySet>) -> (Arc<ProxySet>, u64) {
        let previous = self.current.swap(next);
        let generation = self.generation.fetch_add(1, Ordering::AcqRel) + 1;
        (previous, generation)
    }
}
