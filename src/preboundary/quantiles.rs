//! Empirical Quantiles
//!
//! Quartiles use linear interpolation between closest ranks, so
//! `p25 <= p50 <= p75` holds for any non-empty finite sample.

use serde::{Deserialize, Serialize};
use statrs::statistics::Statistics;

/// Lower quartile, median and upper quartile of a sample.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Quartiles {
    pub p25: f64,
    pub p50: f64,
    pub p75: f64,
}

impl Quartiles {
    pub const ZERO: Quartiles = Quartiles {
        p25: 0.0,
        p50: 0.0,
        p75: 0.0,
    };

    /// Inter-quartile range.
    pub fn spread(&self) -> f64 {
        self.p75 - self.p25
    }

    pub fn is_ordered(&self) -> bool {
        self.p25 <= self.p50 && self.p50 <= self.p75
    }

    pub fn is_finite(&self) -> bool {
        self.p25.is_finite() && self.p50.is_finite() && self.p75.is_finite()
    }
}

/// Percentile `p` (0-100) of an ascending, non-empty slice.
pub fn percentile_sorted(sorted: &[f64], p: f64) -> f64 {
    match sorted.len() {
        0 => 0.0,
        1 => sorted[0],
        n => {
            let rank = (p.clamp(0.0, 100.0) / 100.0) * (n - 1) as f64;
            let lo = rank.floor() as usize;
            let hi = rank.ceil() as usize;
            let frac = rank - lo as f64;
            sorted[lo] + (sorted[hi] - sorted[lo]) * frac
        }
    }
}

/// Sort finite values ascending, dropping NaN and infinities.
pub fn sorted_finite(values: &[f64]) -> Vec<f64> {
    let mut sorted: Vec<f64> = values.iter().copied().filter(|v| v.is_finite()).collect();
    sorted.sort_by(|a, b| a.total_cmp(b));
    sorted
}

/// Quartiles of the finite values in `values`; `None` when there are none.
pub fn quartiles(values: &[f64]) -> Option<Quartiles> {
    let sorted = sorted_finite(values);
    if sorted.is_empty() {
        return None;
    }
    Some(Quartiles {
        p25: percentile_sorted(&sorted, 25.0),
        p50: percentile_sorted(&sorted, 50.0),
        p75: percentile_sorted(&sorted, 75.0),
    })
}

/// Population variance, 0 for fewer than two values.
pub fn population_variance(values: &[f64]) -> f64 {
    if values.len() < 2 {
        return 0.0;
    }
    values.iter().population_variance()
}
