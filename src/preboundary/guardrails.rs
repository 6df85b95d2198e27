//! Guardrail Validator
//!
//! Pure re-check of an [`AllocationResult`] against the hard constraints,
//! independent of the solver that produced it. Checks run in a fixed order
//! and each failing check contributes one message:
//!
//! 1. `sum(x) == V` within `solver.budget_epsilon` (relative). A degenerate
//!    result must instead be all zeros.
//! 2. `x_i >= 0` and finite.
//! 3. `x_i > 0 ⟹ x_i >= min_allocation_threshold`.
//! 4. `count(x_i > 0) <= k_max`.
//! 5. Every key is a known candidate.

use crate::preboundary::config::PreboundaryConfig;
use crate::preboundary::optimizer::{AllocationResult, AllocationStatus};
use crate::preboundary::types::CandidateId;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

/// Relative slack on the minimum threshold for solver rounding.
const THRESHOLD_SLACK: f64 = 1e-9;

/// `{is_valid, warnings}` report handed to downstream consumers.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ValidationReport {
    pub is_valid: bool,
    pub warnings: Vec<String>,
}

/// Re-check `result` against the configured constraints. Never mutates.
pub fn validate_allocation(
    result: &AllocationResult,
    known: &BTreeSet<CandidateId>,
    config: &PreboundaryConfig,
) -> ValidationReport {
    let mut warnings = Vec::new();
    let x = &result.allocations;
    let budget = result.budget;

    let total: f64 = x.values().filter(|v| v.is_finite()).sum();
    if result.status == AllocationStatus::Degenerate {
        if x.values().any(|v| *v != 0.0) {
            warnings.push(format!(
                "Degenerate allocation is not all zeros (sum {:.6})",
                total
            ));
        }
    } else {
        let epsilon = config.solver.budget_epsilon * budget.abs().max(1.0);
        if (total - budget).abs() > epsilon {
            warnings.push(format!(
                "Sum constraint violated: sum(x) = {:.6}, expected {:.6}",
                total, budget
            ));
        }
    }

    let negative: Vec<&str> = x
        .iter()
        .filter(|(_, v)| !v.is_finite() || **v < 0.0)
        .map(|(id, _)| id.as_str())
        .collect();
    if !negative.is_empty() {
        warnings.push(format!(
            "Non-negativity violated for {} candidates: {:?}",
            negative.len(),
            negative
        ));
    }

    let threshold = config.min_allocation_threshold;
    let below: Vec<String> = x
        .iter()
        .filter(|(_, v)| **v > 0.0 && **v < threshold * (1.0 - THRESHOLD_SLACK))
        .map(|(id, v)| format!("{}={:.2}", id, v))
        .collect();
    if !below.is_empty() {
        warnings.push(format!(
            "Minimum threshold {:.2} violated for {} candidates: {:?}",
            threshold,
            below.len(),
            below
        ));
    }

    let active = x.values().filter(|v| **v > 0.0).count();
    if active > config.k_max {
        warnings.push(format!(
            "K_max constraint violated: {} active > {}",
            active, config.k_max
        ));
    }

    let unknown: Vec<&str> = x
        .keys()
        .filter(|id| !known.contains(*id))
        .map(|id| id.as_str())
        .collect();
    if !unknown.is_empty() {
        warnings.push(format!("Unknown candidates in allocation: {:?}", unknown));
    }

    ValidationReport {
        is_valid: warnings.is_empty(),
        warnings,
    }
}
