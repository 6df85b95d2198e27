//! Realized Evaluation
//!
//! Scores one [`AllocationResult`] against what actually happened at the
//! boundary. All returns use the same saturating curve as the optimizer,
//! with realized final values in place of forecasts, and are expressed in
//! basis points of the units allocated.

use crate::preboundary::optimizer::AllocationResult;
use crate::preboundary::types::{CandidateId, DecisionWindow};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tracing::{debug, warn};

/// Realized state of a candidate at resolution (excluding our own units).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RealizedOutcome {
    pub candidate_id: CandidateId,
    pub final_denominator: f64,
    pub final_numerator: f64,
}

impl RealizedOutcome {
    pub fn new(candidate_id: impl Into<String>, final_denominator: f64, final_numerator: f64) -> Self {
        Self {
            candidate_id: candidate_id.into(),
            final_denominator,
            final_numerator,
        }
    }

    /// Units of reward earned by placing `units` on this candidate.
    pub fn return_for(&self, units: f64) -> f64 {
        let d = self.final_denominator + units;
        if units <= 0.0 || d <= 0.0 {
            return 0.0;
        }
        self.final_numerator * units / d
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RealizedEvaluation {
    pub decision_window: DecisionWindow,
    pub total_allocated: f64,
    pub realized_return: f64,
    pub realized_bps: f64,
    pub expected_bps: f64,
    pub worst_case_bps: f64,
    /// `realized_bps - expected_bps`.
    pub forecast_error_bps: f64,
    /// Same total spread equally over every candidate with an outcome.
    pub baseline_all_bps: f64,
    /// Same total spread equally over the allocated candidates.
    pub baseline_selected_bps: f64,
    pub uplift_vs_baseline_bps: f64,
    pub uplift_vs_selected_baseline_bps: f64,
    /// Equal weight over the best `num_active` candidates by realized rate.
    pub hindsight_bps: f64,
    pub regret_bps: f64,
    /// Realized return at least the expected worst-case scenario return.
    pub cleared_worst_case: bool,
    /// Realized return per unit, per allocated candidate.
    pub per_candidate_bps: BTreeMap<CandidateId, f64>,
    /// Allocated candidates without a realized outcome (counted as zero).
    pub missing: Vec<CandidateId>,
}

/// Compare `result` with realized final values.
pub fn evaluate_realized(result: &AllocationResult, outcomes: &[RealizedOutcome]) -> RealizedEvaluation {
    let by_id: BTreeMap<&str, &RealizedOutcome> = outcomes
        .iter()
        .map(|o| (o.candidate_id.as_str(), o))
        .collect();

    let total = result.total_allocated();
    let bps = |value: f64| if total > 0.0 { value / total * 10_000.0 } else { 0.0 };

    let mut realized_return = 0.0;
    let mut per_candidate_bps = BTreeMap::new();
    let mut missing = Vec::new();
    for (id, units) in result.active() {
        match by_id.get(id.as_str()) {
            Some(outcome) => {
                let r = outcome.return_for(units);
                realized_return += r;
                per_candidate_bps.insert(id.clone(), r / units * 10_000.0);
            }
            None => missing.push(id.clone()),
        }
    }
    if !missing.is_empty() {
        warn!(
            "{} allocated candidates have no realized outcome in window {}",
            missing.len(),
            result.decision_window
        );
    }

    let all: Vec<&RealizedOutcome> = by_id.values().copied().collect();
    let selected: Vec<&RealizedOutcome> = result
        .active()
        .filter_map(|(id, _)| by_id.get(id.as_str()).copied())
        .collect();

    let mut by_rate = all.clone();
    by_rate.sort_by(|a, b| {
        first_unit_rate(b)
            .total_cmp(&first_unit_rate(a))
            .then_with(|| a.candidate_id.cmp(&b.candidate_id))
    });
    by_rate.truncate(result.num_active);

    let realized_bps = bps(realized_return);
    let expected_bps = bps(result.expected_return);
    let worst_case_bps = bps(result.worst_case_return);
    let baseline_all_bps = bps(equal_weight_return(&all, total));
    let baseline_selected_bps = bps(equal_weight_return(&selected, total));
    let hindsight_bps = bps(equal_weight_return(&by_rate, total));

    let evaluation = RealizedEvaluation {
        decision_window: result.decision_window,
        total_allocated: total,
        realized_return,
        realized_bps,
        expected_bps,
        worst_case_bps,
        forecast_error_bps: realized_bps - expected_bps,
        baseline_all_bps,
        baseline_selected_bps,
        uplift_vs_baseline_bps: realized_bps - baseline_all_bps,
        uplift_vs_selected_baseline_bps: realized_bps - baseline_selected_bps,
        hindsight_bps,
        regret_bps: hindsight_bps - realized_bps,
        cleared_worst_case: realized_bps >= worst_case_bps,
        per_candidate_bps,
        missing,
    };

    debug!(
        "Realized {} bps vs expected {} bps (baseline {:.1}, regret {:.1}) in window {}",
        evaluation.realized_bps,
        evaluation.expected_bps,
        evaluation.baseline_all_bps,
        evaluation.regret_bps,
        evaluation.decision_window
    );
    evaluation
}

fn first_unit_rate(outcome: &RealizedOutcome) -> f64 {
    if outcome.final_denominator > 0.0 {
        outcome.final_numerator / outcome.final_denominator
    } else {
        0.0
    }
}

fn equal_weight_return(outcomes: &[&RealizedOutcome], total: f64) -> f64 {
    if outcomes.is_empty() || total <= 0.0 {
        return 0.0;
    }
    let each = total / outcomes.len() as f64;
    outcomes.iter().map(|o| o.return_for(each)).sum()
}
