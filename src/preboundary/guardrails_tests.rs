//! Guardrail Validator Tests

use crate::preboundary::config::PreboundaryConfig;
use crate::preboundary::guardrails::*;
use crate::preboundary::optimizer::{AllocationResult, AllocationStatus, SolverKind};
use crate::preboundary::types::{CandidateId, DecisionWindow, ScenarioValues};
use std::collections::BTreeSet;

fn config() -> PreboundaryConfig {
    PreboundaryConfig {
        budget: 100.0,
        k_max: 2,
        min_allocation_threshold: 20.0,
        ..Default::default()
    }
}

fn result(allocations: &[(&str, f64)], status: AllocationStatus) -> AllocationResult {
    AllocationResult {
        decision_window: DecisionWindow::Boundary,
        budget: 100.0,
        allocations: allocations
            .iter()
            .map(|(id, x)| (id.to_string(), *x))
            .collect(),
        scenario_returns: ScenarioValues::default(),
        expected_return: 0.0,
        downside_return: 0.0,
        worst_case_return: 0.0,
        risk_adjustment: 0.0,
        objective: 0.0,
        num_active: allocations.iter().filter(|(_, x)| *x > 0.0).count(),
        constrained: false,
        status,
        solver: SolverKind::WaterFill,
        warnings: Vec::new(),
    }
}

fn known(ids: &[&str]) -> BTreeSet<CandidateId> {
    ids.iter().map(|s| s.to_string()).collect()
}

#[test]
fn test_valid_allocation_passes() {
    let r = result(&[("a", 60.0), ("b", 40.0), ("c", 0.0)], AllocationStatus::Success);
    let report = validate_allocation(&r, &known(&["a", "b", "c"]), &config());
    assert!(report.is_valid);
    assert!(report.warnings.is_empty());
}

#[test]
fn test_sum_within_epsilon() {
    let r = result(&[("a", 60.0), ("b", 40.0 + 1e-7)], AllocationStatus::Success);
    let report = validate_allocation(&r, &known(&["a", "b"]), &config());
    assert!(report.is_valid, "{:?}", report.warnings);

    let r = result(&[("a", 60.0), ("b", 39.0)], AllocationStatus::Success);
    let report = validate_allocation(&r, &known(&["a", "b"]), &config());
    assert!(!report.is_valid);
    assert!(report.warnings[0].starts_with("Sum constraint violated"));
}

#[test]
fn test_every_check_reports_in_order() {
    let r = result(
        &[("a", 50.0), ("b", 10.0), ("c", 30.0), ("ghost", 25.0), ("neg", -5.0)],
        AllocationStatus::Success,
    );
    let report = validate_allocation(&r, &known(&["a", "b", "c", "neg"]), &config());

    assert!(!report.is_valid);
    assert_eq!(report.warnings.len(), 5, "{:?}", report.warnings);
    assert!(report.warnings[0].starts_with("Sum constraint"));
    assert!(report.warnings[1].starts_with("Non-negativity"));
    assert!(report.warnings[1].contains("neg"));
    assert!(report.warnings[2].starts_with("Minimum threshold"));
    assert!(report.warnings[2].contains("b="));
    assert!(report.warnings[3].starts_with("K_max constraint violated: 4 active > 2"));
    assert!(report.warnings[4].contains("ghost"));
}

#[test]
fn test_non_finite_is_flagged() {
    let r = result(&[("a", f64::NAN), ("b", 100.0)], AllocationStatus::Success);
    let report = validate_allocation(&r, &known(&["a", "b"]), &config());
    assert!(!report.is_valid);
    assert!(report.warnings.iter().any(|w| w.starts_with("Non-negativity")));
}

#[test]
fn test_degenerate_zero_vector_is_valid() {
    let r = result(&[("a", 0.0), ("b", 0.0)], AllocationStatus::Degenerate);
    let report = validate_allocation(&r, &known(&["a", "b"]), &config());
    assert!(report.is_valid);

    let bad = result(&[("a", 30.0), ("b", 0.0)], AllocationStatus::Degenerate);
    let report = validate_allocation(&bad, &known(&["a", "b"]), &config());
    assert!(!report.is_valid);
    assert!(report.warnings[0].contains("Degenerate"));
}

#[test]
fn test_validation_does_not_mutate() {
    let r = result(&[("a", 10.0)], AllocationStatus::Success);
    let before = r.clone();
    let report = validate_allocation(&r, &known(&[]), &config());
    assert!(!report.is_valid);
    assert_eq!(r, before);
}
