//! Portfolio Optimizer Tests
//!
//! - Selection rule and tie-breaking
//! - Degenerate, constrained and small-population edge cases
//! - Hard-constraint invariants over random instances
//! - Idempotence and monotonicity
//! - Greedy fallback agreement with water-filling

use crate::preboundary::config::{PreboundaryConfig, SolverMode};
use crate::preboundary::guardrails::validate_allocation;
use crate::preboundary::optimizer::*;
use crate::preboundary::scenarios::{ForecastScenario, ScenarioSet};
use crate::preboundary::types::*;
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;

/// One candidate: denominators and numerators per scenario (cons, base, aggr).
struct Row {
    id: String,
    d: [f64; 3],
    n: [f64; 3],
}

fn flat(id: &str, d: f64, n: f64) -> Row {
    Row {
        id: id.to_string(),
        d: [d, d, d],
        n: [n, n, n],
    }
}

fn scenario_set(rows: &[Row]) -> ScenarioSet {
    let mut set = ScenarioSet::new(DecisionWindow::Day);
    for row in rows {
        for (i, name) in ScenarioName::ALL.iter().enumerate() {
            set.insert(ForecastScenario {
                scenario: *name,
                candidate_id: row.id.clone(),
                decision_window: DecisionWindow::Day,
                drift: 0.0,
                uplift: 0.0,
                final_denominator: row.d[i],
                final_numerator: row.n[i],
                source_tier: SourceTier::Candidate,
                confidence_penalty: 0.0,
            });
        }
    }
    set
}

/// Random candidates whose scenarios satisfy the ordering invariant.
fn random_rows(rng: &mut ChaCha8Rng, count: usize, spread: bool) -> Vec<Row> {
    (0..count)
        .map(|i| {
            let d = rng.gen_range(100.0..100_000.0);
            let n = rng.gen_range(1.0..10_000.0);
            let (dc, da, nc, na) = if spread {
                (
                    d * (1.0 + rng.gen_range(0.0..0.5)),
                    d * (1.0 - rng.gen_range(0.0..0.5)),
                    n * (1.0 - rng.gen_range(0.0..0.5)),
                    n * (1.0 + rng.gen_range(0.0..1.0)),
                )
            } else {
                (d, d, n, n)
            };
            Row {
                id: format!("g{:02}", i),
                d: [dc, d, da],
                n: [nc, n, na],
            }
        })
        .collect()
}

fn config(budget: f64, k_max: usize, min_threshold: f64) -> PreboundaryConfig {
    PreboundaryConfig {
        budget,
        k_max,
        min_allocation_threshold: min_threshold,
        ..Default::default()
    }
}

fn assert_hard_constraints(result: &AllocationResult, config: &PreboundaryConfig) {
    let total = result.total_allocated();
    assert!(
        (total - config.budget).abs() <= 1e-6 * config.budget.max(1.0),
        "sum {} != {}",
        total,
        config.budget
    );
    for (id, x) in &result.allocations {
        assert!(*x >= 0.0, "{} negative", id);
        if *x > 0.0 {
            assert!(
                *x >= config.min_allocation_threshold * (1.0 - 1e-9),
                "{} = {} below threshold",
                id,
                x
            );
        }
    }
    assert!(result.num_active <= config.k_max);
    assert!(result.warnings.is_empty(), "{:?}", result.warnings);
}

// =============================================================================
// CONCRETE SCENARIOS
// =============================================================================

#[test]
fn test_three_candidates_top_two_selected() {
    let config = config(30.0, 2, 0.0);
    let set = scenario_set(&[
        flat("c1", 100.0, 50.0),
        flat("c2", 200.0, 40.0),
        flat("c3", 300.0, 10.0),
    ]);
    let optimizer = PortfolioOptimizer::new(&config);

    let selection = optimizer.select_candidates(&set);
    let ranked: Vec<&str> = selection
        .ranking
        .iter()
        .map(|r| r.candidate_id.as_str())
        .collect();
    assert_eq!(ranked, vec!["c1", "c2", "c3"]);
    assert!((selection.ranking[0].marginal_return - 0.5).abs() < 1e-12);
    assert!((selection.ranking[1].marginal_return - 0.2).abs() < 1e-12);
    assert_eq!(selection.selected, vec!["c1".to_string(), "c2".to_string()]);
    assert!(!selection.constrained);

    let result = optimizer.optimize(&set);
    assert_eq!(result.status, AllocationStatus::Success);
    assert_eq!(result.allocations["c3"], 0.0);
    assert!((result.allocations["c1"] + result.allocations["c2"] - 30.0).abs() < 1e-9);
    // g1(30) = 5000 / 130² ≈ 0.296 still beats g2(0) = 0.2
    assert!((result.allocations["c1"] - 30.0).abs() < 1e-6);
    assert_hard_constraints(&result, &config);
}

#[test]
fn test_all_zero_numerators_is_degenerate() {
    let config = config(1_000.0, 3, 0.0);
    let set = scenario_set(&[flat("a", 100.0, 0.0), flat("b", 200.0, 0.0)]);
    let result = PortfolioOptimizer::new(&config).optimize(&set);

    assert_eq!(result.status, AllocationStatus::Degenerate);
    assert_eq!(result.solver, SolverKind::Skipped);
    assert!(result.allocations.values().all(|x| *x == 0.0));
    assert_eq!(result.allocations.len(), 2);
    assert_eq!(result.num_active, 0);
    assert_eq!(result.objective, 0.0);
    assert!(result.warnings.is_empty());
}

#[test]
fn test_k_max_above_population_uses_all() {
    let config = config(1_000.0, 5, 0.0);
    let set = scenario_set(&[flat("a", 100.0, 50.0), flat("b", 100.0, 40.0)]);
    let result = PortfolioOptimizer::new(&config).optimize(&set);

    assert_eq!(result.num_active, 2);
    assert!(!result.constrained);
    assert_eq!(result.status, AllocationStatus::Success);
    assert!(result.allocations["a"] > result.allocations["b"]);
    assert_hard_constraints(&result, &config);
}

#[test]
fn test_unaffordable_cardinality_is_constrained() {
    let config = config(250.0, 5, 100.0);
    let rows: Vec<Row> = (0..6)
        .map(|i| flat(&format!("g{}", i), 1_000.0, 100.0 - i as f64))
        .collect();
    let set = scenario_set(&rows);
    let optimizer = PortfolioOptimizer::new(&config);

    let selection = optimizer.select_candidates(&set);
    assert_eq!(selection.effective_k, 2);
    assert!(selection.constrained);

    let result = optimizer.optimize(&set);
    assert!(result.constrained);
    assert_eq!(result.status, AllocationStatus::Constrained);
    assert_eq!(result.num_active, 2);
    assert!(result.allocations["g0"] >= 100.0);
    assert!(result.allocations["g1"] >= 100.0);
    assert_hard_constraints(&result, &config);
}

#[test]
fn test_threshold_above_budget_allocates_nothing() {
    let config = config(50.0, 2, 100.0);
    let set = scenario_set(&[flat("a", 100.0, 50.0)]);
    let result = PortfolioOptimizer::new(&config).optimize(&set);

    assert_eq!(result.status, AllocationStatus::Constrained);
    assert_eq!(result.total_allocated(), 0.0);
    assert_eq!(result.warnings.len(), 1);
    assert!(result.warnings[0].contains("Sum constraint"));
}

#[test]
fn test_ties_break_by_id() {
    let config = config(100.0, 1, 0.0);
    let set = scenario_set(&[flat("b", 100.0, 10.0), flat("a", 100.0, 10.0)]);
    let optimizer = PortfolioOptimizer::new(&config);
    let selection = optimizer.select_candidates(&set);
    assert_eq!(selection.selected, vec!["a".to_string()]);
    let result = optimizer.optimize(&set);
    assert_eq!(result.allocations["a"], 100.0);
    assert_eq!(result.allocations["b"], 0.0);
}

#[test]
fn test_missing_scenario_candidate_stays_zero() {
    let config = config(100.0, 3, 0.0);
    let mut set = scenario_set(&[flat("a", 100.0, 10.0)]);
    set.scenarios.base.insert(
        "partial".to_string(),
        ForecastScenario {
            scenario: ScenarioName::Base,
            candidate_id: "partial".to_string(),
            decision_window: DecisionWindow::Day,
            drift: 0.0,
            uplift: 0.0,
            final_denominator: 1.0,
            final_numerator: 1_000.0,
            source_tier: SourceTier::Global,
            confidence_penalty: 0.3,
        },
    );
    let result = PortfolioOptimizer::new(&config).optimize(&set);
    assert_eq!(result.allocations["partial"], 0.0);
    assert!((result.allocations["a"] - 100.0).abs() < 1e-9);
}

// =============================================================================
// RETURN DECOMPOSITION
// =============================================================================

#[test]
fn test_return_decomposition() {
    let config = config(100.0, 1, 0.0);
    let set = scenario_set(&[Row {
        id: "a".to_string(),
        d: [300.0, 100.0, 100.0],
        n: [40.0, 50.0, 60.0],
    }]);
    let result = PortfolioOptimizer::new(&config).optimize(&set);

    // x = 100: cons 40*100/400 = 10, base 25, aggr 30
    assert!((result.scenario_returns.conservative - 10.0).abs() < 1e-9);
    assert!((result.scenario_returns.base - 25.0).abs() < 1e-9);
    assert!((result.scenario_returns.aggressive - 30.0).abs() < 1e-9);
    let expected = 0.25 * 10.0 + 0.5 * 25.0 + 0.25 * 30.0;
    assert!((result.expected_return - expected).abs() < 1e-9);
    assert!((result.downside_return - 15.0).abs() < 1e-9);
    assert!((result.worst_case_return - 10.0).abs() < 1e-9);
    assert!((result.risk_adjustment - 3.0).abs() < 1e-9);
    assert!((result.objective - (expected - 3.0)).abs() < 1e-9);
    assert!((result.expected_return_bps() - expected * 100.0).abs() < 1e-6);
    assert!((result.downside_bps() - 1_500.0).abs() < 1e-6);
    assert!((result.scenario_returns_bps().base - 2_500.0).abs() < 1e-6);
}

// =============================================================================
// PROPERTIES
// =============================================================================

#[test]
fn test_hard_constraints_hold_for_random_instances() {
    for seed in 0..30 {
        let mut rng = ChaCha8Rng::seed_from_u64(seed);
        let count = rng.gen_range(1..15);
        let rows = random_rows(&mut rng, count, true);
        let k_max = rng.gen_range(1..7);
        let budget = rng.gen_range(1_000.0..1_000_000.0);
        let min_threshold = if seed % 3 == 0 {
            0.0
        } else {
            budget / rng.gen_range(2.0..20.0)
        };
        let config = config(budget, k_max, min_threshold);
        let set = scenario_set(&rows);

        let result = PortfolioOptimizer::new(&config).optimize(&set);
        assert_ne!(result.status, AllocationStatus::Degenerate);
        assert_hard_constraints(&result, &config);

        let report = validate_allocation(&result, &set.candidate_ids(), &config);
        assert!(report.is_valid, "seed {}: {:?}", seed, report.warnings);
    }
}

#[test]
fn test_optimizer_is_idempotent() {
    let mut rng = ChaCha8Rng::seed_from_u64(7);
    let rows = random_rows(&mut rng, 12, true);
    let config = config(500_000.0, 5, 20_000.0);
    let set = scenario_set(&rows);
    let optimizer = PortfolioOptimizer::new(&config);

    let first = optimizer.optimize(&set);
    let second = optimizer.optimize(&set);
    assert_eq!(first, second);
    assert_eq!(
        serde_json::to_string(&first).unwrap(),
        serde_json::to_string(&second).unwrap()
    );
}

#[test]
fn test_more_numerator_never_means_fewer_units() {
    for seed in 0..15 {
        for min_threshold in [0.0, 500.0] {
            let mut rng = ChaCha8Rng::seed_from_u64(100 + seed);
            let mut rows = random_rows(&mut rng, 8, false);
            let config = config(10_000.0, 3, min_threshold);
            let target = rng.gen_range(0..rows.len());
            let id = rows[target].id.clone();

            let before = PortfolioOptimizer::new(&config).optimize(&scenario_set(&rows));
            let factor = rng.gen_range(1.05..3.0);
            for n in rows[target].n.iter_mut() {
                *n *= factor;
            }
            let after = PortfolioOptimizer::new(&config).optimize(&scenario_set(&rows));

            assert!(
                after.allocations[&id] >= before.allocations[&id] - 1e-6 * config.budget,
                "seed {} min {}: {} went {} -> {}",
                seed,
                min_threshold,
                id,
                before.allocations[&id],
                after.allocations[&id]
            );
        }
    }
}

// =============================================================================
// SOLVERS
// =============================================================================

#[test]
fn test_greedy_matches_water_fill() {
    for seed in 0..10 {
        let mut rng = ChaCha8Rng::seed_from_u64(200 + seed);
        let rows = random_rows(&mut rng, 10, true);
        let config = config(100_000.0, 4, 5_000.0);
        let set = scenario_set(&rows);
        let optimizer = PortfolioOptimizer::new(&config);

        let water = optimizer.optimize(&set);
        let greedy = optimizer.optimize_greedy(&set);
        assert_eq!(water.solver, SolverKind::WaterFill);
        assert_eq!(greedy.solver, SolverKind::Greedy);
        assert_hard_constraints(&greedy, &config);

        let relative = (water.objective - greedy.objective).abs() / water.objective.abs().max(1.0);
        assert!(relative < 1e-4, "seed {}: {} vs {}", seed, water.objective, greedy.objective);

        let remaining = config.budget - config.min_allocation_threshold * water.num_active as f64;
        let step = remaining / config.solver.greedy_increments as f64;
        let slack = step * config.k_max as f64 + 1e-6 * config.budget;
        for (id, x) in &water.allocations {
            assert!(
                (x - greedy.allocations[id]).abs() <= slack,
                "seed {} {}: {} vs {}",
                seed,
                id,
                x,
                greedy.allocations[id]
            );
        }
    }
}

#[test]
fn test_negative_base_coefficient_uses_greedy() {
    let config = PreboundaryConfig {
        lambda_risk: 0.6,
        ..config(1_000.0, 2, 0.0)
    };
    let mut rng = ChaCha8Rng::seed_from_u64(9);
    let set = scenario_set(&random_rows(&mut rng, 4, true));
    let result = PortfolioOptimizer::new(&config).optimize(&set);
    assert_eq!(result.solver, SolverKind::Greedy);
    assert_hard_constraints(&result, &config);
}

#[test]
fn test_crossing_scenarios_never_lose_to_greedy() {
    let config = config(1_000.0, 2, 100.0);
    let set = scenario_set(&[
        Row {
            id: "a".to_string(),
            d: [100.0, 100.0, 100.0],
            n: [50.0, 40.0, 10.0],
        },
        Row {
            id: "b".to_string(),
            d: [100.0, 100.0, 100.0],
            n: [10.0, 40.0, 50.0],
        },
    ]);
    let optimizer = PortfolioOptimizer::new(&config);
    let result = optimizer.optimize(&set);
    let greedy = optimizer.optimize_greedy(&set);

    // Best split is on the kink R_conservative == R_aggressive: 500 / 500.
    assert!(result.objective >= greedy.objective - 1e-9);
    assert!((result.objective - 55.0).abs() < 1e-3, "objective {}", result.objective);
    assert!((result.allocations["a"] - 500.0).abs() < 1.0);
    assert!((result.allocations["b"] - 500.0).abs() < 1.0);
    assert_hard_constraints(&result, &config);
}

#[test]
fn test_configured_greedy_mode() {
    let mut config = config(1_000.0, 2, 0.0);
    config.solver.mode = SolverMode::Greedy;
    let set = scenario_set(&[flat("a", 100.0, 50.0), flat("b", 100.0, 40.0)]);
    let result = PortfolioOptimizer::new(&config).optimize(&set);
    assert_eq!(result.solver, SolverKind::Greedy);
    assert_hard_constraints(&result, &config);
}
