//! Portfolio Optimizer
//!
//! Chooses `x >= 0` with `sum(x) == V` maximizing
//!
//! ```text
//! E[R(x)] - λ · (R_base(x) - min(R_conservative(x), R_aggressive(x)))
//! ```
//!
//! where `R_s(x) = Σ_i N_{i,s} · x_i / (D_{i,s} + x_i)`.
//!
//! # Two stages
//!
//! Solving cardinality and allocation jointly is combinatorial, so this is a
//! deliberate approximation:
//!
//! 1. **Selection.** Eligible candidates (`N_base > 0`) are ranked by
//!    `N_base / D_base`, descending, ties by ascending id. The top
//!    `min(k_max, eligible)` are selected, reduced until
//!    `k · min_allocation_threshold <= V` (result then `constrained`).
//! 2. **Redistribution.** Every selected candidate starts at the threshold;
//!    the rest of the budget goes where the marginal risk-adjusted return is
//!    highest. Water-filling bisects on the common marginal level; the greedy
//!    solver hands out discrete increments using exact objective gains.
//!
//! The `min(...)` leg is fixed per solve and re-checked afterwards. For a
//! validated scenario set the conservative leg is always the minimum, so the
//! objective is separable. When an effective scenario coefficient is
//! negative the objective is not concave and greedy is used instead.

use crate::preboundary::config::{PreboundaryConfig, SolverConfig, SolverMode};
use crate::preboundary::guardrails::validate_allocation;
use crate::preboundary::scenarios::{ForecastScenario, ScenarioSet};
use crate::preboundary::types::{CandidateId, DecisionWindow, ScenarioName, ScenarioValues};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tracing::{debug, info, warn};

// =============================================================================
// RESULT
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AllocationStatus {
    Success,
    Constrained,
    Degenerate,
}

impl AllocationStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            AllocationStatus::Success => "success",
            AllocationStatus::Constrained => "constrained",
            AllocationStatus::Degenerate => "degenerate",
        }
    }
}

impl std::fmt::Display for AllocationStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for AllocationStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "success" => Ok(AllocationStatus::Success),
            "constrained" => Ok(AllocationStatus::Constrained),
            "degenerate" => Ok(AllocationStatus::Degenerate),
            other => Err(format!("unknown optimizer status '{}'", other)),
        }
    }
}

/// Which routine produced the allocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SolverKind {
    WaterFill,
    Greedy,
    /// Nothing to distribute (degenerate or unaffordable).
    Skipped,
}

/// Allocation for one decision instant. Built once, never patched.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AllocationResult {
    pub decision_window: DecisionWindow,
    pub budget: f64,
    /// Every known candidate, zero when not allocated.
    pub allocations: BTreeMap<CandidateId, f64>,
    pub scenario_returns: ScenarioValues<f64>,
    pub expected_return: f64,
    /// `R_base - min(R_conservative, R_aggressive)`.
    pub downside_return: f64,
    /// `min_s R_s`.
    pub worst_case_return: f64,
    /// `λ · downside_return`.
    pub risk_adjustment: f64,
    pub objective: f64,
    pub num_active: usize,
    pub constrained: bool,
    pub status: AllocationStatus,
    pub solver: SolverKind,
    /// Guardrail warnings, in check order.
    pub warnings: Vec<String>,
}

impl AllocationResult {
    /// Convert a return in units to basis points of the budget.
    pub fn to_bps(&self, value: f64) -> f64 {
        if self.budget > 0.0 {
            value / self.budget * 10_000.0
        } else {
            0.0
        }
    }

    pub fn expected_return_bps(&self) -> f64 {
        self.to_bps(self.expected_return)
    }

    pub fn downside_bps(&self) -> f64 {
        self.to_bps(self.downside_return)
    }

    pub fn risk_adjustment_bps(&self) -> f64 {
        self.to_bps(self.risk_adjustment)
    }

    pub fn scenario_returns_bps(&self) -> ScenarioValues<f64> {
        self.scenario_returns.map(|_, r| self.to_bps(*r))
    }

    pub fn total_allocated(&self) -> f64 {
        self.allocations.values().sum()
    }

    /// Candidates with a nonzero allocation, in id order.
    pub fn active(&self) -> impl Iterator<Item = (&CandidateId, f64)> {
        self.allocations
            .iter()
            .filter(|(_, x)| **x > 0.0)
            .map(|(id, x)| (id, *x))
    }
}

/// Ranked eligible candidate.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RankedCandidate {
    pub candidate_id: CandidateId,
    /// `N_base / D_base`.
    pub marginal_return: f64,
}

/// Outcome of the selection stage.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Selection {
    /// All eligible candidates, best first.
    pub ranking: Vec<RankedCandidate>,
    /// Top `effective_k` of the ranking.
    pub selected: Vec<CandidateId>,
    pub effective_k: usize,
    /// Cardinality was reduced to afford the minimum threshold.
    pub constrained: bool,
}

impl Selection {
    pub fn is_degenerate(&self) -> bool {
        self.ranking.is_empty()
    }
}

// =============================================================================
// RETURN CURVES
// =============================================================================

/// `N_s · x / (D_s + x)` for the three scenarios of one candidate.
#[derive(Debug, Clone)]
struct Curve {
    id: CandidateId,
    numerator: ScenarioValues<f64>,
    denominator: ScenarioValues<f64>,
}

impl Curve {
    fn from_triple(triple: ScenarioValues<&ForecastScenario>) -> Self {
        Self {
            id: triple.base.candidate_id.clone(),
            numerator: triple.map(|_, f| f.final_numerator),
            denominator: triple.map(|_, f| f.final_denominator),
        }
    }

    fn value(&self, scenario: ScenarioName, x: f64) -> f64 {
        let d = self.denominator.get(scenario) + x;
        if x <= 0.0 || d <= 0.0 {
            return 0.0;
        }
        self.numerator.get(scenario) * x / d
    }

    fn returns(&self, x: f64) -> ScenarioValues<f64> {
        ScenarioValues::from_fn(|s| self.value(s, x))
    }

    /// Derivative of `Σ_s coef_s · R_s` at `x`.
    fn marginal(&self, coef: &ScenarioValues<f64>, x: f64) -> f64 {
        coef.iter()
            .map(|(s, c)| {
                let d = *self.denominator.get(s);
                let denom = (d + x) * (d + x);
                if denom <= 0.0 {
                    0.0
                } else {
                    c * self.numerator.get(s) * d / denom
                }
            })
            .sum()
    }

    fn is_eligible(&self) -> bool {
        self.numerator.base > 0.0 && self.denominator.base > 0.0
    }

    fn rank_score(&self) -> f64 {
        self.numerator.base / self.denominator.base
    }
}

/// Scenario that supplies the `min` in the downside term.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum DownsideLeg {
    Conservative,
    Aggressive,
}

impl DownsideLeg {
    fn of(returns: &ScenarioValues<f64>) -> Self {
        if returns.aggressive < returns.conservative {
            DownsideLeg::Aggressive
        } else {
            DownsideLeg::Conservative
        }
    }

    fn scenario(&self) -> ScenarioName {
        match self {
            DownsideLeg::Conservative => ScenarioName::Conservative,
            DownsideLeg::Aggressive => ScenarioName::Aggressive,
        }
    }
}

/// Objective decomposition for a vector of scenario totals.
#[derive(Debug, Clone, Copy)]
struct Breakdown {
    returns: ScenarioValues<f64>,
    expected: f64,
    downside: f64,
    worst_case: f64,
    risk_adjustment: f64,
    objective: f64,
}

// =============================================================================
// OPTIMIZER
// =============================================================================

pub struct PortfolioOptimizer<'a> {
    config: &'a PreboundaryConfig,
}

impl<'a> PortfolioOptimizer<'a> {
    pub fn new(config: &'a PreboundaryConfig) -> Self {
        Self { config }
    }

    /// Allocate the configured budget over the candidates of `set`.
    ///
    /// Candidates missing from any scenario are kept at zero.
    pub fn optimize(&self, set: &ScenarioSet) -> AllocationResult {
        let budget = self.config.budget;
        let floor = self.config.min_allocation_threshold;
        let curves = curves_of(set);
        let mut allocations: BTreeMap<CandidateId, f64> =
            set.candidate_ids().into_iter().map(|id| (id, 0.0)).collect();

        let selection = self.select(&curves);
        let selected: Vec<&Curve> = selection
            .selected
            .iter()
            .filter_map(|id| curves.iter().find(|c| &c.id == id))
            .collect();

        let (status, solver) = if selection.is_degenerate() {
            info!(
                "No candidate with positive base reward in window {}; returning zero allocation",
                set.window
            );
            (AllocationStatus::Degenerate, SolverKind::Skipped)
        } else if selected.is_empty() {
            warn!(
                "Minimum threshold {:.2} exceeds budget {:.2} in window {}; nothing allocated",
                floor, budget, set.window
            );
            (AllocationStatus::Constrained, SolverKind::Skipped)
        } else {
            let (x, solver) = self.allocate(&selected, floor, budget);
            for (curve, units) in selected.iter().zip(x) {
                allocations.insert(curve.id.clone(), units);
            }
            let status = if selection.constrained {
                warn!(
                    "Window {}: cardinality reduced to {} to afford threshold {:.2}",
                    set.window, selection.effective_k, floor
                );
                AllocationStatus::Constrained
            } else {
                AllocationStatus::Success
            };
            (status, solver)
        };

        let mut totals = ScenarioValues::new(0.0, 0.0, 0.0);
        for curve in &curves {
            let x = allocations.get(&curve.id).copied().unwrap_or(0.0);
            for (s, r) in curve.returns(x).iter() {
                *totals.get_mut(s) += r;
            }
        }
        let breakdown = self.breakdown(totals);

        let mut result = AllocationResult {
            decision_window: set.window,
            budget,
            num_active: allocations.values().filter(|x| **x > 0.0).count(),
            allocations,
            scenario_returns: breakdown.returns,
            expected_return: breakdown.expected,
            downside_return: breakdown.downside,
            worst_case_return: breakdown.worst_case,
            risk_adjustment: breakdown.risk_adjustment,
            objective: breakdown.objective,
            constrained: selection.constrained || status == AllocationStatus::Constrained,
            status,
            solver,
            warnings: Vec::new(),
        };

        let report = validate_allocation(&result, &set.candidate_ids(), self.config);
        for warning in &report.warnings {
            warn!("Guardrail ({}): {}", set.window, warning);
        }
        result.warnings = report.warnings;

        info!(
            "Allocation for window {}: {} active, status {}, solver {:?}, E[R]={:.2} downside={:.2} objective={:.2}",
            result.decision_window,
            result.num_active,
            result.status,
            result.solver,
            result.expected_return,
            result.downside_return,
            result.objective
        );
        result
    }

    /// Rank eligible candidates and pick the affordable top `k`.
    pub fn select_candidates(&self, set: &ScenarioSet) -> Selection {
        self.select(&curves_of(set))
    }

    fn select(&self, curves: &[Curve]) -> Selection {
        let mut ranking: Vec<RankedCandidate> = curves
            .iter()
            .filter(|c| c.is_eligible())
            .map(|c| RankedCandidate {
                candidate_id: c.id.clone(),
                marginal_return: c.rank_score(),
            })
            .collect();
        ranking.sort_by(|a, b| {
            b.marginal_return
                .total_cmp(&a.marginal_return)
                .then_with(|| a.candidate_id.cmp(&b.candidate_id))
        });

        let budget = self.config.budget;
        let floor = self.config.min_allocation_threshold;
        let slack = self.config.solver.budget_epsilon * budget.abs().max(1.0);

        let mut effective_k = self.config.k_max.min(ranking.len());
        let mut constrained = false;
        while effective_k > 0 && effective_k as f64 * floor > budget + slack {
            effective_k -= 1;
            constrained = true;
        }

        let selected = ranking
            .iter()
            .take(effective_k)
            .map(|r| r.candidate_id.clone())
            .collect();

        debug!(
            "Selection: {} eligible, effective_k={} (k_max={}), constrained={}",
            ranking.len(),
            effective_k,
            self.config.k_max,
            constrained
        );

        Selection {
            ranking,
            selected,
            effective_k,
            constrained,
        }
    }

    /// Distribute `budget` over `selected` (rank order), each at least `floor`.
    fn allocate(&self, selected: &[&Curve], floor: f64, budget: f64) -> (Vec<f64>, SolverKind) {
        if self.config.solver.mode == SolverMode::Greedy {
            return (self.greedy_allocate(selected, floor, budget), SolverKind::Greedy);
        }

        let mut best: Option<(Vec<f64>, f64)> = None;
        let mut settled = false;
        for leg in [DownsideLeg::Conservative, DownsideLeg::Aggressive] {
            let coef = self.coefficients(leg);
            if coef.iter().any(|(_, c)| *c < 0.0) {
                debug!("Effective coefficient negative for {:?} leg; objective not concave", leg);
                best = None;
                break;
            }
            let x = self.water_fill(selected, &coef, floor, budget);
            let totals = scenario_totals(selected, &x);
            let objective = self.breakdown(totals).objective;
            let consistent = DownsideLeg::of(&totals) == leg;
            let better = best.as_ref().map_or(true, |(_, o)| objective > *o);
            if better {
                best = Some((x, objective));
            }
            if consistent {
                settled = true;
                break;
            }
            debug!("Downside leg changed after {:?} solve; re-solving", leg);
        }

        match best {
            Some((x, _)) if settled => (x, SolverKind::WaterFill),
            Some((x, objective)) => {
                // Optimum sits where the conservative and aggressive returns cross.
                let greedy = self.greedy_allocate(selected, floor, budget);
                let greedy_objective = self.breakdown(scenario_totals(selected, &greedy)).objective;
                if greedy_objective > objective {
                    warn!(
                        "No consistent downside leg; greedy objective {:.6} beats water-fill {:.6}",
                        greedy_objective, objective
                    );
                    (greedy, SolverKind::Greedy)
                } else {
                    (x, SolverKind::WaterFill)
                }
            }
            None => {
                warn!("Water-filling unavailable; using greedy allocation");
                (self.greedy_allocate(selected, floor, budget), SolverKind::Greedy)
            }
        }
    }

    /// Bisection on the common marginal level `μ`.
    ///
    /// Each candidate takes the largest `x >= floor` whose marginal is still
    /// at least `μ`; `μ` is searched so the total meets the budget. Any
    /// residual goes to the candidate with the highest marginal.
    fn water_fill(
        &self,
        selected: &[&Curve],
        coef: &ScenarioValues<f64>,
        floor: f64,
        budget: f64,
    ) -> Vec<f64> {
        let n = selected.len();
        let remaining = budget - floor * n as f64;
        if n == 0 || remaining <= 0.0 {
            return vec![floor; n];
        }
        let ceiling = floor + remaining;
        let iterations = self.config.solver.max_iterations;
        let tolerance = self.config.solver.tolerance * budget.max(1.0);

        let at_floor: Vec<f64> = selected.iter().map(|c| c.marginal(coef, floor)).collect();
        let top = at_floor.iter().copied().fold(0.0_f64, f64::max);

        let level_alloc = |i: usize, mu: f64| -> f64 {
            let curve = selected[i];
            if at_floor[i] <= mu {
                return floor;
            }
            if curve.marginal(coef, ceiling) >= mu {
                return ceiling;
            }
            let (mut lo, mut hi) = (floor, ceiling);
            for _ in 0..iterations {
                let mid = 0.5 * (lo + hi);
                if curve.marginal(coef, mid) >= mu {
                    lo = mid;
                } else {
                    hi = mid;
                }
                if hi - lo <= f64::EPSILON * ceiling {
                    break;
                }
            }
            lo
        };
        let fill = |mu: f64| -> Vec<f64> { (0..n).map(|i| level_alloc(i, mu)).collect() };

        let mut x = if top > 0.0 {
            // fill(hi) never exceeds the budget
            let (mut lo, mut hi) = (0.0, top);
            let mut below = vec![floor; n];
            for _ in 0..iterations {
                let mid = 0.5 * (lo + hi);
                let candidate = fill(mid);
                let total: f64 = candidate.iter().sum();
                if total > budget {
                    lo = mid;
                } else {
                    hi = mid;
                    below = candidate;
                    if budget - total <= tolerance {
                        break;
                    }
                }
            }
            below
        } else {
            vec![floor; n]
        };

        let residual = budget - x.iter().sum::<f64>();
        if residual > tolerance {
            debug!("Water-fill residual {:.6} after {} iterations", residual, iterations);
        }
        if residual > 0.0 {
            let mut target = 0;
            for i in 1..n {
                if selected[i].marginal(coef, x[i]) > selected[target].marginal(coef, x[target]) {
                    target = i;
                }
            }
            x[target] += residual;
        }
        x
    }

    /// [`optimize`](Self::optimize) with the greedy solver forced.
    pub fn optimize_greedy(&self, set: &ScenarioSet) -> AllocationResult {
        let config = PreboundaryConfig {
            solver: SolverConfig {
                mode: SolverMode::Greedy,
                ..self.config.solver
            },
            ..self.config.clone()
        };
        PortfolioOptimizer::new(&config).optimize(set)
    }

    /// Discrete greedy: `greedy_increments` equal steps above the floor, each
    /// to the candidate with the largest exact objective gain (lowest rank on
    /// ties). The last step takes the exact remainder.
    fn greedy_allocate(&self, selected: &[&Curve], floor: f64, budget: f64) -> Vec<f64> {
        let n = selected.len();
        let mut x = vec![floor; n];
        let remaining = budget - floor * n as f64;
        if n == 0 || remaining <= 0.0 {
            return x;
        }

        let steps = self.config.solver.greedy_increments.max(1);
        let increment = remaining / steps as f64;
        let mut totals = scenario_totals(selected, &x);
        let mut handed_out = 0.0;

        for step in 0..steps {
            let delta = if step + 1 == steps {
                remaining - handed_out
            } else {
                increment
            };
            let current = self.breakdown(totals).objective;

            let mut best_index = 0;
            let mut best_gain = f64::NEG_INFINITY;
            let mut best_totals = totals;
            for (i, curve) in selected.iter().enumerate() {
                let before = curve.returns(x[i]);
                let after = curve.returns(x[i] + delta);
                let trial = totals.map(|s, t| t - before.get(s) + after.get(s));
                let gain = self.breakdown(trial).objective - current;
                if gain > best_gain {
                    best_gain = gain;
                    best_index = i;
                    best_totals = trial;
                }
            }

            x[best_index] += delta;
            totals = best_totals;
            handed_out += delta;
        }
        x
    }

    /// `coef_s = w_s - λ·[s = base] + λ·[s = leg]`.
    fn coefficients(&self, leg: DownsideLeg) -> ScenarioValues<f64> {
        let lambda = self.config.lambda_risk;
        let weights = &self.config.scenario_weights;
        ScenarioValues::from_fn(|s| {
            let mut c = weights.weight(s);
            if s == ScenarioName::Base {
                c -= lambda;
            }
            if s == leg.scenario() {
                c += lambda;
            }
            c
        })
    }

    fn breakdown(&self, returns: ScenarioValues<f64>) -> Breakdown {
        let weights = &self.config.scenario_weights;
        let expected = returns
            .iter()
            .map(|(s, r)| weights.weight(s) * r)
            .sum::<f64>();
        let downside = returns.base - returns.conservative.min(returns.aggressive);
        let worst_case = returns
            .conservative
            .min(returns.base)
            .min(returns.aggressive);
        let risk_adjustment = self.config.lambda_risk * downside;
        Breakdown {
            returns,
            expected,
            downside,
            worst_case,
            risk_adjustment,
            objective: expected - risk_adjustment,
        }
    }
}

/// Curves of candidates present in all three scenarios, in id order.
fn curves_of(set: &ScenarioSet) -> Vec<Curve> {
    set.candidate_ids()
        .iter()
        .filter_map(|id| set.triple(id).map(Curve::from_triple))
        .collect()
}

fn scenario_totals(selected: &[&Curve], x: &[f64]) -> ScenarioValues<f64> {
    let mut totals = ScenarioValues::new(0.0, 0.0, 0.0);
    for (curve, units) in selected.iter().zip(x) {
        for (s, r) in curve.returns(*units).iter() {
            *totals.get_mut(s) += r;
        }
    }
    totals
}
