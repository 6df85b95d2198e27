//! Pre-Boundary Allocation CLI
//!
//! Loads candidate snapshots and resolved episodes from JSON, runs the
//! allocation pipeline per decision window, and optionally persists the
//! forecast rows to SQLite.
//!
//! Usage:
//!   cargo run --release --bin preboundary -- optimize --snapshots snaps.json --episodes history.json
//!   cargo run --release --bin preboundary -- optimize --snapshots snaps.json --episodes history.json --window T-1 --db forecasts.db
//!   cargo run --release --bin preboundary -- proxies --snapshots snaps.json --episodes history.json --window day
//!   cargo run --release --bin preboundary -- evaluate --run run.json --realized outcomes.json

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use preboundary_backend::preboundary::{
    evaluate_realized, forecast_rows, run_pipeline, validate_proxies, AllocationResult,
    CandidateSnapshot, DecisionWindow, ForecastStore, HistoricalEpisode, PreboundaryConfig,
    ProxyEstimator, RealizedOutcome,
};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Scenario-based pre-boundary allocation
#[derive(Parser, Debug)]
#[command(name = "preboundary")]
#[command(about = "Forecast final pool state and allocate a budget under downside risk")]
struct Cli {
    /// TOML config (defaults when absent)
    #[arg(short, long, env = "PREBOUNDARY_CONFIG_PATH")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Estimate proxies, build scenarios and allocate for each window
    Optimize {
        /// JSON array of candidate snapshots
        #[arg(long)]
        snapshots: PathBuf,

        /// JSON array of historical episodes
        #[arg(long)]
        episodes: PathBuf,

        /// Windows to run (default: every window present in the snapshots)
        #[arg(short, long, value_parser = parse_window)]
        window: Vec<DecisionWindow>,

        /// Override the configured budget
        #[arg(long)]
        budget: Option<f64>,

        /// Run identifier used as the row key (random when omitted)
        #[arg(long)]
        run_id: Option<String>,

        /// SQLite database to upsert forecast rows into
        #[arg(long)]
        db: Option<PathBuf>,

        /// Write the run as JSON (stdout summary only if not specified)
        #[arg(short, long)]
        output: Option<PathBuf>,
    },

    /// Print learned proxies and their diagnostics for one window
    Proxies {
        #[arg(long)]
        snapshots: PathBuf,

        #[arg(long)]
        episodes: PathBuf,

        #[arg(short, long, value_parser = parse_window)]
        window: DecisionWindow,
    },

    /// Score a stored run against realized final values
    Evaluate {
        /// JSON written by `optimize --output`
        #[arg(long)]
        run: PathBuf,

        /// JSON array of realized outcomes
        #[arg(long)]
        realized: PathBuf,

        #[arg(short, long, value_parser = parse_window)]
        window: Option<DecisionWindow>,
    },
}

/// Serialized output of one `optimize` invocation.
#[derive(Debug, Serialize, Deserialize)]
struct RunOutput {
    run_id: String,
    results: Vec<AllocationResult>,
}

fn parse_window(s: &str) -> std::result::Result<DecisionWindow, String> {
    s.parse()
}

fn main() -> Result<()> {
    let _ = dotenv::dotenv();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "preboundary_backend=info,preboundary=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let cli = Cli::parse();
    let config = match &cli.config {
        Some(path) => PreboundaryConfig::load(path)
            .with_context(|| format!("Failed to load config: {:?}", path))?,
        None => PreboundaryConfig::from_env(),
    };

    match cli.command {
        Commands::Optimize {
            snapshots,
            episodes,
            window,
            budget,
            run_id,
            db,
            output,
        } => {
            let config = match budget {
                Some(budget) => config.with_budget(budget),
                None => config,
            };
            optimize(
                &config,
                &snapshots,
                &episodes,
                window,
                run_id,
                db.as_deref(),
                output.as_deref(),
            )
        }
        Commands::Proxies {
            snapshots,
            episodes,
            window,
        } => show_proxies(&config, &snapshots, &episodes, window),
        Commands::Evaluate {
            run,
            realized,
            window,
        } => evaluate(&run, &realized, window),
    }
}

fn read_json<T: DeserializeOwned>(path: &Path) -> Result<T> {
    let contents =
        std::fs::read_to_string(path).with_context(|| format!("Failed to read {:?}", path))?;
    serde_json::from_str(&contents).with_context(|| format!("Failed to parse {:?}", path))
}

fn optimize(
    config: &PreboundaryConfig,
    snapshots_path: &Path,
    episodes_path: &Path,
    windows: Vec<DecisionWindow>,
    run_id: Option<String>,
    db: Option<&Path>,
    output: Option<&Path>,
) -> Result<()> {
    config.validate()?;
    let snapshots: Vec<CandidateSnapshot> = read_json(snapshots_path)?;
    let episodes: Vec<HistoricalEpisode> = read_json(episodes_path)?;

    let windows: BTreeSet<DecisionWindow> = if windows.is_empty() {
        snapshots.iter().map(|s| s.decision_window).collect()
    } else {
        windows.into_iter().collect()
    };
    if windows.is_empty() {
        bail!("No snapshots and no --window given; nothing to optimize");
    }

    let run_id = run_id.unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
    let store = match db {
        Some(path) => Some(
            ForecastStore::open(path)
                .with_context(|| format!("Failed to open database: {:?}", path))?,
        ),
        None => None,
    };

    info!(
        "Run {}: {} snapshots, {} episodes, windows {:?}",
        run_id,
        snapshots.len(),
        episodes.len(),
        windows
    );

    let mut results = Vec::with_capacity(windows.len());
    for window in windows {
        let outcome = run_pipeline(config, window, &snapshots, &episodes)
            .with_context(|| format!("Pipeline failed for window {}", window))?;

        if !outcome.proxy_consistent {
            warn!("Window {} proxies failed consistency checks", window);
        }
        for warning in &outcome.proxy_warnings {
            warn!("Proxy check ({}): {}", window, warning);
        }
        print_allocation(&outcome.allocation);

        if let Some(store) = &store {
            let rows = forecast_rows(&run_id, &outcome.optimized_scenarios(), &outcome.allocation);
            let written = store.upsert_rows(&rows)?;
            info!("Persisted {} forecast rows for window {}", written, window);
        }
        results.push(outcome.allocation);
    }

    if let Some(path) = output {
        let run = RunOutput { run_id, results };
        let json = serde_json::to_string_pretty(&run)?;
        std::fs::write(path, json).with_context(|| format!("Failed to write {:?}", path))?;
        println!("Wrote run to {:?}", path);
    }
    Ok(())
}

fn print_allocation(result: &AllocationResult) {
    println!("=== Window {} ===", result.decision_window);
    println!(
        "status: {}  solver: {:?}  active: {}  constrained: {}",
        result.status, result.solver, result.num_active, result.constrained
    );
    let bps = result.scenario_returns_bps();
    println!(
        "return bps  cons {:>9.2}  base {:>9.2}  aggr {:>9.2}",
        bps.conservative, bps.base, bps.aggressive
    );
    println!(
        "expected {:>9.2} bps  downside {:>9.2} bps  risk adj {:>9.2} bps",
        result.expected_return_bps(),
        result.downside_bps(),
        result.risk_adjustment_bps()
    );
    for (id, units) in result.active() {
        println!("  {:<44} {:>16.2}", id, units);
    }
    for warning in &result.warnings {
        println!("  ⚠ {}", warning);
    }
    println!();
}

fn show_proxies(
    config: &PreboundaryConfig,
    snapshots_path: &Path,
    episodes_path: &Path,
    window: DecisionWindow,
) -> Result<()> {
    let snapshots: Vec<CandidateSnapshot> = read_json(snapshots_path)?;
    let episodes: Vec<HistoricalEpisode> = read_json(episodes_path)?;
    let proxies = ProxyEstimator::new(config)
        .estimate_window(window, &snapshots, &episodes)
        .with_context(|| format!("Proxy estimation failed for window {}", window))?;

    println!(
        "=== Proxies for window {} ({} episodes) ===",
        window, proxies.episode_count
    );
    println!(
        "{:<44} {:>9} {:>9} {:>9} {:>9} {:>9} {:>9} {:>10} {:>7}",
        "candidate", "drift25", "drift50", "drift75", "upl25", "upl50", "upl75", "tier", "penalty"
    );
    for (id, p) in &proxies.candidates {
        println!(
            "{:<44} {:>9.4} {:>9.4} {:>9.4} {:>9.4} {:>9.4} {:>9.4} {:>10} {:>7.2}",
            id,
            p.drift.p25,
            p.drift.p50,
            p.drift.p75,
            p.uplift.p25,
            p.uplift.p50,
            p.uplift.p75,
            p.source_tier(),
            p.confidence_penalty()
        );
    }

    let diag = proxies.diagnostics();
    println!();
    println!("drift tiers:  {:?}", diag.drift_tiers);
    println!("uplift tiers: {:?}", diag.uplift_tiers);
    println!("high-penalty candidates: {}", diag.high_penalty_count);

    let (consistent, warnings) = validate_proxies(&proxies);
    println!("consistent: {}", consistent);
    for warning in warnings {
        println!("  ⚠ {}", warning);
    }
    Ok(())
}

fn evaluate(run_path: &Path, realized_path: &Path, window: Option<DecisionWindow>) -> Result<()> {
    let run: RunOutput = read_json(run_path)?;
    let outcomes: Vec<RealizedOutcome> = read_json(realized_path)?;

    let mut evaluated = 0;
    for result in run
        .results
        .iter()
        .filter(|r| window.map_or(true, |w| r.decision_window == w))
    {
        let eval = evaluate_realized(result, &outcomes);
        println!("=== Run {} window {} ===", run.run_id, eval.decision_window);
        println!(
            "realized {:>9.2} bps  expected {:>9.2} bps  error {:>9.2} bps",
            eval.realized_bps, eval.expected_bps, eval.forecast_error_bps
        );
        println!(
            "baseline all {:>9.2} bps  baseline selected {:>9.2} bps  regret {:>9.2} bps",
            eval.baseline_all_bps, eval.baseline_selected_bps, eval.regret_bps
        );
        println!("cleared worst case: {}", eval.cleared_worst_case);
        if !eval.missing.is_empty() {
            println!("missing outcomes: {:?}", eval.missing);
        }
        println!();
        evaluated += 1;
    }

    if evaluated == 0 {
        bail!("No result in {:?} matches the requested window", run_path);
    }
    Ok(())
}
