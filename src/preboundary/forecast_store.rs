//! Forecast Output Rows
//!
//! Flattens one [`AllocationResult`] into per-candidate rows keyed by
//! `(run_id, decision_window, candidate_id)` and persists them in SQLite.
//!
//! # Schema
//!
//! ```sql
//! CREATE TABLE preboundary_forecasts (
//!     run_id TEXT NOT NULL,
//!     decision_window TEXT NOT NULL,
//!     candidate_id TEXT NOT NULL,
//!     recommended_units REAL NOT NULL,
//!     return_conservative_bps REAL NOT NULL,
//!     return_base_bps REAL NOT NULL,
//!     return_aggressive_bps REAL NOT NULL,
//!     portfolio_return_bps REAL NOT NULL,
//!     portfolio_downside_bps REAL NOT NULL,
//!     risk_adjustment_bps REAL NOT NULL,
//!     confidence_penalty REAL NOT NULL,
//!     num_candidates_allocated INTEGER NOT NULL,
//!     was_constrained INTEGER NOT NULL,
//!     optimizer_status TEXT NOT NULL,
//!     source_tag TEXT NOT NULL,
//!     computed_at TEXT NOT NULL,
//!     PRIMARY KEY (run_id, decision_window, candidate_id)
//! ) WITHOUT ROWID;
//! ```
//!
//! `computed_at` exists only in the table; rows themselves carry no clock
//! value, so reruns on frozen inputs produce identical rows.

use crate::preboundary::optimizer::{AllocationResult, AllocationStatus};
use crate::preboundary::scenarios::ScenarioSet;
use crate::preboundary::types::{CandidateId, DecisionWindow, ScenarioName, ScenarioValues};
use chrono::Utc;
use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, info, warn};

const SCHEMA_VERSION: u32 = 1;

/// One persisted row of an allocation run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ForecastRow {
    pub run_id: String,
    pub decision_window: DecisionWindow,
    pub candidate_id: CandidateId,
    pub recommended_units: f64,
    pub return_conservative_bps: f64,
    pub return_base_bps: f64,
    pub return_aggressive_bps: f64,
    pub portfolio_return_bps: f64,
    pub portfolio_downside_bps: f64,
    pub risk_adjustment_bps: f64,
    pub confidence_penalty: f64,
    pub num_candidates_allocated: usize,
    pub was_constrained: bool,
    pub optimizer_status: AllocationStatus,
    /// Weakest proxy tier behind the candidate's scenarios.
    pub source_tag: String,
}

/// Build one row per candidate of `result`.
///
/// Per-candidate bps is the return per allocated unit under each scenario;
/// at zero allocation it is the first-unit rate `N / D`.
pub fn forecast_rows(
    run_id: &str,
    scenarios: &ScenarioSet,
    result: &AllocationResult,
) -> Vec<ForecastRow> {
    result
        .allocations
        .iter()
        .map(|(id, units)| {
            let (per_unit, penalty, tag) = match scenarios.triple(id) {
                Some(t) => (
                    t.map(|_, f| {
                        let rate = if *units > 0.0 {
                            f.final_numerator / (f.final_denominator + units)
                        } else if f.final_denominator > 0.0 {
                            f.final_numerator / f.final_denominator
                        } else {
                            0.0
                        };
                        rate * 10_000.0
                    }),
                    t.base.confidence_penalty,
                    t.base.source_tier.as_str().to_string(),
                ),
                None => (
                    ScenarioValues::new(0.0, 0.0, 0.0),
                    0.0,
                    "unknown".to_string(),
                ),
            };
            ForecastRow {
                run_id: run_id.to_string(),
                decision_window: result.decision_window,
                candidate_id: id.clone(),
                recommended_units: *units,
                return_conservative_bps: *per_unit.get(ScenarioName::Conservative),
                return_base_bps: *per_unit.get(ScenarioName::Base),
                return_aggressive_bps: *per_unit.get(ScenarioName::Aggressive),
                portfolio_return_bps: result.expected_return_bps(),
                portfolio_downside_bps: result.downside_bps(),
                risk_adjustment_bps: result.risk_adjustment_bps(),
                confidence_penalty: penalty,
                num_candidates_allocated: result.num_active,
                was_constrained: result.constrained,
                optimizer_status: result.status,
                source_tag: tag,
            }
        })
        .collect()
}

// =============================================================================
// STORE
// =============================================================================

/// SQLite sink for [`ForecastRow`]s. Rewrites are upserts on the key.
pub struct ForecastStore {
    conn: Arc<Mutex<Connection>>,
}

impl ForecastStore {
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, ForecastStoreError> {
        let conn = Connection::open(path)?;
        let store = Self {
            conn: Arc::new(Mutex::new(conn)),
        };
        store.initialize_schema()?;
        Ok(store)
    }

    /// Create an in-memory store (for testing).
    pub fn in_memory() -> Result<Self, ForecastStoreError> {
        let conn = Connection::open_in_memory()?;
        let store = Self {
            conn: Arc::new(Mutex::new(conn)),
        };
        store.initialize_schema()?;
        Ok(store)
    }

    fn initialize_schema(&self) -> Result<(), ForecastStoreError> {
        let conn = self.conn.lock();

        conn.execute(
            "CREATE TABLE IF NOT EXISTS schema_version (version INTEGER PRIMARY KEY)",
            [],
        )?;
        let current_version: Option<u32> = conn
            .query_row("SELECT version FROM schema_version LIMIT 1", [], |row| {
                row.get(0)
            })
            .optional()?;

        match current_version {
            None => {
                conn.execute_batch(
                    r#"
                    CREATE TABLE IF NOT EXISTS preboundary_forecasts (
                        run_id TEXT NOT NULL,
                        decision_window TEXT NOT NULL,
                        candidate_id TEXT NOT NULL,
                        recommended_units REAL NOT NULL,
                        return_conservative_bps REAL NOT NULL,
                        return_base_bps REAL NOT NULL,
                        return_aggressive_bps REAL NOT NULL,
                        portfolio_return_bps REAL NOT NULL,
                        portfolio_downside_bps REAL NOT NULL,
                        risk_adjustment_bps REAL NOT NULL,
                        confidence_penalty REAL NOT NULL,
                        num_candidates_allocated INTEGER NOT NULL,
                        was_constrained INTEGER NOT NULL,
                        optimizer_status TEXT NOT NULL,
                        source_tag TEXT NOT NULL,
                        computed_at TEXT NOT NULL,
                        PRIMARY KEY (run_id, decision_window, candidate_id)
                    ) WITHOUT ROWID;

                    CREATE INDEX IF NOT EXISTS idx_forecasts_window
                        ON preboundary_forecasts(decision_window, run_id);
                    "#,
                )?;
                conn.execute(
                    "INSERT INTO schema_version (version) VALUES (?)",
                    [SCHEMA_VERSION],
                )?;
                info!("Created forecast store schema v{}", SCHEMA_VERSION);
            }
            Some(v) if v == SCHEMA_VERSION => {
                debug!("Forecast store schema at v{}", SCHEMA_VERSION);
            }
            Some(v) => {
                warn!(
                    "Forecast store schema version mismatch: expected {}, got {}",
                    SCHEMA_VERSION, v
                );
            }
        }
        Ok(())
    }

    /// Insert or replace rows in one transaction. Returns the row count.
    pub fn upsert_rows(&self, rows: &[ForecastRow]) -> Result<usize, ForecastStoreError> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;
        let computed_at = Utc::now().to_rfc3339();
        {
            let mut stmt = tx.prepare(
                r#"
                INSERT INTO preboundary_forecasts (
                    run_id, decision_window, candidate_id, recommended_units,
                    return_conservative_bps, return_base_bps, return_aggressive_bps,
                    portfolio_return_bps, portfolio_downside_bps, risk_adjustment_bps,
                    confidence_penalty, num_candidates_allocated, was_constrained,
                    optimizer_status, source_tag, computed_at
                ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16)
                ON CONFLICT(run_id, decision_window, candidate_id) DO UPDATE SET
                    recommended_units = excluded.recommended_units,
                    return_conservative_bps = excluded.return_conservative_bps,
                    return_base_bps = excluded.return_base_bps,
                    return_aggressive_bps = excluded.return_aggressive_bps,
                    portfolio_return_bps = excluded.portfolio_return_bps,
                    portfolio_downside_bps = excluded.portfolio_downside_bps,
                    risk_adjustment_bps = excluded.risk_adjustment_bps,
                    confidence_penalty = excluded.confidence_penalty,
                    num_candidates_allocated = excluded.num_candidates_allocated,
                    was_constrained = excluded.was_constrained,
                    optimizer_status = excluded.optimizer_status,
                    source_tag = excluded.source_tag,
                    computed_at = excluded.computed_at
                "#,
            )?;
            for row in rows {
                stmt.execute(params![
                    row.run_id,
                    row.decision_window.as_str(),
                    row.candidate_id,
                    row.recommended_units,
                    row.return_conservative_bps,
                    row.return_base_bps,
                    row.return_aggressive_bps,
                    row.portfolio_return_bps,
                    row.portfolio_downside_bps,
                    row.risk_adjustment_bps,
                    row.confidence_penalty,
                    row.num_candidates_allocated as i64,
                    row.was_constrained,
                    row.optimizer_status.as_str(),
                    row.source_tag,
                    computed_at,
                ])?;
            }
        }
        tx.commit()?;
        debug!("Upserted {} forecast rows", rows.len());
        Ok(rows.len())
    }

    /// Rows of one run, ordered by window then candidate.
    pub fn load_rows(&self, run_id: &str) -> Result<Vec<ForecastRow>, ForecastStoreError> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            r#"
            SELECT run_id, decision_window, candidate_id, recommended_units,
                   return_conservative_bps, return_base_bps, return_aggressive_bps,
                   portfolio_return_bps, portfolio_downside_bps, risk_adjustment_bps,
                   confidence_penalty, num_candidates_allocated, was_constrained,
                   optimizer_status, source_tag
            FROM preboundary_forecasts
            WHERE run_id = ?1
            ORDER BY decision_window, candidate_id
            "#,
        )?;

        let raw = stmt
            .query_map([run_id], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                    [
                        row.get::<_, f64>(3)?,
                        row.get::<_, f64>(4)?,
                        row.get::<_, f64>(5)?,
                        row.get::<_, f64>(6)?,
                        row.get::<_, f64>(7)?,
                        row.get::<_, f64>(8)?,
                        row.get::<_, f64>(9)?,
                        row.get::<_, f64>(10)?,
                    ],
                    row.get::<_, i64>(11)?,
                    row.get::<_, bool>(12)?,
                    row.get::<_, String>(13)?,
                    row.get::<_, String>(14)?,
                ))
            })?
            .collect::<Result<Vec<_>, _>>()?;

        let mut rows = Vec::with_capacity(raw.len());
        for (run_id, window, candidate_id, v, active, constrained, status, tag) in raw {
            let decision_window = window
                .parse::<DecisionWindow>()
                .map_err(ForecastStoreError::InvalidRow)?;
            let optimizer_status = status
                .parse::<AllocationStatus>()
                .map_err(ForecastStoreError::InvalidRow)?;
            rows.push(ForecastRow {
                run_id,
                decision_window,
                candidate_id,
                recommended_units: v[0],
                return_conservative_bps: v[1],
                return_base_bps: v[2],
                return_aggressive_bps: v[3],
                portfolio_return_bps: v[4],
                portfolio_downside_bps: v[5],
                risk_adjustment_bps: v[6],
                confidence_penalty: v[7],
                num_candidates_allocated: active.max(0) as usize,
                was_constrained: constrained,
                optimizer_status,
                source_tag: tag,
            });
        }
        Ok(rows)
    }

    /// `computed_at` of a stored row.
    pub fn computed_at(
        &self,
        run_id: &str,
        window: DecisionWindow,
        candidate_id: &str,
    ) -> Result<Option<String>, ForecastStoreError> {
        let conn = self.conn.lock();
        let value = conn
            .query_row(
                "SELECT computed_at FROM preboundary_forecasts
                 WHERE run_id = ?1 AND decision_window = ?2 AND candidate_id = ?3",
                params![run_id, window.as_str(), candidate_id],
                |row| row.get(0),
            )
            .optional()?;
        Ok(value)
    }

    /// Export a run as pretty JSON.
    pub fn export_json(&self, run_id: &str) -> Result<String, ForecastStoreError> {
        let rows = self.load_rows(run_id)?;
        Ok(serde_json::to_string_pretty(&rows)?)
    }
}

#[derive(Debug)]
pub enum ForecastStoreError {
    Sqlite(rusqlite::Error),
    Serialization(serde_json::Error),
    InvalidRow(String),
}

impl std::fmt::Display for ForecastStoreError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Sqlite(e) => write!(f, "SQLite error: {}", e),
            Self::Serialization(e) => write!(f, "Serialization error: {}", e),
            Self::InvalidRow(reason) => write!(f, "Invalid stored row: {}", reason),
        }
    }
}

impl std::error::Error for ForecastStoreError {}

impl From<rusqlite::Error> for ForecastStoreError {
    fn from(e: rusqlite::Error) -> Self {
        Self::Sqlite(e)
    }
}

impl From<serde_json::Error> for ForecastStoreError {
    fn from(e: serde_json::Error) -> Self {
        Self::Serialization(e)
    }
}

// =============================================================================
// TESTS
// =============================================================================
