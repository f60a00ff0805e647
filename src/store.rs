//! Persistent, transactional storage for observations and cached option
//! tables.
//!
//! A single SQLite file holds three tables: `observations` (one row per
//! command execution, plus synthetic per-segment rows for pipelines),
//! `manopt_cache` (harvested option summaries keyed by base command), and
//! `meta` (key/value bookkeeping such as the last prune instant). Every
//! operation is one short transaction on a mutex-guarded connection; the
//! connection waits up to 5 seconds on a busy database before surfacing
//! `StoreUnavailable`.

use crate::error::ToolError;
use chrono::{DateTime, Utc};
use rusqlite::{Connection, OptionalExtension, params};
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// How long to wait for a busy database before giving up.
const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS observations (
    id                  INTEGER PRIMARY KEY AUTOINCREMENT,
    session_id          TEXT NOT NULL,
    command_fingerprint TEXT NOT NULL,
    command_preview     TEXT NOT NULL,
    template            TEXT NOT NULL,
    exit_code           INTEGER NOT NULL,
    pipestatus          TEXT NOT NULL,
    duration_ms         INTEGER NOT NULL,
    timed_out           INTEGER NOT NULL,
    output_snippet      TEXT,
    error_snippet       TEXT,
    weight              REAL NOT NULL DEFAULT 1.0,
    created_at          TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_observations_fingerprint
    ON observations(command_fingerprint);
CREATE INDEX IF NOT EXISTS idx_observations_template
    ON observations(template, session_id);
CREATE INDEX IF NOT EXISTS idx_observations_created_at
    ON observations(created_at);
CREATE INDEX IF NOT EXISTS idx_observations_weight
    ON observations(weight);
CREATE TABLE IF NOT EXISTS manopt_cache (
    base_command TEXT PRIMARY KEY,
    options_text TEXT NOT NULL,
    created_at   TEXT NOT NULL
);
CREATE TABLE IF NOT EXISTS meta (
    key   TEXT PRIMARY KEY,
    value TEXT NOT NULL
);
";

/// One command execution to persist.
#[derive(Debug, Clone)]
pub struct Observation {
    pub session_id: String,
    pub command_fingerprint: String,
    pub command_preview: String,
    pub template: String,
    pub exit_code: i32,
    pub pipestatus: Vec<i32>,
    pub duration_ms: u64,
    pub timed_out: bool,
    pub output_snippet: Option<String>,
    pub error_snippet: Option<String>,
}

/// Decayed aggregate over all observations sharing a fingerprint.
#[derive(Debug, Clone, serde::Serialize)]
pub struct PatternAggregate {
    pub observations: u64,
    pub weighted_observations: f64,
    pub timeout_rate: f64,
    pub success_rate: f64,
    pub avg_duration_ms: f64,
    pub max_duration_ms: u64,
}

/// One recent outcome of a template, newest first.
#[derive(Debug, Clone, Copy)]
pub struct RecentOutcome {
    pub exit_code: i32,
    pub timed_out: bool,
}

/// Store-wide counts for the stats tool.
#[derive(Debug, Clone, Copy, serde::Serialize)]
pub struct StoreTotals {
    pub total_observations: u64,
    pub total_patterns: u64,
}

/// Thread-safe handle to the SQLite store.
#[derive(Clone)]
pub struct Store {
    conn: Arc<Mutex<Connection>>,
}

impl Store {
    /// Open (creating if necessary) the store at `path`.
    pub fn open(path: &Path) -> Result<Self, ToolError> {
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent)
                .map_err(|e| ToolError::StoreUnavailable(format!("create {parent:?}: {e}")))?;
        }
        let conn = Connection::open(path).map_err(map_sqlite)?;
        conn.busy_timeout(BUSY_TIMEOUT).map_err(map_sqlite)?;
        conn.pragma_update(None, "journal_mode", "WAL")
            .map_err(map_sqlite)?;
        conn.execute_batch(SCHEMA).map_err(map_sqlite)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Insert one observation with weight 1.0 at the current instant.
    pub fn insert_observation(&self, obs: &Observation) -> Result<(), ToolError> {
        let conn = self.lock()?;
        conn.execute(
            "INSERT INTO observations (
                session_id, command_fingerprint, command_preview, template,
                exit_code, pipestatus, duration_ms, timed_out,
                output_snippet, error_snippet, weight, created_at
             ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, 1.0, ?11)",
            params![
                obs.session_id,
                obs.command_fingerprint,
                obs.command_preview,
                obs.template,
                obs.exit_code,
                serde_json::to_string(&obs.pipestatus).unwrap_or_else(|_| "[]".into()),
                obs.duration_ms as i64,
                obs.timed_out as i64,
                obs.output_snippet,
                obs.error_snippet,
                Utc::now().to_rfc3339(),
            ],
        )
        .map_err(map_sqlite)?;
        Ok(())
    }

    /// Aggregate all observations matching a fingerprint, with decay
    /// applied row by row. Returns `None` when the pattern is unknown.
    pub fn query_pattern(
        &self,
        fingerprint: &str,
        half_life_hours: f64,
    ) -> Result<Option<PatternAggregate>, ToolError> {
        let conn = self.lock()?;
        let mut stmt = conn
            .prepare(
                "SELECT exit_code, duration_ms, timed_out, weight, created_at
                 FROM observations WHERE command_fingerprint = ?1",
            )
            .map_err(map_sqlite)?;
        let rows = stmt
            .query_map(params![fingerprint], |row| {
                Ok((
                    row.get::<_, i32>(0)?,
                    row.get::<_, i64>(1)?,
                    row.get::<_, i64>(2)? != 0,
                    row.get::<_, f64>(3)?,
                    row.get::<_, String>(4)?,
                ))
            })
            .map_err(map_sqlite)?;

        let now = Utc::now();
        let mut count = 0u64;
        let mut weighted = 0.0f64;
        let mut weighted_timeouts = 0.0f64;
        let mut weighted_successes = 0.0f64;
        let mut duration_sum = 0.0f64;
        let mut max_duration = 0u64;
        for row in rows {
            let (exit_code, duration_ms, timed_out, weight, created_at) =
                row.map_err(map_sqlite)?;
            let w = weight * decay_factor(&created_at, now, half_life_hours);
            count += 1;
            weighted += w;
            if timed_out {
                weighted_timeouts += w;
            }
            if exit_code == 0 && !timed_out {
                weighted_successes += w;
            }
            duration_sum += duration_ms as f64;
            max_duration = max_duration.max(duration_ms.max(0) as u64);
        }

        if count == 0 {
            return Ok(None);
        }
        Ok(Some(PatternAggregate {
            observations: count,
            weighted_observations: weighted,
            timeout_rate: if weighted > 0.0 {
                weighted_timeouts / weighted
            } else {
                0.0
            },
            success_rate: if weighted > 0.0 {
                weighted_successes / weighted
            } else {
                0.0
            },
            avg_duration_ms: duration_sum / count as f64,
            max_duration_ms: max_duration,
        }))
    }

    /// Recent outcomes for a template within one session, newest first.
    pub fn query_recent_by_template(
        &self,
        template: &str,
        session_id: &str,
        limit: usize,
    ) -> Result<Vec<RecentOutcome>, ToolError> {
        let conn = self.lock()?;
        let mut stmt = conn
            .prepare(
                "SELECT exit_code, timed_out FROM observations
                 WHERE template = ?1 AND session_id = ?2
                 ORDER BY id DESC LIMIT ?3",
            )
            .map_err(map_sqlite)?;
        let rows = stmt
            .query_map(params![template, session_id, limit as i64], |row| {
                Ok(RecentOutcome {
                    exit_code: row.get(0)?,
                    timed_out: row.get::<_, i64>(1)? != 0,
                })
            })
            .map_err(map_sqlite)?;
        rows.collect::<Result<Vec<_>, _>>().map_err(map_sqlite)
    }

    /// Multiply every weight by `0.5^(hours_since_created / half_life)`.
    pub fn apply_decay(&self, half_life_hours: f64) -> Result<(), ToolError> {
        let mut conn = self.lock()?;
        let tx = conn.transaction().map_err(map_sqlite)?;
        decay_within(&tx, half_life_hours)?;
        tx.commit().map_err(map_sqlite)
    }

    /// Decay, drop rows below `threshold`, cap to the `max_entries`
    /// highest-weight rows, and record the prune instant.
    pub fn prune(
        &self,
        half_life_hours: f64,
        threshold: f64,
        max_entries: usize,
    ) -> Result<(), ToolError> {
        let mut conn = self.lock()?;
        let tx = conn.transaction().map_err(map_sqlite)?;
        decay_within(&tx, half_life_hours)?;
        tx.execute(
            "DELETE FROM observations WHERE weight < ?1",
            params![threshold],
        )
        .map_err(map_sqlite)?;
        tx.execute(
            "DELETE FROM observations WHERE id NOT IN (
                 SELECT id FROM observations ORDER BY weight DESC, id DESC LIMIT ?1
             )",
            params![max_entries as i64],
        )
        .map_err(map_sqlite)?;
        tx.execute(
            "INSERT INTO meta (key, value) VALUES ('last_prune', ?1)
             ON CONFLICT(key) DO UPDATE SET value = excluded.value",
            params![Utc::now().to_rfc3339()],
        )
        .map_err(map_sqlite)?;
        tx.commit().map_err(map_sqlite)
    }

    /// The last instant `prune` ran, if ever.
    pub fn get_last_prune(&self) -> Result<Option<DateTime<Utc>>, ToolError> {
        let conn = self.lock()?;
        let raw: Option<String> = conn
            .query_row(
                "SELECT value FROM meta WHERE key = 'last_prune'",
                [],
                |row| row.get(0),
            )
            .optional()
            .map_err(map_sqlite)?;
        Ok(raw
            .and_then(|s| DateTime::parse_from_rfc3339(&s).ok())
            .map(|t| t.with_timezone(&Utc)))
    }

    /// Overwrite the recorded prune instant.
    pub fn set_last_prune(&self, at: DateTime<Utc>) -> Result<(), ToolError> {
        let conn = self.lock()?;
        conn.execute(
            "INSERT INTO meta (key, value) VALUES ('last_prune', ?1)
             ON CONFLICT(key) DO UPDATE SET value = excluded.value",
            params![at.to_rfc3339()],
        )
        .map_err(map_sqlite)?;
        Ok(())
    }

    /// Insert or replace a harvested option table.
    pub fn upsert_manopt_cache(&self, base: &str, text: &str) -> Result<(), ToolError> {
        let conn = self.lock()?;
        conn.execute(
            "INSERT INTO manopt_cache (base_command, options_text, created_at)
             VALUES (?1, ?2, ?3)
             ON CONFLICT(base_command) DO UPDATE SET
                 options_text = excluded.options_text,
                 created_at = excluded.created_at",
            params![base, text, Utc::now().to_rfc3339()],
        )
        .map_err(map_sqlite)?;
        Ok(())
    }

    /// The cached option table for a base command, if harvested.
    pub fn get_manopt_cache(&self, base: &str) -> Result<Option<String>, ToolError> {
        let conn = self.lock()?;
        conn.query_row(
            "SELECT options_text FROM manopt_cache WHERE base_command = ?1",
            params![base],
            |row| row.get(0),
        )
        .optional()
        .map_err(map_sqlite)
    }

    /// Store-wide counts for the stats tool.
    pub fn totals(&self) -> Result<StoreTotals, ToolError> {
        let conn = self.lock()?;
        let (total, patterns): (i64, i64) = conn
            .query_row(
                "SELECT COUNT(*), COUNT(DISTINCT command_fingerprint) FROM observations",
                [],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .map_err(map_sqlite)?;
        Ok(StoreTotals {
            total_observations: total.max(0) as u64,
            total_patterns: patterns.max(0) as u64,
        })
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, Connection>, ToolError> {
        self.conn
            .lock()
            .map_err(|_| ToolError::StoreUnavailable("store mutex poisoned".into()))
    }
}

/// Row-by-row decay inside an open transaction. Factors are computed in
/// Rust so the schema has no dependence on SQL math builtins.
fn decay_within(tx: &rusqlite::Transaction<'_>, half_life_hours: f64) -> Result<(), ToolError> {
    let now = Utc::now();
    let rows: Vec<(i64, f64, String)> = {
        let mut stmt = tx
            .prepare("SELECT id, weight, created_at FROM observations")
            .map_err(map_sqlite)?;
        let mapped = stmt
            .query_map([], |row| {
                Ok((row.get(0)?, row.get(1)?, row.get(2)?))
            })
            .map_err(map_sqlite)?;
        mapped
            .collect::<Result<Vec<_>, _>>()
            .map_err(map_sqlite)?
    };
    let mut update = tx
        .prepare("UPDATE observations SET weight = ?1 WHERE id = ?2")
        .map_err(map_sqlite)?;
    for (id, weight, created_at) in rows {
        let decayed = weight * decay_factor(&created_at, now, half_life_hours);
        update.execute(params![decayed, id]).map_err(map_sqlite)?;
    }
    Ok(())
}

/// `0.5^(age_hours / half_life)`; clamps to 1.0 for unparseable or future
/// timestamps so weights never grow.
fn decay_factor(created_at: &str, now: DateTime<Utc>, half_life_hours: f64) -> f64 {
    let Some(created) = DateTime::parse_from_rfc3339(created_at)
        .ok()
        .map(|t| t.with_timezone(&Utc))
    else {
        return 1.0;
    };
    let age_hours = (now - created).num_milliseconds() as f64 / 3_600_000.0;
    if age_hours <= 0.0 || half_life_hours <= 0.0 {
        return 1.0;
    }
    0.5f64.powf(age_hours / half_life_hours)
}

fn map_sqlite(err: rusqlite::Error) -> ToolError {
    use rusqlite::ErrorCode;
    match &err {
        rusqlite::Error::SqliteFailure(code, _)
            if matches!(
                code.code,
                ErrorCode::DatabaseBusy | ErrorCode::DatabaseLocked
            ) =>
        {
            ToolError::StoreUnavailable(err.to_string())
        }
        _ => ToolError::Internal(format!("sqlite: {err}")),
    }
}
