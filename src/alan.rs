//! A.L.A.N. ("As Long As Necessary"): the time-decayed learning store.
//!
//! Every command execution is recorded as an observation; pipelines
//! additionally record one synthetic observation per segment so that
//! per-segment patterns stay visible even when a pipe masks a failure.
//! Observation weights decay with a configurable half-life and low-weight
//! rows are pruned, so the store learns "as long as necessary" and then
//! forgets. On top of the raw rows sit pattern statistics, streak
//! detection, pre-execution insights, post-execution insights, and a
//! deferred man-page option harvester for commands that keep failing.
//!
//! Everything in this module is observability: store or harvester
//! failures are logged and absorbed, never surfaced to the command path.

use crate::config::Config;
use crate::fingerprint;
use crate::store::{Observation, PatternAggregate, Store};
use chrono::Utc;
use serde::Serialize;
use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::Mutex;
use std::time::Duration;

/// How many recent outcomes to inspect for streaks and fail counts.
const RECENT_OUTCOME_WINDOW: usize = 50;

/// Max characters kept of the raw command in an observation.
const PREVIEW_CHARS: usize = 200;

/// Max characters kept of stdout/stderr snippets.
const SNIPPET_CHARS: usize = 500;

/// Severity of an insight line.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum InsightLevel {
    Info,
    Warning,
}

/// One insight: a severity and a human-readable message.
pub type Insight = (InsightLevel, String);

/// Pattern statistics for a command, as returned by `zsh_alan_query`.
#[derive(Debug, Clone, Serialize)]
pub struct PatternStats {
    pub known: bool,
    pub fingerprint: String,
    #[serde(flatten)]
    pub aggregate: Option<PatternAggregate>,
}

/// Current streak of identical outcomes for a command template.
#[derive(Debug, Clone, Serialize)]
pub struct Streak {
    pub has_streak: bool,
    pub current: usize,
    pub successes: bool,
}

/// Store-wide summary for health/stats tools.
#[derive(Debug, Clone, Serialize)]
pub struct AlanStats {
    pub total_patterns: u64,
    pub total_observations: u64,
    pub session_id: String,
    pub last_prune: Option<String>,
}

/// The learning subsystem. One instance per process, injected into the
/// executor; tests construct isolated instances against temporary stores.
pub struct Alan {
    store: Store,
    config: Config,
    session_id: String,
    /// Base commands the harvester has already been attempted for.
    /// Failures never retry within the same process.
    manopt_attempted: Mutex<HashSet<String>>,
}

impl Alan {
    pub fn new(store: Store, config: Config) -> Self {
        Self::with_session(store, config, uuid::Uuid::new_v4().to_string())
    }

    /// Construct with an explicit session id (used by tests to model
    /// multiple service instances over one store).
    pub fn with_session(store: Store, config: Config, session_id: String) -> Self {
        Self {
            store,
            config,
            session_id,
            manopt_attempted: Mutex::new(HashSet::new()),
        }
    }

    #[must_use]
    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    #[must_use]
    pub fn store(&self) -> &Store {
        &self.store
    }

    /// Record one command execution.
    ///
    /// Multi-segment pipelines additionally record one synthetic
    /// observation per segment with the segment's own exit code. The call
    /// opportunistically prunes (rate-limited) and may kick off a manopt
    /// harvest when the same command shape keeps failing this session.
    pub fn record(
        &self,
        command: &str,
        exit_code: i32,
        duration_ms: u64,
        timed_out: bool,
        output_snippet: Option<&str>,
        error_snippet: Option<&str>,
        pipestatus: &[i32],
    ) {
        let pipestatus = if pipestatus.is_empty() {
            vec![exit_code]
        } else {
            pipestatus.to_vec()
        };

        let obs = Observation {
            session_id: self.session_id.clone(),
            command_fingerprint: fingerprint::fingerprint(command),
            command_preview: truncate_chars(command, PREVIEW_CHARS),
            template: fingerprint::template(command),
            exit_code,
            pipestatus: pipestatus.clone(),
            duration_ms,
            timed_out,
            output_snippet: output_snippet.map(|s| truncate_chars(s, SNIPPET_CHARS)),
            error_snippet: error_snippet.map(|s| truncate_chars(s, SNIPPET_CHARS)),
        };
        if let Err(e) = self.store.insert_observation(&obs) {
            tracing::warn!(error = %e, "dropping observation");
            return;
        }

        if pipestatus.len() > 1 {
            let segments = split_pipeline(command);
            for (segment, &code) in segments.iter().zip(pipestatus.iter()) {
                let seg_obs = Observation {
                    session_id: self.session_id.clone(),
                    command_fingerprint: fingerprint::fingerprint(segment),
                    command_preview: truncate_chars(segment, PREVIEW_CHARS),
                    template: fingerprint::template(segment),
                    exit_code: code,
                    pipestatus: vec![code],
                    duration_ms,
                    timed_out: false,
                    output_snippet: None,
                    error_snippet: None,
                };
                if let Err(e) = self.store.insert_observation(&seg_obs) {
                    tracing::warn!(error = %e, "dropping segment observation");
                }
            }
        }

        self.maybe_prune();

        // Harvest options when the fail count passes *through* the trigger,
        // not every time it exceeds it.
        if !timed_out && exit_code != 0 {
            let fails = self.template_fail_count(command);
            if fails == self.config.alan_manopt_fail_trigger {
                self.trigger_manopt(command);
            }
        }
    }

    /// Decayed aggregate statistics for a command's fingerprint.
    #[must_use]
    pub fn get_pattern_stats(&self, command: &str) -> PatternStats {
        let fp = fingerprint::fingerprint(command);
        let aggregate = self
            .store
            .query_pattern(&fp, self.config.alan_decay_half_life_hours)
            .unwrap_or_else(|e| {
                tracing::warn!(error = %e, "pattern query failed");
                None
            });
        PatternStats {
            known: aggregate.is_some(),
            fingerprint: fp,
            aggregate,
        }
    }

    /// Run length of consecutive identical outcomes for this command's
    /// template within the current session, newest first.
    #[must_use]
    pub fn get_streak(&self, command: &str) -> Streak {
        let outcomes = self
            .store
            .query_recent_by_template(
                &fingerprint::template(command),
                &self.session_id,
                RECENT_OUTCOME_WINDOW,
            )
            .unwrap_or_default();

        let Some(first) = outcomes.first() else {
            return Streak {
                has_streak: false,
                current: 0,
                successes: false,
            };
        };
        let success = |o: &crate::store::RecentOutcome| o.exit_code == 0 && !o.timed_out;
        let head = success(first);
        let current = outcomes.iter().take_while(|o| success(o) == head).count();
        Streak {
            has_streak: current >= 3,
            current,
            successes: head,
        }
    }

    /// Pre-execution insights, deterministic order, at most one per
    /// category: new-pattern, success-rate, timeout risk, streak, and the
    /// cached option table once a command shape has failed enough times.
    #[must_use]
    pub fn get_insights(&self, command: &str, timeout_s: u64) -> Vec<Insight> {
        let mut insights = Vec::new();
        let stats = self.get_pattern_stats(command);

        match &stats.aggregate {
            None => {
                insights.push((
                    InsightLevel::Info,
                    "New pattern: no prior observations of this command shape".to_string(),
                ));
            }
            Some(agg) => {
                let pct = agg.success_rate * 100.0;
                if agg.success_rate >= 0.9 {
                    insights.push((
                        InsightLevel::Info,
                        format!(
                            "Reliable pattern: {pct:.0}% success across {} observations",
                            agg.observations
                        ),
                    ));
                } else if agg.success_rate >= 0.4 {
                    insights.push((
                        InsightLevel::Info,
                        format!("Mixed results: {pct:.0}% success rate for this pattern"),
                    ));
                } else {
                    insights.push((
                        InsightLevel::Warning,
                        format!("Unreliable pattern: {pct:.0}% success rate"),
                    ));
                }

                let budget_ms = timeout_s.saturating_mul(1000) as f64;
                if budget_ms > 0.0 && agg.max_duration_ms as f64 >= 0.8 * budget_ms {
                    insights.push((
                        InsightLevel::Warning,
                        format!(
                            "Past runs took up to {:.1}s; the {timeout_s}s timeout may be tight",
                            agg.max_duration_ms as f64 / 1000.0
                        ),
                    ));
                }
            }
        }

        let streak = self.get_streak(command);
        if streak.has_streak {
            if streak.successes {
                insights.push((
                    InsightLevel::Info,
                    format!("Streak: {} consecutive successes", streak.current),
                ));
            } else {
                insights.push((
                    InsightLevel::Warning,
                    format!("Streak: {} consecutive failures", streak.current),
                ));
            }
        }

        if self.config.alan_manopt_enabled
            && self.template_fail_count(command)
                >= self.config.alan_manopt_fail_present.saturating_sub(1)
            && self.config.alan_manopt_fail_present > 0
        {
            let base = fingerprint::base_command(command);
            if let Ok(Some(text)) = self.store.get_manopt_cache(&base) {
                insights.push((
                    InsightLevel::Warning,
                    format!("Options for {base}:\n{text}"),
                ));
            }
        }

        insights
    }

    /// Store-wide summary for `zsh_health` and `zsh_alan_stats`.
    #[must_use]
    pub fn stats(&self) -> AlanStats {
        let totals = self.store.totals().unwrap_or_else(|e| {
            tracing::warn!(error = %e, "totals query failed");
            crate::store::StoreTotals {
                total_observations: 0,
                total_patterns: 0,
            }
        });
        AlanStats {
            total_patterns: totals.total_patterns,
            total_observations: totals.total_observations,
            session_id: self.session_id.clone(),
            last_prune: self
                .store
                .get_last_prune()
                .ok()
                .flatten()
                .map(|t| t.to_rfc3339()),
        }
    }

    /// Prune if the last prune is older than the configured interval.
    pub fn maybe_prune(&self) {
        let due = match self.store.get_last_prune() {
            Ok(Some(last)) => {
                let elapsed_hours =
                    (Utc::now() - last).num_milliseconds() as f64 / 3_600_000.0;
                elapsed_hours >= self.config.alan_prune_interval_hours
            }
            Ok(None) => true,
            Err(e) => {
                tracing::warn!(error = %e, "last-prune lookup failed");
                false
            }
        };
        if due {
            if let Err(e) = self.store.prune(
                self.config.alan_decay_half_life_hours,
                self.config.alan_prune_threshold,
                self.config.alan_max_entries,
            ) {
                tracing::warn!(error = %e, "prune failed");
            }
        }
    }

    /// Consecutive failures (newest first) for this command's template
    /// within the current session.
    #[must_use]
    pub fn template_fail_count(&self, command: &str) -> usize {
        self.store
            .query_recent_by_template(
                &fingerprint::template(command),
                &self.session_id,
                RECENT_OUTCOME_WINDOW,
            )
            .unwrap_or_default()
            .iter()
            .take_while(|o| o.exit_code != 0)
            .count()
    }

    /// Kick off an asynchronous option harvest for a command's base.
    ///
    /// Never blocks the caller; skipped when disabled, already cached,
    /// already attempted this process, no helper is installed, or no
    /// runtime is available.
    fn trigger_manopt(&self, command: &str) {
        if !self.config.alan_manopt_enabled {
            return;
        }
        let base = fingerprint::base_command(command);
        if base.is_empty() {
            return;
        }
        {
            let mut attempted = match self.manopt_attempted.lock() {
                Ok(guard) => guard,
                Err(_) => return,
            };
            if !attempted.insert(base.clone()) {
                return;
            }
        }
        match self.store.get_manopt_cache(&base) {
            Ok(Some(_)) => return,
            Ok(None) => {}
            Err(_) => return,
        }
        let Some(helper) = find_manopt_helper() else {
            tracing::debug!(base = %base, "manopt helper not found, skipping harvest");
            return;
        };
        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            return;
        };

        let store = self.store.clone();
        let timeout = self.config.manopt_timeout();
        handle.spawn(async move {
            harvest_manopt(store, helper, base, timeout).await;
        });
    }
}

/// Run the manopt helper and cache its output on success. All failures
/// are silent (debug-logged); the harvester never affects execution.
async fn harvest_manopt(store: Store, helper: PathBuf, base: String, timeout: Duration) {
    let result = tokio::time::timeout(
        timeout,
        tokio::process::Command::new(&helper)
            .arg(&base)
            .kill_on_drop(true)
            .output(),
    )
    .await;

    match result {
        Ok(Ok(output)) if output.status.success() => {
            let text = String::from_utf8_lossy(&output.stdout);
            let text = text.trim();
            if text.is_empty() {
                tracing::debug!(base = %base, "manopt produced no output");
                return;
            }
            if let Err(e) = store.upsert_manopt_cache(&base, text) {
                tracing::debug!(base = %base, error = %e, "manopt cache write failed");
            } else {
                tracing::info!(base = %base, "cached option table");
            }
        }
        Ok(Ok(output)) => {
            tracing::debug!(base = %base, status = ?output.status, "manopt exited nonzero");
        }
        Ok(Err(e)) => {
            tracing::debug!(base = %base, error = %e, "manopt failed to run");
        }
        Err(_) => {
            tracing::debug!(base = %base, "manopt timed out");
        }
    }
}

/// Prefer `manopt` on PATH, else a `scripts/manopt` sibling (development).
fn find_manopt_helper() -> Option<PathBuf> {
    if let Ok(path) = which::which("manopt") {
        return Some(path);
    }
    let dev = PathBuf::from("scripts/manopt");
    if dev.is_file() {
        return Some(dev);
    }
    None
}

// ---------------------------------------------------------------------------
// Post-execution insights
// ---------------------------------------------------------------------------

/// Exit codes with one universal meaning, always surfaced as warnings and
/// taking precedence over command-specific mappings.
fn universal_exit_message(code: i32) -> Option<&'static str> {
    match code {
        126 => Some("permission denied"),
        127 => Some("command not found"),
        255 => Some("SSH connection failed"),
        _ => None,
    }
}

/// Commands for which a particular non-zero exit is an answer, not an
/// error.
fn benign_exit_message(base: &str, code: i32) -> Option<&'static str> {
    match (base, code) {
        ("grep", 1) => Some("no match"),
        ("diff", 1) => Some("files differ"),
        ("cmp", 1) => Some("files differ"),
        ("test", 1) => Some("condition false"),
        ("[", 1) => Some("condition false"),
        _ => None,
    }
}

/// Insights derived from a finished command: exit-code taxonomy,
/// pipe-segment masking, and silent success.
#[must_use]
pub fn get_post_insights(command: &str, pipestatus: &[i32], output: &str) -> Vec<Insight> {
    let mut insights = Vec::new();
    let Some(&last) = pipestatus.last() else {
        return insights;
    };

    if let Some(msg) = universal_exit_message(last) {
        insights.push((InsightLevel::Warning, format!("exit {last}: {msg}")));
    } else if last != 0 {
        let base = fingerprint::base_command(command);
        if let Some(msg) = benign_exit_message(&base, last) {
            insights.push((
                InsightLevel::Info,
                format!("{base} exit {last} = {msg} (normal, not an error)"),
            ));
        }
    }

    // A failing segment hidden behind a succeeding tail is the trap this
    // subsystem exists to catch. SIGPIPE (141) upstream of a consumer
    // that stopped reading is expected pipeline behavior, not an anomaly.
    if pipestatus.len() >= 2 && last == 0 {
        for (i, &code) in pipestatus[..pipestatus.len() - 1].iter().enumerate() {
            if code != 0 && code != 141 {
                insights.push((
                    InsightLevel::Warning,
                    format!(
                        "pipe segment {} failed (exit {code}), masked by subsequent success",
                        i + 1
                    ),
                ));
            }
        }
    }

    if last == 0 && output.trim().is_empty() {
        insights.push((
            InsightLevel::Info,
            "No output (command completed silently)".to_string(),
        ));
    }

    insights
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

/// Split a command on top-level pipes, respecting quotes and `||`.
#[must_use]
pub fn split_pipeline(command: &str) -> Vec<String> {
    let mut segments = Vec::new();
    let mut current = String::new();
    let mut chars = command.chars().peekable();
    let mut in_single = false;
    let mut in_double = false;

    while let Some(c) = chars.next() {
        match c {
            '\'' if !in_double => {
                in_single = !in_single;
                current.push(c);
            }
            '"' if !in_single => {
                in_double = !in_double;
                current.push(c);
            }
            '|' if !in_single && !in_double => {
                if chars.peek() == Some(&'|') {
                    // `||` is sequencing, not a pipe.
                    chars.next();
                    current.push_str("||");
                } else {
                    segments.push(current.trim().to_string());
                    current = String::new();
                }
            }
            _ => current.push(c),
        }
    }
    segments.push(current.trim().to_string());
    segments
}

fn truncate_chars(s: &str, max: usize) -> String {
    s.chars().take(max).collect()
}
