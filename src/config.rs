//! Typed configuration with defaults and environment overrides.
//!
//! One field per recognized option, populated once at startup. Every option
//! has an uppercase environment key of the same name (e.g. `ALAN_DB_PATH`,
//! `NEVERHANG_TIMEOUT_MAX`). Unparseable values fall back to the default
//! with a warning rather than aborting startup.

use std::path::PathBuf;
use std::time::Duration;

/// Runtime configuration for the executor, NEVERHANG, and A.L.A.N.
#[derive(Debug, Clone)]
pub struct Config {
    /// Location of the observation/cache store.
    pub alan_db_path: PathBuf,
    /// Default per-command timeout in seconds.
    pub neverhang_timeout_default: u64,
    /// Hard cap on per-command timeouts; requests above clamp down.
    pub neverhang_timeout_max: u64,
    /// Cooperative yield interval in seconds.
    pub yield_after_default: f64,
    /// Per-snapshot output cap in characters.
    pub truncate_output_at: usize,
    /// Observation weight halves every this many hours.
    pub alan_decay_half_life_hours: f64,
    /// Observations below this weight are pruned.
    pub alan_prune_threshold: f64,
    /// Minimum wall-time between prunes, in hours.
    pub alan_prune_interval_hours: f64,
    /// Hard cap on stored observations after a prune.
    pub alan_max_entries: usize,
    /// Timeouts within the sample window that open the circuit.
    pub neverhang_failure_threshold: usize,
    /// Open -> half-open cooldown in seconds.
    pub neverhang_recovery_timeout: u64,
    /// Failures older than this many seconds are forgotten.
    pub neverhang_sample_window: u64,
    /// Turn man-page option harvesting on/off.
    pub alan_manopt_enabled: bool,
    /// Consecutive same-template failures that trigger a harvest.
    pub alan_manopt_fail_trigger: usize,
    /// Consecutive failures at which the cached option table is shown.
    pub alan_manopt_fail_present: usize,
    /// Max seconds for the harvester subprocess.
    pub alan_manopt_timeout: f64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            alan_db_path: default_db_path(),
            neverhang_timeout_default: 120,
            neverhang_timeout_max: 600,
            yield_after_default: 2.0,
            truncate_output_at: 30_000,
            alan_decay_half_life_hours: 24.0,
            alan_prune_threshold: 0.01,
            alan_prune_interval_hours: 6.0,
            alan_max_entries: 10_000,
            neverhang_failure_threshold: 3,
            neverhang_recovery_timeout: 300,
            neverhang_sample_window: 3600,
            alan_manopt_enabled: true,
            alan_manopt_fail_trigger: 2,
            alan_manopt_fail_present: 3,
            alan_manopt_timeout: 2.0,
        }
    }
}

impl Config {
    /// Build a config from the environment, falling back to defaults.
    #[must_use]
    pub fn from_env() -> Self {
        let d = Self::default();
        Self {
            alan_db_path: std::env::var("ALAN_DB_PATH")
                .map(PathBuf::from)
                .unwrap_or(d.alan_db_path),
            neverhang_timeout_default: env_parse(
                "NEVERHANG_TIMEOUT_DEFAULT",
                d.neverhang_timeout_default,
            ),
            neverhang_timeout_max: env_parse("NEVERHANG_TIMEOUT_MAX", d.neverhang_timeout_max),
            yield_after_default: env_parse("YIELD_AFTER_DEFAULT", d.yield_after_default),
            truncate_output_at: env_parse("TRUNCATE_OUTPUT_AT", d.truncate_output_at),
            alan_decay_half_life_hours: env_parse(
                "ALAN_DECAY_HALF_LIFE_HOURS",
                d.alan_decay_half_life_hours,
            ),
            alan_prune_threshold: env_parse("ALAN_PRUNE_THRESHOLD", d.alan_prune_threshold),
            alan_prune_interval_hours: env_parse(
                "ALAN_PRUNE_INTERVAL_HOURS",
                d.alan_prune_interval_hours,
            ),
            alan_max_entries: env_parse("ALAN_MAX_ENTRIES", d.alan_max_entries),
            neverhang_failure_threshold: env_parse(
                "NEVERHANG_FAILURE_THRESHOLD",
                d.neverhang_failure_threshold,
            ),
            neverhang_recovery_timeout: env_parse(
                "NEVERHANG_RECOVERY_TIMEOUT",
                d.neverhang_recovery_timeout,
            ),
            neverhang_sample_window: env_parse(
                "NEVERHANG_SAMPLE_WINDOW",
                d.neverhang_sample_window,
            ),
            alan_manopt_enabled: env_bool("ALAN_MANOPT_ENABLED", d.alan_manopt_enabled),
            alan_manopt_fail_trigger: env_parse(
                "ALAN_MANOPT_FAIL_TRIGGER",
                d.alan_manopt_fail_trigger,
            ),
            alan_manopt_fail_present: env_parse(
                "ALAN_MANOPT_FAIL_PRESENT",
                d.alan_manopt_fail_present,
            ),
            alan_manopt_timeout: env_parse("ALAN_MANOPT_TIMEOUT", d.alan_manopt_timeout),
        }
    }

    /// Clamp a requested timeout to the configured ceiling.
    #[must_use]
    pub fn clamp_timeout(&self, timeout: Option<u64>) -> u64 {
        timeout
            .unwrap_or(self.neverhang_timeout_default)
            .min(self.neverhang_timeout_max)
    }

    /// The manopt subprocess timeout as a [`Duration`].
    #[must_use]
    pub fn manopt_timeout(&self) -> Duration {
        Duration::from_secs_f64(self.alan_manopt_timeout.max(0.0))
    }
}

/// `~/.claude/plugins/zsh-tool/data/alan.db`, or a relative fallback when
/// no home directory can be determined (e.g. stripped-down containers).
fn default_db_path() -> PathBuf {
    directories::BaseDirs::new()
        .map(|dirs| dirs.home_dir().to_path_buf())
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".claude/plugins/zsh-tool/data/alan.db")
}

fn env_parse<T: std::str::FromStr>(key: &str, default: T) -> T {
    match std::env::var(key) {
        Ok(raw) => raw.trim().parse().unwrap_or_else(|_| {
            tracing::warn!(key, value = %raw, "unparseable config value, using default");
            default
        }),
        Err(_) => default,
    }
}

fn env_bool(key: &str, default: bool) -> bool {
    match std::env::var(key) {
        Ok(raw) => !matches!(
            raw.trim().to_ascii_lowercase().as_str(),
            "0" | "false" | "no" | "off" | ""
        ),
        Err(_) => default,
    }
}
