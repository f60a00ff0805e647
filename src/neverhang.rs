//! NEVERHANG: a circuit breaker over command submission.
//!
//! Three states. CLOSED lets everything through while counting timeouts in
//! a sliding sample window. Enough timeouts inside the window open the
//! circuit, which blocks submission until a recovery cooldown elapses;
//! then one probing submission is allowed (HALF_OPEN). A success closes
//! the circuit, another timeout re-opens it. The predicate is advisory:
//! a briefly stale answer under concurrency is acceptable.

use serde::Serialize;
use std::sync::Mutex;
use std::time::{Duration, Instant};

/// Circuit state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

/// Serializable snapshot for health checks.
#[derive(Debug, Clone, Serialize)]
pub struct CircuitStatus {
    pub state: CircuitState,
    pub failures_in_window: usize,
    pub failure_threshold: usize,
    pub sample_window_s: u64,
    pub recovery_timeout_s: u64,
    /// Seconds since the circuit opened, when open.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub open_for_s: Option<u64>,
}

#[derive(Debug)]
struct Inner {
    state: CircuitState,
    /// Recent timeouts: (instant, command fingerprint).
    failures: Vec<(Instant, String)>,
    opened_at: Option<Instant>,
}

/// The circuit breaker. Interior mutability so one instance can be shared
/// across collectors and tool handlers.
pub struct CircuitBreaker {
    failure_threshold: usize,
    recovery_timeout: Duration,
    sample_window: Duration,
    inner: Mutex<Inner>,
}

impl CircuitBreaker {
    #[must_use]
    pub fn new(failure_threshold: usize, recovery_timeout_s: u64, sample_window_s: u64) -> Self {
        Self {
            failure_threshold,
            recovery_timeout: Duration::from_secs(recovery_timeout_s),
            sample_window: Duration::from_secs(sample_window_s),
            inner: Mutex::new(Inner {
                state: CircuitState::Closed,
                failures: Vec::new(),
                opened_at: None,
            }),
        }
    }

    /// Whether a submission may proceed, with an advisory message.
    pub fn should_allow(&self) -> (bool, Option<String>) {
        let mut inner = self.lock();
        match inner.state {
            CircuitState::Closed => (true, None),
            CircuitState::HalfOpen => (
                true,
                Some("NEVERHANG half-open: testing recovery".to_string()),
            ),
            CircuitState::Open => {
                let open_for = inner
                    .opened_at
                    .map(|t| t.elapsed())
                    .unwrap_or(Duration::ZERO);
                if open_for > self.recovery_timeout {
                    inner.state = CircuitState::HalfOpen;
                    (
                        true,
                        Some("NEVERHANG half-open: testing recovery".to_string()),
                    )
                } else {
                    let retry_in = self.recovery_timeout.saturating_sub(open_for).as_secs();
                    (
                        false,
                        Some(format!(
                            "NEVERHANG: circuit open after repeated timeouts; \
                             retry in {retry_in}s or call zsh_neverhang_reset"
                        )),
                    )
                }
            }
        }
    }

    /// Record a command timeout keyed by its fingerprint.
    pub fn record_timeout(&self, fingerprint: &str) {
        let mut inner = self.lock();
        let now = Instant::now();
        inner.failures.push((now, fingerprint.to_string()));
        let window = self.sample_window;
        inner
            .failures
            .retain(|(at, _)| now.duration_since(*at) <= window);

        match inner.state {
            CircuitState::Closed => {
                if inner.failures.len() >= self.failure_threshold {
                    tracing::warn!(
                        failures = inner.failures.len(),
                        "NEVERHANG opening circuit"
                    );
                    inner.state = CircuitState::Open;
                    inner.opened_at = Some(now);
                }
            }
            CircuitState::HalfOpen => {
                tracing::warn!("NEVERHANG recovery probe timed out, re-opening");
                inner.state = CircuitState::Open;
                inner.opened_at = Some(now);
            }
            CircuitState::Open => {}
        }
    }

    /// Record a successful command completion.
    pub fn record_success(&self) {
        let mut inner = self.lock();
        if inner.state == CircuitState::HalfOpen {
            tracing::info!("NEVERHANG recovery confirmed, closing circuit");
            inner.state = CircuitState::Closed;
            inner.failures.clear();
            inner.opened_at = None;
        }
    }

    /// Explicit reset to CLOSED, clearing all failure history.
    pub fn reset(&self) {
        let mut inner = self.lock();
        inner.state = CircuitState::Closed;
        inner.failures.clear();
        inner.opened_at = None;
    }

    /// Full state for health checks.
    #[must_use]
    pub fn status(&self) -> CircuitStatus {
        let inner = self.lock();
        CircuitStatus {
            state: inner.state,
            failures_in_window: inner.failures.len(),
            failure_threshold: self.failure_threshold,
            sample_window_s: self.sample_window.as_secs(),
            recovery_timeout_s: self.recovery_timeout.as_secs(),
            open_for_s: inner.opened_at.map(|t| t.elapsed().as_secs()),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        // A poisoned breaker would otherwise wedge all submissions.
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }
}
