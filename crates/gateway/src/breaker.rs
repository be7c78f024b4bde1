//! Circuit breaker registry for backend failure isolation.
//!
//! Each backend has its own breaker that opens after repeated failures
//! inside a sliding window and recovers through exactly one half-open
//! probe call after a cooldown. A backend judged unhealthy is never
//! contacted until the probe succeeds.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use tokio::sync::RwLock;

#[derive(Debug, Clone, Copy)]
pub struct CircuitBreakerConfig {
    /// Failures within `window` before the circuit opens.
    pub failure_threshold: u32,
    /// Sliding window for counting failures.
    pub window: Duration,
    /// Time the circuit stays open before allowing a probe.
    pub cooldown: Duration,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            window: Duration::from_secs(30),
            cooldown: Duration::from_secs(15),
        }
    }
}

/// Observable breaker state for one backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

/// How an admitted call should be reported back.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallKind {
    Normal,
    /// The single recovery probe permitted in HalfOpen.
    Probe,
}

/// Result of asking the breaker whether a call may proceed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BreakerDecision {
    Permitted(CallKind),
    Rejected,
}

#[derive(Debug)]
struct BreakerState {
    state: CircuitState,
    failures: u32,
    window_start: Instant,
    opened_at: Instant,
    probe_in_flight: bool,
}

impl BreakerState {
    fn new(now: Instant) -> Self {
        Self {
            state: CircuitState::Closed,
            failures: 0,
            window_start: now,
            opened_at: now,
            probe_in_flight: false,
        }
    }
}

/// Manages circuit breakers for all backends, keyed by backend id.
pub struct CircuitBreakerRegistry {
    breakers: RwLock<HashMap<String, BreakerState>>,
    config: CircuitBreakerConfig,
}

impl CircuitBreakerRegistry {
    pub fn new(config: CircuitBreakerConfig) -> Self {
        Self {
            breakers: RwLock::new(HashMap::new()),
            config,
        }
    }

    /// Ask whether a call to `backend` may proceed right now.
    ///
    /// Open circuits whose cooldown has elapsed transition to HalfOpen and
    /// hand out exactly one `CallKind::Probe`; all other calls are rejected
    /// until the probe outcome is recorded.
    pub async fn try_acquire(&self, backend: &str) -> BreakerDecision {
        let now = Instant::now();
        let mut breakers = self.breakers.write().await;
        let entry = breakers
            .entry(backend.to_string())
            .or_insert_with(|| BreakerState::new(now));

        match entry.state {
            CircuitState::Closed => BreakerDecision::Permitted(CallKind::Normal),
            CircuitState::Open => {
                if now.duration_since(entry.opened_at) >= self.config.cooldown {
                    entry.state = CircuitState::HalfOpen;
                    entry.probe_in_flight = true;
                    tracing::debug!(backend = %backend, "Circuit HALF-OPEN - allowing probe");
                    BreakerDecision::Permitted(CallKind::Probe)
                } else {
                    BreakerDecision::Rejected
                }
            }
            CircuitState::HalfOpen => {
                // Only one probe outstanding at a time.
                BreakerDecision::Rejected
            }
        }
    }

    /// Record the terminal outcome of a previously permitted call.
    pub async fn record_outcome(&self, backend: &str, kind: CallKind, success: bool) {
        let now = Instant::now();
        let mut breakers = self.breakers.write().await;
        let entry = breakers
            .entry(backend.to_string())
            .or_insert_with(|| BreakerState::new(now));

        match kind {
            CallKind::Probe => {
                entry.probe_in_flight = false;
                if success {
                    tracing::info!(backend = %backend, "Circuit CLOSED - probe succeeded");
                    entry.state = CircuitState::Closed;
                    entry.failures = 0;
                    entry.window_start = now;
                } else {
                    tracing::warn!(backend = %backend, "Circuit RE-OPENED - probe failed");
                    entry.state = CircuitState::Open;
                    entry.opened_at = now;
                }
            }
            CallKind::Normal => {
                // Outcomes of calls that were in flight when the circuit
                // opened do not move the state machine.
                if entry.state != CircuitState::Closed {
                    return;
                }

                if success {
                    entry.failures = 0;
                    entry.window_start = now;
                    return;
                }

                if now.duration_since(entry.window_start) > self.config.window {
                    entry.failures = 1;
                    entry.window_start = now;
                } else {
                    entry.failures += 1;
                }

                if entry.failures >= self.config.failure_threshold {
                    tracing::warn!(
                        backend = %backend,
                        failures = entry.failures,
                        "Circuit OPENED"
                    );
                    entry.state = CircuitState::Open;
                    entry.opened_at = now;
                } else {
                    tracing::debug!(
                        backend = %backend,
                        failures = entry.failures,
                        threshold = self.config.failure_threshold,
                        "Failure recorded - circuit still closed"
                    );
                }
            }
        }
    }

    /// Current state for a backend; Closed for backends never seen.
    pub async fn state(&self, backend: &str) -> CircuitState {
        let breakers = self.breakers.read().await;
        breakers
            .get(backend)
            .map(|b| b.state)
            .unwrap_or(CircuitState::Closed)
    }

    #[cfg(test)]
    async fn backdate_opened_at(&self, backend: &str, by: Duration) {
        let mut breakers = self.breakers.write().await;
        if let Some(entry) = breakers.get_mut(backend) {
            entry.opened_at -= by;
        }
    }

    #[cfg(test)]
    async fn backdate_window_start(&self, backend: &str, by: Duration) {
        let mut breakers = self.breakers.write().await;
        if let Some(entry) = breakers.get_mut(backend) {
            entry.window_start -= by;
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    fn config() -> CircuitBreakerConfig {
        CircuitBreakerConfig {
            failure_threshold: 5,
            window: Duration::from_secs(30),
            cooldown: Duration::from_secs(15),
        }
    }

    async fn fail_times(registry: &CircuitBreakerRegistry, backend: &str, n: u32) {
        for _ in 0..n {
            assert_eq!(
                registry.try_acquire(backend).await,
                BreakerDecision::Permitted(CallKind::Normal)
            );
            registry.record_outcome(backend, CallKind::Normal, false).await;
        }
    }

    #[tokio::test]
    async fn test_opens_after_threshold_failures() {
        let registry = CircuitBreakerRegistry::new(config());

        fail_times(&registry, "calc", 5).await;
        assert_eq!(registry.state("calc").await, CircuitState::Open);

        // 6th call rejected without contacting the backend.
        assert_eq!(registry.try_acquire("calc").await, BreakerDecision::Rejected);
    }

    #[tokio::test]
    async fn test_success_resets_failure_window() {
        let registry = CircuitBreakerRegistry::new(config());

        fail_times(&registry, "calc", 4).await;
        registry.record_outcome("calc", CallKind::Normal, true).await;

        // Counter was reset; four more failures still do not open.
        fail_times(&registry, "calc", 4).await;
        assert_eq!(registry.state("calc").await, CircuitState::Closed);
    }

    #[tokio::test]
    async fn test_failures_outside_window_do_not_accumulate() {
        let registry = CircuitBreakerRegistry::new(config());

        fail_times(&registry, "calc", 4).await;
        registry
            .backdate_window_start("calc", Duration::from_secs(31))
            .await;

        // The stale window restarts at 1; no transition to Open.
        fail_times(&registry, "calc", 1).await;
        assert_eq!(registry.state("calc").await, CircuitState::Closed);
    }

    #[tokio::test]
    async fn test_single_probe_after_cooldown() {
        let registry = CircuitBreakerRegistry::new(config());
        fail_times(&registry, "calc", 5).await;

        // Before cooldown: still rejected.
        assert_eq!(registry.try_acquire("calc").await, BreakerDecision::Rejected);

        registry
            .backdate_opened_at("calc", Duration::from_secs(16))
            .await;

        // Exactly one probe is handed out.
        assert_eq!(
            registry.try_acquire("calc").await,
            BreakerDecision::Permitted(CallKind::Probe)
        );
        assert_eq!(registry.state("calc").await, CircuitState::HalfOpen);
        assert_eq!(registry.try_acquire("calc").await, BreakerDecision::Rejected);
    }

    #[tokio::test]
    async fn test_probe_success_closes_circuit() {
        let registry = CircuitBreakerRegistry::new(config());
        fail_times(&registry, "calc", 5).await;
        registry
            .backdate_opened_at("calc", Duration::from_secs(16))
            .await;

        assert_eq!(
            registry.try_acquire("calc").await,
            BreakerDecision::Permitted(CallKind::Probe)
        );
        registry.record_outcome("calc", CallKind::Probe, true).await;

        assert_eq!(registry.state("calc").await, CircuitState::Closed);
        assert_eq!(
            registry.try_acquire("calc").await,
            BreakerDecision::Permitted(CallKind::Normal)
        );
    }

    #[tokio::test]
    async fn test_probe_failure_reopens_and_restarts_cooldown() {
        let registry = CircuitBreakerRegistry::new(config());
        fail_times(&registry, "calc", 5).await;
        registry
            .backdate_opened_at("calc", Duration::from_secs(16))
            .await;

        assert_eq!(
            registry.try_acquire("calc").await,
            BreakerDecision::Permitted(CallKind::Probe)
        );
        registry.record_outcome("calc", CallKind::Probe, false).await;

        // Back to Open with a fresh opened_at; no call passes before the
        // cooldown elapses again.
        assert_eq!(registry.state("calc").await, CircuitState::Open);
        assert_eq!(registry.try_acquire("calc").await, BreakerDecision::Rejected);

        registry
            .backdate_opened_at("calc", Duration::from_secs(16))
            .await;
        assert_eq!(
            registry.try_acquire("calc").await,
            BreakerDecision::Permitted(CallKind::Probe)
        );
    }

    #[tokio::test]
    async fn test_stale_normal_outcomes_ignored_while_open() {
        let registry = CircuitBreakerRegistry::new(config());
        fail_times(&registry, "calc", 5).await;

        // A success from a call admitted before the circuit opened must not
        // close it; only the probe path does that.
        registry.record_outcome("calc", CallKind::Normal, true).await;
        assert_eq!(registry.state("calc").await, CircuitState::Open);
    }

    #[tokio::test]
    async fn test_backends_are_isolated() {
        let registry = CircuitBreakerRegistry::new(config());
        fail_times(&registry, "calc", 5).await;

        assert_eq!(registry.state("calc").await, CircuitState::Open);
        assert_eq!(
            registry.try_acquire("docs").await,
            BreakerDecision::Permitted(CallKind::Normal)
        );
    }
}
