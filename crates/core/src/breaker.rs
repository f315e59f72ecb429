//! Circuit Breaker
//!
//! Per-dependency failure isolation with CLOSED/OPEN/HALF_OPEN states,
//! optional adaptive thresholds, and Prometheus-formatted metrics export.
//!
//! Every outbound remote call (vector store, chat model, embedding service,
//! DMS) goes through one of these so a failing provider rejects in O(1)
//! instead of queueing work behind timeouts.

use std::collections::VecDeque;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use thiserror::Error;

/// Circuit breaker states
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    /// Normal operation, calls pass through
    Closed,
    /// Failing, calls rejected immediately
    Open,
    /// Testing recovery, calls pass through
    HalfOpen,
}

impl CircuitState {
    /// Numeric gauge value for Prometheus (0=closed, 1=open, 2=half_open)
    pub fn gauge_value(&self) -> u8 {
        match self {
            CircuitState::Closed => 0,
            CircuitState::Open => 1,
            CircuitState::HalfOpen => 2,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            CircuitState::Closed => "closed",
            CircuitState::Open => "open",
            CircuitState::HalfOpen => "half_open",
        }
    }
}

/// Error returned by a breaker-gated call
#[derive(Debug, Error)]
pub enum BreakerError<E> {
    /// Circuit is open; the wrapped callable was not invoked
    #[error("circuit breaker {name} is open, retry in {retry_in:.1}s")]
    Open { name: String, retry_in: f64 },

    /// The wrapped callable failed
    #[error(transparent)]
    Inner(E),
}

impl<E> BreakerError<E> {
    pub fn is_open(&self) -> bool {
        matches!(self, BreakerError::Open { .. })
    }
}

/// Circuit breaker tuning
#[derive(Debug, Clone)]
pub struct CircuitBreakerConfig {
    /// Consecutive failures before opening the circuit
    pub failure_threshold: u32,
    /// How long the circuit stays open before probing
    pub timeout_duration: Duration,
    /// Successes needed in HALF_OPEN to close again
    pub success_threshold: u32,
    /// Adjust the failure threshold from the recent error rate
    pub adaptive: bool,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            timeout_duration: Duration::from_secs(30),
            success_threshold: 3,
            adaptive: true,
        }
    }
}

/// Sliding window for adaptive threshold adjustment
const ADAPTIVE_WINDOW: Duration = Duration::from_secs(60);
const ADAPTIVE_TRIGGER: usize = 10;

#[derive(Debug)]
struct BreakerInner {
    state: CircuitState,
    failure_count: u32,
    success_count: u32,
    last_failure: Option<Instant>,
    /// Current (possibly adaptively lowered) failure threshold
    failure_threshold: u32,
    /// Timestamps of recent failures within the adaptive window
    failure_window: VecDeque<Instant>,
}

/// Rolling call counters, exported to Prometheus
#[derive(Debug, Default)]
struct BreakerMetrics {
    total_calls: AtomicU64,
    successful_calls: AtomicU64,
    failed_calls: AtomicU64,
    circuit_opens: AtomicU64,
    circuit_closes: AtomicU64,
}

/// Read-only view of breaker state for health reporting
#[derive(Debug, Clone)]
pub struct BreakerSnapshot {
    pub name: String,
    pub state: CircuitState,
    pub failure_count: u32,
    pub success_count: u32,
    pub failure_threshold: u32,
    pub total_calls: u64,
    pub failed_calls: u64,
    pub circuit_opens: u64,
}

/// Circuit breaker wrapping a single remote dependency
pub struct CircuitBreaker {
    name: String,
    config: CircuitBreakerConfig,
    inner: Mutex<BreakerInner>,
    metrics: BreakerMetrics,
}

impl CircuitBreaker {
    /// Create a breaker with explicit tuning
    pub fn new(name: impl Into<String>, config: CircuitBreakerConfig) -> Self {
        let failure_threshold = config.failure_threshold;
        Self {
            name: name.into(),
            config,
            inner: Mutex::new(BreakerInner {
                state: CircuitState::Closed,
                failure_count: 0,
                success_count: 0,
                last_failure: None,
                failure_threshold,
                failure_window: VecDeque::new(),
            }),
            metrics: BreakerMetrics::default(),
        }
    }

    /// Default tuning for the vector store (5 failures, 30s, 3 successes)
    pub fn vector_store() -> Self {
        Self::new("vector_store", CircuitBreakerConfig::default())
    }

    /// Default tuning for the chat model (3 failures, 20s, 2 successes)
    pub fn chat_model() -> Self {
        Self::new(
            "chat_model",
            CircuitBreakerConfig {
                failure_threshold: 3,
                timeout_duration: Duration::from_secs(20),
                success_threshold: 2,
                adaptive: true,
            },
        )
    }

    /// Default tuning for the embedding service (5 failures, 30s, 3 successes)
    pub fn embedding_service() -> Self {
        Self::new("embedding_service", CircuitBreakerConfig::default())
    }

    /// Default tuning for DMS providers (5 failures, 60s, 3 successes)
    pub fn dms() -> Self {
        Self::new(
            "dms",
            CircuitBreakerConfig {
                failure_threshold: 5,
                timeout_duration: Duration::from_secs(60),
                success_threshold: 3,
                adaptive: true,
            },
        )
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Run `fut` through the breaker.
    ///
    /// When the circuit is open the future is never polled and the call is
    /// rejected with `BreakerError::Open`.
    pub async fn call<T, E, F>(&self, fut: F) -> Result<T, BreakerError<E>>
    where
        F: Future<Output = Result<T, E>>,
    {
        self.before_call()?;
        self.metrics.total_calls.fetch_add(1, Ordering::Relaxed);

        match fut.await {
            Ok(value) => {
                self.on_success();
                Ok(value)
            }
            Err(e) => {
                self.on_failure();
                Err(BreakerError::Inner(e))
            }
        }
    }

    /// Gate check before invoking the wrapped callable
    fn before_call<E>(&self) -> Result<(), BreakerError<E>> {
        let mut inner = self.inner.lock();

        if inner.state == CircuitState::Open {
            let elapsed = inner
                .last_failure
                .map(|t| t.elapsed())
                .unwrap_or(Duration::MAX);

            if elapsed >= self.config.timeout_duration {
                tracing::info!(breaker = %self.name, "OPEN -> HALF_OPEN (timeout expired)");
                inner.state = CircuitState::HalfOpen;
                inner.success_count = 0;
            } else {
                let retry_in = (self.config.timeout_duration - elapsed).as_secs_f64();
                tracing::warn!(breaker = %self.name, retry_in, "rejecting call, circuit open");
                return Err(BreakerError::Open {
                    name: self.name.clone(),
                    retry_in,
                });
            }
        }

        Ok(())
    }

    fn on_success(&self) {
        self.metrics.successful_calls.fetch_add(1, Ordering::Relaxed);
        let mut inner = self.inner.lock();

        match inner.state {
            CircuitState::HalfOpen => {
                inner.success_count += 1;
                tracing::info!(
                    breaker = %self.name,
                    successes = inner.success_count,
                    needed = self.config.success_threshold,
                    "HALF_OPEN success"
                );
                if inner.success_count >= self.config.success_threshold {
                    tracing::info!(breaker = %self.name, "HALF_OPEN -> CLOSED (recovered)");
                    inner.state = CircuitState::Closed;
                    inner.failure_count = 0;
                    self.metrics.circuit_closes.fetch_add(1, Ordering::Relaxed);
                }
            }
            CircuitState::Closed => {
                inner.failure_count = 0;
            }
            CircuitState::Open => {}
        }
    }

    fn on_failure(&self) {
        self.metrics.failed_calls.fetch_add(1, Ordering::Relaxed);
        let mut inner = self.inner.lock();
        let now = Instant::now();

        inner.failure_count += 1;
        inner.last_failure = Some(now);

        if self.config.adaptive {
            inner.failure_window.push_back(now);
            Self::adjust_threshold(&mut inner, &self.config, &self.name);
        }

        match inner.state {
            CircuitState::HalfOpen => {
                tracing::warn!(breaker = %self.name, "HALF_OPEN -> OPEN (probe failed)");
                inner.state = CircuitState::Open;
                inner.success_count = 0;
                self.metrics.circuit_opens.fetch_add(1, Ordering::Relaxed);
            }
            CircuitState::Closed if inner.failure_count >= inner.failure_threshold => {
                tracing::error!(
                    breaker = %self.name,
                    failures = inner.failure_count,
                    "CLOSED -> OPEN (failure threshold reached)"
                );
                inner.state = CircuitState::Open;
                self.metrics.circuit_opens.fetch_add(1, Ordering::Relaxed);
            }
            _ => {}
        }
    }

    /// Lower the threshold under sustained error bursts, restore otherwise
    fn adjust_threshold(inner: &mut BreakerInner, config: &CircuitBreakerConfig, name: &str) {
        let cutoff = Instant::now() - ADAPTIVE_WINDOW;
        while inner
            .failure_window
            .front()
            .map(|t| *t < cutoff)
            .unwrap_or(false)
        {
            inner.failure_window.pop_front();
        }

        if inner.failure_window.len() > ADAPTIVE_TRIGGER {
            let lowered = config.failure_threshold.saturating_sub(2).max(3);
            if inner.failure_threshold != lowered {
                tracing::info!(breaker = %name, threshold = lowered, "adaptive threshold lowered");
            }
            inner.failure_threshold = lowered;
        } else {
            inner.failure_threshold = config.failure_threshold;
        }
    }

    /// Manually reset to CLOSED, clearing all counters
    pub fn reset(&self) {
        tracing::info!(breaker = %self.name, "manual reset to CLOSED");
        let mut inner = self.inner.lock();
        inner.state = CircuitState::Closed;
        inner.failure_count = 0;
        inner.success_count = 0;
        inner.last_failure = None;
        inner.failure_window.clear();
        inner.failure_threshold = self.config.failure_threshold;
    }

    /// Current state
    pub fn state(&self) -> CircuitState {
        self.inner.lock().state
    }

    /// Snapshot for health and stats endpoints
    pub fn snapshot(&self) -> BreakerSnapshot {
        let inner = self.inner.lock();
        BreakerSnapshot {
            name: self.name.clone(),
            state: inner.state,
            failure_count: inner.failure_count,
            success_count: inner.success_count,
            failure_threshold: inner.failure_threshold,
            total_calls: self.metrics.total_calls.load(Ordering::Relaxed),
            failed_calls: self.metrics.failed_calls.load(Ordering::Relaxed),
            circuit_opens: self.metrics.circuit_opens.load(Ordering::Relaxed),
        }
    }

    /// Render metrics in Prometheus text exposition format
    pub fn prometheus_metrics(&self) -> String {
        let state = self.state();
        let mut out = Vec::new();

        out.push(
            "# HELP circuit_breaker_state Current circuit breaker state (0=closed, 1=open, 2=half_open)"
                .to_string(),
        );
        out.push("# TYPE circuit_breaker_state gauge".to_string());
        out.push(format!(
            "circuit_breaker_state{{name=\"{}\"}} {}",
            self.name,
            state.gauge_value()
        ));

        out.push("# HELP circuit_breaker_total_calls Total calls through circuit breaker".to_string());
        out.push("# TYPE circuit_breaker_total_calls counter".to_string());
        out.push(format!(
            "circuit_breaker_total_calls{{name=\"{}\"}} {}",
            self.name,
            self.metrics.total_calls.load(Ordering::Relaxed)
        ));

        out.push("# HELP circuit_breaker_successful_calls Successful calls".to_string());
        out.push("# TYPE circuit_breaker_successful_calls counter".to_string());
        out.push(format!(
            "circuit_breaker_successful_calls{{name=\"{}\"}} {}",
            self.name,
            self.metrics.successful_calls.load(Ordering::Relaxed)
        ));

        out.push("# HELP circuit_breaker_failed_calls Failed calls".to_string());
        out.push("# TYPE circuit_breaker_failed_calls counter".to_string());
        out.push(format!(
            "circuit_breaker_failed_calls{{name=\"{}\"}} {}",
            self.name,
            self.metrics.failed_calls.load(Ordering::Relaxed)
        ));

        out.push("# HELP circuit_breaker_opens Circuit breaker opens".to_string());
        out.push("# TYPE circuit_breaker_opens counter".to_string());
        out.push(format!(
            "circuit_breaker_opens{{name=\"{}\"}} {}",
            self.name,
            self.metrics.circuit_opens.load(Ordering::Relaxed)
        ));

        out.push("# HELP circuit_breaker_closes Circuit breaker closes".to_string());
        out.push("# TYPE circuit_breaker_closes counter".to_string());
        out.push(format!(
            "circuit_breaker_closes{{name=\"{}\"}} {}",
            self.name,
            self.metrics.circuit_closes.load(Ordering::Relaxed)
        ));

        out.join("\n")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, Error)]
    #[error("boom")]
    struct Boom;

    fn fast_breaker(failure_threshold: u32, timeout: Duration) -> CircuitBreaker {
        CircuitBreaker::new(
            "test",
            CircuitBreakerConfig {
                failure_threshold,
                timeout_duration: timeout,
                success_threshold: 2,
                adaptive: false,
            },
        )
    }

    #[tokio::test]
    async fn test_closed_passes_through() {
        let breaker = fast_breaker(3, Duration::from_secs(30));
        let result: Result<i32, BreakerError<Boom>> = breaker.call(async { Ok(42) }).await;
        assert_eq!(result.unwrap(), 42);
        assert_eq!(breaker.state(), CircuitState::Closed);
    }

    #[tokio::test]
    async fn test_opens_after_threshold() {
        let breaker = fast_breaker(3, Duration::from_secs(30));

        for _ in 0..3 {
            let _: Result<(), _> = breaker.call(async { Err::<(), _>(Boom) }).await;
        }
        assert_eq!(breaker.state(), CircuitState::Open);

        // Next call must be rejected without touching the wrapped callable
        let mut invoked = false;
        let result: Result<(), BreakerError<Boom>> = breaker
            .call(async {
                invoked = true;
                Ok(())
            })
            .await;
        assert!(matches!(result, Err(BreakerError::Open { .. })));
        assert!(!invoked);
    }

    #[tokio::test]
    async fn test_success_resets_failure_count() {
        let breaker = fast_breaker(3, Duration::from_secs(30));

        let _: Result<(), _> = breaker.call(async { Err::<(), _>(Boom) }).await;
        let _: Result<(), _> = breaker.call(async { Err::<(), _>(Boom) }).await;
        let _: Result<(), BreakerError<Boom>> = breaker.call(async { Ok(()) }).await;
        let _: Result<(), _> = breaker.call(async { Err::<(), _>(Boom) }).await;
        let _: Result<(), _> = breaker.call(async { Err::<(), _>(Boom) }).await;

        // 2 failures, reset, 2 more failures: never reached the threshold of 3
        assert_eq!(breaker.state(), CircuitState::Closed);
    }

    #[tokio::test]
    async fn test_half_open_recovery() {
        let breaker = fast_breaker(1, Duration::ZERO);

        let _: Result<(), _> = breaker.call(async { Err::<(), _>(Boom) }).await;
        assert_eq!(breaker.state(), CircuitState::Open);

        // Zero timeout: the next call probes immediately in HALF_OPEN
        let _: Result<(), BreakerError<Boom>> = breaker.call(async { Ok(()) }).await;
        assert_eq!(breaker.state(), CircuitState::HalfOpen);

        let _: Result<(), BreakerError<Boom>> = breaker.call(async { Ok(()) }).await;
        assert_eq!(breaker.state(), CircuitState::Closed);
    }

    #[tokio::test]
    async fn test_half_open_failure_reopens() {
        let breaker = fast_breaker(1, Duration::ZERO);

        let _: Result<(), _> = breaker.call(async { Err::<(), _>(Boom) }).await;
        assert_eq!(breaker.state(), CircuitState::Open);

        let _: Result<(), _> = breaker.call(async { Err::<(), _>(Boom) }).await;
        assert_eq!(breaker.state(), CircuitState::Open);
    }

    #[tokio::test]
    async fn test_open_does_not_probe_before_timeout() {
        let breaker = fast_breaker(1, Duration::from_secs(3600));

        let _: Result<(), _> = breaker.call(async { Err::<(), _>(Boom) }).await;
        let result: Result<(), BreakerError<Boom>> = breaker.call(async { Ok(()) }).await;
        assert!(matches!(result, Err(BreakerError::Open { .. })));
        assert_eq!(breaker.state(), CircuitState::Open);
    }

    #[tokio::test]
    async fn test_prometheus_export() {
        let breaker = fast_breaker(1, Duration::from_secs(30));
        let _: Result<(), BreakerError<Boom>> = breaker.call(async { Ok(()) }).await;

        let text = breaker.prometheus_metrics();
        assert!(text.contains("circuit_breaker_state{name=\"test\"} 0"));
        assert!(text.contains("circuit_breaker_total_calls{name=\"test\"} 1"));
        assert!(text.contains("circuit_breaker_successful_calls{name=\"test\"} 1"));
    }

    #[test]
    fn test_provider_defaults() {
        let dms = CircuitBreaker::dms();
        assert_eq!(dms.config.failure_threshold, 5);
        assert_eq!(dms.config.timeout_duration, Duration::from_secs(60));

        let chat = CircuitBreaker::chat_model();
        assert_eq!(chat.config.failure_threshold, 3);
        assert_eq!(chat.config.success_threshold, 2);
    }
}
