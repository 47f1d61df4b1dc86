//! Per-backend circuit breakers
//!
//! `closed` passes calls through, `open` rejects them without contacting the
//! backend, and after the cooldown `half-open` admits exactly one probe whose
//! outcome decides between `closed` and a fresh `open` period. Only transient
//! failures are counted; a content error is a healthy response from the
//! backend's point of view.

use dashmap::DashMap;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;

use crate::config::BreakerConfig;

/// Wait suggested while another caller's probe decides the circuit
const PROBE_BACKOFF: Duration = Duration::from_secs(1);

/// Breaker state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

/// Call refused because the circuit is open
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Rejected {
    /// Time until a probe may be admitted
    pub retry_after: Duration,
}

#[derive(Debug)]
struct BreakerInner {
    state: CircuitState,
    /// Consecutive transient failures, oldest first
    failures: VecDeque<Instant>,
    opened_at: Option<Instant>,
    probe_in_flight: bool,
    rejected_calls: u64,
}

/// Circuit breaker for one downstream backend
#[derive(Debug)]
pub struct CircuitBreaker {
    backend_id: String,
    threshold: usize,
    window: Duration,
    cooldown: Duration,
    inner: Mutex<BreakerInner>,
}

impl CircuitBreaker {
    pub fn new(backend_id: impl Into<String>, config: &BreakerConfig) -> Self {
        Self {
            backend_id: backend_id.into(),
            threshold: config.failure_threshold.max(1) as usize,
            window: Duration::from_secs(config.window_secs),
            cooldown: Duration::from_secs(config.cooldown_secs),
            inner: Mutex::new(BreakerInner {
                state: CircuitState::Closed,
                failures: VecDeque::new(),
                opened_at: None,
                probe_in_flight: false,
                rejected_calls: 0,
            }),
        }
    }

    pub fn backend_id(&self) -> &str {
        &self.backend_id
    }

    /// Current state; an expired cooldown reads as half-open
    pub fn state(&self) -> CircuitState {
        let inner = self.inner.lock();
        match (inner.state, inner.opened_at) {
            (CircuitState::Open, Some(at)) if at.elapsed() >= self.cooldown => CircuitState::HalfOpen,
            (state, _) => state,
        }
    }

    /// Ask to call the backend
    pub fn acquire(self: &Arc<Self>) -> Result<BreakerPermit, Rejected> {
        let mut inner = self.inner.lock();
        let now = Instant::now();

        let probe = match inner.state {
            CircuitState::Closed => false,
            CircuitState::Open => {
                let opened_at = inner.opened_at.unwrap_or(now);
                let elapsed = now.saturating_duration_since(opened_at);
                if elapsed < self.cooldown {
                    inner.rejected_calls += 1;
                    return Err(Rejected { retry_after: self.cooldown - elapsed });
                }
                tracing::info!("Circuit for {} half-open, admitting probe", self.backend_id);
                inner.state = CircuitState::HalfOpen;
                inner.probe_in_flight = true;
                true
            }
            CircuitState::HalfOpen => {
                if inner.probe_in_flight {
                    inner.rejected_calls += 1;
                    return Err(Rejected { retry_after: PROBE_BACKOFF.min(self.cooldown) });
                }
                inner.probe_in_flight = true;
                true
            }
        };

        Ok(BreakerPermit {
            breaker: Arc::clone(self),
            probe,
            resolved: false,
        })
    }

    fn on_success(&self, probe: bool) {
        let mut inner = self.inner.lock();
        inner.failures.clear();
        if probe {
            inner.probe_in_flight = false;
            inner.state = CircuitState::Closed;
            inner.opened_at = None;
            tracing::info!("Circuit for {} closed after successful probe", self.backend_id);
        }
    }

    fn on_failure(&self, probe: bool) {
        let mut inner = self.inner.lock();
        let now = Instant::now();

        if probe {
            inner.probe_in_flight = false;
            inner.state = CircuitState::Open;
            inner.opened_at = Some(now);
            tracing::warn!("Probe to {} failed, circuit re-opened", self.backend_id);
            return;
        }
        if inner.state != CircuitState::Closed {
            // admitted before the circuit opened; already counted
            return;
        }

        while inner
            .failures
            .front()
            .is_some_and(|t| now.saturating_duration_since(*t) > self.window)
        {
            inner.failures.pop_front();
        }
        inner.failures.push_back(now);

        if inner.failures.len() >= self.threshold {
            inner.state = CircuitState::Open;
            inner.opened_at = Some(now);
            tracing::warn!(
                "Circuit for {} opened after {} consecutive failures (cooldown {}s)",
                self.backend_id,
                inner.failures.len(),
                self.cooldown.as_secs()
            );
        }
    }

    pub fn snapshot(&self) -> BreakerSnapshot {
        let state = self.state();
        let inner = self.inner.lock();
        BreakerSnapshot {
            backend_id: self.backend_id.clone(),
            state,
            consecutive_failures: inner.failures.len(),
            rejected_calls: inner.rejected_calls,
        }
    }
}

/// Permission to make one backend call. Report the outcome exactly once;
/// a probe permit dropped without an outcome re-opens the circuit.
#[derive(Debug)]
pub struct BreakerPermit {
    breaker: Arc<CircuitBreaker>,
    probe: bool,
    resolved: bool,
}

impl BreakerPermit {
    pub fn is_probe(&self) -> bool {
        self.probe
    }

    /// The backend answered successfully
    pub fn succeeded(mut self) {
        self.resolved = true;
        self.breaker.on_success(self.probe);
    }

    /// The backend answered, but rejected the content. Counts as healthy.
    pub fn rejected_content(mut self) {
        self.resolved = true;
        self.breaker.on_success(self.probe);
    }

    /// Timeout, connection failure or server error
    pub fn failed(mut self) {
        self.resolved = true;
        self.breaker.on_failure(self.probe);
    }
}

impl Drop for BreakerPermit {
    fn drop(&mut self) {
        if !self.resolved && self.probe {
            self.breaker.on_failure(true);
        }
    }
}

/// Observability view of one breaker
#[derive(Debug, Clone, Serialize)]
pub struct BreakerSnapshot {
    pub backend_id: String,
    pub state: CircuitState,
    pub consecutive_failures: usize,
    pub rejected_calls: u64,
}

/// All breakers, keyed by backend id; created lazily on first use
#[derive(Debug)]
pub struct BreakerRegistry {
    config: BreakerConfig,
    breakers: DashMap<String, Arc<CircuitBreaker>>,
}

impl BreakerRegistry {
    pub fn new(config: BreakerConfig) -> Self {
        Self {
            config,
            breakers: DashMap::new(),
        }
    }

    pub fn get(&self, backend_id: &str) -> Arc<CircuitBreaker> {
        if let Some(existing) = self.breakers.get(backend_id) {
            return Arc::clone(existing.value());
        }
        let entry = self
            .breakers
            .entry(backend_id.to_string())
            .or_insert_with(|| Arc::new(CircuitBreaker::new(backend_id, &self.config)));
        Arc::clone(entry.value())
    }

    pub fn snapshot(&self) -> Vec<BreakerSnapshot> {
        let mut all: Vec<_> = self.breakers.iter().map(|b| b.snapshot()).collect();
        all.sort_by(|a, b| a.backend_id.cmp(&b.backend_id));
        all
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn breaker() -> Arc<CircuitBreaker> {
        Arc::new(CircuitBreaker::new("documents-http", &BreakerConfig::default()))
    }

    fn fail(breaker: &Arc<CircuitBreaker>) {
        breaker.acquire().unwrap().failed();
    }

    #[tokio::test(start_paused = true)]
    async fn test_opens_at_threshold_and_probes_after_cooldown() {
        let breaker = breaker();
        for _ in 0..5 {
            fail(&breaker);
        }
        assert_eq!(breaker.state(), CircuitState::Open);

        // sixth call is refused without reaching the backend
        let rejected = breaker.acquire().unwrap_err();
        assert_eq!(rejected.retry_after, Duration::from_secs(30));

        tokio::time::advance(Duration::from_secs(30)).await;
        let probe = breaker.acquire().unwrap();
        assert!(probe.is_probe());
        // only one probe at a time; the others come back shortly
        let waiting = breaker.acquire().unwrap_err();
        assert_eq!(waiting.retry_after, Duration::from_secs(1));

        probe.succeeded();
        assert_eq!(breaker.state(), CircuitState::Closed);
        assert!(!breaker.acquire().unwrap().is_probe());
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_probe_restarts_cooldown() {
        let breaker = breaker();
        for _ in 0..5 {
            fail(&breaker);
        }
        tokio::time::advance(Duration::from_secs(31)).await;
        breaker.acquire().unwrap().failed();
        assert_eq!(breaker.state(), CircuitState::Open);

        tokio::time::advance(Duration::from_secs(10)).await;
        assert_eq!(
            breaker.acquire().unwrap_err().retry_after,
            Duration::from_secs(20)
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_success_resets_streak() {
        let breaker = breaker();
        for _ in 0..4 {
            fail(&breaker);
        }
        breaker.acquire().unwrap().succeeded();
        for _ in 0..4 {
            fail(&breaker);
        }
        assert_eq!(breaker.state(), CircuitState::Closed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_content_errors_do_not_count() {
        let breaker = breaker();
        for _ in 0..10 {
            breaker.acquire().unwrap().rejected_content();
        }
        assert_eq!(breaker.state(), CircuitState::Closed);
        assert_eq!(breaker.snapshot().consecutive_failures, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failures_outside_window_expire() {
        let breaker = breaker();
        for _ in 0..4 {
            fail(&breaker);
        }
        tokio::time::advance(Duration::from_secs(61)).await;
        fail(&breaker);
        assert_eq!(breaker.state(), CircuitState::Closed);
        assert_eq!(breaker.snapshot().consecutive_failures, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_abandoned_probe_reopens() {
        let breaker = breaker();
        for _ in 0..5 {
            fail(&breaker);
        }
        tokio::time::advance(Duration::from_secs(30)).await;
        drop(breaker.acquire().unwrap());
        assert_eq!(breaker.snapshot().state, CircuitState::Open);
    }

    #[test]
    fn test_registry_shares_instances() {
        let registry = BreakerRegistry::new(BreakerConfig::default());
        let a = registry.get("ocr");
        let b = registry.get("ocr");
        assert!(Arc::ptr_eq(&a, &b));
        registry.get("asr");
        let ids: Vec<_> = registry.snapshot().into_iter().map(|s| s.backend_id).collect();
        assert_eq!(ids, vec!["asr".to_string(), "ocr".to_string()]);
    }
}
