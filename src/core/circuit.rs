//! Per-provider circuit breakers.
//!
//! A breaker trips after `failure_threshold` consecutive failures, or when the
//! failure ratio over the last `window` outcomes reaches `failure_ratio`. An
//! open breaker short-circuits calls until the cooldown elapses, then admits a
//! single probe whose outcome decides between closing and re-opening.

use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use super::clock::{SharedClock, SystemClock};

/// Circuit breaker state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    /// Calls proceed normally.
    Closed,
    /// Calls fail immediately.
    Open,
    /// Cooldown elapsed; one probe call decides the next state.
    HalfOpen,
}

impl fmt::Display for CircuitState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Closed => write!(f, "closed"),
            Self::Open => write!(f, "open"),
            Self::HalfOpen => write!(f, "half-open"),
        }
    }
}

/// Breaker tuning.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CircuitConfig {
    /// Consecutive failures that open the circuit (K).
    pub failure_threshold: u32,

    /// How long the circuit stays open before allowing a probe.
    #[serde(with = "duration_secs")]
    pub cooldown: Duration,

    /// Optional failure ratio (0.0..=1.0) that also opens the circuit.
    pub failure_ratio: Option<f64>,

    /// Number of recent outcomes the ratio is computed over.
    pub window: usize,
}

impl Default for CircuitConfig {
    fn default() -> Self {
        Self { failure_threshold: 3, cooldown: Duration::from_secs(60), failure_ratio: None, window: 20 }
    }
}

/// Circuit breaker for one provider.
#[derive(Debug)]
pub struct CircuitBreaker {
    config: CircuitConfig,
    state: CircuitState,
    consecutive_failures: u32,
    recent: VecDeque<bool>,
    opened_at: Option<Instant>,
    probe_in_flight: bool,
}

impl CircuitBreaker {
    /// Create a closed breaker.
    pub fn new(config: CircuitConfig) -> Self {
        Self {
            recent: VecDeque::with_capacity(config.window),
            config,
            state: CircuitState::Closed,
            consecutive_failures: 0,
            opened_at: None,
            probe_in_flight: false,
        }
    }

    /// Current state, moving OPEN to HALF_OPEN once the cooldown has elapsed.
    pub fn state(&mut self, now: Instant) -> CircuitState {
        if self.state == CircuitState::Open {
            if let Some(opened_at) = self.opened_at {
                if now.saturating_duration_since(opened_at) >= self.config.cooldown {
                    self.state = CircuitState::HalfOpen;
                    self.probe_in_flight = false;
                }
            }
        }
        self.state
    }

    /// Whether a call may be attempted now.
    ///
    /// In HALF_OPEN exactly one caller gets `true` until that probe's result
    /// is recorded.
    pub fn allow(&mut self, now: Instant) -> bool {
        match self.state(now) {
            CircuitState::Closed => true,
            CircuitState::Open => false,
            CircuitState::HalfOpen => {
                if self.probe_in_flight {
                    false
                } else {
                    self.probe_in_flight = true;
                    true
                }
            }
        }
    }

    /// Record a successful call.
    pub fn record_success(&mut self, now: Instant) {
        match self.state(now) {
            CircuitState::Closed => {
                self.consecutive_failures = 0;
                self.push_outcome(true);
            }
            CircuitState::HalfOpen => self.close(),
            CircuitState::Open => {}
        }
    }

    /// Record a failed call.
    pub fn record_failure(&mut self, now: Instant) {
        match self.state(now) {
            CircuitState::Closed => {
                self.consecutive_failures += 1;
                self.push_outcome(false);
                if self.consecutive_failures >= self.config.failure_threshold || self.ratio_tripped()
                {
                    self.open(now);
                }
            }
            CircuitState::HalfOpen => self.open(now),
            CircuitState::Open => {}
        }
    }

    /// Give the half-open probe slot back when the probe never completed.
    pub fn abandon_probe(&mut self) {
        if self.state == CircuitState::HalfOpen {
            self.probe_in_flight = false;
        }
    }

    /// Consecutive failures seen while closed.
    pub fn consecutive_failures(&self) -> u32 {
        self.consecutive_failures
    }

    fn push_outcome(&mut self, success: bool) {
        if self.config.window == 0 {
            return;
        }
        if self.recent.len() == self.config.window {
            self.recent.pop_front();
        }
        self.recent.push_back(success);
    }

    fn ratio_tripped(&self) -> bool {
        let Some(ratio) = self.config.failure_ratio else {
            return false;
        };
        // Only judge a full window.
        if self.recent.len() < self.config.window || self.config.window == 0 {
            return false;
        }
        let failures = self.recent.iter().filter(|ok| !**ok).count();
        failures as f64 / self.recent.len() as f64 >= ratio
    }

    fn open(&mut self, now: Instant) {
        self.state = CircuitState::Open;
        self.opened_at = Some(now);
        self.probe_in_flight = false;
    }

    fn close(&mut self) {
        self.state = CircuitState::Closed;
        self.consecutive_failures = 0;
        self.opened_at = None;
        self.probe_in_flight = false;
        self.recent.clear();
    }
}

/// Breakers for every provider, keyed by provider id.
#[derive(Debug, Clone)]
pub struct BreakerRegistry {
    config: CircuitConfig,
    clock: SharedClock,
    breakers: Arc<Mutex<HashMap<String, CircuitBreaker>>>,
}

impl BreakerRegistry {
    pub fn new(config: CircuitConfig) -> Self {
        Self::with_clock(config, Arc::new(SystemClock))
    }

    /// Registry reading time from the given clock.
    pub fn with_clock(config: CircuitConfig, clock: SharedClock) -> Self {
        Self { config, clock, breakers: Arc::new(Mutex::new(HashMap::new())) }
    }

    fn with_breaker<R>(&self, provider: &str, f: impl FnOnce(&mut CircuitBreaker, Instant) -> R) -> R {
        let now = self.clock.now();
        let mut breakers = self.breakers.lock();
        let breaker = breakers
            .entry(provider.to_string())
            .or_insert_with(|| CircuitBreaker::new(self.config.clone()));
        f(breaker, now)
    }

    /// Whether `provider` may be called now.
    pub fn allow(&self, provider: &str) -> bool {
        self.with_breaker(provider, |b, now| b.allow(now))
    }

    pub fn record_success(&self, provider: &str) {
        self.with_breaker(provider, |b, now| b.record_success(now));
    }

    pub fn record_failure(&self, provider: &str) {
        let opened = self.with_breaker(provider, |b, now| {
            let before = b.state(now);
            b.record_failure(now);
            before != CircuitState::Open && b.state(now) == CircuitState::Open
        });
        if opened {
            tracing::warn!(provider, cooldown = ?self.config.cooldown, "Circuit opened");
        }
    }

    /// Free the probe slot of a cancelled half-open call.
    pub fn abandon_probe(&self, provider: &str) {
        self.with_breaker(provider, |b, _| b.abandon_probe());
    }

    pub fn state(&self, provider: &str) -> CircuitState {
        self.with_breaker(provider, |b, now| b.state(now))
    }

    /// State of every provider seen so far, sorted by id.
    pub fn status_summary(&self) -> Vec<(String, CircuitState)> {
        let now = self.clock.now();
        let mut breakers = self.breakers.lock();
        let mut summary: Vec<_> =
            breakers.iter_mut().map(|(id, b)| (id.clone(), b.state(now))).collect();
        summary.sort_by(|a, b| a.0.cmp(&b.0));
        summary
    }
}

pub(crate) mod duration_secs {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_f64(duration.as_secs_f64())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        let secs = f64::deserialize(deserializer)?;
        Duration::try_from_secs_f64(secs).map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::clock::ManualClock;

    fn config(threshold: u32, cooldown_secs: u64) -> CircuitConfig {
        CircuitConfig {
            failure_threshold: threshold,
            cooldown: Duration::from_secs(cooldown_secs),
            failure_ratio: None,
            window: 10,
        }
    }

    #[test]
    fn test_circuit_breaker_closed() {
        let now = Instant::now();
        let mut cb = CircuitBreaker::new(config(3, 1));
        assert_eq!(cb.state(now), CircuitState::Closed);
        assert!(cb.allow(now));
    }

    #[test]
    fn test_circuit_breaker_opens_after_failures() {
        let now = Instant::now();
        let mut cb = CircuitBreaker::new(config(3, 60));

        cb.record_failure(now);
        cb.record_failure(now);
        assert_eq!(cb.state(now), CircuitState::Closed);

        cb.record_failure(now); // Third failure opens circuit
        assert_eq!(cb.state(now), CircuitState::Open);
        assert!(!cb.allow(now));
    }

    #[test]
    fn test_success_resets_failure_count() {
        let now = Instant::now();
        let mut cb = CircuitBreaker::new(config(3, 60));

        cb.record_failure(now);
        cb.record_failure(now);
        cb.record_success(now);

        assert_eq!(cb.consecutive_failures(), 0);
        cb.record_failure(now);
        cb.record_failure(now);
        assert_eq!(cb.state(now), CircuitState::Closed);
    }

    #[test]
    fn test_half_open_admits_exactly_one_probe() {
        let start = Instant::now();
        let mut cb = CircuitBreaker::new(config(1, 30));
        cb.record_failure(start);
        assert!(!cb.allow(start + Duration::from_secs(29)));

        let later = start + Duration::from_secs(30);
        assert_eq!(cb.state(later), CircuitState::HalfOpen);
        assert!(cb.allow(later));
        assert!(!cb.allow(later));
        assert!(!cb.allow(later));
    }

    #[test]
    fn test_abandoned_probe_frees_slot() {
        let start = Instant::now();
        let mut cb = CircuitBreaker::new(config(1, 5));
        cb.record_failure(start);

        let later = start + Duration::from_secs(5);
        assert!(cb.allow(later));
        cb.abandon_probe();
        assert!(cb.allow(later));
    }

    #[test]
    fn test_half_open_success_closes() {
        let start = Instant::now();
        let mut cb = CircuitBreaker::new(config(1, 5));
        cb.record_failure(start);

        let later = start + Duration::from_secs(5);
        assert!(cb.allow(later));
        cb.record_success(later);
        assert_eq!(cb.state(later), CircuitState::Closed);
        assert!(cb.allow(later));
    }

    #[test]
    fn test_half_open_failure_reopens_with_new_cooldown() {
        let start = Instant::now();
        let mut cb = CircuitBreaker::new(config(1, 5));
        cb.record_failure(start);

        let probe_time = start + Duration::from_secs(5);
        assert!(cb.allow(probe_time));
        cb.record_failure(probe_time);
        assert_eq!(cb.state(probe_time), CircuitState::Open);
        assert!(!cb.allow(probe_time + Duration::from_secs(4)));
        assert!(cb.allow(probe_time + Duration::from_secs(5)));
    }

    #[test]
    fn test_failure_ratio_trips_over_full_window() {
        let now = Instant::now();
        let mut cb = CircuitBreaker::new(CircuitConfig {
            failure_threshold: 100,
            cooldown: Duration::from_secs(10),
            failure_ratio: Some(0.5),
            window: 4,
        });

        cb.record_failure(now);
        cb.record_success(now);
        cb.record_failure(now);
        assert_eq!(cb.state(now), CircuitState::Closed);

        cb.record_success(now);
        cb.record_failure(now); // window: [ok, fail, ok, fail] -> 50%
        assert_eq!(cb.state(now), CircuitState::Open);
    }

    #[test]
    fn test_registry_isolates_providers() {
        let clock = Arc::new(ManualClock::new());
        let registry = BreakerRegistry::with_clock(config(2, 30), clock.clone());

        registry.record_failure("flaky");
        registry.record_failure("flaky");
        assert!(!registry.allow("flaky"));
        assert!(registry.allow("steady"));

        clock.advance(Duration::from_secs(30));
        assert_eq!(registry.state("flaky"), CircuitState::HalfOpen);
        assert!(registry.allow("flaky"));
        assert!(!registry.allow("flaky"));

        let summary = registry.status_summary();
        assert_eq!(summary[0].0, "flaky");
        assert_eq!(summary[1], ("steady".to_string(), CircuitState::Closed));
    }
}
