//! Time source used by the circuit breaker and retry policy.
//!
//! Production code uses [`SystemClock`]; tests inject a [`ManualClock`] that
//! advances virtual time on every sleep instead of blocking.

use std::fmt::Debug;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use parking_lot::Mutex;

/// Source of the current instant and of (possibly virtual) sleeps.
#[async_trait]
pub trait Clock: Send + Sync + Debug {
    /// Current instant.
    fn now(&self) -> Instant;

    /// Wait for the given duration.
    async fn sleep(&self, duration: Duration);
}

/// Shared clock handle.
pub type SharedClock = Arc<dyn Clock>;

/// Wall clock backed by tokio's timer.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

#[async_trait]
impl Clock for SystemClock {
    fn now(&self) -> Instant {
        Instant::now()
    }

    async fn sleep(&self, duration: Duration) {
        tokio::time::sleep(duration).await;
    }
}

/// Virtual clock for tests.
///
/// `sleep` returns immediately, advances the clock and records the requested
/// duration.
#[derive(Debug)]
pub struct ManualClock {
    origin: Instant,
    state: Mutex<ManualState>,
}

#[derive(Debug, Default)]
struct ManualState {
    offset: Duration,
    sleeps: Vec<Duration>,
}

impl Default for ManualClock {
    fn default() -> Self {
        Self::new()
    }
}

impl ManualClock {
    pub fn new() -> Self {
        Self { origin: Instant::now(), state: Mutex::new(ManualState::default()) }
    }

    /// Move virtual time forward.
    pub fn advance(&self, by: Duration) {
        self.state.lock().offset += by;
    }

    /// Every duration passed to `sleep`, in call order.
    pub fn sleeps(&self) -> Vec<Duration> {
        self.state.lock().sleeps.clone()
    }

    /// Virtual time elapsed since creation.
    pub fn elapsed(&self) -> Duration {
        self.state.lock().offset
    }
}

#[async_trait]
impl Clock for ManualClock {
    fn now(&self) -> Instant {
        self.origin + self.state.lock().offset
    }

    async fn sleep(&self, duration: Duration) {
        let mut state = self.state.lock();
        state.offset += duration;
        state.sleeps.push(duration);
    }
}
