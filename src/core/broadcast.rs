//! Live progress events.
//!
//! Publishing never blocks: events go into a bounded broadcast channel and a
//! subscriber that falls behind skips what it missed. The last event is kept
//! so observers that connect late start from the current state.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use futures::stream::{Stream, StreamExt};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tokio_stream::wrappers::BroadcastStream;

use super::cost::Cost;
use super::session::{PipelineState, SessionId};

/// Severity of an event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EventLevel {
    Info,
    Warn,
    Error,
}

/// Running totals carried by every event.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProgressCounters {
    /// Prompt selections completed
    pub prompts: usize,
    /// Images persisted
    pub images: usize,
    /// Committed spend
    pub cost: Cost,
}

/// One progress event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatusEvent {
    pub session_id: SessionId,
    pub phase: PipelineState,
    pub level: EventLevel,
    /// Fraction of the session's assets finished, `0.0..=1.0`
    pub progress: f64,
    pub counters: ProgressCounters,
    pub message: String,
    pub timestamp: DateTime<Utc>,
}

/// Publish/subscribe hub for [`StatusEvent`]s.
#[derive(Debug, Clone)]
pub struct StatusBroadcaster {
    tx: broadcast::Sender<StatusEvent>,
    latest: Arc<Mutex<Option<StatusEvent>>>,
}

impl Default for StatusBroadcaster {
    fn default() -> Self {
        Self::new(256)
    }
}

impl StatusBroadcaster {
    /// Create a broadcaster buffering up to `capacity` events per subscriber.
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx, latest: Arc::new(Mutex::new(None)) }
    }

    /// Send an event to every subscriber, ignoring if none are connected.
    pub fn publish(&self, event: StatusEvent) {
        *self.latest.lock() = Some(event.clone());
        let _ = self.tx.send(event);
    }

    /// Most recent event, if any.
    pub fn latest(&self) -> Option<StatusEvent> {
        self.latest.lock().clone()
    }

    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }

    /// Raw receiver, for callers that want to see lag explicitly.
    pub fn receiver(&self) -> broadcast::Receiver<StatusEvent> {
        self.tx.subscribe()
    }

    /// Stream of events published from now on. Lagged events are skipped.
    pub fn subscribe(&self) -> impl Stream<Item = StatusEvent> + Send + 'static {
        BroadcastStream::new(self.tx.subscribe()).filter_map(|result| async move {
            match result {
                Ok(event) => Some(event),
                Err(err) => {
                    tracing::debug!(error = %err, "Status subscriber lagged");
                    None
                }
            }
        })
    }
}
