//! Fire-and-forget event publication.
//!
//! External viewers subscribe to a single broadcast channel carrying
//! [`EngineEvent`]s: connection counts, per-port initialization progress,
//! lifecycle transitions, session info and every new measurement sample.
//! No acknowledgement or back-pressure exists; a send with no subscribers
//! is not an error.

use crate::model::{GpsFix, MeasurementSample, Technology};
use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::broadcast;

/// Everything the engine announces to the outside world.
#[derive(Clone, Debug, Serialize)]
pub enum EngineEvent {
    /// Number of currently open serial links.
    ConnectionCount { count: usize },
    /// Initialization progress for one port, 0–100 with two decimals.
    InitProgress { port: usize, progress: f64 },
    /// Lifecycle transition, human-readable state name.
    Status { state: String, at: DateTime<Utc> },
    /// Current expert/type/code for the running inspection.
    SessionInfo {
        expert: String,
        kind: String,
        code: String,
    },
    /// A freshly persisted GPS fix.
    Fix { fix: GpsFix },
    /// A freshly persisted measurement sample, keyed by technology and
    /// operator.
    Sample {
        technology: Technology,
        operator: String,
        sample: MeasurementSample,
    },
    /// A measurement loop confirmed (or lost) its technology lock.
    LockState {
        technology: Technology,
        operator: String,
        locked: bool,
    },
}

/// Fire-and-forget publish collaborator. Emission failures are non-fatal
/// by contract, so the method is infallible.
pub trait EventPublisher: Send + Sync {
    fn publish(&self, event: EngineEvent);
}

/// Broadcast-channel implementation. Every subscriber gets every event;
/// lagging subscribers drop the oldest events, never block the engine.
pub struct BroadcastPublisher {
    tx: broadcast::Sender<EngineEvent>,
}

impl BroadcastPublisher {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<EngineEvent> {
        self.tx.subscribe()
    }
}

impl Default for BroadcastPublisher {
    fn default() -> Self {
        Self::new(1024)
    }
}

impl EventPublisher for BroadcastPublisher {
    fn publish(&self, event: EngineEvent) {
        // No subscribers is fine; the error carries the event back, drop it.
        let _ = self.tx.send(event);
    }
}

/// Publisher that swallows everything. Handy in unit tests.
pub struct NullPublisher;

impl EventPublisher for NullPublisher {
    fn publish(&self, _event: EngineEvent) {}
}

/// Shared open-link counter. Sessions bump it on open/close and the new
/// count is published after every change.
#[derive(Default)]
pub struct ConnectionGauge {
    count: std::sync::atomic::AtomicUsize,
}

impl ConnectionGauge {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn count(&self) -> usize {
        self.count.load(std::sync::atomic::Ordering::SeqCst)
    }

    pub fn opened(&self, publisher: &dyn EventPublisher) {
        let count = self.count.fetch_add(1, std::sync::atomic::Ordering::SeqCst) + 1;
        publisher.publish(EngineEvent::ConnectionCount { count });
    }

    pub fn closed(&self, publisher: &dyn EventPublisher) {
        let previous = self
            .count
            .fetch_update(
                std::sync::atomic::Ordering::SeqCst,
                std::sync::atomic::Ordering::SeqCst,
                |current| Some(current.saturating_sub(1)),
            )
            .unwrap_or(0);
        publisher.publish(EngineEvent::ConnectionCount {
            count: previous.saturating_sub(1),
        });
    }
}
