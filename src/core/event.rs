//! Engine event stream
//!
//! All components publish into a single [`EventBus`]. Two kinds of
//! subscribers exist:
//!
//! - display subscribers ([`EventBus::subscribe`]) read from a bounded ring.
//!   A slow display subscriber loses the oldest events and never stalls
//!   a session's read loop.
//! - lossless subscribers ([`EventBus::subscribe_lossless`]) get an
//!   unbounded queue and see every event, in publication order.

use crate::core::discovery::Port;
use crate::core::pipeline::{ExtractionError, MetricSample};
use crate::core::script::TaskState;
use crate::core::session::{RawLine, SessionId};
use crate::core::state_machine::SessionState;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::{broadcast, mpsc};
use tracing::warn;
use uuid::Uuid;

/// Events emitted by the engine
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum EngineEvent {
    /// A port appeared
    Attached {
        /// The classified port
        port: Port,
    },
    /// A port vanished
    Detached {
        /// Port path
        port_id: String,
    },
    /// A session moved between states
    SessionStateChanged {
        /// Session id
        session_id: SessionId,
        /// Port path
        port_id: String,
        /// Previous state
        from: SessionState,
        /// New state
        to: SessionState,
        /// Reason attached to the transition
        reason: Option<String>,
        /// Transition time
        timestamp: DateTime<Utc>,
    },
    /// A session hit an unrecoverable error
    SessionFailed {
        /// Session id
        session_id: SessionId,
        /// Port path
        port_id: String,
        /// Failure cause
        cause: String,
    },
    /// A line was received or sent
    RawLine(RawLine),
    /// A structured value was extracted from a line
    MetricSample(MetricSample),
    /// An extraction rule matched but produced an unusable value
    ExtractionError(ExtractionError),
    /// A script task changed state
    TaskStateChanged {
        /// Task id
        task_id: Uuid,
        /// Task name
        name: String,
        /// New state
        state: TaskState,
        /// Failure message, if the task failed
        error: Option<String>,
    },
}

impl EngineEvent {
    /// Event name as used in serialized output
    pub fn name(&self) -> &'static str {
        match self {
            Self::Attached { .. } => "attached",
            Self::Detached { .. } => "detached",
            Self::SessionStateChanged { .. } => "session_state_changed",
            Self::SessionFailed { .. } => "session_failed",
            Self::RawLine(_) => "raw_line",
            Self::MetricSample(_) => "metric_sample",
            Self::ExtractionError(_) => "extraction_error",
            Self::TaskStateChanged { .. } => "task_state_changed",
        }
    }

    /// Session this event belongs to, if any
    pub fn session_id(&self) -> Option<SessionId> {
        match self {
            Self::SessionStateChanged { session_id, .. } | Self::SessionFailed { session_id, .. } => {
                Some(*session_id)
            }
            Self::RawLine(line) => Some(line.session_id),
            Self::MetricSample(sample) => Some(sample.session_id),
            Self::ExtractionError(err) => Some(err.session_id),
            _ => None,
        }
    }
}

/// Single fan-out point for engine events
pub struct EventBus {
    display_tx: broadcast::Sender<EngineEvent>,
    lossless: Mutex<Vec<mpsc::UnboundedSender<EngineEvent>>>,
}

impl EventBus {
    /// Create a bus whose display subscribers buffer `display_capacity` events
    pub fn new(display_capacity: usize) -> Self {
        let (display_tx, _) = broadcast::channel(display_capacity.max(1));
        Self {
            display_tx,
            lossless: Mutex::new(Vec::new()),
        }
    }

    /// Publish an event to every subscriber. Never blocks.
    pub fn publish(&self, event: EngineEvent) {
        let mut lossless = self.lossless.lock();
        lossless.retain(|tx| tx.send(event.clone()).is_ok());
        // No display subscribers is not an error
        let _ = self.display_tx.send(event);
    }

    /// Subscribe with a bounded, drop-oldest queue
    pub fn subscribe(&self) -> Subscription {
        Subscription {
            rx: self.display_tx.subscribe(),
            dropped: 0,
        }
    }

    /// Subscribe with an unbounded queue that never drops events
    pub fn subscribe_lossless(&self) -> mpsc::UnboundedReceiver<EngineEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.lossless.lock().push(tx);
        rx
    }

    /// Number of live subscribers of both kinds
    pub fn subscriber_count(&self) -> usize {
        self.display_tx.receiver_count() + self.lossless.lock().len()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(1024)
    }
}

/// Display subscription handle
pub struct Subscription {
    rx: broadcast::Receiver<EngineEvent>,
    dropped: u64,
}

impl Subscription {
    /// Receive the next event, skipping over anything lost to overflow.
    /// Returns `None` once the bus is gone.
    pub async fn recv(&mut self) -> Option<EngineEvent> {
        loop {
            match self.rx.recv().await {
                Ok(event) => return Some(event),
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    self.dropped += n;
                    warn!("Display subscriber lagged, dropped {} oldest events", n);
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }

    /// Non-blocking receive
    pub fn try_recv(&mut self) -> Option<EngineEvent> {
        loop {
            match self.rx.try_recv() {
                Ok(event) => return Some(event),
                Err(broadcast::error::TryRecvError::Lagged(n)) => self.dropped += n,
                Err(_) => return None,
            }
        }
    }

    /// Total events lost because this subscriber fell behind
    pub fn dropped(&self) -> u64 {
        self.dropped
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn detached(n: usize) -> EngineEvent {
        EngineEvent::Detached {
            port_id: format!("/dev/ttyUSB{n}"),
        }
    }

    #[tokio::test]
    async fn test_display_drops_oldest() {
        let bus = EventBus::new(4);
        let mut sub = bus.subscribe();

        for n in 0..10 {
            bus.publish(detached(n));
        }

        let first = sub.recv().await.unwrap();
        match first {
            EngineEvent::Detached { port_id } => assert_eq!(port_id, "/dev/ttyUSB6"),
            other => panic!("unexpected event {other:?}"),
        }
        assert_eq!(sub.dropped(), 6);
    }

    #[tokio::test]
    async fn test_lossless_keeps_everything() {
        let bus = EventBus::new(2);
        let mut rx = bus.subscribe_lossless();

        for n in 0..100 {
            bus.publish(detached(n));
        }

        for n in 0..100 {
            match rx.recv().await.unwrap() {
                EngineEvent::Detached { port_id } => assert_eq!(port_id, format!("/dev/ttyUSB{n}")),
                other => panic!("unexpected event {other:?}"),
            }
        }
    }

    #[test]
    fn test_closed_lossless_subscribers_are_pruned() {
        let bus = EventBus::new(2);
        let rx = bus.subscribe_lossless();
        assert_eq!(bus.subscriber_count(), 1);
        drop(rx);
        bus.publish(detached(0));
        assert_eq!(bus.subscriber_count(), 0);
    }

    #[test]
    fn test_event_serializes_with_tag() {
        let json = serde_json::to_string(&detached(3)).unwrap();
        assert_eq!(json, r#"{"event":"detached","port_id":"/dev/ttyUSB3"}"#);
    }
}
