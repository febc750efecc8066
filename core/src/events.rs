//! Per-session event broadcast.
//!
//! Events are sequence-numbered with a monotonically increasing counter
//! so subscribers can order them. Fan-out uses `tokio::sync::broadcast`:
//! a slow or disconnected subscriber lags (dropping the oldest events for
//! that subscriber only) and resumes from the latest; producers are
//! never blocked and nothing is buffered unboundedly.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use chrono::Utc;
use riff_protocol::{Event, EventLevel};
use tokio::sync::broadcast;
use tracing::warn;

use crate::store::Store;

/// Events a subscriber can fall behind by before lag-dropping kicks in.
const CHANNEL_CAPACITY: usize = 512;

struct BusInner {
    session_id: String,
    seq: AtomicU64,
    tx: broadcast::Sender<Event>,
    /// Durable sink; the bus logs every published event through it.
    store: Option<Arc<Store>>,
}

/// Cheap-to-clone handle for publishing and subscribing to session events.
#[derive(Clone)]
pub struct EventBus {
    inner: Arc<BusInner>,
}

impl EventBus {
    pub fn new(session_id: impl Into<String>, store: Option<Arc<Store>>) -> Self {
        let (tx, _rx) = broadcast::channel(CHANNEL_CAPACITY);
        Self {
            inner: Arc::new(BusInner {
                session_id: session_id.into(),
                seq: AtomicU64::new(0),
                tx,
                store,
            }),
        }
    }

    pub fn session_id(&self) -> &str {
        &self.inner.session_id
    }

    /// Publish an event to all subscribers and the durable log.
    pub fn publish(
        &self,
        source: &str,
        level: EventLevel,
        message: impl Into<String>,
        payload: serde_json::Value,
    ) -> Event {
        let event = Event {
            seq: self.inner.seq.fetch_add(1, Ordering::SeqCst) + 1,
            ts: Utc::now(),
            source: source.to_string(),
            level,
            message: message.into(),
            payload,
        };
        if let Some(store) = &self.inner.store
            && let Err(err) = store.log_event(&self.inner.session_id, &event)
        {
            warn!("failed to persist event #{}: {err}", event.seq);
        }
        // No subscribers is fine; send only fails when all receivers dropped.
        let _ = self.inner.tx.send(event.clone());
        event
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.inner.tx.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn events_are_sequence_numbered_in_order() {
        let bus = EventBus::new("s1", None);
        let mut rx = bus.subscribe();

        bus.publish("system", EventLevel::Info, "one", serde_json::json!({}));
        bus.publish("system", EventLevel::Info, "two", serde_json::json!({}));
        bus.publish("system", EventLevel::Warning, "three", serde_json::json!({}));

        let seqs: Vec<u64> = vec![
            rx.recv().await.unwrap().seq,
            rx.recv().await.unwrap().seq,
            rx.recv().await.unwrap().seq,
        ];
        assert_eq!(seqs, vec![1, 2, 3]);
    }

    #[tokio::test]
    async fn publish_without_subscribers_does_not_panic() {
        let bus = EventBus::new("s1", None);
        let event = bus.publish("runtime", EventLevel::Error, "boom", serde_json::json!({}));
        assert_eq!(event.seq, 1);
    }

    #[tokio::test]
    async fn lagged_subscriber_resumes_from_latest() {
        let bus = EventBus::new("s1", None);
        let mut rx = bus.subscribe();

        for i in 0..(CHANNEL_CAPACITY + 8) {
            bus.publish("system", EventLevel::Debug, format!("e{i}"), serde_json::json!({}));
        }

        // First recv reports the lag, subsequent recvs resume.
        match rx.recv().await {
            Err(broadcast::error::RecvError::Lagged(n)) => assert!(n > 0),
            other => panic!("expected lag, got {other:?}"),
        }
        let resumed = rx.recv().await.unwrap();
        assert!(resumed.seq > 1);
    }
}
