//! Event fan-out: a single-process multiplexer from committed domain
//! events to push-channel subscribers.
//!
//! Delivery contract: per-entity order is preserved (publishers hand events
//! over in commit order), each subscriber owns a bounded queue, and an
//! enqueue that would block past the configured timeout drops the event for
//! that subscriber and bumps the `dropped` counter. Committed domain events
//! are also appended to the document store, which persistent audit sinks
//! consume; those are immune to queue drops.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use serde_json::json;
use tokio::sync::mpsc;

use crate::config::FanoutConfig;
use crate::domain::event::{Component, EventEnvelope, EventKind};
use crate::store::docs::DocStore;
use crate::telemetry::Metrics;

/// A subscriber's end of the push channel.
pub struct Subscription {
    pub id: u64,
    pub rx: mpsc::Receiver<EventEnvelope>,
}

struct SubscriberHandle {
    id: u64,
    tx: mpsc::Sender<EventEnvelope>,
}

/// The multiplexer. One per process; constructed at startup and stopped
/// (with a `shutdown` sentinel) during reverse-order teardown.
pub struct EventFanout {
    config: FanoutConfig,
    docs: Arc<DocStore>,
    metrics: Metrics,
    subscribers: Mutex<Vec<SubscriberHandle>>,
    next_id: AtomicU64,
}

impl EventFanout {
    pub fn new(config: FanoutConfig, docs: Arc<DocStore>, metrics: Metrics) -> Self {
        Self {
            config,
            docs,
            metrics,
            subscribers: Mutex::new(Vec::new()),
            next_id: AtomicU64::new(1),
        }
    }

    /// Register a subscriber. The `connected` sentinel is the first event
    /// on the stream; subscribers resume coarse state by fetching a full
    /// snapshot through the API rather than replaying history.
    pub fn subscribe(&self) -> Subscription {
        let (tx, rx) = mpsc::channel(self.config.queue_depth);
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let connected = EventEnvelope::new(
            EventKind::Connected,
            Component::System,
            json!({ "subscriber_id": id }),
        );
        // The queue is empty at this point, so the sentinel cannot block.
        let _ = tx.try_send(connected);
        self.subscribers.lock().push(SubscriberHandle { id, tx });
        self.metrics.fanout_subscribers.inc();
        Subscription { id, rx }
    }

    /// Number of currently registered subscribers.
    pub fn subscriber_count(&self) -> usize {
        self.subscribers.lock().len()
    }

    /// Deliver an event to every subscriber and, for domain events, append
    /// it to the audit log.
    pub async fn publish(&self, event: EventEnvelope) {
        if !matches!(
            event.kind,
            EventKind::Heartbeat | EventKind::Connected | EventKind::Shutdown
        ) {
            if let Err(err) = self.docs.append_event(&event) {
                tracing::warn!(kind = %event.kind, error = %err, "failed to persist event to audit log");
            }
        }
        self.deliver(event).await;
    }

    async fn deliver(&self, event: EventEnvelope) {
        let handles: Vec<(u64, mpsc::Sender<EventEnvelope>)> = self
            .subscribers
            .lock()
            .iter()
            .map(|h| (h.id, h.tx.clone()))
            .collect();
        let mut gone = Vec::new();
        for (id, tx) in handles {
            match tx.send_timeout(event.clone(), self.config.enqueue_timeout()).await {
                Ok(()) => {}
                Err(mpsc::error::SendTimeoutError::Timeout(_)) => {
                    self.metrics.fanout_dropped.inc();
                    tracing::debug!(subscriber = id, kind = %event.kind, "dropped event for slow subscriber");
                }
                Err(mpsc::error::SendTimeoutError::Closed(_)) => gone.push(id),
            }
        }
        if !gone.is_empty() {
            let mut subscribers = self.subscribers.lock();
            subscribers.retain(|h| !gone.contains(&h.id));
            self.metrics.fanout_subscribers.sub(gone.len() as i64);
        }
    }

    /// Emit keep-alives until cancelled.
    pub async fn run_heartbeat(&self) {
        let mut tick = tokio::time::interval(self.config.heartbeat());
        tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        // The first interval tick fires immediately; skip it so the first
        // frame a subscriber sees is `connected`.
        tick.tick().await;
        loop {
            tick.tick().await;
            self.deliver(EventEnvelope::new(
                EventKind::Heartbeat,
                Component::System,
                json!({}),
            ))
            .await;
        }
    }

    /// Emit the `shutdown` sentinel and detach all subscribers.
    pub async fn shutdown(&self) {
        self.deliver(EventEnvelope::new(
            EventKind::Shutdown,
            Component::System,
            json!({}),
        ))
        .await;
        let drained = {
            let mut subscribers = self.subscribers.lock();
            let n = subscribers.len();
            subscribers.clear();
            n
        };
        self.metrics.fanout_subscribers.sub(drained as i64);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn fanout(queue_depth: usize) -> (Arc<EventFanout>, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let docs =
            Arc::new(DocStore::open(dir.path().join("docs"), Duration::from_secs(60)).unwrap());
        let metrics = Metrics::new().unwrap();
        let config = FanoutConfig {
            queue_depth,
            enqueue_timeout_ms: 20,
            heartbeat_secs: 30,
        };
        (Arc::new(EventFanout::new(config, docs, metrics)), dir)
    }

    fn event(kind: EventKind) -> EventEnvelope {
        EventEnvelope::new(kind, Component::System, json!({}))
    }

    #[tokio::test]
    async fn subscriber_sees_connected_then_events() {
        let (fanout, _dir) = fanout(8);
        let mut sub = fanout.subscribe();
        fanout.publish(event(EventKind::Heartbeat)).await;

        let first = sub.rx.recv().await.unwrap();
        assert_eq!(first.kind, EventKind::Connected);
        let second = sub.rx.recv().await.unwrap();
        assert_eq!(second.kind, EventKind::Heartbeat);
    }

    #[tokio::test]
    async fn slow_subscriber_drops_and_counts() {
        let (fanout, _dir) = fanout(1);
        let sub = fanout.subscribe();
        // Queue holds the connected sentinel; the next publishes time out.
        fanout.publish(event(EventKind::Heartbeat)).await;
        fanout.publish(event(EventKind::Heartbeat)).await;
        assert_eq!(fanout.metrics.fanout_dropped.get(), 2);
        drop(sub);
    }

    #[tokio::test]
    async fn dropped_subscriber_is_pruned_on_next_publish() {
        let (fanout, _dir) = fanout(8);
        let sub = fanout.subscribe();
        assert_eq!(fanout.subscriber_count(), 1);
        drop(sub);
        fanout.publish(event(EventKind::Heartbeat)).await;
        assert_eq!(fanout.subscriber_count(), 0);
    }

    #[tokio::test]
    async fn shutdown_emits_sentinel() {
        let (fanout, _dir) = fanout(8);
        let mut sub = fanout.subscribe();
        fanout.shutdown().await;
        let first = sub.rx.recv().await.unwrap();
        assert_eq!(first.kind, EventKind::Connected);
        let second = sub.rx.recv().await.unwrap();
        assert_eq!(second.kind, EventKind::Shutdown);
    }
}
