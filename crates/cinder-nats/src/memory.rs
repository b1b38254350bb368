//! In-process event bus over a tokio broadcast channel.

use async_trait::async_trait;
use cinder_core::Result;
use cinder_core::events::Event;
use cinder_core::ports::{EventBus, EventStream};
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{debug, warn};

use crate::health::HealthCheck;
use crate::metrics::BusMetrics;

const DEFAULT_CAPACITY: usize = 1024;

/// Event bus that delivers to subscribers in the same process.
///
/// Subscribers only see events published after they subscribed. A subscriber that falls
/// more than the channel capacity behind skips the events it missed.
#[derive(Clone)]
pub struct BroadcastEventBus {
    sender: broadcast::Sender<Event>,
    metrics: Arc<BusMetrics>,
}

impl Default for BroadcastEventBus {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}

impl BroadcastEventBus {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        let metrics = BusMetrics::new();
        metrics.set_connected(true);
        Self { sender, metrics }
    }

    pub fn metrics(&self) -> &Arc<BusMetrics> {
        &self.metrics
    }

    pub fn health_check(&self) -> HealthCheck {
        HealthCheck::from_metrics(&self.metrics, true)
    }
}

#[async_trait]
impl EventBus for BroadcastEventBus {
    async fn publish(&self, event: Event) -> Result<()> {
        let subject = event.subject();
        // No subscribers is not an error.
        let receivers = self.sender.send(event).unwrap_or(0);
        self.metrics.record_publish(0);
        debug!(subject = %subject, receivers, "Published event");
        Ok(())
    }

    async fn subscribe(&self, pattern: &str) -> Result<EventStream> {
        let receiver = self.sender.subscribe();
        let pattern = pattern.to_string();
        let metrics = self.metrics.clone();

        let stream = futures::stream::unfold(receiver, move |mut receiver| {
            let pattern = pattern.clone();
            let metrics = metrics.clone();
            async move {
                loop {
                    match receiver.recv().await {
                        Ok(event) if subject_matches(&pattern, &event.subject()) => {
                            metrics.record_receive();
                            return Some((Ok(event), receiver));
                        }
                        Ok(_) => continue,
                        Err(broadcast::error::RecvError::Lagged(skipped)) => {
                            warn!(pattern = %pattern, skipped, "Subscriber lagged, events dropped");
                            metrics.record_dropped(skipped);
                        }
                        Err(broadcast::error::RecvError::Closed) => return None,
                    }
                }
            }
        });

        Ok(Box::pin(stream))
    }
}

/// NATS-style subject matching: `*` matches one token, a trailing `>` matches one or
/// more tokens.
pub fn subject_matches(pattern: &str, subject: &str) -> bool {
    let mut subject_tokens = subject.split('.');
    for token in pattern.split('.') {
        match (token, subject_tokens.next()) {
            (">", Some(_)) => return true,
            (_, None) => return false,
            ("*", Some(_)) => {}
            (expected, Some(actual)) if expected == actual => {}
            _ => return false,
        }
    }
    subject_tokens.next().is_none()
}
