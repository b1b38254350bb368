//! NATS JetStream event bus.

use async_nats::jetstream::{
    self, consumer::pull::Config as ConsumerConfig, stream::Config as JetStreamConfig,
};
use async_trait::async_trait;
use cinder_core::events::Event;
use cinder_core::ports::{EventBus, EventStream};
use cinder_core::{Error, Result};
use futures::StreamExt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tracing::{debug, error, info};

use crate::config::{NatsConfig, SUBJECTS};
use crate::health::HealthCheck;
use crate::metrics::BusMetrics;

/// Event bus backed by a JetStream stream, so subscribers can come and go.
#[derive(Clone)]
pub struct NatsEventBus {
    client: async_nats::Client,
    jetstream: jetstream::Context,
    config: NatsConfig,
    metrics: Arc<BusMetrics>,
    shutdown: Arc<AtomicBool>,
}

impl NatsEventBus {
    pub async fn connect(url: &str) -> Result<Self> {
        Self::connect_with_config(NatsConfig::new(url)).await
    }

    /// Connect and make sure the event stream exists.
    pub async fn connect_with_config(config: NatsConfig) -> Result<Self> {
        let urls = config.urls.join(",");
        info!(urls = %urls, stream = %config.stream_name, "Connecting to NATS");

        let mut options = async_nats::ConnectOptions::new()
            .connection_timeout(config.connection_timeout())
            .request_timeout(Some(config.request_timeout()))
            .retry_on_initial_connect();
        if let Some(max) = config.max_reconnect_attempts {
            options = options.max_reconnects(max);
        }
        let client = options
            .connect(urls.as_str())
            .await
            .map_err(|e| Error::EventBus(format!("Failed to connect to NATS: {}", e)))?;

        let jetstream = jetstream::new(client.clone());
        let stream_config = JetStreamConfig {
            name: config.stream_name.clone(),
            subjects: SUBJECTS.iter().map(|s| s.to_string()).collect(),
            retention: jetstream::stream::RetentionPolicy::Limits,
            max_age: config.max_age(),
            storage: jetstream::stream::StorageType::File,
            ..Default::default()
        };
        jetstream
            .get_or_create_stream(stream_config)
            .await
            .map_err(|e| Error::EventBus(format!("Failed to create stream: {}", e)))?;

        let metrics = BusMetrics::new();
        metrics.set_connected(true);
        info!("Connected to NATS and initialized JetStream");

        Ok(Self {
            client,
            jetstream,
            config,
            metrics,
            shutdown: Arc::new(AtomicBool::new(false)),
        })
    }

    pub fn metrics(&self) -> &Arc<BusMetrics> {
        &self.metrics
    }

    pub fn is_connected(&self) -> bool {
        self.client.connection_state() == async_nats::connection::State::Connected
    }

    pub fn health_check(&self) -> HealthCheck {
        HealthCheck::from_metrics(&self.metrics, self.is_connected())
    }

    pub fn is_shutdown(&self) -> bool {
        self.shutdown.load(Ordering::SeqCst)
    }

    /// Stop publishing and drain the connection.
    pub async fn shutdown(&self) -> Result<()> {
        info!("Draining NATS connection");
        self.shutdown.store(true, Ordering::SeqCst);

        if let Err(e) = self.client.drain().await {
            error!(error = %e, "Error draining NATS connection");
        }
        self.metrics.set_connected(false);
        Ok(())
    }

    pub async fn stream_info(&self) -> Result<StreamInfo> {
        let mut stream = self
            .jetstream
            .get_stream(&self.config.stream_name)
            .await
            .map_err(|e| Error::EventBus(format!("Failed to get stream: {}", e)))?;

        let info = stream
            .info()
            .await
            .map_err(|e| Error::EventBus(format!("Failed to get stream info: {}", e)))?;

        Ok(StreamInfo {
            name: info.config.name.clone(),
            messages: info.state.messages,
            bytes: info.state.bytes,
            first_seq: info.state.first_sequence,
            last_seq: info.state.last_sequence,
            consumer_count: info.state.consumer_count,
        })
    }

    async fn create_event_stream(
        &self,
        consumer: jetstream::consumer::Consumer<ConsumerConfig>,
    ) -> Result<EventStream> {
        let messages = consumer
            .messages()
            .await
            .map_err(|e| Error::EventBus(format!("Failed to get messages: {}", e)))?;

        let metrics = self.metrics.clone();
        let shutdown = self.shutdown.clone();

        let stream = messages.map(move |msg_result| {
            if shutdown.load(Ordering::SeqCst) {
                return Err(Error::EventBus("Shutdown in progress".to_string()));
            }
            match msg_result {
                Ok(msg) => {
                    metrics.record_receive();
                    // Fire-and-forget ack; redelivery is bounded by max_deliver.
                    drop(msg.ack());
                    serde_json::from_slice::<Event>(&msg.payload)
                        .map_err(|e| Error::Serialization(e.to_string()))
                }
                Err(e) => Err(Error::EventBus(format!("Message error: {}", e))),
            }
        });

        Ok(Box::pin(stream))
    }
}

/// Information about the JetStream stream.
#[derive(Debug, Clone)]
pub struct StreamInfo {
    pub name: String,
    pub messages: u64,
    pub bytes: u64,
    pub first_seq: u64,
    pub last_seq: u64,
    pub consumer_count: usize,
}

#[async_trait]
impl EventBus for NatsEventBus {
    async fn publish(&self, event: Event) -> Result<()> {
        if self.is_shutdown() {
            return Err(Error::EventBus(
                "Cannot publish: shutdown in progress".to_string(),
            ));
        }

        let subject = event.subject();
        let payload = serde_json::to_vec(&event)?;
        let payload_len = payload.len() as u64;
        debug!(subject = %subject, "Publishing event");

        match self
            .jetstream
            .publish(subject.clone(), payload.into())
            .await
        {
            Ok(ack) => {
                ack.await
                    .map_err(|e| Error::EventBus(format!("Failed to confirm publish: {}", e)))?;
                self.metrics.record_publish(payload_len);
                Ok(())
            }
            Err(e) => {
                self.metrics.record_publish_failure();
                Err(Error::EventBus(format!(
                    "Failed to publish to {}: {}",
                    subject, e
                )))
            }
        }
    }

    async fn subscribe(&self, pattern: &str) -> Result<EventStream> {
        debug!(pattern = %pattern, "Subscribing");

        let consumer = self
            .jetstream
            .create_consumer_on_stream(
                ConsumerConfig {
                    filter_subject: pattern.to_string(),
                    deliver_policy: jetstream::consumer::DeliverPolicy::New,
                    max_deliver: self.config.max_deliver,
                    ack_wait: Duration::from_secs(30),
                    ..Default::default()
                },
                &self.config.stream_name,
            )
            .await
            .map_err(|e| Error::EventBus(format!("Failed to create consumer: {}", e)))?;

        self.create_event_stream(consumer).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    #[ignore] // Requires NATS server
    async fn test_connect() {
        let bus = NatsEventBus::connect("nats://localhost:4222").await;
        assert!(bus.is_ok());
    }

    #[tokio::test]
    #[ignore] // Requires NATS server
    async fn test_health_check() {
        let bus = NatsEventBus::connect("nats://localhost:4222")
            .await
            .unwrap();
        let health = bus.health_check();
        assert!(health.status.is_healthy());
        assert!(health.connected);
    }
}
