//! Integration tests for cinder-nats.
//!
//! These tests require a running NATS server with JetStream enabled.
//! Run with: `cargo test -p cinder-nats --features integration`
//!
//! To start NATS: `docker run -p 4222:4222 nats:latest -js`

#![cfg(feature = "integration")]

use cinder_core::events::{Event, JobCompletedPayload, JobCreatedPayload};
use cinder_core::ids::{JobId, StreamId, TemplateId};
use cinder_core::job::{JobState, StepOutcome};
use cinder_core::ports::EventBus;
use cinder_nats::{NatsConfig, NatsEventBus};
use futures::StreamExt;
use std::time::Duration;

const NATS_URL: &str = "nats://localhost:4222";

fn created(job_id: JobId) -> Event {
    Event::JobCreated(JobCreatedPayload {
        job_id,
        stream_id: StreamId::new("main"),
        template_id: TemplateId::new("ci"),
        change: 7,
        created_at: chrono::Utc::now(),
    })
}

#[tokio::test]
async fn test_publish_records_metrics() {
    let bus = NatsEventBus::connect(NATS_URL).await.expect("connect");

    bus.publish(created(JobId::new())).await.expect("publish");

    let snapshot = bus.metrics().snapshot();
    assert_eq!(snapshot.events_published, 1);
    assert!(snapshot.bytes_published > 0);
}

#[tokio::test]
async fn test_subscribe_receives_new_events() {
    let bus = NatsEventBus::connect(NATS_URL).await.expect("connect");
    let job_id = JobId::new();
    let mut events = bus
        .subscribe(&format!("job.{}.completed", job_id))
        .await
        .expect("subscribe");

    let event = Event::JobCompleted(JobCompletedPayload {
        job_id,
        state: JobState::Complete,
        outcome: StepOutcome::Success,
        completed_at: chrono::Utc::now(),
    });
    bus.publish(event.clone()).await.expect("publish");

    let received = tokio::time::timeout(Duration::from_secs(5), events.next())
        .await
        .expect("event within timeout")
        .expect("stream open")
        .expect("decoded event");
    assert_eq!(received, event);
}

#[tokio::test]
async fn test_stream_info() {
    let bus = NatsEventBus::connect(NATS_URL).await.expect("connect");

    let info = bus.stream_info().await.expect("stream info");
    assert_eq!(info.name, "CINDER_EVENTS");
}

#[tokio::test]
async fn test_connect_with_config() {
    let config = NatsConfig::new(NATS_URL)
        .with_max_reconnects(3)
        .with_max_deliver(5);

    let bus = NatsEventBus::connect_with_config(config)
        .await
        .expect("connect");

    assert!(bus.health_check().status.is_healthy());
    assert_eq!(bus.stream_info().await.expect("info").name, "CINDER_EVENTS");
}

#[tokio::test]
async fn test_graceful_shutdown() {
    let bus = NatsEventBus::connect(NATS_URL).await.expect("connect");

    assert!(!bus.is_shutdown());
    assert!(bus.is_connected());

    bus.shutdown().await.expect("shutdown");

    assert!(bus.is_shutdown());
    assert!(bus.publish(created(JobId::new())).await.is_err());
}
