//! Port traits (hexagonal architecture).
//!
//! These traits define the interfaces between the core domain and external adapters.

use crate::Result;
use crate::agent::{Agent, Pool, StreamConfig};
use crate::events::Event;
use crate::graph::{Graph, GraphDefinition};
use crate::ids::*;
use crate::job::Job;
use async_trait::async_trait;
use futures::Stream;
use std::pin::Pin;
use std::sync::Arc;

/// Stream of events.
pub type EventStream = Pin<Box<dyn Stream<Item = Result<Event>> + Send>>;

/// Event bus for publishing and subscribing to events.
#[async_trait]
pub trait EventBus: Send + Sync {
    /// Publish an event.
    async fn publish(&self, event: Event) -> Result<()>;

    /// Subscribe to events matching a pattern.
    /// Pattern supports wildcards: `job.*.completed`, `job.>`
    async fn subscribe(&self, pattern: &str) -> Result<EventStream>;
}

/// Durable storage for job records, versioned by `Job::update_index`.
#[async_trait]
pub trait JobStore: Send + Sync {
    /// Insert a new job. The stored copy is returned with its initial update index.
    async fn add(&self, job: &Job) -> Result<Job>;

    /// Get a job by ID.
    async fn get(&self, id: JobId) -> Result<Option<Job>>;

    /// Replace a job if its stored update index still equals `expected_update_index`.
    ///
    /// Returns the committed record (with an advanced update index), or `None` when
    /// another writer got there first.
    async fn try_update(&self, job: &Job, expected_update_index: u64) -> Result<Option<Job>>;

    /// Jobs with a positive schedule priority.
    async fn find_dispatchable(&self) -> Result<Vec<Job>>;

    /// Jobs with at least one batch that is not complete.
    async fn find_incomplete(&self) -> Result<Vec<Job>>;

    /// Delete a job if its stored update index still equals `expected_update_index`.
    async fn remove(&self, id: JobId, expected_update_index: u64) -> Result<bool>;
}

/// Content-addressed storage for immutable graphs.
#[async_trait]
pub trait GraphStore: Send + Sync {
    /// Get a graph by content hash.
    async fn get(&self, hash: &ContentHash) -> Result<Option<Arc<Graph>>>;

    /// Validate and store a graph definition. Adding the same definition twice is a no-op.
    async fn add(&self, definition: &GraphDefinition) -> Result<Arc<Graph>>;
}

/// Read-only view of the agent fleet.
#[async_trait]
pub trait AgentDirectory: Send + Sync {
    async fn list_pools(&self) -> Result<Vec<Pool>>;

    async fn list_agents(&self) -> Result<Vec<Agent>>;
}

/// Per-stream agent type and workspace configuration.
#[async_trait]
pub trait StreamDirectory: Send + Sync {
    async fn get_stream(&self, id: &StreamId) -> Result<Option<StreamConfig>>;
}
