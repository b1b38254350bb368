//! In-memory stores.

use async_trait::async_trait;
use cinder_core::agent::{Agent, Pool, StreamConfig};
use cinder_core::graph::{Graph, GraphDefinition};
use cinder_core::ids::{AgentId, ContentHash, JobId, StreamId};
use cinder_core::job::{BatchState, Job};
use cinder_core::ports::{AgentDirectory, GraphStore, JobStore, StreamDirectory};
use cinder_core::{Error, Result};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;

/// Job store keeping every record in a map, versioned like the database store.
#[derive(Default)]
pub struct MemoryJobStore {
    jobs: RwLock<HashMap<JobId, Job>>,
}

impl MemoryJobStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl JobStore for MemoryJobStore {
    async fn add(&self, job: &Job) -> Result<Job> {
        let mut jobs = self.jobs.write().await;
        if jobs.contains_key(&job.id) {
            return Err(Error::Database(format!("job {} already exists", job.id)));
        }
        let mut stored = job.clone();
        stored.update_index = 1;
        jobs.insert(stored.id, stored.clone());
        Ok(stored)
    }

    async fn get(&self, id: JobId) -> Result<Option<Job>> {
        Ok(self.jobs.read().await.get(&id).cloned())
    }

    async fn try_update(&self, job: &Job, expected_update_index: u64) -> Result<Option<Job>> {
        let mut jobs = self.jobs.write().await;
        let Some(current) = jobs.get_mut(&job.id) else {
            return Ok(None);
        };
        if current.update_index != expected_update_index {
            return Ok(None);
        }
        let mut next = job.clone();
        next.update_index = expected_update_index + 1;
        *current = next.clone();
        Ok(Some(next))
    }

    async fn find_dispatchable(&self) -> Result<Vec<Job>> {
        Ok(self
            .jobs
            .read()
            .await
            .values()
            .filter(|job| job.schedule_priority > 0)
            .cloned()
            .collect())
    }

    async fn find_incomplete(&self) -> Result<Vec<Job>> {
        Ok(self
            .jobs
            .read()
            .await
            .values()
            .filter(|job| job.batches.iter().any(|b| b.state != BatchState::Complete))
            .cloned()
            .collect())
    }

    async fn remove(&self, id: JobId, expected_update_index: u64) -> Result<bool> {
        let mut jobs = self.jobs.write().await;
        match jobs.get(&id) {
            Some(job) if job.update_index == expected_update_index => {
                jobs.remove(&id);
                Ok(true)
            }
            _ => Ok(false),
        }
    }
}

/// Content-addressed graph store.
#[derive(Default)]
pub struct MemoryGraphStore {
    graphs: RwLock<HashMap<ContentHash, Arc<Graph>>>,
}

impl MemoryGraphStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl GraphStore for MemoryGraphStore {
    async fn get(&self, hash: &ContentHash) -> Result<Option<Arc<Graph>>> {
        Ok(self.graphs.read().await.get(hash).cloned())
    }

    async fn add(&self, definition: &GraphDefinition) -> Result<Arc<Graph>> {
        let graph = Arc::new(definition.build()?);
        let mut graphs = self.graphs.write().await;
        Ok(graphs
            .entry(graph.hash.clone())
            .or_insert(graph)
            .clone())
    }
}

/// Pools, agents and streams held in memory, seeded from configuration.
#[derive(Default)]
pub struct MemoryDirectory {
    pools: RwLock<Vec<Pool>>,
    agents: RwLock<HashMap<AgentId, Agent>>,
    streams: RwLock<HashMap<StreamId, StreamConfig>>,
}

impl MemoryDirectory {
    pub fn new(pools: Vec<Pool>, agents: Vec<Agent>, streams: Vec<StreamConfig>) -> Self {
        Self {
            pools: RwLock::new(pools),
            agents: RwLock::new(agents.into_iter().map(|a| (a.id, a)).collect()),
            streams: RwLock::new(streams.into_iter().map(|s| (s.id.clone(), s)).collect()),
        }
    }

    /// Insert or replace an agent, e.g. when it connects or its session ends.
    pub async fn upsert_agent(&self, agent: Agent) {
        self.agents.write().await.insert(agent.id, agent);
    }

    pub async fn add_pool(&self, pool: Pool) {
        let mut pools = self.pools.write().await;
        pools.retain(|p| p.id != pool.id);
        pools.push(pool);
    }

    pub async fn upsert_stream(&self, stream: StreamConfig) {
        self.streams.write().await.insert(stream.id.clone(), stream);
    }
}

#[async_trait]
impl AgentDirectory for MemoryDirectory {
    async fn list_pools(&self) -> Result<Vec<Pool>> {
        Ok(self.pools.read().await.clone())
    }

    async fn list_agents(&self) -> Result<Vec<Agent>> {
        Ok(self.agents.read().await.values().cloned().collect())
    }
}

#[async_trait]
impl StreamDirectory for MemoryDirectory {
    async fn get_stream(&self, id: &StreamId) -> Result<Option<StreamConfig>> {
        Ok(self.streams.read().await.get(id).cloned())
    }
}
