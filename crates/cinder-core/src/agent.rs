//! Agent, pool, stream and lease types.

use crate::ids::{AgentId, BatchId, JobId, LeaseId, LogId, PoolId, SessionId, StreamId};
use chrono::{DateTime, Utc};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct Pool {
    pub id: PoolId,
    pub name: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum AgentStatus {
    Online,
    Offline,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct Agent {
    pub id: AgentId,
    pub name: String,
    pub pools: Vec<PoolId>,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    pub status: AgentStatus,
    /// Current session, present while the agent is connected.
    #[serde(default)]
    pub session_id: Option<SessionId>,
    #[serde(default)]
    pub last_heartbeat_at: Option<DateTime<Utc>>,
}

fn default_enabled() -> bool {
    true
}

impl Agent {
    pub fn is_online(&self) -> bool {
        self.status == AgentStatus::Online && self.session_id.is_some()
    }

    pub fn is_available(&self) -> bool {
        self.enabled && self.is_online()
    }

    pub fn in_pool(&self, pool_id: &PoolId) -> bool {
        self.pools.contains(pool_id)
    }
}

/// Workspace an agent must sync before running a batch.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema)]
pub struct Workspace {
    pub identifier: String,
    #[serde(default)]
    pub incremental: bool,
}

/// How a stream maps a node group's agent type onto a pool.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct AgentTypeConfig {
    pub pool: PoolId,
    /// Key into the stream's workspace table; none for workspace-less agent types.
    #[serde(default)]
    pub workspace: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct StreamConfig {
    pub id: StreamId,
    #[serde(default)]
    pub agent_types: HashMap<String, AgentTypeConfig>,
    #[serde(default)]
    pub workspaces: HashMap<String, Workspace>,
}

/// An agent's claim on one batch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct Lease {
    pub id: LeaseId,
    pub log_id: LogId,
    pub agent_id: AgentId,
    pub session_id: SessionId,
    pub pool_id: PoolId,
    pub job_id: JobId,
    pub batch_id: BatchId,
    #[serde(default)]
    pub workspace: Option<Workspace>,
    pub assigned_at: DateTime<Utc>,
}

/// An idle agent asking for work.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LeaseRequest {
    pub agent_id: AgentId,
    pub session_id: SessionId,
    /// Pools the agent serves.
    pub pools: Vec<PoolId>,
}

/// Final outcome reported when a lease finishes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum LeaseOutcome {
    Success,
    Failure,
    Cancelled,
}
