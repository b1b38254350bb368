//! Pool resolution and dispatchability checks.
//!
//! Agents pull work themselves, so the directory is only consulted to decide whether a
//! batch can ever be picked up, never to choose a particular agent.

use cinder_core::agent::{Agent, Pool, StreamConfig, Workspace};
use cinder_core::ids::PoolId;
use cinder_core::job::BatchErrorCode;

/// Where a node group's batches run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PoolAssignment {
    pub pool_id: PoolId,
    pub workspace: Option<Workspace>,
}

/// Map a node group's agent type onto a pool and workspace using the stream configuration.
pub fn resolve_pool(
    stream: Option<&StreamConfig>,
    agent_type: &str,
) -> Result<PoolAssignment, BatchErrorCode> {
    let stream = stream.ok_or(BatchErrorCode::UnknownStream)?;
    let config = stream
        .agent_types
        .get(agent_type)
        .ok_or(BatchErrorCode::UnknownAgentType)?;
    let workspace = match &config.workspace {
        Some(key) => Some(
            stream
                .workspaces
                .get(key)
                .cloned()
                .ok_or(BatchErrorCode::UnknownWorkspace)?,
        ),
        None => None,
    };
    Ok(PoolAssignment {
        pool_id: config.pool.clone(),
        workspace,
    })
}

/// Result of checking a pool against the live agent fleet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PoolHealth {
    /// At least one enabled agent is online.
    Available,
    /// Enabled agents exist but none is online right now.
    NoAgentsOnline,
    /// The batch can never be dispatched.
    Unschedulable(BatchErrorCode),
}

pub fn check_pool(pool_id: &PoolId, pools: &[Pool], agents: &[Agent]) -> PoolHealth {
    if !pools.iter().any(|p| &p.id == pool_id) {
        return PoolHealth::Unschedulable(BatchErrorCode::UnknownPool);
    }
    let mut members = agents.iter().filter(|a| a.enabled && a.in_pool(pool_id)).peekable();
    if members.peek().is_none() {
        return PoolHealth::Unschedulable(BatchErrorCode::NoAgentsInPool);
    }
    if members.any(Agent::is_online) {
        PoolHealth::Available
    } else {
        PoolHealth::NoAgentsOnline
    }
}
