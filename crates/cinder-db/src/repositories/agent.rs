//! PostgreSQL implementation of AgentDirectory and StreamDirectory.

use async_trait::async_trait;
use cinder_core::agent::{Agent, AgentStatus, Pool, StreamConfig};
use cinder_core::ids::{AgentId, PoolId, SessionId, StreamId};
use cinder_core::ports::{AgentDirectory, StreamDirectory};
use cinder_core::{Error, Result};
use sqlx::{PgPool, Row};

pub struct PgDirectory {
    pool: PgPool,
}

impl PgDirectory {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    fn status_to_str(status: &AgentStatus) -> &'static str {
        match status {
            AgentStatus::Online => "online",
            AgentStatus::Offline => "offline",
        }
    }

    fn str_to_status(s: &str) -> AgentStatus {
        match s {
            "online" => AgentStatus::Online,
            _ => AgentStatus::Offline,
        }
    }

    fn row_to_agent(r: &sqlx::postgres::PgRow) -> Result<Agent> {
        let pools: Vec<PoolId> = serde_json::from_value(r.get("pools"))?;
        let status_str: String = r.get("status");
        Ok(Agent {
            id: AgentId::from_uuid(r.get::<uuid::Uuid, _>("id")),
            name: r.get("name"),
            pools,
            enabled: r.get("enabled"),
            status: Self::str_to_status(&status_str),
            session_id: r
                .get::<Option<uuid::Uuid>, _>("session_id")
                .map(SessionId::from_uuid),
            last_heartbeat_at: r.get("last_heartbeat_at"),
        })
    }

    pub async fn upsert_pool(&self, pool: &Pool) -> Result<()> {
        sqlx::query(
            "INSERT INTO pools (id, name) VALUES ($1, $2) ON CONFLICT (id) DO UPDATE SET name = EXCLUDED.name",
        )
        .bind(pool.id.as_str())
        .bind(&pool.name)
        .execute(&self.pool)
        .await
        .map_err(|e| Error::Database(e.to_string()))?;
        Ok(())
    }

    pub async fn upsert_agent(&self, agent: &Agent) -> Result<()> {
        let pools_json = serde_json::to_value(&agent.pools)?;
        sqlx::query("INSERT INTO agents (id, name, pools, enabled, status, session_id, last_heartbeat_at) VALUES ($1, $2, $3, $4, $5, $6, $7) ON CONFLICT (id) DO UPDATE SET name = EXCLUDED.name, pools = EXCLUDED.pools, enabled = EXCLUDED.enabled, status = EXCLUDED.status, session_id = EXCLUDED.session_id, last_heartbeat_at = EXCLUDED.last_heartbeat_at")
            .bind(agent.id.as_uuid())
            .bind(&agent.name)
            .bind(&pools_json)
            .bind(agent.enabled)
            .bind(Self::status_to_str(&agent.status))
            .bind(agent.session_id.map(|id| *id.as_uuid()))
            .bind(agent.last_heartbeat_at)
            .execute(&self.pool)
            .await
            .map_err(|e| Error::Database(e.to_string()))?;
        Ok(())
    }

    pub async fn upsert_stream(&self, stream: &StreamConfig) -> Result<()> {
        let config = serde_json::to_value(stream)?;
        sqlx::query(
            "INSERT INTO streams (id, config) VALUES ($1, $2) ON CONFLICT (id) DO UPDATE SET config = EXCLUDED.config",
        )
        .bind(stream.id.as_str())
        .bind(&config)
        .execute(&self.pool)
        .await
        .map_err(|e| Error::Database(e.to_string()))?;
        Ok(())
    }
}

#[async_trait]
impl AgentDirectory for PgDirectory {
    async fn list_pools(&self) -> Result<Vec<Pool>> {
        let rows = sqlx::query("SELECT id, name FROM pools ORDER BY id")
            .fetch_all(&self.pool)
            .await
            .map_err(|e| Error::Database(e.to_string()))?;
        Ok(rows
            .iter()
            .map(|r| Pool {
                id: PoolId::new(r.get::<String, _>("id")),
                name: r.get("name"),
            })
            .collect())
    }

    async fn list_agents(&self) -> Result<Vec<Agent>> {
        let rows = sqlx::query(
            "SELECT id, name, pools, enabled, status, session_id, last_heartbeat_at FROM agents",
        )
        .fetch_all(&self.pool)
        .await
        .map_err(|e| Error::Database(e.to_string()))?;
        rows.iter().map(Self::row_to_agent).collect()
    }
}

#[async_trait]
impl StreamDirectory for PgDirectory {
    async fn get_stream(&self, id: &StreamId) -> Result<Option<StreamConfig>> {
        let row = sqlx::query("SELECT config FROM streams WHERE id = $1")
            .bind(id.as_str())
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| Error::Database(e.to_string()))?;
        match row {
            Some(r) => Ok(Some(serde_json::from_value(r.get("config"))?)),
            None => Ok(None),
        }
    }
}
