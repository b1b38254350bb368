//! PostgreSQL implementation of GraphStore.

use async_trait::async_trait;
use cinder_core::graph::{Graph, GraphDefinition};
use cinder_core::ids::ContentHash;
use cinder_core::ports::GraphStore;
use cinder_core::{Error, Result};
use sqlx::{PgPool, Row};
use std::sync::Arc;

pub struct PgGraphStore {
    pool: PgPool,
}

impl PgGraphStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl GraphStore for PgGraphStore {
    async fn get(&self, hash: &ContentHash) -> Result<Option<Arc<Graph>>> {
        let row = sqlx::query("SELECT graph FROM graphs WHERE hash = $1")
            .bind(hash.as_str())
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| Error::Database(e.to_string()))?;

        match row {
            Some(r) => {
                let graph: Graph = serde_json::from_value(r.get("graph"))?;
                Ok(Some(Arc::new(graph)))
            }
            None => Ok(None),
        }
    }

    async fn add(&self, definition: &GraphDefinition) -> Result<Arc<Graph>> {
        let graph = definition.build()?;
        let definition_json = serde_json::to_value(definition)?;
        let graph_json = serde_json::to_value(&graph)?;

        sqlx::query(
            "INSERT INTO graphs (hash, definition, graph) VALUES ($1, $2, $3) ON CONFLICT (hash) DO NOTHING",
        )
        .bind(graph.hash.as_str())
        .bind(&definition_json)
        .bind(&graph_json)
        .execute(&self.pool)
        .await
        .map_err(|e| Error::Database(e.to_string()))?;

        Ok(Arc::new(graph))
    }
}
