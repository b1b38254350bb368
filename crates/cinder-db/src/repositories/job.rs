//! PostgreSQL implementation of JobStore.
//!
//! Each job is one JSONB document. `update_index`, `schedule_priority` and `complete`
//! are mirrored into columns so the compare-and-swap and the scheduler's scans stay in
//! SQL.

use async_trait::async_trait;
use cinder_core::ids::JobId;
use cinder_core::job::{BatchState, Job};
use cinder_core::ports::JobStore;
use cinder_core::{Error, Result};
use sqlx::{PgPool, Row};

pub struct PgJobStore {
    pool: PgPool,
}

impl PgJobStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    fn is_complete(job: &Job) -> bool {
        job.batches.iter().all(|b| b.state == BatchState::Complete)
    }

    fn row_to_job(r: &sqlx::postgres::PgRow) -> Result<Job> {
        let document: serde_json::Value = r.get("document");
        Ok(serde_json::from_value(document)?)
    }

    async fn fetch_where(&self, condition: &str) -> Result<Vec<Job>> {
        let rows = sqlx::query(&format!("SELECT document FROM jobs WHERE {condition}"))
            .fetch_all(&self.pool)
            .await
            .map_err(|e| Error::Database(e.to_string()))?;

        rows.iter().map(Self::row_to_job).collect()
    }
}

#[async_trait]
impl JobStore for PgJobStore {
    async fn add(&self, job: &Job) -> Result<Job> {
        let mut stored = job.clone();
        stored.update_index = 1;
        let document = serde_json::to_value(&stored)?;

        sqlx::query(
            r#"INSERT INTO jobs (id, stream_id, update_index, schedule_priority, complete, document, created_at)
               VALUES ($1, $2, $3, $4, $5, $6, $7)"#,
        )
        .bind(stored.id.as_uuid())
        .bind(stored.stream_id.as_str())
        .bind(stored.update_index as i64)
        .bind(stored.schedule_priority)
        .bind(Self::is_complete(&stored))
        .bind(&document)
        .bind(stored.created_at)
        .execute(&self.pool)
        .await
        .map_err(|e| Error::Database(e.to_string()))?;

        Ok(stored)
    }

    async fn get(&self, id: JobId) -> Result<Option<Job>> {
        let row = sqlx::query("SELECT document FROM jobs WHERE id = $1")
            .bind(id.as_uuid())
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| Error::Database(e.to_string()))?;

        row.as_ref().map(Self::row_to_job).transpose()
    }

    async fn try_update(&self, job: &Job, expected_update_index: u64) -> Result<Option<Job>> {
        let mut next = job.clone();
        next.update_index = expected_update_index + 1;
        let document = serde_json::to_value(&next)?;

        let result = sqlx::query(
            r#"UPDATE jobs
               SET update_index = $3, schedule_priority = $4, complete = $5, document = $6, updated_at = NOW()
               WHERE id = $1 AND update_index = $2"#,
        )
        .bind(next.id.as_uuid())
        .bind(expected_update_index as i64)
        .bind(next.update_index as i64)
        .bind(next.schedule_priority)
        .bind(Self::is_complete(&next))
        .bind(&document)
        .execute(&self.pool)
        .await
        .map_err(|e| Error::Database(e.to_string()))?;

        if result.rows_affected() == 0 {
            return Ok(None);
        }
        Ok(Some(next))
    }

    async fn find_dispatchable(&self) -> Result<Vec<Job>> {
        self.fetch_where("schedule_priority > 0").await
    }

    async fn find_incomplete(&self) -> Result<Vec<Job>> {
        self.fetch_where("NOT complete").await
    }

    async fn remove(&self, id: JobId, expected_update_index: u64) -> Result<bool> {
        let result = sqlx::query("DELETE FROM jobs WHERE id = $1 AND update_index = $2")
            .bind(id.as_uuid())
            .bind(expected_update_index as i64)
            .execute(&self.pool)
            .await
            .map_err(|e| Error::Database(e.to_string()))?;

        Ok(result.rows_affected() > 0)
    }
}
