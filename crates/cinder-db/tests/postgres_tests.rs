//! PostgreSQL store tests.
//!
//! Run with `DATABASE_URL` pointing at a scratch database:
//! `cargo test -p cinder-db -- --ignored`

use chrono::Utc;
use cinder_core::agent::{Agent, AgentStatus, Pool, StreamConfig};
use cinder_core::graph::{GraphDefinition, GroupDefinition, NodeDefinition, Priority};
use cinder_core::ids::{AgentId, BatchId, ContentHash, JobId, PoolId, SessionId, StreamId, TemplateId};
use cinder_core::job::{Batch, Job, JobOptions};
use cinder_core::ports::{AgentDirectory, GraphStore, JobStore, StreamDirectory};
use cinder_db::{Database, DatabaseConfig, PgDirectory, PgGraphStore, PgJobStore};
use std::collections::HashMap;

async fn database() -> Database {
    let url = std::env::var("DATABASE_URL").expect("DATABASE_URL must be set");
    let db = Database::connect(&DatabaseConfig::new(url)).await.unwrap();
    db.migrate().await.unwrap();
    db
}

fn job() -> Job {
    Job {
        id: JobId::new(),
        stream_id: StreamId::new("//Main"),
        template_id: TemplateId::new("ci"),
        graph_hash: ContentHash::compute(b"graph"),
        change: 1,
        priority: Priority::Normal,
        arguments: vec!["-Target=Compile".to_string()],
        options: JobOptions::default(),
        batches: vec![Batch::new(BatchId::new(1), 0)],
        abort_by: None,
        update_index: 0,
        schedule_priority: 21,
        next_sub_resource_id: 2,
        created_at: Utc::now(),
        updated_at: None,
    }
}

#[tokio::test]
#[ignore] // Requires PostgreSQL
async fn test_job_store_compare_and_swap() {
    let db = database().await;
    let store = PgJobStore::new(db.pool().clone());

    let stored = store.add(&job()).await.unwrap();
    assert_eq!(stored.update_index, 1);
    assert!(store
        .find_dispatchable()
        .await
        .unwrap()
        .iter()
        .any(|j| j.id == stored.id));

    let mut next = stored.clone();
    next.schedule_priority = 0;
    let committed = store.try_update(&next, 1).await.unwrap().unwrap();
    assert_eq!(committed.update_index, 2);
    assert!(store.try_update(&next, 1).await.unwrap().is_none());

    let loaded = store.get(stored.id).await.unwrap().unwrap();
    assert_eq!(loaded, committed);

    assert!(!store.remove(stored.id, 1).await.unwrap());
    assert!(store.remove(stored.id, 2).await.unwrap());
}

#[tokio::test]
#[ignore] // Requires PostgreSQL
async fn test_graph_store_roundtrip() {
    let db = database().await;
    let store = PgGraphStore::new(db.pool().clone());
    let definition = GraphDefinition {
        groups: vec![GroupDefinition {
            agent_type: "win".to_string(),
            nodes: vec![NodeDefinition {
                name: "Compile".to_string(),
                input_dependencies: vec![],
                order_dependencies: vec![],
                priority: Priority::High,
                allow_retry: false,
                run_early: false,
            }],
        }],
        aggregates: vec![],
        labels: vec![],
    };

    let graph = store.add(&definition).await.unwrap();
    store.add(&definition).await.unwrap();
    let loaded = store.get(&graph.hash).await.unwrap().unwrap();
    assert_eq!(*loaded, *graph);
}

#[tokio::test]
#[ignore] // Requires PostgreSQL
async fn test_directory() {
    let db = database().await;
    let directory = PgDirectory::new(db.pool().clone());
    let pool = Pool {
        id: PoolId::new("win-test"),
        name: "Windows".to_string(),
    };
    let agent = Agent {
        id: AgentId::new(),
        name: "win-01".to_string(),
        pools: vec![pool.id.clone()],
        enabled: true,
        status: AgentStatus::Online,
        session_id: Some(SessionId::new()),
        last_heartbeat_at: Some(Utc::now()),
    };
    let stream = StreamConfig {
        id: StreamId::new("//Test"),
        agent_types: HashMap::new(),
        workspaces: HashMap::new(),
    };

    directory.upsert_pool(&pool).await.unwrap();
    directory.upsert_agent(&agent).await.unwrap();
    directory.upsert_stream(&stream).await.unwrap();

    assert!(directory.list_pools().await.unwrap().contains(&pool));
    let agents = directory.list_agents().await.unwrap();
    let loaded = agents.iter().find(|a| a.id == agent.id).unwrap();
    assert!(loaded.is_online());
    assert_eq!(
        directory.get_stream(&stream.id).await.unwrap(),
        Some(stream)
    );
}
