//! Command handlers.

use crate::config::{DirectoryConfig, ServerConfig};
use anyhow::Context;
use cinder_core::graph::{Graph, GraphDefinition};
use cinder_core::ports::{AgentDirectory, EventBus, GraphStore, JobStore, StreamDirectory};
use cinder_db::{Database, MemoryDirectory, MemoryGraphStore, MemoryJobStore, PgDirectory, PgGraphStore, PgJobStore};
use cinder_nats::{BroadcastEventBus, HealthCheck, NatsEventBus};
use cinder_scheduler::dag::GraphIndex;
use cinder_scheduler::{DispatchScheduler, JobService};
use std::path::Path;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{info, warn};

/// Read a graph definition and check that it compiles.
pub fn load_graph(path: &Path) -> anyhow::Result<(GraphDefinition, Graph)> {
    let contents = std::fs::read_to_string(path)
        .with_context(|| format!("reading graph definition {}", path.display()))?;
    let definition: GraphDefinition = serde_yaml::from_str(&contents)
        .with_context(|| format!("parsing graph definition {}", path.display()))?;
    let graph = definition
        .build()
        .with_context(|| format!("invalid graph {}", path.display()))?;
    GraphIndex::new(Arc::new(graph.clone()))
        .with_context(|| format!("invalid graph {}", path.display()))?;
    Ok((definition, graph))
}

pub fn validate_graph(path: &Path) -> anyhow::Result<()> {
    let (_, graph) = load_graph(path)?;
    println!("Graph {} is valid", path.display());
    println!("  Hash: {}", graph.hash);
    println!("  Groups: {}", graph.groups.len());
    for group in &graph.groups {
        println!("    - {} ({} nodes)", group.agent_type, group.nodes.len());
    }
    if !graph.labels.is_empty() {
        println!("  Labels: {}", graph.labels.len());
    }
    Ok(())
}

pub fn graph_schema() -> anyhow::Result<()> {
    let schema = schemars::schema_for!(GraphDefinition);
    println!("{}", serde_json::to_string_pretty(&schema)?);
    Ok(())
}

/// Stores and directory behind the scheduler.
struct Backend {
    jobs: Arc<dyn JobStore>,
    graphs: Arc<dyn GraphStore>,
    agents: Arc<dyn AgentDirectory>,
    streams: Arc<dyn StreamDirectory>,
}

async fn connect_backend(config: &ServerConfig) -> anyhow::Result<Backend> {
    let Some(database) = &config.database else {
        info!("No database configured, keeping jobs in memory");
        let DirectoryConfig {
            pools,
            agents,
            streams,
        } = config.directory.clone();
        let directory = Arc::new(MemoryDirectory::new(pools, agents, streams));
        return Ok(Backend {
            jobs: Arc::new(MemoryJobStore::new()),
            graphs: Arc::new(MemoryGraphStore::new()),
            agents: directory.clone(),
            streams: directory,
        });
    };

    let db = Database::connect(database).await?;
    db.migrate().await?;
    let directory = Arc::new(PgDirectory::new(db.pool().clone()));
    for pool in &config.directory.pools {
        directory.upsert_pool(pool).await?;
    }
    for agent in &config.directory.agents {
        directory.upsert_agent(agent).await?;
    }
    for stream in &config.directory.streams {
        directory.upsert_stream(stream).await?;
    }
    Ok(Backend {
        jobs: Arc::new(PgJobStore::new(db.pool().clone())),
        graphs: Arc::new(PgGraphStore::new(db.pool().clone())),
        agents: directory.clone(),
        streams: directory,
    })
}

enum Bus {
    Nats(Arc<NatsEventBus>),
    Local(Arc<BroadcastEventBus>),
}

impl Bus {
    async fn connect(config: &ServerConfig) -> anyhow::Result<Self> {
        match &config.nats {
            Some(nats) => Ok(Bus::Nats(Arc::new(
                NatsEventBus::connect_with_config(nats.clone()).await?,
            ))),
            None => {
                info!("No NATS configured, publishing events in-process");
                Ok(Bus::Local(Arc::new(BroadcastEventBus::default())))
            }
        }
    }

    fn event_bus(&self) -> Arc<dyn EventBus> {
        match self {
            Bus::Nats(bus) => bus.clone(),
            Bus::Local(bus) => bus.clone(),
        }
    }

    fn health_check(&self) -> HealthCheck {
        match self {
            Bus::Nats(bus) => bus.health_check(),
            Bus::Local(bus) => bus.health_check(),
        }
    }

    async fn shutdown(&self) {
        if let Bus::Nats(bus) = self
            && let Err(e) = bus.shutdown().await
        {
            warn!(error = %e, "Event bus shutdown failed");
        }
    }
}

/// Run the scheduler until Ctrl-C.
pub async fn serve(config: ServerConfig) -> anyhow::Result<()> {
    let backend = connect_backend(&config).await?;
    let bus = Bus::connect(&config).await?;

    for path in &config.graphs {
        let (definition, _) = load_graph(path)?;
        let graph = backend.graphs.add(&definition).await?;
        info!(path = %path.display(), hash = %graph.hash, "Graph loaded");
    }

    let jobs = Arc::new(JobService::new(
        backend.jobs,
        backend.graphs,
        bus.event_bus(),
        config.scheduler.clone(),
    ));
    let scheduler = DispatchScheduler::start(jobs, backend.agents, backend.streams).await;

    let (shutdown, receiver) = watch::channel(false);
    let runner = {
        let scheduler = scheduler.clone();
        tokio::spawn(async move { scheduler.run(receiver).await })
    };
    info!("Cinder scheduler running, press Ctrl-C to stop");

    tokio::signal::ctrl_c()
        .await
        .context("waiting for shutdown signal")?;
    info!("Shutdown requested");
    let _ = shutdown.send(true);
    runner.await.context("scheduler task panicked")?;

    let health = bus.health_check();
    info!(
        published = health.events_published,
        publish_failures = health.publish_failures,
        dropped = health.events_dropped,
        "Event bus closing"
    );
    bus.shutdown().await;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    const GRAPH: &str = r#"
groups:
  - agent_type: CompileWin64
    nodes:
      - name: Compile
      - name: Test
        input_dependencies: [Compile]
labels:
  - name: Editor
    required_nodes: [Test]
"#;

    fn write_temp(contents: &str) -> tempfile::NamedTempFile {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(contents.as_bytes()).unwrap();
        file
    }

    #[test]
    fn test_load_graph() {
        let file = write_temp(GRAPH);
        let (definition, graph) = load_graph(file.path()).unwrap();
        assert_eq!(graph.hash, definition.hash().unwrap());
        assert_eq!(graph.groups[0].nodes.len(), 2);
        assert!(validate_graph(file.path()).is_ok());
    }

    #[test]
    fn test_load_graph_rejects_unknown_dependency() {
        let file = write_temp(
            r#"
groups:
  - agent_type: CompileWin64
    nodes:
      - name: Test
        input_dependencies: [Compile]
"#,
        );
        let err = load_graph(file.path()).unwrap_err();
        assert!(err.to_string().starts_with("invalid graph"));
    }

    #[test]
    fn test_graph_schema_prints() {
        assert!(graph_schema().is_ok());
    }

    #[tokio::test]
    async fn test_memory_backend_is_seeded() {
        let config: ServerConfig = serde_yaml::from_str(
            r#"
directory:
  pools:
    - id: win
      name: Windows
  streams:
    - id: //Main
"#,
        )
        .unwrap();
        let backend = connect_backend(&config).await.unwrap();
        assert_eq!(backend.agents.list_pools().await.unwrap().len(), 1);
        assert!(
            backend
                .streams
                .get_stream(&cinder_core::ids::StreamId::new("//Main"))
                .await
                .unwrap()
                .is_some()
        );

        let bus = Bus::connect(&config).await.unwrap();
        assert!(bus.health_check().status.is_healthy());
    }
}
