//! Server configuration.

use cinder_core::agent::{Agent, Pool, StreamConfig};
use cinder_db::DatabaseConfig;
use cinder_nats::NatsConfig;
use cinder_scheduler::SchedulerConfig;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Server configuration, usually read from `cinder.yaml`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ServerConfig {
    /// PostgreSQL connection. Jobs are kept in memory when absent.
    #[serde(default)]
    pub database: Option<DatabaseConfig>,
    /// NATS connection. Events stay inside the process when absent.
    #[serde(default)]
    pub nats: Option<NatsConfig>,
    #[serde(default)]
    pub scheduler: SchedulerConfig,
    #[serde(default)]
    pub log_format: LogFormat,
    /// Graph definition files loaded into the graph store at startup.
    #[serde(default)]
    pub graphs: Vec<PathBuf>,
    #[serde(default)]
    pub directory: DirectoryConfig,
}

/// Pools, agents and streams seeded into the directory at startup.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DirectoryConfig {
    #[serde(default)]
    pub pools: Vec<Pool>,
    #[serde(default)]
    pub agents: Vec<Agent>,
    #[serde(default)]
    pub streams: Vec<StreamConfig>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

impl ServerConfig {
    /// Load configuration from a YAML file.
    pub fn from_file(path: &Path) -> Result<Self, std::io::Error> {
        let contents = std::fs::read_to_string(path)?;
        serde_yaml::from_str(&contents)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))
    }
}
