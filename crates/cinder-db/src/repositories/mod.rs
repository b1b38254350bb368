//! Store implementations for PostgreSQL.

mod agent;
mod graph;
mod job;

pub use agent::PgDirectory;
pub use graph::PgGraphStore;
pub use job::PgJobStore;
