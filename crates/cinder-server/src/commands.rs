//! CLI command definitions.

use clap::Subcommand;
use std::path::PathBuf;

#[derive(Subcommand)]
pub enum Commands {
    /// Run the scheduler until interrupted
    Serve,

    /// Check a graph definition and print its content hash
    ValidateGraph {
        /// Path to a YAML or JSON graph definition
        path: PathBuf,
    },

    /// Print the JSON schema of graph definitions
    GraphSchema,
}
