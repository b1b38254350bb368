//! Cinder scheduler entrypoint.

use clap::Parser;
use std::path::PathBuf;

mod commands;
mod config;
mod handlers;
mod logging;

use commands::Commands;
use config::{LogFormat, ServerConfig};

#[derive(Parser)]
#[command(name = "cinder")]
#[command(author, version, about = "Cinder build farm scheduler", long_about = None)]
struct Cli {
    /// Path to the server configuration file
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Log output format, overriding the configuration file
    #[arg(long, value_enum, global = true)]
    log_format: Option<LogFormat>,

    #[command(subcommand)]
    command: Commands,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let config = match &cli.config {
        Some(path) => ServerConfig::from_file(path)?,
        None => ServerConfig::default(),
    };
    logging::init_tracing(cli.log_format.unwrap_or(config.log_format));

    match cli.command {
        Commands::Serve => handlers::serve(config).await?,
        Commands::ValidateGraph { path } => handlers::validate_graph(&path)?,
        Commands::GraphSchema => handlers::graph_schema()?,
    }

    Ok(())
}
