//! Command-line interface.

use std::path::PathBuf;

use clap::{Parser, Subcommand};

#[derive(Parser)]
#[command(name = "switchyard", about = "Multi-tenant agent gateway", version)]
pub struct Cli {
    /// State directory for the KV and blob stores.
    #[arg(long, default_value = "switchyard-data")]
    pub state_dir: PathBuf,

    /// Bootstrap TOML config; its sections seed the persisted overrides.
    #[arg(long, default_value = "switchyard.toml")]
    pub config: PathBuf,

    /// Listen address for the HTTP/WebSocket surface.
    #[arg(long, default_value = "127.0.0.1:8787")]
    pub listen: String,

    #[command(subcommand)]
    pub command: Option<Command>,
}

#[derive(Subcommand)]
pub enum Command {
    /// Run the gateway (the default).
    Serve,
    /// Inspect or validate configuration.
    Config {
        #[command(subcommand)]
        command: ConfigCommand,
    },
}

#[derive(Subcommand)]
pub enum ConfigCommand {
    /// Print the merged config with secrets masked.
    Show,
    /// Validate the bootstrap TOML and the persisted overrides.
    Validate,
}
