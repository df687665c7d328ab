use clap::{Parser, Subcommand};
use std::path::PathBuf;

#[derive(Debug, Parser)]
#[command(
    name = "stackpanel",
    about = "Supervise the services of a local web development stack",
    version
)]
pub struct Cli {
    /// Path to stackpanel.toml
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    #[arg(long, global = true)]
    pub json: bool,

    #[command(subcommand)]
    pub command: Option<Command>,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Show the status of every service
    #[command(visible_alias = "list")]
    Status,
    /// Start services (all when no id is given)
    Start { ids: Vec<String> },
    /// Stop services (all when no id is given)
    Stop { ids: Vec<String> },
    /// Restart services (all when no id is given)
    Restart { ids: Vec<String> },
    /// Show detailed info about a service
    Detail { id: String },
    /// Check which stack ports are in use
    Ports,
    /// Supervise services and print status changes until interrupted
    Watch,
    /// Write the default configuration file
    Init,
}

impl Command {
    pub fn optional_ids(ids: Vec<String>) -> Option<Vec<String>> {
        if ids.is_empty() { None } else { Some(ids) }
    }
}
