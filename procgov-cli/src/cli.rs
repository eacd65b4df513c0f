//! CLI argument definitions

use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};

#[derive(Parser)]
#[command(name = "procgov")]
#[command(about = "Process resource governor: apply CPU, memory, disk and priority limits to groups of processes", long_about = None)]
#[command(version)]
pub struct Cli {
    /// Enable verbose logging
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Log as JSON lines
    #[arg(long, global = true)]
    pub json_logs: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Govern processes until interrupted
    Run(RunArgs),

    /// Show which processes the configuration would govern
    Check(CheckArgs),

    /// Show version information
    Version,
}

#[derive(Args)]
pub struct RunArgs {
    /// Configuration file
    #[arg(short, long, default_value = "procgov.json")]
    pub config: PathBuf,

    /// cgroup v2 mount point, overriding the configuration file
    #[arg(long)]
    pub cgroup_root: Option<PathBuf>,
}

#[derive(Args)]
pub struct CheckArgs {
    /// Configuration file
    #[arg(short, long, default_value = "procgov.json")]
    pub config: PathBuf,
}
