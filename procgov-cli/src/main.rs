//! Procgov CLI
//!
//! Runs the process resource governor against the local machine.

use std::process;

use clap::Parser;
use tracing_subscriber::EnvFilter;

mod check;
mod cli;
mod config;
mod run;

use cli::{Cli, Commands};

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    init_logging(cli.verbose, cli.json_logs);

    let result = match cli.command {
        Commands::Run(args) => run::execute(args).await,
        Commands::Check(args) => check::execute(&args).await,
        Commands::Version => {
            print_version();
            Ok(())
        }
    };

    if let Err(e) = result {
        eprintln!("Error: {e:#}");
        process::exit(1);
    }
}

/// `RUST_LOG` wins; otherwise `info`, or `debug` with `--verbose`
fn init_logging(verbose: bool, json: bool) {
    let default_level = if verbose { "debug" } else { "info" };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr);

    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}

fn print_version() {
    println!("procgov {}", env!("CARGO_PKG_VERSION"));
    println!();
    println!("Limits:");
    println!("  - CPU weight, hard cap and core affinity (cgroup v2)");
    println!("  - Memory cap with trim or terminate on overuse");
    println!("  - Disk rate by suspension");
    println!("  - Scheduling priority");
}
