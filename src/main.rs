//! vmdeck CLI entry point.

use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;
use vmdeck::config::VmdeckConfig;

mod cli;

/// vmdeck - VM, snapshot and storage orchestration backend
#[derive(Parser, Debug)]
#[command(name = "vmdeck")]
#[command(about = "VM, snapshot and storage orchestration backend")]
#[command(version)]
struct Cli {
    /// Emit logs as JSON lines.
    #[arg(long, global = true)]
    log_json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Start the HTTP API server.
    Serve(cli::serve::ServeCmd),

    /// List VMs and pools from the local database.
    #[command(alias = "ls")]
    List {
        #[command(flatten)]
        cmd: cli::list::ListCmd,

        /// Config file (defaults to the user config directory).
        #[arg(short, long, value_name = "FILE")]
        config: Option<PathBuf>,
    },

    /// Export the OpenAPI document.
    Openapi(cli::openapi::OpenapiCmd),
}

fn main() {
    let cli = Cli::parse();

    // Initialize logging based on RUST_LOG or default to info
    init_logging(cli.log_json);

    tracing::debug!(version = vmdeck::VERSION, "starting vmdeck");

    // Execute command
    let result = match cli.command {
        Commands::Serve(cmd) => cmd.run(),
        Commands::List { cmd, config } => load_config(config).and_then(|c| cmd.run(&c)),
        Commands::Openapi(cmd) => cmd.run(),
    };

    // Handle errors
    if let Err(e) = result {
        tracing::error!(error = %e, "command failed");
        eprintln!("Error: {}", e);
        std::process::exit(1);
    }
}

fn load_config(path: Option<PathBuf>) -> vmdeck::Result<VmdeckConfig> {
    match path {
        Some(path) => VmdeckConfig::load_from(&path),
        None => VmdeckConfig::load(),
    }
}

/// Initialize the tracing subscriber.
fn init_logging(json: bool) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("vmdeck=info"));

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
