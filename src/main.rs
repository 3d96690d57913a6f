//! sandbox-gateway - HTTP front for remote code sandboxes.
//!
//! Usage:
//!   sandbox-gateway serve [--port 8000] [--backend mock|isolate]

use std::process::exit;

use clap::{Parser, Subcommand};
use sandbox_gateway::config::{GatewayConfig, ServeArgs};
use sandbox_gateway::http_server;
use sandbox_gateway::sdk;
use sandbox_gateway::state::AppState;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "sandbox-gateway")]
#[command(about = "HTTP gateway for remote code sandboxes")]
struct Args {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Start the HTTP server
    Serve(ServeArgs),
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();

    match args.command {
        Commands::Serve(serve) => {
            let config = GatewayConfig::from_args(serve);
            info!(
                port = config.port,
                host_url = %config.host_url,
                backend = ?config.backend,
                scratch_root = %config.scratch_root.display(),
                "Configuration loaded"
            );

            let backend = match sdk::build_backend(&config) {
                Ok(backend) => backend,
                Err(e) => {
                    error!(error = %e, "failed to initialise sandbox backend");
                    exit(1);
                }
            };

            let state = AppState::new(config, backend);
            if let Err(e) = http_server::run_server(state).await {
                error!(error = %e, "server error");
                exit(1);
            }
        }
    }
}
