//! openexec - interactive code-execution engine over isolated containers.
//!
//! Usage:
//!   openexec serve [--port 8080] [--max-concurrency 10]   # Start the HTTP/WebSocket server
//!   openexec languages                                    # List supported languages

mod config;
mod engine;
mod error;
mod http_server;
mod language;
mod sandbox;
mod session;

use std::process::exit;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use tracing::warn;

use crate::config::EngineConfig;
use crate::engine::Engine;
use crate::language::LanguageRegistry;
use crate::sandbox::DockerSandbox;

#[derive(Parser, Debug)]
#[command(name = "openexec")]
#[command(about = "Interactive code-execution engine over isolated containers")]
struct Args {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Start the HTTP/WebSocket server
    Serve {
        /// HTTP port to listen on
        #[arg(long, default_value = "8080")]
        port: u16,

        /// Maximum number of concurrently running sessions
        #[arg(long, default_value = "10")]
        max_concurrency: usize,
    },
    /// List the supported languages
    Languages,
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt::init();

    let args = Args::parse();
    match args.command {
        Commands::Serve {
            port,
            max_concurrency,
        } => {
            let config = EngineConfig {
                port,
                max_concurrency,
                ..EngineConfig::default()
            };
            let registry = LanguageRegistry::builtin();

            let sandbox = match DockerSandbox::connect(&config) {
                Ok(sandbox) => sandbox,
                Err(err) => {
                    eprintln!("Error: cannot reach the container runtime: {err}");
                    exit(1);
                }
            };
            if let Err(err) = sandbox.preload_images(&registry).await {
                warn!(error = %err, "image preload failed; sessions may fail to start");
            }

            let engine = Engine::new(Arc::new(sandbox), registry, config.clone());
            http_server::run_server(config.port, engine).await;
        }
        Commands::Languages => {
            let registry = LanguageRegistry::builtin();
            for spec in registry.all() {
                println!("{:<12} {}", spec.name, spec.image);
            }
        }
    }
}
