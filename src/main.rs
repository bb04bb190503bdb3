//! # docqa CLI
//!
//! ```bash
//! docqa serve                              # defaults, 127.0.0.1:5000
//! docqa --config ./docqa.toml serve --bind 0.0.0.0:8080
//! docqa --config ./docqa.toml sessions     # list persisted session indexes
//! ```
//!
//! Log verbosity follows `RUST_LOG` (default `info`).

use clap::{Parser, Subcommand};
use std::path::PathBuf;

use docqa::config::{self, Config};
use docqa::server;
use docqa::store::{self, SessionStorage};

/// Question answering over remote PDF documents.
#[derive(Parser)]
#[command(name = "docqa", version)]
struct Cli {
    /// Path to configuration file (TOML). Built-in defaults apply when omitted.
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the HTTP server.
    Serve {
        /// Override `[server].bind`.
        #[arg(long)]
        bind: Option<String>,
    },

    /// List sessions with a persisted index.
    Sessions,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();

    let mut cfg = match &cli.config {
        Some(path) => config::load_config(path)?,
        None => {
            let cfg = Config::default();
            cfg.validate()?;
            cfg
        }
    };

    match cli.command {
        Commands::Serve { bind } => {
            if let Some(bind) = bind {
                cfg.server.bind = bind;
            }
            server::run_server(&cfg).await?;
        }
        Commands::Sessions => {
            let storage = SessionStorage::new(&cfg.storage.root)?;
            let sessions = store::describe_sessions(&storage).await?;
            if sessions.is_empty() {
                println!("No sessions in {}", storage.root().display());
                return Ok(());
            }
            println!(
                "{:<32} {:>9} {:>7}  BUILT AT",
                "SESSION", "DOCUMENTS", "NODES"
            );
            for (session, manifest) in sessions {
                println!(
                    "{:<32} {:>9} {:>7}  {}",
                    session.as_str(),
                    manifest.document_count,
                    manifest.node_count,
                    manifest.built_at.format("%Y-%m-%d %H:%M:%S UTC")
                );
            }
        }
    }

    Ok(())
}
