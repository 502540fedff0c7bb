//! media-dl process entry point.

use clap::{Parser, Subcommand};
use media_dl::{Config, Pipeline, Role, run_with_shutdown};
use std::net::SocketAddr;
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "media-dl")]
#[command(about = "Asynchronous media package downloader", long_about = None)]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Command,

    /// SQLite file shared by every media-dl process
    #[arg(long, global = true, env = "DATABASE_PATH")]
    database: Option<PathBuf>,
}

#[derive(Subcommand)]
enum Command {
    /// Run the HTTP API and the result consumer
    Serve {
        /// Address to bind the API to
        #[arg(long, env = "APP_ADDR")]
        bind: Option<SocketAddr>,
    },
    /// Run the image and video download workers
    Worker {
        /// Concurrent downloads per media kind
        #[arg(long, env = "MAX_CONCURRENCY")]
        concurrency: Option<usize>,
    },
    /// Run everything in one process
    All,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // A missing .env file is fine
    let _ = dotenvy::dotenv();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("media_dl=info,sqlx=warn")),
        )
        .init();

    let cli = Cli::parse();
    let mut config = Config::from_env()?;
    if let Some(database) = cli.database {
        config.persistence.database_path = database;
    }

    let role = match cli.command {
        Command::Serve { bind } => {
            if let Some(bind) = bind {
                config.api.bind_address = bind;
            }
            Role::Serve
        }
        Command::Worker { concurrency } => {
            if let Some(concurrency) = concurrency {
                config.workers.concurrency = concurrency;
            }
            Role::Worker
        }
        Command::All => Role::All,
    };

    let pipeline = Pipeline::start(config, role).await?;
    run_with_shutdown(pipeline).await?;
    Ok(())
}
