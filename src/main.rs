use std::path::PathBuf;

use anyhow::Result;
use clap::{Parser, Subcommand};

use minigram::server::server::{ServerConfig, start_server};

#[derive(Parser)]
#[command(name = "minigram")]
#[command(version, about = "Prompt-to-app generation and productivity back-end")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the HTTP server
    Serve {
        #[arg(short, long, default_value = "8080", env = "PORT")]
        port: u16,
        /// SQLite database path
        #[arg(long, default_value = ".minigram/minigram.db")]
        db: PathBuf,
        /// Bind all interfaces and allow permissive CORS
        #[arg(long)]
        dev: bool,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    match cli.command {
        Commands::Serve { port, db, dev } => {
            start_server(ServerConfig {
                port,
                db_path: db,
                dev_mode: dev,
            })
            .await
        }
    }
}
