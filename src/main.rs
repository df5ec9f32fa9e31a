use anyhow::Result;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

mod cli;

#[derive(Parser)]
#[command(name = "genpool")]
#[command(version, about = "Pooled, rate-limited client for generative-AI completion APIs", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Config file path (environment variables are used when omitted)
    #[arg(long, global = true)]
    config: Option<String>,

    /// Log level (error, warn, info, debug, trace)
    #[arg(long, global = true, default_value = "info")]
    log_level: String,
}

#[derive(Subcommand)]
enum Commands {
    /// Submit a single request
    Submit {
        /// Request body; read from stdin when omitted
        payload: Option<String>,
    },

    /// Submit one request per line of a file
    Batch {
        /// File with one payload per line
        file: PathBuf,
    },

    /// Warm the connection pool and report upstream reachability
    Ping,

    /// Print the effective configuration
    Config,
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    // Initialize logging
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| cli.log_level.clone().into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    // Batches keep many connections busy at once; everything else is a
    // handful of sequential calls.
    let runtime = if matches!(cli.command, Commands::Batch { .. }) {
        tokio::runtime::Builder::new_multi_thread()
            .enable_all()
            .build()?
    } else {
        tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()?
    };

    runtime.block_on(async_main(cli))
}

async fn async_main(cli: Cli) -> Result<()> {
    // Load configuration
    let config = genpool::config::load_config(cli.config.as_deref())?;

    match cli.command {
        Commands::Submit { payload } => {
            cli::commands::cmd_submit(&config, payload).await?;
        }
        Commands::Batch { file } => {
            cli::commands::cmd_batch(&config, &file).await?;
        }
        Commands::Ping => {
            cli::commands::cmd_ping(&config).await?;
        }
        Commands::Config => {
            cli::commands::cmd_config(&config)?;
        }
    }

    Ok(())
}
