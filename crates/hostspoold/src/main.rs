//! hostspoold — the hosts pool daemon.
//!
//! Opens the pool store (redb), registers the locations declared in the
//! configuration file, and serves the hosts pool REST API.
//!
//! # Usage
//!
//! ```text
//! hostspoold serve --config /etc/hostspool/hostspool.toml --port 8800
//! hostspoold check-config --config /etc/hostspool/hostspool.toml
//! ```

mod serve;

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use hostspool_core::PoolConfig;

#[derive(Parser)]
#[command(name = "hostspoold", about = "Hosts pool daemon")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Serve the REST API.
    Serve {
        /// Configuration file; defaults apply when omitted.
        #[arg(long)]
        config: Option<PathBuf>,

        /// Port to listen on, overriding the configuration.
        #[arg(long)]
        port: Option<u16>,

        /// Data directory for the pool store, overriding the configured path.
        #[arg(long)]
        data_dir: Option<PathBuf>,
    },
    /// Parse a configuration file and print it with defaults filled in.
    CheckConfig {
        #[arg(long)]
        config: PathBuf,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("info,hostspoold=debug,hostspool=debug")),
        )
        .init();

    let cli = Cli::parse();

    match cli.command {
        Command::Serve {
            config,
            port,
            data_dir,
        } => {
            let mut config = match config {
                Some(path) => PoolConfig::from_file(&path)?,
                None => PoolConfig::default(),
            };
            if let Some(port) = port {
                config.api.port = port;
            }
            if let Some(dir) = data_dir {
                std::fs::create_dir_all(&dir)?;
                config.store.path = dir.join(serve::STORE_FILE);
            }
            serve::run_serve(config).await
        }
        Command::CheckConfig { config } => {
            let config = PoolConfig::from_file(&config)?;
            print!("{}", config.to_toml_string()?);
            Ok(())
        }
    }
}
