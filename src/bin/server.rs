use std::path::PathBuf;

use clap::Parser;
use signal_hook::consts::{SIGHUP, SIGINT, SIGQUIT, SIGTERM};
use signal_hook::iterator::Signals;

use fifostore::{EvictOn, Server, ServerConfig, ShutdownMode};

#[derive(Parser)]
#[command(name = "fifostore-server")]
#[command(about = "In-memory file store served over a Unix socket", long_about = None)]
struct Cli {
    /// TOML config file; command-line flags override its values
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Path of the listening socket
    #[arg(short, long)]
    socket: Option<PathBuf>,

    /// Number of worker threads
    #[arg(short, long)]
    workers: Option<usize>,

    /// Maximum number of stored files
    #[arg(long)]
    max_files: Option<usize>,

    /// Maximum total size of stored files, in bytes
    #[arg(long)]
    max_bytes: Option<usize>,

    /// Which limit evicts: file_count, byte_size or both
    #[arg(long)]
    evict_on: Option<EvictOn>,
}

impl Cli {
    fn into_config(self) -> fifostore::Result<ServerConfig> {
        let mut config = match &self.config {
            Some(path) => ServerConfig::from_file(path)?,
            None => ServerConfig::default(),
        };

        if let Some(socket) = self.socket {
            config = config.socket_path(socket);
        }
        if let Some(workers) = self.workers {
            config = config.workers(workers);
        }
        if let Some(max_files) = self.max_files {
            config.storage = config.storage.max_files(max_files);
        }
        if let Some(max_bytes) = self.max_bytes {
            config.storage = config.storage.max_bytes(max_bytes);
        }
        if let Some(evict_on) = self.evict_on {
            config.storage = config.storage.evict_on(evict_on);
        }
        Ok(config)
    }
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let config = Cli::parse().into_config()?;
    let handle = Server::bind(config)?.spawn()?;

    let mut signals = Signals::new([SIGINT, SIGQUIT, SIGTERM, SIGHUP])?;
    if let Some(signal) = signals.forever().next() {
        let mode = if signal == SIGHUP {
            ShutdownMode::Graceful
        } else {
            ShutdownMode::Immediate
        };
        tracing::info!(signal, ?mode, "Received signal");
        handle.shutdown(mode)?;
    }

    // A later signal upgrades a graceful shutdown to an immediate one.
    let shutdown = handle.shutdown_hook();
    std::thread::spawn(move || {
        for signal in signals.forever() {
            tracing::info!(signal, "Received signal during shutdown");
            if let Err(e) = shutdown.request(ShutdownMode::Immediate) {
                tracing::error!(error = %e, "Failed to request shutdown");
            }
        }
    });

    handle.join()?;
    Ok(())
}
