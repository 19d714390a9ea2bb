//! Tessel file server binary.
//!
//! Usage:
//!   cargo run -p tessel-server
//!   cargo run -p tessel-server -- --bind 0.0.0.0:9090 --root ./shared
//!
//! Log level comes from `RUST_LOG` (defaults to `info`).

use std::path::PathBuf;

use clap::Parser;
use log::info;
use tessel_collab::{ServerConfig, SyncServer};

/// Collaborative line-locking file server.
#[derive(Parser, Debug)]
#[command(name = "tessel-server")]
#[command(about = "Serve a directory of text files for shared editing")]
struct Args {
    /// Address to listen on
    #[arg(short, long, default_value = "127.0.0.1:9090")]
    bind: String,

    /// Directory all file paths are relative to; created if missing
    #[arg(short, long, default_value = "file_root")]
    root: PathBuf,

    /// Broadcast frames buffered per connection before they are dropped
    #[arg(long)]
    outbound_capacity: Option<usize>,

    /// Requests buffered per open file
    #[arg(long)]
    file_queue_capacity: Option<usize>,

    /// Seconds between WebSocket pings
    #[arg(long)]
    heartbeat: Option<u64>,
}

impl Args {
    fn into_config(self) -> ServerConfig {
        let defaults = ServerConfig::default();
        ServerConfig {
            bind_addr: self.bind,
            root_dir: self.root,
            outbound_capacity: self.outbound_capacity.unwrap_or(defaults.outbound_capacity),
            file_queue_capacity: self
                .file_queue_capacity
                .unwrap_or(defaults.file_queue_capacity),
            heartbeat_interval_secs: self.heartbeat.unwrap_or(defaults.heartbeat_interval_secs),
        }
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let config = Args::parse().into_config();
    if !config.root_dir.exists() {
        std::fs::create_dir_all(&config.root_dir)?;
        info!("Created file root {}", config.root_dir.display());
    }

    info!(
        "Starting Tessel server on {} serving {}",
        config.bind_addr,
        config.root_dir.display()
    );
    SyncServer::new(config).run().await
}
