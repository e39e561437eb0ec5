use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::time::{self, Duration};
use tracing::info;
use tracing_subscriber::{EnvFilter, fmt};

use kadmesh::{Config, MemoryStore, Node, SledStore, Store};

#[derive(Parser, Debug)]
#[command(name = "kadmesh")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// TOML configuration file.
    #[arg(short, long, value_name = "FILE")]
    config: Option<PathBuf>,

    #[arg(short, long)]
    listen: Option<SocketAddr>,

    /// Address announced to peers.
    #[arg(short, long)]
    advertise: Option<SocketAddr>,

    /// Seed peer URL (`kad://<hex-id>@ip:port`). Repeatable.
    #[arg(short = 'S', long = "seed", value_name = "URL")]
    seeds: Vec<String>,

    #[arg(short, long, value_name = "DIR")]
    data_dir: Option<PathBuf>,

    /// Keep all state in memory, ignoring any data directory.
    #[arg(long)]
    memory: bool,

    #[arg(short, long, default_value = "300")]
    telemetry_interval: u64,
}

impl Args {
    fn into_config(self) -> Result<(Config, bool, u64)> {
        let mut config = match &self.config {
            Some(path) => Config::load(path)?,
            None => Config::default(),
        };
        if let Some(listen) = self.listen {
            config.listen = listen;
        }
        if self.advertise.is_some() {
            config.advertise = self.advertise;
        }
        config.seeds.extend(self.seeds);
        if self.data_dir.is_some() {
            config.data_dir = self.data_dir;
        }
        Ok((config, self.memory, self.telemetry_interval.max(1)))
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let (config, memory, telemetry_interval) = Args::parse().into_config()?;

    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&config.log_level))
        .unwrap_or_else(|_| EnvFilter::new("info"));

    fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false)
        .with_writer(std::io::stderr)
        .init();

    let store: Arc<dyn Store> = match (&config.data_dir, memory) {
        (Some(dir), false) => Arc::new(
            SledStore::open(dir).with_context(|| format!("failed to open {}", dir.display()))?,
        ),
        _ => Arc::new(MemoryStore::new()),
    };

    let node = Node::bind(config, store.clone()).await?;
    info!("Node URL: {}", node.self_node());

    let mut interval = time::interval(Duration::from_secs(telemetry_interval));

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("Received shutdown signal, exiting gracefully");
                break;
            }
            _ = interval.tick() => {
                let snapshot = node.telemetry().await;
                info!(
                    peers = snapshot.peers,
                    occupied_buckets = snapshot.occupied_buckets,
                    seen_ids = snapshot.seen_ids,
                    "telemetry snapshot"
                );
            }
        }
    }

    store.flush().context("failed to flush store")?;
    Ok(())
}
