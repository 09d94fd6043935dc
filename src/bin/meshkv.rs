//! meshkv binary: an N-peer cluster on an in-process mesh, one JSON gateway
//! per peer

use clap::{Parser, Subcommand};
use futures_util::future::{select_all, try_join_all};
use meshkv::cluster::{create_router, GatewayState};
use meshkv::common::BackendKind;
use meshkv::{Config, LocalMesh, Node};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser)]
#[command(name = "meshkv")]
#[command(about = "Raft-replicated etcd-style KV store over a gossip mesh")]
#[command(version = meshkv::VERSION)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start a local cluster
    Serve {
        /// Number of peers to run
        #[arg(long, default_value = "3")]
        peers: usize,

        /// Cluster quorum floor (overrides the config file)
        #[arg(long)]
        min_peers: Option<usize>,

        /// Gateway address of the first peer; peer i listens on port + i
        #[arg(long, default_value = "127.0.0.1:2379")]
        bind: SocketAddr,

        /// Raft tick interval, e.g. "100ms" (overrides the config file)
        #[arg(long, value_parser = duration_arg)]
        tick: Option<Duration>,

        /// Client request deadline, e.g. "5s" (overrides the config file)
        #[arg(long, value_parser = duration_arg)]
        request_timeout: Option<Duration>,

        /// Store backend (overrides the config file)
        #[arg(long, value_enum)]
        backend: Option<Backend>,

        /// TOML configuration file
        #[arg(long)]
        config: Option<PathBuf>,
    },
}

#[derive(Clone, Copy, clap::ValueEnum)]
enum Backend {
    Memory,
    Rocksdb,
}

impl From<Backend> for BackendKind {
    fn from(b: Backend) -> Self {
        match b {
            Backend::Memory => BackendKind::Memory,
            Backend::Rocksdb => BackendKind::Rocksdb,
        }
    }
}

fn duration_arg(s: &str) -> Result<Duration, String> {
    meshkv::common::parse_duration(s).map_err(|e| e.to_string())
}

fn init_tracing(default_level: &str) {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| default_level.into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Serve {
            peers,
            min_peers,
            bind,
            tick,
            request_timeout,
            backend,
            config,
        } => {
            // Config file and environment first, CLI flags on top
            let mut config = Config::load(config.as_deref())?;
            init_tracing(&config.log_level);
            if let Some(min) = min_peers {
                config.min_peer_count = min;
            }
            if let Some(tick) = tick {
                config.tick_interval_ms = tick.as_millis() as u64;
            }
            if let Some(timeout) = request_timeout {
                config.request_timeout_ms = timeout.as_millis() as u64;
            }
            if let Some(backend) = backend {
                config.backend = backend.into();
            }
            config.validate()?;
            anyhow::ensure!(
                peers >= config.min_peer_count,
                "--peers ({}) must be at least the minimum peer count ({})",
                peers,
                config.min_peer_count
            );
            serve(config, peers, bind).await?;
        }
    }

    Ok(())
}

/// Gateway address of every peer: consecutive ports from `bind`
fn gateway_addrs(bind: SocketAddr, peers: usize) -> anyhow::Result<Vec<SocketAddr>> {
    (0..peers)
        .map(|i| {
            u16::try_from(i)
                .ok()
                .and_then(|i| bind.port().checked_add(i))
                .map(|port| SocketAddr::new(bind.ip(), port))
                .ok_or_else(|| anyhow::anyhow!("gateway port for peer-{} overflows {}", i, bind))
        })
        .collect()
}

async fn serve(config: Config, peers: usize, bind: SocketAddr) -> anyhow::Result<()> {
    let addrs = gateway_addrs(bind, peers)?;
    let mesh = LocalMesh::new();

    // Exactly the minimum joins first so those peers found the cluster
    // together; the rest join it one at a time.
    let founders: Vec<_> = (0..config.min_peer_count)
        .map(|i| Arc::new(mesh.join(format!("peer-{}", i))))
        .collect();
    let mut nodes = try_join_all(founders.into_iter().map(|peer| Node::start(peer, config.clone()))).await?;
    for i in config.min_peer_count..peers {
        let peer = Arc::new(mesh.join(format!("peer-{}", i)));
        nodes.push(Node::start(peer, config.clone()).await?);
    }

    let body_limit = config.max_request_bytes * 2;
    for (i, (node, addr)) in nodes.iter().zip(addrs).enumerate() {
        let router = create_router(
            GatewayState {
                kv: node.kv(),
                status: node.subscribe(),
            },
            body_limit,
        );
        let listener = tokio::net::TcpListener::bind(addr).await?;
        tracing::info!("peer-{} ({:x}) gateway on http://{}", i, node.uid(), addr);
        tokio::spawn(async move {
            if let Err(e) = axum::serve(listener, router).await {
                tracing::error!("gateway {}: {}", addr, e);
            }
        });
    }

    tracing::info!("✓ meshkv ready ({} peers, min {})", nodes.len(), config.min_peer_count);

    let failed = tokio::select! {
        _ = tokio::signal::ctrl_c() => None,
        (err, idx, _) = select_all(nodes.iter_mut().map(|node| Box::pin(node.wait()))) => Some((idx, err)),
    };

    if let Some((idx, err)) = &failed {
        tracing::error!("peer-{} terminated: {}", idx, err);
    } else {
        tracing::info!("shutting down");
    }
    for node in nodes {
        node.terminate().await;
    }

    match failed {
        Some((_, err)) => Err(err.into()),
        None => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_gateway_ports_are_consecutive() {
        let addrs = gateway_addrs("127.0.0.1:2379".parse().unwrap(), 3).unwrap();
        let ports: Vec<u16> = addrs.iter().map(|a| a.port()).collect();
        assert_eq!(ports, vec![2379, 2380, 2381]);
    }

    #[test]
    fn test_gateway_port_overflow_rejected() {
        assert!(gateway_addrs("127.0.0.1:65534".parse().unwrap(), 2).is_ok());
        assert!(gateway_addrs("127.0.0.1:65534".parse().unwrap(), 3).is_err());
    }
}
