//! cqlmock - mock CQL server
//!
//! Starts one or more nodes that answer the CQL native protocol with canned
//! responses.

use clap::Parser;
use cqlmock_server::metrics::run_metrics_server;
use cqlmock_server::{
    tls, AddressGenerator, Cluster, Config, Ipv4AddressGenerator, Metrics, RequestHandlerBuilder,
    ServerConfig,
};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "cqlmock")]
#[command(about = "Mock server for the CQL native protocol")]
#[command(version)]
struct Cli {
    /// YAML configuration file
    #[arg(short, long, env = "CQLMOCK_CONFIG")]
    config: Option<PathBuf>,

    /// Address of the first node
    #[arg(short, long)]
    bind: Option<SocketAddr>,

    /// Number of nodes
    #[arg(short, long)]
    nodes: Option<usize>,

    /// Require PLAIN authentication with this username
    #[arg(long)]
    username: Option<String>,

    /// Password for --username
    #[arg(long, default_value = "")]
    password: String,
}

impl Cli {
    fn load_config(&self) -> Result<Config, Box<dyn std::error::Error>> {
        let mut config = match &self.config {
            Some(path) => {
                tracing::info!("Loading config from {}", path.display());
                Config::from_file(path)?
            }
            None => Config::default(),
        };
        config.apply_env_overrides();

        if let Some(bind) = self.bind {
            config.network.bind_addr = bind;
        }
        if let Some(nodes) = self.nodes {
            config.network.nodes = nodes;
        }
        if let Some(username) = &self.username {
            config.auth.enabled = true;
            config.auth.username = username.clone();
            config.auth.password = self.password.clone();
        }

        config.validate()?;
        Ok(config)
    }
}

/// Hands out the same address every time.
struct FixedAddress(SocketAddr);

impl AddressGenerator for FixedAddress {
    fn next(&mut self) -> SocketAddr {
        self.0
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    let config = match cli.load_config() {
        Ok(config) => config,
        Err(e) => {
            tracing::error!("Invalid configuration: {}", e);
            return Err(e);
        }
    };

    tracing::info!("Starting cqlmock");
    tracing::info!("  First node: {}", config.network.bind_addr);
    tracing::info!("  Nodes: {}", config.network.nodes);
    tracing::info!(
        "  Protocol versions: {}..={}",
        config.protocol.lowest_version,
        config.protocol.highest_version
    );

    let handler = if config.auth.enabled {
        tracing::info!("  Authentication: enabled (user {})", config.auth.username);
        RequestHandlerBuilder::with_auth(&config.auth.username, &config.auth.password).build()
    } else {
        tracing::info!("  Authentication: disabled");
        RequestHandlerBuilder::simple().build()
    };

    let mut server_config = ServerConfig::from_config(&config);
    if config.tls.enabled {
        server_config = server_config.with_tls(tls::create_tls_acceptor(&config.tls)?);
        tracing::info!("  TLS: enabled");
        if config.tls.require_client_cert {
            tracing::info!("  mTLS: enabled (client certificate required)");
        }
    } else {
        tracing::info!("  TLS: disabled");
    }

    let (metrics_shutdown, _) = broadcast::channel(1);
    let metrics_handle = if config.metrics.enabled {
        let metrics = Arc::new(Metrics::new()?);
        server_config = server_config.with_metrics(metrics.clone());
        let addr = config.metrics.bind_addr;
        let shutdown = metrics_shutdown.subscribe();
        Some(tokio::spawn(async move {
            if let Err(e) = run_metrics_server(addr, metrics, shutdown).await {
                tracing::error!("Metrics server failed: {}", e);
            }
        }))
    } else {
        None
    };

    // Validation allows IPv6 only for single-node clusters.
    let mut generator: Box<dyn AddressGenerator> = match config.network.bind_addr {
        SocketAddr::V4(addr) => Box::new(Ipv4AddressGenerator::new(*addr.ip(), addr.port())),
        addr @ SocketAddr::V6(_) => Box::new(FixedAddress(addr)),
    };
    let mut cluster = Cluster::new(
        &server_config,
        handler,
        config.network.nodes,
        generator.as_mut(),
    );

    cluster.start_all().await?;
    for node in 1..=cluster.len() {
        tracing::info!("Node {} listening on {}", node, cluster.address(node)?);
    }

    tokio::signal::ctrl_c().await?;
    tracing::info!("Received shutdown signal, stopping nodes...");

    cluster.stop_all().await;
    let _ = metrics_shutdown.send(());
    if let Some(handle) = metrics_handle {
        let _ = handle.await;
    }

    tracing::info!("Server stopped");
    Ok(())
}
