//! Groups of mock nodes.
//!
//! Every node is a [`Server`] sharing one request handler. Nodes get their
//! addresses from an [`AddressGenerator`] and are numbered from 1.

use crate::error::ServerError;
use crate::handler::RequestHandler;
use crate::server::{Server, ServerConfig};
use cqlmock_protocol::DEFAULT_PORT;
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use std::sync::Arc;
use tokio::task::JoinHandle;

/// Source of node addresses.
pub trait AddressGenerator: Send {
    fn next(&mut self) -> SocketAddr;
}

/// Hands out consecutive IPv4 addresses on one port, starting at the base.
#[derive(Debug, Clone)]
pub struct Ipv4AddressGenerator {
    ip: u32,
    port: u16,
}

impl Ipv4AddressGenerator {
    pub fn new(base: Ipv4Addr, port: u16) -> Self {
        Self {
            ip: u32::from(base),
            port,
        }
    }
}

impl Default for Ipv4AddressGenerator {
    fn default() -> Self {
        Self::new(Ipv4Addr::LOCALHOST, DEFAULT_PORT)
    }
}

impl AddressGenerator for Ipv4AddressGenerator {
    fn next(&mut self) -> SocketAddr {
        let addr = SocketAddrV4::new(Ipv4Addr::from(self.ip), self.port);
        self.ip = self.ip.wrapping_add(1);
        SocketAddr::V4(addr)
    }
}

struct Node {
    server: Arc<Server>,
    task: Option<JoinHandle<Result<(), ServerError>>>,
}

/// A set of mock nodes started and stopped together or one at a time.
pub struct Cluster {
    nodes: Vec<Node>,
}

impl Cluster {
    /// Creates `nodes` stopped nodes. Each node's bind address comes from
    /// `generator`; everything else comes from `config`.
    pub fn new(
        config: &ServerConfig,
        handler: Arc<RequestHandler>,
        nodes: usize,
        generator: &mut dyn AddressGenerator,
    ) -> Self {
        let nodes = (0..nodes)
            .map(|_| {
                let mut config = config.clone();
                config.bind_addr = generator.next();
                Node {
                    server: Arc::new(Server::new(config, handler.clone())),
                    task: None,
                }
            })
            .collect();
        Self { nodes }
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Starts every stopped node. Stops at the first node that fails to bind.
    pub async fn start_all(&mut self) -> Result<(), ServerError> {
        for node in 1..=self.nodes.len() {
            self.start(node).await?;
        }
        Ok(())
    }

    pub async fn stop_all(&mut self) {
        for node in 1..=self.nodes.len() {
            // Node numbers come from the range above.
            let _ = self.stop(node).await;
        }
    }

    /// Starts one node. Starting a running node does nothing.
    pub async fn start(&mut self, node: usize) -> Result<(), ServerError> {
        let entry = self.node_mut(node)?;
        if entry.task.is_some() {
            return Ok(());
        }

        let listener = entry.server.bind().await?;
        tracing::debug!("Starting node {} on {}", node, listener.local_addr()?);
        entry.task = Some(tokio::spawn(entry.server.serve(listener)));
        Ok(())
    }

    /// Stops one node and waits for its accept loop to exit. Stopping a
    /// stopped node does nothing.
    pub async fn stop(&mut self, node: usize) -> Result<(), ServerError> {
        let entry = self.node_mut(node)?;
        let Some(task) = entry.task.take() else {
            return Ok(());
        };

        tracing::debug!("Stopping node {}", node);
        entry.server.shutdown();
        match task.await {
            Ok(result) => result,
            Err(e) => {
                tracing::warn!("Node {} task failed: {}", node, e);
                Ok(())
            }
        }
    }

    pub fn is_running(&self, node: usize) -> Result<bool, ServerError> {
        Ok(self.node(node)?.task.is_some())
    }

    /// Address the node listens on while running, or its configured address.
    pub fn address(&self, node: usize) -> Result<SocketAddr, ServerError> {
        let server = &self.node(node)?.server;
        Ok(server
            .local_addr()
            .unwrap_or(server.config().bind_addr))
    }

    pub fn server(&self, node: usize) -> Result<&Arc<Server>, ServerError> {
        Ok(&self.node(node)?.server)
    }

    fn node(&self, node: usize) -> Result<&Node, ServerError> {
        node.checked_sub(1)
            .and_then(|index| self.nodes.get(index))
            .ok_or(ServerError::InvalidNode(node))
    }

    fn node_mut(&mut self, node: usize) -> Result<&mut Node, ServerError> {
        node.checked_sub(1)
            .and_then(|index| self.nodes.get_mut(index))
            .ok_or(ServerError::InvalidNode(node))
    }
}

impl Drop for Cluster {
    fn drop(&mut self) {
        for node in &mut self.nodes {
            if node.task.take().is_some() {
                node.server.shutdown();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handler::RequestHandlerBuilder;
    use cqlmock_client::{Client, ConnectionConfig};

    fn local_cluster(nodes: usize) -> Cluster {
        let mut generator = Ipv4AddressGenerator::new(Ipv4Addr::LOCALHOST, 0);
        Cluster::new(
            &ServerConfig::default(),
            RequestHandlerBuilder::simple().build(),
            nodes,
            &mut generator,
        )
    }

    #[test]
    fn test_ipv4_generator() {
        let mut generator = Ipv4AddressGenerator::new(Ipv4Addr::new(127, 0, 0, 254), 9042);
        assert_eq!(generator.next(), "127.0.0.254:9042".parse().unwrap());
        assert_eq!(generator.next(), "127.0.0.255:9042".parse().unwrap());
        assert_eq!(generator.next(), "127.0.1.0:9042".parse().unwrap());
    }

    #[test]
    fn test_default_generator() {
        let mut generator = Ipv4AddressGenerator::default();
        assert_eq!(generator.next(), "127.0.0.1:9042".parse().unwrap());
        assert_eq!(generator.next(), "127.0.0.2:9042".parse().unwrap());
    }

    #[test]
    fn test_node_addresses_from_generator() {
        let mut generator = Ipv4AddressGenerator::new(Ipv4Addr::new(127, 0, 0, 1), 19042);
        let cluster = Cluster::new(
            &ServerConfig::default(),
            RequestHandlerBuilder::simple().build(),
            3,
            &mut generator,
        );
        assert_eq!(cluster.len(), 3);
        assert_eq!(cluster.address(3).unwrap(), "127.0.0.3:19042".parse().unwrap());
    }

    #[tokio::test]
    async fn test_invalid_node() {
        let mut cluster = local_cluster(1);
        assert!(matches!(cluster.start(0).await, Err(ServerError::InvalidNode(0))));
        assert!(matches!(cluster.stop(2).await, Err(ServerError::InvalidNode(2))));
        assert!(matches!(cluster.is_running(5), Err(ServerError::InvalidNode(5))));
    }

    #[tokio::test]
    async fn test_start_stop_node() {
        let mut cluster = local_cluster(1);
        cluster.start_all().await.unwrap();
        assert!(cluster.is_running(1).unwrap());

        let addr = cluster.address(1).unwrap();
        assert_ne!(addr.port(), 0);
        let client = Client::new(ConnectionConfig::new(addr));
        client.connect().await.unwrap();
        client.options().await.unwrap();
        client.close().await.unwrap();

        cluster.stop(1).await.unwrap();
        assert!(!cluster.is_running(1).unwrap());
        assert!(!cluster.server(1).unwrap().is_running());

        // Restarting picks a fresh ephemeral port.
        cluster.start(1).await.unwrap();
        let addr = cluster.address(1).unwrap();
        let client = Client::new(ConnectionConfig::new(addr));
        client.connect().await.unwrap();
        client.options().await.unwrap();
        client.close().await.unwrap();

        cluster.stop_all().await;
        assert!(!cluster.is_running(1).unwrap());
    }

    #[tokio::test]
    async fn test_start_is_idempotent() {
        let mut cluster = local_cluster(1);
        cluster.start(1).await.unwrap();
        let addr = cluster.address(1).unwrap();
        cluster.start(1).await.unwrap();
        assert_eq!(cluster.address(1).unwrap(), addr);
        cluster.stop_all().await;
        cluster.stop(1).await.unwrap();
    }
}
