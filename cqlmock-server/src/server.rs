//! TCP server implementation.
//!
//! One tokio task per connection. The task owns the socket, feeds every read
//! into a [`ClientConnection`], writes whatever the action chains queue on
//! the connection's [`Transport`], and drives the connection's timers.

use crate::config::Config;
use crate::connection::{ClientConnection, ConnectionOptions, Transport};
use crate::error::ServerError;
use crate::handler::RequestHandler;
use crate::metrics::Metrics;
use crate::stream::MaybeTlsStream;
use bytes::BytesMut;
use cqlmock_protocol::{
    Buffer, DEFAULT_PORT, HIGHEST_SUPPORTED_VERSION, LOWEST_SUPPORTED_VERSION, MAX_BODY_SIZE,
};
use parking_lot::Mutex;
use std::future::Future;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, mpsc};
use tokio::time::Instant;
use tokio_rustls::TlsAcceptor;

const READ_BUFFER_SIZE: usize = 8192;

/// Server configuration.
#[derive(Clone)]
pub struct ServerConfig {
    /// Address to bind to.
    pub bind_addr: SocketAddr,
    /// Idle connection timeout. Zero disables it.
    pub idle_timeout: Duration,
    /// Maximum concurrent connections.
    pub max_connections: usize,
    /// Close every connection right after accepting it.
    pub close_immediately: bool,
    pub lowest_version: u8,
    pub highest_version: u8,
    /// Longest frame body a connection accepts.
    pub max_body_size: usize,
    /// TLS acceptor (if TLS is enabled).
    pub tls_acceptor: Option<Arc<TlsAcceptor>>,
    /// Metrics instance (if metrics are enabled).
    pub metrics: Option<Arc<Metrics>>,
}

impl std::fmt::Debug for ServerConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServerConfig")
            .field("bind_addr", &self.bind_addr)
            .field("idle_timeout", &self.idle_timeout)
            .field("max_connections", &self.max_connections)
            .field("close_immediately", &self.close_immediately)
            .field("versions", &(self.lowest_version..=self.highest_version))
            .field("max_body_size", &self.max_body_size)
            .field("tls_enabled", &self.tls_acceptor.is_some())
            .field("metrics_enabled", &self.metrics.is_some())
            .finish()
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::from(([127, 0, 0, 1], DEFAULT_PORT)),
            idle_timeout: Duration::from_secs(300),
            max_connections: 1000,
            close_immediately: false,
            lowest_version: LOWEST_SUPPORTED_VERSION,
            highest_version: HIGHEST_SUPPORTED_VERSION,
            max_body_size: MAX_BODY_SIZE,
            tls_acceptor: None,
            metrics: None,
        }
    }
}

impl ServerConfig {
    pub fn new(bind_addr: SocketAddr) -> Self {
        Self {
            bind_addr,
            ..Default::default()
        }
    }

    /// Node settings from the network and protocol sections of `config`.
    /// TLS and metrics are attached separately.
    pub fn from_config(config: &Config) -> Self {
        Self {
            bind_addr: config.network.bind_addr,
            idle_timeout: config.network.idle_timeout(),
            max_connections: config.network.max_connections,
            close_immediately: config.network.close_immediately,
            lowest_version: config.protocol.lowest_version,
            highest_version: config.protocol.highest_version,
            max_body_size: config.protocol.max_body_size,
            tls_acceptor: None,
            metrics: None,
        }
    }

    /// Sets the TLS acceptor.
    pub fn with_tls(mut self, acceptor: TlsAcceptor) -> Self {
        self.tls_acceptor = Some(Arc::new(acceptor));
        self
    }

    /// Sets the metrics instance.
    pub fn with_metrics(mut self, metrics: Arc<Metrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Restricts the accepted protocol versions.
    pub fn with_versions(mut self, lowest: u8, highest: u8) -> Self {
        self.lowest_version = lowest;
        self.highest_version = highest;
        self
    }

    pub fn tls_enabled(&self) -> bool {
        self.tls_acceptor.is_some()
    }

    pub fn metrics_enabled(&self) -> bool {
        self.metrics.is_some()
    }

    fn connection_options(&self) -> ConnectionOptions {
        ConnectionOptions {
            lowest_version: self.lowest_version,
            highest_version: self.highest_version,
            max_body_size: self.max_body_size,
            metrics: self.metrics.clone(),
        }
    }
}

/// Server statistics.
#[derive(Debug, Default)]
pub struct ServerStats {
    pub connections_total: AtomicU64,
    pub connections_active: AtomicU64,
    pub connections_rejected: AtomicU64,
    pub errors_total: AtomicU64,
}

enum Outbound {
    Data(Buffer),
    Close,
}

/// Transport that hands frames to the connection task.
struct ChannelTransport {
    tx: mpsc::UnboundedSender<Outbound>,
}

impl Transport for ChannelTransport {
    fn write(&self, data: Buffer) {
        // The task is gone only once the socket is; nothing left to write to.
        let _ = self.tx.send(Outbound::Data(data));
    }

    fn close(&self) {
        let _ = self.tx.send(Outbound::Close);
    }
}

/// Mock CQL server for one node.
pub struct Server {
    config: ServerConfig,
    handler: Arc<RequestHandler>,
    stats: Arc<ServerStats>,
    shutdown: broadcast::Sender<()>,
    running: AtomicBool,
    local_addr: Mutex<Option<SocketAddr>>,
}

impl Server {
    /// Creates a new server.
    pub fn new(config: ServerConfig, handler: Arc<RequestHandler>) -> Self {
        let (shutdown_tx, _) = broadcast::channel(1);
        Self {
            config,
            handler,
            stats: Arc::new(ServerStats::default()),
            shutdown: shutdown_tx,
            running: AtomicBool::new(false),
            local_addr: Mutex::new(None),
        }
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    /// Binds the configured address.
    pub async fn bind(&self) -> Result<TcpListener, ServerError> {
        Ok(TcpListener::bind(self.config.bind_addr).await?)
    }

    /// Binds and serves until [`Server::shutdown`] is called.
    pub async fn run(self: &Arc<Self>) -> Result<(), ServerError> {
        let listener = self.bind().await?;
        self.serve(listener).await
    }

    /// Serves connections from `listener`.
    ///
    /// The server counts as running, and listens for shutdown, as soon as
    /// this returns; the future only has to be polled to accept.
    pub fn serve(
        self: &Arc<Self>,
        listener: TcpListener,
    ) -> impl Future<Output = Result<(), ServerError>> + Send + 'static {
        let shutdown_rx = self.shutdown.subscribe();
        self.running.store(true, Ordering::SeqCst);
        *self.local_addr.lock() = listener.local_addr().ok();
        let server = Arc::clone(self);
        async move {
            let result = server.accept_loop(listener, shutdown_rx).await;
            server.running.store(false, Ordering::SeqCst);
            *server.local_addr.lock() = None;
            result
        }
    }

    async fn accept_loop(
        &self,
        listener: TcpListener,
        mut shutdown_rx: broadcast::Receiver<()>,
    ) -> Result<(), ServerError> {
        let tls_mode = if self.config.tls_enabled() {
            "TLS"
        } else {
            "plain"
        };
        tracing::info!(
            "Server listening on {} ({})",
            listener.local_addr()?,
            tls_mode
        );

        loop {
            tokio::select! {
                result = listener.accept() => {
                    match result {
                        Ok((tcp_stream, addr)) => self.accept(tcp_stream, addr),
                        Err(e) => {
                            tracing::error!("Accept error: {}", e);
                        }
                    }
                }
                _ = shutdown_rx.recv() => {
                    tracing::info!("Server shutting down");
                    break;
                }
            }
        }

        Ok(())
    }

    fn accept(&self, tcp_stream: TcpStream, addr: SocketAddr) {
        if self.config.close_immediately {
            tracing::debug!("[{}] Closing connection immediately", addr);
            drop(tcp_stream);
            return;
        }

        if self.stats.connections_active.load(Ordering::Relaxed)
            >= self.config.max_connections as u64
        {
            tracing::warn!("Connection limit reached, rejecting {}", addr);
            self.stats
                .connections_rejected
                .fetch_add(1, Ordering::Relaxed);
            return;
        }

        self.stats.connections_total.fetch_add(1, Ordering::Relaxed);
        self.stats.connections_active.fetch_add(1, Ordering::Relaxed);
        if let Some(ref metrics) = self.config.metrics {
            metrics.connections_total.inc();
            metrics.connections_active.inc();
        }

        let handler = self.handler.clone();
        let stats = self.stats.clone();
        let config = self.config.clone();
        let mut conn_shutdown = self.shutdown.subscribe();

        tokio::spawn(async move {
            let stream =
                match Self::maybe_tls_accept(tcp_stream, config.tls_acceptor.as_deref(), addr)
                    .await
                {
                    Ok(s) => Some(s),
                    Err(e) => {
                        tracing::warn!("[{}] TLS handshake failed: {}", addr, e);
                        stats.errors_total.fetch_add(1, Ordering::Relaxed);
                        None
                    }
                };

            if let Some(stream) = stream {
                let result =
                    Self::handle_connection(stream, addr, handler, &config, &mut conn_shutdown)
                        .await;
                match result {
                    Ok(()) | Err(ServerError::ShuttingDown) => {}
                    Err(e) => {
                        tracing::debug!("Connection {} error: {}", addr, e);
                        stats.errors_total.fetch_add(1, Ordering::Relaxed);
                    }
                }
                tracing::info!("Client disconnected: {}", addr);
            }

            stats.connections_active.fetch_sub(1, Ordering::Relaxed);
            if let Some(ref metrics) = config.metrics {
                metrics.connections_active.dec();
            }
        });
    }

    /// Optionally performs TLS handshake on the stream.
    async fn maybe_tls_accept(
        tcp_stream: TcpStream,
        acceptor: Option<&TlsAcceptor>,
        addr: SocketAddr,
    ) -> Result<MaybeTlsStream, ServerError> {
        match acceptor {
            Some(acceptor) => {
                tracing::debug!("[{}] Performing TLS handshake", addr);
                let tls_stream = acceptor
                    .accept(tcp_stream)
                    .await
                    .map_err(|e| ServerError::TlsHandshake(e.to_string()))?;
                tracing::debug!("[{}] TLS handshake complete", addr);
                Ok(MaybeTlsStream::Tls { stream: tls_stream })
            }
            None => Ok(MaybeTlsStream::Plain { stream: tcp_stream }),
        }
    }

    /// Runs one connection until the peer hangs up, an action closes it,
    /// it idles out or the server shuts down.
    async fn handle_connection(
        stream: MaybeTlsStream,
        addr: SocketAddr,
        handler: Arc<RequestHandler>,
        config: &ServerConfig,
        shutdown: &mut broadcast::Receiver<()>,
    ) -> Result<(), ServerError> {
        let tls_status = if stream.is_tls() { " (TLS)" } else { "" };
        tracing::info!("Client connected: {}{}", addr, tls_status);
        if let Err(e) = stream.set_nodelay() {
            tracing::debug!("[{}] Failed to set TCP_NODELAY: {}", addr, e);
        }

        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut connection = ClientConnection::with_options(
            Box::new(ChannelTransport { tx }),
            handler,
            config.connection_options(),
        );
        let timers = connection.handle().timers().clone();
        let (mut reader, mut writer) = tokio::io::split(stream);
        let mut buf = BytesMut::with_capacity(READ_BUFFER_SIZE);
        let mut last_activity = Instant::now();

        loop {
            let next_deadline = connection.next_deadline();
            let idle_deadline = last_activity + config.idle_timeout;

            tokio::select! {
                biased;

                // Frames and close requests queued by action chains
                Some(outbound) = rx.recv() => match outbound {
                    Outbound::Data(data) => {
                        tracing::debug!("[{}] Writing {} bytes", addr, data.len());
                        writer.write_all(&data).await?;
                        writer.flush().await?;
                    }
                    Outbound::Close => {
                        tracing::debug!("[{}] Connection closed by server", addr);
                        let _ = writer.shutdown().await;
                        return Ok(());
                    }
                },

                result = reader.read_buf(&mut buf) => {
                    match result {
                        Ok(0) => {
                            tracing::debug!("[{}] Connection closed by client", addr);
                            return Ok(());
                        }
                        Ok(n) => {
                            tracing::debug!("[{}] Received {} bytes", addr, n);
                            last_activity = Instant::now();
                            connection.on_read(&buf);
                            buf.clear();
                        }
                        Err(e) => {
                            tracing::debug!("[{}] Read error: {}", addr, e);
                            return Err(ServerError::Io(e));
                        }
                    }
                }

                _ = tokio::time::sleep_until(next_deadline.unwrap_or(idle_deadline)), if next_deadline.is_some() => {
                    let fired = connection.fire_timers(Instant::now());
                    tracing::trace!("[{}] Fired {} timers", addr, fired);
                }

                // Recompute the next deadline
                _ = timers.changed() => {}

                _ = tokio::time::sleep_until(idle_deadline), if !config.idle_timeout.is_zero() => {
                    tracing::debug!("[{}] Idle timeout", addr);
                    return Ok(());
                }

                _ = shutdown.recv() => {
                    tracing::debug!("[{}] Shutdown signal received", addr);
                    return Err(ServerError::ShuttingDown);
                }
            }
        }
    }

    /// Initiates server shutdown.
    pub fn shutdown(&self) {
        let _ = self.shutdown.send(());
    }

    /// Returns whether the server is running.
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Address the server is listening on, while it runs.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        *self.local_addr.lock()
    }

    /// Returns server statistics.
    pub fn stats(&self) -> &ServerStats {
        &self.stats
    }
}
