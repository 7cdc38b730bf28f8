//! Connection management.

use crate::error::ClientError;
use bytes::BytesMut;
use cqlmock_protocol::{
    Buffer, Event, Frame, FrameDecoder, FrameEvent, Opcode, ProtocolError, RequestMessage,
    ResponseMessage,
};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::{broadcast, oneshot, Mutex};

/// Default read buffer size (8 KiB).
pub const DEFAULT_READ_BUFFER_SIZE: usize = 8 * 1024;

/// Minimum read buffer size (1 KiB).
pub const MIN_READ_BUFFER_SIZE: usize = 1024;

/// Maximum read buffer size (1 MiB).
pub const MAX_READ_BUFFER_SIZE: usize = 1024 * 1024;

/// Protocol version used unless configured otherwise.
pub const DEFAULT_PROTOCOL_VERSION: u8 = 4;

/// Stream the server uses for pushed events.
pub const EVENT_STREAM: i16 = -1;

/// Number of usable stream ids for a protocol version.
pub fn max_streams(version: u8) -> u32 {
    if version >= 3 {
        32768
    } else {
        128
    }
}

/// Connection configuration.
#[derive(Debug, Clone)]
pub struct ConnectionConfig {
    /// Server address.
    pub addr: SocketAddr,
    pub protocol_version: u8,
    /// Connection timeout.
    pub connect_timeout: Duration,
    /// Request timeout.
    pub request_timeout: Duration,
    /// Read buffer size for socket reads.
    pub read_buffer_size: usize,
    /// Options sent in STARTUP.
    pub startup_options: Vec<(String, String)>,
    /// Username and password, used if the server asks to authenticate.
    pub credentials: Option<(String, String)>,
}

impl ConnectionConfig {
    pub fn new(addr: SocketAddr) -> Self {
        Self {
            addr,
            protocol_version: DEFAULT_PROTOCOL_VERSION,
            connect_timeout: Duration::from_secs(10),
            request_timeout: Duration::from_secs(30),
            read_buffer_size: DEFAULT_READ_BUFFER_SIZE,
            startup_options: vec![("CQL_VERSION".to_string(), "3.0.0".to_string())],
            credentials: None,
        }
    }

    pub fn with_protocol_version(mut self, version: u8) -> Self {
        self.protocol_version = version;
        self
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    pub fn with_read_buffer_size(mut self, size: usize) -> Self {
        self.read_buffer_size = size.clamp(MIN_READ_BUFFER_SIZE, MAX_READ_BUFFER_SIZE);
        self
    }

    pub fn with_startup_option(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.startup_options.push((key.into(), value.into()));
        self
    }

    pub fn with_credentials(
        mut self,
        username: impl Into<String>,
        password: impl Into<String>,
    ) -> Self {
        self.credentials = Some((username.into(), password.into()));
        self
    }
}

/// Builds a SASL PLAIN token: an empty authorization id, then the username
/// and password, separated by NUL bytes.
pub fn plain_token(username: &str, password: &str) -> Buffer {
    let mut token = Vec::with_capacity(2 + username.len() + password.len());
    token.push(0);
    token.extend_from_slice(username.as_bytes());
    token.push(0);
    token.extend_from_slice(password.as_bytes());
    Buffer::from_slice(&token)
}

/// Default capacity for the server event channel.
const EVENT_CHANNEL_CAPACITY: usize = 256;

/// A connection to a CQL server.
pub struct Connection {
    config: ConnectionConfig,
    /// Write half of the stream (for sending requests).
    writer: Mutex<Option<OwnedWriteHalf>>,
    /// Read half of the stream (for receiving responses).
    reader: Mutex<Option<OwnedReadHalf>>,
    decoder: Mutex<FrameDecoder>,
    /// Requests waiting for a response, by stream id.
    pending: Mutex<HashMap<i16, oneshot::Sender<Frame>>>,
    next_stream: AtomicU32,
    /// Is the connection established?
    connected: AtomicBool,
    /// Broadcast channel for server events.
    events: broadcast::Sender<Event>,
}

impl Connection {
    /// Creates a new connection (not yet connected).
    pub fn new(config: ConnectionConfig) -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            config,
            writer: Mutex::new(None),
            reader: Mutex::new(None),
            decoder: Mutex::new(FrameDecoder::new()),
            pending: Mutex::new(HashMap::new()),
            next_stream: AtomicU32::new(1),
            connected: AtomicBool::new(false),
            events,
        }
    }

    pub fn config(&self) -> &ConnectionConfig {
        &self.config
    }

    pub fn protocol_version(&self) -> u8 {
        self.config.protocol_version
    }

    /// Subscribes to events pushed by the server after REGISTER.
    pub fn subscribe_events(&self) -> broadcast::Receiver<Event> {
        self.events.subscribe()
    }

    /// Connects and performs the STARTUP handshake, authenticating if the
    /// server asks to.
    pub async fn connect(&self) -> Result<(), ClientError> {
        tracing::debug!("Connecting to {}...", self.config.addr);

        let tcp_stream = tokio::time::timeout(
            self.config.connect_timeout,
            TcpStream::connect(self.config.addr),
        )
        .await
        .map_err(|_| {
            tracing::debug!("Connection timeout");
            ClientError::Timeout
        })?
        .map_err(|e| {
            tracing::debug!("Connection failed: {}", e);
            ClientError::Io(e)
        })?;

        tcp_stream.set_nodelay(true).ok();

        let (read_half, write_half) = tcp_stream.into_split();
        *self.writer.lock().await = Some(write_half);
        *self.reader.lock().await = Some(read_half);
        self.decoder.lock().await.clear();

        tracing::debug!("Starting protocol handshake...");
        self.handshake().await?;
        tracing::debug!("Handshake complete");

        self.connected.store(true, Ordering::SeqCst);
        Ok(())
    }

    /// Sends STARTUP and answers an AUTHENTICATE challenge. Runs before the
    /// read loop, so responses are read directly from the socket.
    async fn handshake(&self) -> Result<(), ClientError> {
        let startup = RequestMessage::Startup {
            options: self.config.startup_options.clone(),
        };
        let authenticator = match self.handshake_step(&startup).await? {
            ResponseMessage::Ready => return Ok(()),
            ResponseMessage::Authenticate { authenticator } => authenticator,
            other => return Err(unexpected(&other)),
        };

        let (username, password) = self
            .config
            .credentials
            .as_ref()
            .ok_or_else(|| ClientError::AuthenticationRequired(authenticator.clone()))?;
        tracing::debug!("Authenticating with {}", authenticator);

        let auth = if self.config.protocol_version == 1 {
            RequestMessage::Credentials {
                credentials: vec![
                    ("username".to_string(), username.clone()),
                    ("password".to_string(), password.clone()),
                ],
            }
        } else {
            RequestMessage::AuthResponse {
                token: Some(plain_token(username, password)),
            }
        };
        match self.handshake_step(&auth).await? {
            ResponseMessage::Ready | ResponseMessage::AuthSuccess { .. } => Ok(()),
            other => Err(unexpected(&other)),
        }
    }

    async fn handshake_step(
        &self,
        message: &RequestMessage,
    ) -> Result<ResponseMessage, ClientError> {
        let encoded = self.encode(0, message)?;
        {
            let mut writer_guard = self.writer.lock().await;
            let writer = writer_guard.as_mut().ok_or(ClientError::NotConnected)?;
            writer.write_all(&encoded).await?;
        }
        let frame = self.read_single_frame().await?;
        into_result(ResponseMessage::decode(frame.opcode, &frame.body)?)
    }

    fn encode(&self, stream: i16, message: &RequestMessage) -> Result<Buffer, ClientError> {
        let version = self.config.protocol_version;
        let body = message.encode(version)?;
        Ok(Frame::request(version, stream, message.opcode(), body).encode()?)
    }

    /// Reads frames until one that is not an event arrives. Used during
    /// handshake before the read loop is started.
    async fn read_single_frame(&self) -> Result<Frame, ClientError> {
        let timeout = self.config.request_timeout;

        tokio::time::timeout(timeout, async {
            let mut buf = BytesMut::with_capacity(self.config.read_buffer_size);
            loop {
                let n = {
                    let mut reader_guard = self.reader.lock().await;
                    let reader = reader_guard.as_mut().ok_or(ClientError::NotConnected)?;
                    reader.read_buf(&mut buf).await?
                };
                if n == 0 {
                    tracing::debug!("Connection closed (0 bytes)");
                    return Err(ClientError::ConnectionClosed);
                }

                let events = self.decoder.lock().await.decode_all(&buf);
                buf.clear();
                for event in events {
                    let frame = check_version(event)?;
                    if frame.stream != EVENT_STREAM {
                        return Ok(frame);
                    }
                }
            }
        })
        .await
        .map_err(|_| {
            tracing::debug!("Read timeout");
            ClientError::Timeout
        })?
    }

    /// Takes a free stream id and registers `tx` for its response.
    async fn allocate_stream(
        &self,
        tx: oneshot::Sender<Frame>,
    ) -> Result<i16, ClientError> {
        let max = max_streams(self.config.protocol_version);
        let mut pending = self.pending.lock().await;
        for _ in 0..max {
            let stream = (self.next_stream.fetch_add(1, Ordering::Relaxed) % max) as i16;
            if let std::collections::hash_map::Entry::Vacant(entry) = pending.entry(stream) {
                entry.insert(tx);
                return Ok(stream);
            }
        }
        Err(ClientError::StreamsExhausted)
    }

    /// Sends a request and waits for its response frame.
    pub async fn send(&self, opcode: Opcode, body: &[u8]) -> Result<Frame, ClientError> {
        if !self.connected.load(Ordering::SeqCst) {
            tracing::debug!("send() called but not connected");
            return Err(ClientError::NotConnected);
        }

        let (tx, rx) = oneshot::channel();
        let stream = self.allocate_stream(tx).await?;
        let frame = Frame::request(
            self.config.protocol_version,
            stream,
            opcode,
            Buffer::from_slice(body),
        );
        let encoded = match frame.encode() {
            Ok(encoded) => encoded,
            Err(e) => {
                self.pending.lock().await.remove(&stream);
                return Err(e.into());
            }
        };

        let written = {
            let mut writer_guard = self.writer.lock().await;
            match writer_guard.as_mut() {
                Some(writer) => writer.write_all(&encoded).await.map_err(ClientError::Io),
                None => Err(ClientError::NotConnected),
            }
        };
        if let Err(e) = written {
            self.pending.lock().await.remove(&stream);
            return Err(e);
        }
        tracing::debug!("Request {} sent on stream {}", opcode, stream);

        match tokio::time::timeout(self.config.request_timeout, rx).await {
            Ok(Ok(frame)) => Ok(frame),
            Ok(Err(_)) => {
                tracing::debug!("Stream {} channel closed", stream);
                Err(ClientError::ConnectionClosed)
            }
            Err(_) => {
                tracing::debug!("Stream {} timed out", stream);
                self.pending.lock().await.remove(&stream);
                Err(ClientError::Timeout)
            }
        }
    }

    /// Sends a request and decodes the response. ERROR responses become
    /// [`ClientError::Server`].
    pub async fn request(&self, message: &RequestMessage) -> Result<ResponseMessage, ClientError> {
        let body = message.encode(self.config.protocol_version)?;
        let frame = self.send(message.opcode(), &body).await?;
        into_result(ResponseMessage::decode(frame.opcode, &frame.body)?)
    }

    /// Reads and dispatches responses and events (call this in a background task).
    pub async fn read_loop(&self) -> Result<(), ClientError> {
        let result = self.read_frames().await;
        self.connected.store(false, Ordering::SeqCst);
        // Dropping the senders wakes every waiter with ConnectionClosed.
        self.pending.lock().await.clear();
        result
    }

    async fn read_frames(&self) -> Result<(), ClientError> {
        let mut buf = BytesMut::with_capacity(self.config.read_buffer_size);

        loop {
            let n = {
                let mut reader_guard = self.reader.lock().await;
                let reader = reader_guard.as_mut().ok_or(ClientError::NotConnected)?;
                reader.read_buf(&mut buf).await?
            };
            if n == 0 {
                tracing::debug!("read_loop: connection closed");
                return Err(ClientError::ConnectionClosed);
            }

            let events = self.decoder.lock().await.decode_all(&buf);
            buf.clear();
            for event in events {
                let frame = check_version(event)?;
                if frame.stream == EVENT_STREAM {
                    self.dispatch_event(&frame);
                    continue;
                }
                match self.pending.lock().await.remove(&frame.stream) {
                    Some(tx) => {
                        let _ = tx.send(frame);
                    }
                    None => {
                        tracing::debug!("read_loop: no pending request for stream {}", frame.stream)
                    }
                }
            }
        }
    }

    fn dispatch_event(&self, frame: &Frame) {
        match ResponseMessage::decode(frame.opcode, &frame.body) {
            Ok(ResponseMessage::Event(event)) => {
                tracing::debug!("read_loop: server event {:?}", event);
                // No subscribers is fine.
                let _ = self.events.send(event);
            }
            Ok(other) => tracing::warn!("read_loop: {} on event stream", other.opcode()),
            Err(e) => tracing::warn!("read_loop: bad event frame: {}", e),
        }
    }

    /// Returns whether the connection is established.
    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    /// Closes the connection.
    pub async fn close(&self) -> Result<(), ClientError> {
        tracing::debug!("Closing connection...");
        self.connected.store(false, Ordering::SeqCst);

        if let Some(mut writer) = self.writer.lock().await.take() {
            let _ = writer.shutdown().await;
        }

        let mut pending = self.pending.lock().await;
        tracing::debug!("Clearing {} pending requests", pending.len());
        pending.clear();
        Ok(())
    }

    /// Returns the number of pending requests.
    pub fn pending_count(&self) -> usize {
        self.pending.try_lock().map(|p| p.len()).unwrap_or(0)
    }
}

fn check_version(event: FrameEvent) -> Result<Frame, ClientError> {
    match event {
        FrameEvent::Frame(frame) => Ok(frame),
        FrameEvent::InvalidVersion { received, .. } => {
            Err(ProtocolError::UnsupportedVersion(received).into())
        }
        FrameEvent::TooLarge { size, max, .. } => Err(ProtocolError::TooLarge { size, max }.into()),
    }
}

fn into_result(message: ResponseMessage) -> Result<ResponseMessage, ClientError> {
    match message {
        ResponseMessage::Error { code, message } => Err(ClientError::Server { code, message }),
        other => Ok(other),
    }
}

fn unexpected(message: &ResponseMessage) -> ClientError {
    ClientError::UnexpectedResponse(message.opcode().name())
}
