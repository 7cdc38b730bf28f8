//! Client connections.
//!
//! A [`ClientConnection`] owns the frame decoder for one peer and turns each
//! decoded frame into a [`Request`] that runs through the request handler.
//! Responses leave through the [`Transport`]; the connection never touches
//! the socket directly.

use crate::handler::RequestHandler;
use crate::metrics::Metrics;
use crate::request::Request;
use crate::timer::{TimerCallback, TimerId, TimerQueue, TimerService};
use cqlmock_protocol::{
    Buffer, Direction, ErrorCode, Frame, FrameDecoder, FrameEvent, HIGHEST_SUPPORTED_VERSION,
    LOWEST_SUPPORTED_VERSION, MAX_BODY_SIZE,
};
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::time::Instant;
use uuid::Uuid;

/// Write side of a connection.
pub trait Transport: Send + Sync {
    /// Queues a fully encoded frame.
    fn write(&self, data: Buffer);

    /// Closes the underlying stream once queued writes are flushed.
    fn close(&self);
}

/// Identifies a request within its connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RequestId(u64);

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Default)]
struct ConnectionState {
    closed: bool,
    next_request_id: u64,
    in_flight: HashSet<RequestId>,
    /// Requests parked behind a wait timer.
    pending: HashMap<RequestId, TimerId>,
    keyspace: Option<String>,
    /// Options from the last valid STARTUP.
    options: Vec<(String, String)>,
    registered_events: Vec<String>,
}

struct Shared {
    id: Uuid,
    transport: Box<dyn Transport>,
    timers: Arc<TimerQueue>,
    metrics: Option<Arc<Metrics>>,
    state: Mutex<ConnectionState>,
}

/// Cheap, cloneable handle to a connection's shared state.
///
/// Every [`Request`] carries one so it can write its response and release
/// itself when dropped.
#[derive(Clone)]
pub struct ConnectionHandle(Arc<Shared>);

impl ConnectionHandle {
    pub fn new(transport: Box<dyn Transport>, metrics: Option<Arc<Metrics>>) -> Self {
        Self(Arc::new(Shared {
            id: Uuid::new_v4(),
            transport,
            timers: Arc::new(TimerQueue::new()),
            metrics,
            state: Mutex::new(ConnectionState::default()),
        }))
    }

    pub fn id(&self) -> Uuid {
        self.0.id
    }

    pub fn metrics(&self) -> Option<&Arc<Metrics>> {
        self.0.metrics.as_ref()
    }

    pub fn timers(&self) -> &Arc<TimerQueue> {
        &self.0.timers
    }

    /// Writes an encoded frame. Ignored once the connection is closed.
    pub fn write(&self, data: Buffer) {
        if self.is_closed() {
            tracing::debug!("[{}] Dropping {} bytes on closed connection", self.0.id, data.len());
            return;
        }
        self.0.transport.write(data);
    }

    /// Closes the connection and drops every request parked behind a timer.
    pub fn close(&self) {
        let pending: Vec<TimerId> = {
            let mut state = self.0.state.lock();
            if state.closed {
                return;
            }
            state.closed = true;
            state.pending.drain().map(|(_, timer)| timer).collect()
        };

        for timer in pending {
            if self.0.timers.cancel(timer) {
                if let Some(metrics) = self.metrics() {
                    metrics.pending_waits.dec();
                }
            }
        }
        self.0.transport.close();
        tracing::debug!("[{}] Connection closed", self.0.id);
    }

    pub fn is_closed(&self) -> bool {
        self.0.state.lock().closed
    }

    /// Number of requests that have been dispatched and not yet released.
    pub fn in_flight(&self) -> usize {
        self.0.state.lock().in_flight.len()
    }

    /// Number of requests waiting on a timer.
    pub fn pending_waits(&self) -> usize {
        self.0.state.lock().pending.len()
    }

    pub fn keyspace(&self) -> Option<String> {
        self.0.state.lock().keyspace.clone()
    }

    pub fn set_keyspace(&self, keyspace: impl Into<String>) {
        self.0.state.lock().keyspace = Some(keyspace.into());
    }

    pub fn options(&self) -> Vec<(String, String)> {
        self.0.state.lock().options.clone()
    }

    pub fn set_options(&self, options: Vec<(String, String)>) {
        self.0.state.lock().options = options;
    }

    pub fn registered_events(&self) -> Vec<String> {
        self.0.state.lock().registered_events.clone()
    }

    pub fn set_registered_events(&self, events: Vec<String>) {
        self.0.state.lock().registered_events = events;
    }

    pub(crate) fn acquire(&self) -> RequestId {
        let mut state = self.0.state.lock();
        state.next_request_id += 1;
        let id = RequestId(state.next_request_id);
        state.in_flight.insert(id);
        id
    }

    pub(crate) fn release(&self, id: RequestId) {
        let mut state = self.0.state.lock();
        state.in_flight.remove(&id);
        state.pending.remove(&id);
    }

    /// Runs `callback` after `timeout` on the connection task. Returns `None`
    /// (dropping the callback) when the connection is already closed.
    pub(crate) fn schedule(
        &self,
        id: RequestId,
        timeout: Duration,
        callback: TimerCallback,
    ) -> Option<TimerId> {
        if self.is_closed() {
            return None;
        }

        let shared: Weak<Shared> = Arc::downgrade(&self.0);
        let wrapped: TimerCallback = Box::new(move || {
            if let Some(shared) = shared.upgrade() {
                shared.state.lock().pending.remove(&id);
                if let Some(metrics) = shared.metrics.as_ref() {
                    metrics.pending_waits.dec();
                }
            }
            callback();
        });

        if let Some(metrics) = self.metrics() {
            metrics.pending_waits.inc();
        }
        let timer = self.0.timers.start(timeout, wrapped);

        let closed = {
            let mut state = self.0.state.lock();
            if !state.closed {
                state.pending.insert(id, timer);
            }
            state.closed
        };
        if closed {
            if self.0.timers.cancel(timer) {
                if let Some(metrics) = self.metrics() {
                    metrics.pending_waits.dec();
                }
            }
            return None;
        }
        Some(timer)
    }
}

impl fmt::Debug for ConnectionHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionHandle")
            .field("id", &self.0.id)
            .field("closed", &self.is_closed())
            .finish()
    }
}

/// Per-connection settings.
#[derive(Clone)]
pub struct ConnectionOptions {
    pub lowest_version: u8,
    pub highest_version: u8,
    /// Longest frame body accepted before the connection is dropped.
    pub max_body_size: usize,
    pub metrics: Option<Arc<Metrics>>,
}

impl Default for ConnectionOptions {
    fn default() -> Self {
        Self {
            lowest_version: LOWEST_SUPPORTED_VERSION,
            highest_version: HIGHEST_SUPPORTED_VERSION,
            max_body_size: MAX_BODY_SIZE,
            metrics: None,
        }
    }
}

/// Server side of one client connection.
pub struct ClientConnection {
    handle: ConnectionHandle,
    decoder: FrameDecoder,
    handler: Arc<RequestHandler>,
}

impl ClientConnection {
    pub fn new(transport: Box<dyn Transport>, handler: Arc<RequestHandler>) -> Self {
        Self::with_options(transport, handler, ConnectionOptions::default())
    }

    pub fn with_options(
        transport: Box<dyn Transport>,
        handler: Arc<RequestHandler>,
        options: ConnectionOptions,
    ) -> Self {
        Self {
            handle: ConnectionHandle::new(transport, options.metrics),
            decoder: FrameDecoder::with_versions(options.lowest_version, options.highest_version)
                .with_max_body_size(options.max_body_size),
            handler,
        }
    }

    pub fn handle(&self) -> &ConnectionHandle {
        &self.handle
    }

    /// Feeds bytes read from the peer. Every complete frame is dispatched
    /// before this returns, except for steps deferred by a wait.
    pub fn on_read(&mut self, data: &[u8]) {
        if self.handle.is_closed() {
            return;
        }

        let handle = &self.handle;
        let handler = &self.handler;
        self.decoder.decode(data, |event| {
            if handle.is_closed() {
                return;
            }
            match event {
                FrameEvent::Frame(frame) => {
                    tracing::debug!(
                        "[{}] Frame: v{} stream={} opcode={:#04x} ({} bytes)",
                        handle.id(),
                        frame.version,
                        frame.stream,
                        frame.opcode,
                        frame.body.len()
                    );
                    if let Some(metrics) = handle.metrics() {
                        metrics.record_frame(frame.opcode);
                    }
                    handler.run(Request::from_frame(handle.clone(), frame));
                }
                FrameEvent::InvalidVersion {
                    received,
                    reply_version,
                } => {
                    tracing::warn!(
                        "[{}] Invalid protocol version {}, replying with v{}",
                        handle.id(),
                        received,
                        reply_version
                    );
                    if let Some(metrics) = handle.metrics() {
                        metrics.invalid_protocol_total.inc();
                    }
                    handler.invalid_protocol(Request::invalid_protocol(handle.clone(), reply_version));
                }
                FrameEvent::TooLarge {
                    version,
                    stream,
                    size,
                    max,
                } => {
                    tracing::warn!(
                        "[{}] Frame body of {} bytes exceeds limit of {}, closing",
                        handle.id(),
                        size,
                        max
                    );
                    let frame = Frame {
                        version,
                        direction: Direction::Request,
                        flags: 0,
                        stream,
                        opcode: 0,
                        body: Buffer::new(),
                    };
                    let request = Request::from_frame(handle.clone(), frame);
                    request.error(
                        ErrorCode::Protocol.code(),
                        &format!("Frame body of {} bytes exceeds limit of {}", size, max),
                    );
                    drop(request);
                    // The rest of the stream can no longer be framed.
                    handle.close();
                }
            }
        });
    }

    /// Earliest wait deadline, if any request is parked.
    pub fn next_deadline(&self) -> Option<Instant> {
        self.handle.timers().next_deadline()
    }

    /// Resumes every wait that expired at or before `now`.
    pub fn fire_timers(&self, now: Instant) -> usize {
        self.handle.timers().fire_expired(now)
    }

    pub fn close(&mut self) {
        self.handle.close();
        self.decoder.clear();
    }

    pub fn is_closed(&self) -> bool {
        self.handle.is_closed()
    }
}

impl Drop for ClientConnection {
    fn drop(&mut self) {
        self.close();
        // Anything left holds a request, which holds this connection.
        self.handle.timers().clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handler::RequestHandlerBuilder;
    use crate::test_util::{frame, RecordingTransport};
    use cqlmock_protocol::{ErrorCode, Opcode, RequestMessage, ResponseMessage};

    fn connection(handler: Arc<RequestHandler>) -> (ClientConnection, RecordingTransport) {
        let transport = RecordingTransport::new();
        let conn = ClientConnection::new(Box::new(transport.clone()), handler);
        (conn, transport)
    }

    #[test]
    fn test_startup_gets_ready() {
        let (mut conn, transport) = connection(RequestHandlerBuilder::simple().build());
        conn.on_read(&frame(4, 7, &RequestMessage::Startup {
            options: vec![("CQL_VERSION".into(), "3.0.0".into())],
        }));

        let responses = transport.responses();
        assert_eq!(responses.len(), 1);
        assert_eq!(responses[0].version, 4);
        assert_eq!(responses[0].stream, 7);
        assert_eq!(responses[0].message, ResponseMessage::Ready);
        assert_eq!(conn.handle().in_flight(), 0);
    }

    #[test]
    fn test_byte_at_a_time() {
        let (mut conn, transport) = connection(RequestHandlerBuilder::simple().build());
        let bytes = frame(3, 1, &RequestMessage::Options);
        for byte in bytes.iter() {
            conn.on_read(std::slice::from_ref(byte));
        }
        let responses = transport.responses();
        assert_eq!(responses.len(), 1);
        assert_eq!(responses[0].opcode, Opcode::Supported.as_u8());
    }

    #[test]
    fn test_pipelined_frames_answer_in_order() {
        let (mut conn, transport) = connection(RequestHandlerBuilder::simple().build());
        let mut bytes = frame(4, 1, &RequestMessage::Options).to_vec();
        bytes.extend_from_slice(&frame(4, 2, &RequestMessage::Startup { options: vec![] }));
        conn.on_read(&bytes);

        let streams: Vec<i16> = transport.responses().iter().map(|r| r.stream).collect();
        assert_eq!(streams, vec![1, 2]);
    }

    #[test]
    fn test_invalid_version_replies_with_highest() {
        for version in [0u8, 6] {
            let (mut conn, transport) = connection(RequestHandlerBuilder::simple().build());
            conn.on_read(&[version, 0, 0, 0, 0x05, 0, 0, 0, 0]);

            let responses = transport.responses();
            assert_eq!(responses.len(), 1, "version {}", version);
            assert_eq!(responses[0].version, 5);
            assert_eq!(responses[0].stream, 0);
            match &responses[0].message {
                ResponseMessage::Error { code, message } => {
                    assert_eq!(*code, ErrorCode::Protocol.code());
                    assert_eq!(message, "Invalid or unsupported protocol version");
                }
                other => panic!("unexpected response {:?}", other),
            }
            assert!(!conn.is_closed());
        }
    }

    #[test]
    fn test_custom_version_range() {
        let transport = RecordingTransport::new();
        let options = ConnectionOptions {
            lowest_version: 3,
            highest_version: 4,
            ..Default::default()
        };
        let mut conn = ClientConnection::with_options(
            Box::new(transport.clone()),
            RequestHandlerBuilder::simple().build(),
            options,
        );
        conn.on_read(&frame(2, 0, &RequestMessage::Options));
        let responses = transport.responses();
        assert_eq!(responses[0].version, 4);
        assert_eq!(responses[0].opcode, Opcode::Error.as_u8());
    }

    #[test]
    fn test_oversized_frame_answers_and_closes() {
        let transport = RecordingTransport::new();
        let options = ConnectionOptions {
            max_body_size: 64,
            ..Default::default()
        };
        let mut conn = ClientConnection::with_options(
            Box::new(transport.clone()),
            RequestHandlerBuilder::simple().build(),
            options,
        );

        let mut bytes = vec![0x04, 0, 0x00, 0x0b, Opcode::Query.as_u8()];
        bytes.extend_from_slice(&u32::MAX.to_be_bytes());
        bytes.extend_from_slice(&[0; 32]);
        conn.on_read(&bytes);

        let responses = transport.responses();
        assert_eq!(responses.len(), 1);
        assert_eq!(responses[0].version, 4);
        assert_eq!(responses[0].stream, 11);
        match &responses[0].message {
            ResponseMessage::Error { code, message } => {
                assert_eq!(*code, ErrorCode::Protocol.code());
                assert!(message.contains("exceeds limit of 64"));
            }
            other => panic!("unexpected response {:?}", other),
        }
        assert!(conn.is_closed());
        assert!(transport.is_closed());
        assert_eq!(conn.handle().in_flight(), 0);

        // Frames after the rejected one are ignored.
        conn.on_read(&frame(4, 1, &RequestMessage::Options));
        assert_eq!(transport.responses().len(), 1);
    }

    #[test]
    fn test_reads_ignored_after_close() {
        let (mut conn, transport) = connection(RequestHandlerBuilder::simple().build());
        conn.close();
        assert!(transport.is_closed());

        conn.on_read(&frame(4, 1, &RequestMessage::Options));
        assert!(transport.responses().is_empty());
    }

    #[test]
    fn test_close_is_idempotent() {
        let (mut conn, transport) = connection(RequestHandlerBuilder::simple().build());
        conn.close();
        conn.close();
        assert_eq!(transport.close_count(), 1);
    }

    #[test]
    fn test_connection_state() {
        let (conn, _transport) = connection(RequestHandlerBuilder::simple().build());
        let handle = conn.handle();
        assert!(handle.keyspace().is_none());
        handle.set_keyspace("ks");
        assert_eq!(handle.keyspace().as_deref(), Some("ks"));
        handle.set_registered_events(vec!["STATUS_CHANGE".into()]);
        assert_eq!(handle.registered_events(), vec!["STATUS_CHANGE".to_string()]);
    }
}
