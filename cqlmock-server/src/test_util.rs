//! Helpers shared by unit tests.

use crate::connection::{ClientConnection, ConnectionHandle, Transport};
use crate::handler::RequestHandler;
use crate::request::Request;
use cqlmock_protocol::{Buffer, Frame, FrameDecoder, FrameEvent, RequestMessage, ResponseMessage};
use parking_lot::Mutex;
use std::sync::Arc;

#[derive(Default)]
struct Recorded {
    written: Vec<Buffer>,
    close_count: usize,
}

/// Transport that keeps everything written to it.
#[derive(Clone, Default)]
pub struct RecordingTransport {
    inner: Arc<Mutex<Recorded>>,
}

/// A decoded response frame.
#[derive(Debug)]
pub struct RecordedResponse {
    pub version: u8,
    pub stream: i16,
    pub opcode: u8,
    pub message: ResponseMessage,
}

impl RecordingTransport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn written(&self) -> Vec<Buffer> {
        self.inner.lock().written.clone()
    }

    pub fn is_closed(&self) -> bool {
        self.inner.lock().close_count > 0
    }

    pub fn close_count(&self) -> usize {
        self.inner.lock().close_count
    }

    /// Decodes every written frame.
    pub fn responses(&self) -> Vec<RecordedResponse> {
        let mut decoder = FrameDecoder::new();
        let mut responses = Vec::new();
        for data in self.written() {
            for event in decoder.decode_all(&data) {
                match event {
                    FrameEvent::Frame(frame) => responses.push(RecordedResponse {
                        version: frame.version,
                        stream: frame.stream,
                        opcode: frame.opcode,
                        message: ResponseMessage::decode(frame.opcode, &frame.body).unwrap(),
                    }),
                    other => panic!("unexpected {:?}", other),
                }
            }
        }
        assert_eq!(decoder.buffered(), 0, "partial frame written");
        responses
    }
}

impl Transport for RecordingTransport {
    fn write(&self, data: Buffer) {
        self.inner.lock().written.push(data);
    }

    fn close(&self) {
        self.inner.lock().close_count += 1;
    }
}

/// Encodes a request frame.
pub fn frame(version: u8, stream: i16, message: &RequestMessage) -> Buffer {
    let body = message.encode(version).unwrap();
    Frame::request(version, stream, message.opcode(), body)
        .encode()
        .unwrap()
}

/// Encodes a request frame with an arbitrary opcode and body.
pub fn raw_frame(version: u8, stream: i16, opcode: u8, body: &[u8]) -> Buffer {
    raw(version, stream, opcode, body).encode().unwrap()
}

fn raw(version: u8, stream: i16, opcode: u8, body: &[u8]) -> Frame {
    Frame {
        version,
        direction: cqlmock_protocol::Direction::Request,
        flags: 0,
        stream,
        opcode,
        body: Buffer::from_slice(body),
    }
}

/// A request on a fresh connection writing to `transport`.
pub fn request(
    transport: &RecordingTransport,
    version: u8,
    stream: i16,
    message: &RequestMessage,
) -> Request {
    let body = message.encode(version).unwrap();
    raw_request(transport, version, stream, message.opcode().as_u8(), &body)
}

pub fn raw_request(
    transport: &RecordingTransport,
    version: u8,
    stream: i16,
    opcode: u8,
    body: &[u8],
) -> Request {
    let handle = ConnectionHandle::new(Box::new(transport.clone()), None);
    Request::from_frame(handle, raw(version, stream, opcode, body))
}

/// Feeds each buffer to a new connection in turn and returns the connection.
pub fn run_frames(
    transport: &RecordingTransport,
    handler: Arc<RequestHandler>,
    frames: &[Buffer],
) -> ClientConnection {
    let mut conn = ClientConnection::new(Box::new(transport.clone()), handler);
    for data in frames {
        conn.on_read(data);
    }
    conn
}
