//! A single in-flight request.

use crate::action::Continuation;
use crate::connection::{ConnectionHandle, RequestId};
use cqlmock_protocol::codec::{self, expect_end};
use cqlmock_protocol::frame::encode_header;
use cqlmock_protocol::params::{self, PrepareParameters, QueryParameters};
use cqlmock_protocol::{
    header_size, Buffer, Direction, Frame, Opcode, ProtocolError, ResponseMessage,
};
use std::fmt;
use std::time::Duration;

/// One decoded frame travelling through an action chain.
///
/// Responses are framed with the request's version and stream. Dropping the
/// request releases it from its connection.
pub struct Request {
    id: RequestId,
    version: u8,
    flags: u8,
    stream: i16,
    opcode: u8,
    body: Buffer,
    connection: ConnectionHandle,
}

impl Request {
    pub fn from_frame(connection: ConnectionHandle, frame: Frame) -> Self {
        Self {
            id: connection.acquire(),
            version: frame.version,
            flags: frame.flags,
            stream: frame.stream,
            opcode: frame.opcode,
            body: frame.body,
            connection,
        }
    }

    /// Request standing in for a frame whose version was rejected. It
    /// answers on stream 0 using `reply_version`.
    pub fn invalid_protocol(connection: ConnectionHandle, reply_version: u8) -> Self {
        Self {
            id: connection.acquire(),
            version: reply_version,
            flags: 0,
            stream: 0,
            opcode: 0,
            body: Buffer::new(),
            connection,
        }
    }

    pub fn id(&self) -> RequestId {
        self.id
    }

    pub fn version(&self) -> u8 {
        self.version
    }

    pub fn flags(&self) -> u8 {
        self.flags
    }

    pub fn stream(&self) -> i16 {
        self.stream
    }

    pub fn opcode(&self) -> u8 {
        self.opcode
    }

    pub fn body(&self) -> &Buffer {
        &self.body
    }

    pub fn connection(&self) -> &ConnectionHandle {
        &self.connection
    }

    /// Writes a response frame with this request's version and stream.
    pub fn write(&self, opcode: Opcode, body: &[u8]) {
        self.write_on_stream(self.stream, opcode, body);
    }

    /// Writes a response frame on an explicit stream (-1 for events).
    pub fn write_on_stream(&self, stream: i16, opcode: Opcode, body: &[u8]) {
        let mut frame = Buffer::with_size(header_size(self.version) + body.len());
        let pos = encode_header(
            &mut frame,
            0,
            self.version,
            Direction::Response,
            0,
            stream,
            opcode.as_u8(),
            body.len() as u32,
        );
        frame.copy(pos, body);

        tracing::debug!(
            "[{}] Response: {} stream={} ({} bytes)",
            self.connection.id(),
            opcode,
            stream,
            body.len()
        );
        if let Some(metrics) = self.connection.metrics() {
            metrics.record_response(opcode);
        }
        self.connection.write(frame);
    }

    pub fn respond(&self, message: &ResponseMessage) {
        self.write(message.opcode(), &message.encode());
    }

    /// Writes an ERROR response. Messages longer than a `[string]` allows
    /// are cut at the last char boundary that fits.
    pub fn error(&self, code: i32, message: &str) {
        if let Some(metrics) = self.connection.metrics() {
            metrics.record_error(code);
        }
        self.respond(&ResponseMessage::Error {
            code,
            message: clamp_string(message).to_string(),
        });
    }

    pub fn close(&self) {
        self.connection.close();
    }

    /// Parks the request until `timeout` elapses, then resumes the chain at
    /// `continuation`. The request is dropped if the connection closes first.
    pub fn wait(self, timeout: Duration, continuation: Continuation) {
        let connection = self.connection.clone();
        let id = self.id;
        connection.schedule(
            id,
            timeout,
            Box::new(move || continuation.resume(self)),
        );
    }

    /// STARTUP: a string map of options.
    pub fn decode_startup(&self) -> Result<Vec<(String, String)>, ProtocolError> {
        let (options, rest) = codec::decode_string_map(&self.body)?;
        expect_end(rest)?;
        Ok(options)
    }

    /// CREDENTIALS (v1): a string map of credentials.
    pub fn decode_credentials(&self) -> Result<Vec<(String, String)>, ProtocolError> {
        let (credentials, rest) = codec::decode_string_map(&self.body)?;
        expect_end(rest)?;
        Ok(credentials)
    }

    /// AUTH_RESPONSE: a nullable token.
    pub fn decode_auth_response(&self) -> Result<Option<Buffer>, ProtocolError> {
        let (token, rest) = codec::decode_bytes(&self.body)?;
        expect_end(rest)?;
        Ok(token)
    }

    /// REGISTER: the event types to subscribe to.
    pub fn decode_register(&self) -> Result<Vec<String>, ProtocolError> {
        let (events, rest) = codec::decode_string_list(&self.body)?;
        expect_end(rest)?;
        Ok(events)
    }

    /// QUERY: query text followed by query parameters.
    pub fn decode_query(&self) -> Result<(String, QueryParameters), ProtocolError> {
        let (query, rest) = codec::decode_long_string(&self.body)?;
        let (params, rest) = params::decode_query_params(self.version, rest, false)?;
        expect_end(rest)?;
        Ok((query, params))
    }

    /// EXECUTE: prepared id followed by query parameters.
    pub fn decode_execute(&self) -> Result<(Buffer, QueryParameters), ProtocolError> {
        let (id, rest) = codec::decode_short_bytes(&self.body)?;
        let (params, rest) = params::decode_query_params(self.version, rest, true)?;
        expect_end(rest)?;
        Ok((id, params))
    }

    /// PREPARE: query text followed by prepare parameters.
    pub fn decode_prepare(&self) -> Result<(String, PrepareParameters), ProtocolError> {
        let (query, rest) = codec::decode_long_string(&self.body)?;
        let (params, rest) = params::decode_prepare_params(self.version, rest)?;
        expect_end(rest)?;
        Ok((query, params))
    }
}

fn clamp_string(s: &str) -> &str {
    let max = u16::MAX as usize;
    if s.len() <= max {
        return s;
    }
    let mut end = max;
    while !s.is_char_boundary(end) {
        end -= 1;
    }
    &s[..end]
}

impl Drop for Request {
    fn drop(&mut self) {
        self.connection.release(self.id);
    }
}

impl fmt::Debug for Request {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Request")
            .field("id", &self.id)
            .field("version", &self.version)
            .field("stream", &self.stream)
            .field("opcode", &self.opcode)
            .field("body_len", &self.body.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_util::{request, RecordingTransport};
    use cqlmock_protocol::{QueryFlags, RequestMessage, Value};

    #[test]
    fn test_response_uses_request_framing() {
        for (version, stream) in [(1u8, 5i16), (2, 127), (3, 300), (5, -2)] {
            let transport = RecordingTransport::new();
            let req = request(&transport, version, stream, &RequestMessage::Options);
            req.respond(&ResponseMessage::Ready);

            let written = transport.written();
            assert_eq!(written.len(), 1);
            assert_eq!(written[0].len(), header_size(version));
            assert_eq!(written[0][0], 0x80 | version);

            let responses = transport.responses();
            assert_eq!(responses[0].stream, stream);
        }
    }

    #[test]
    fn test_error_message_clamped() {
        let transport = RecordingTransport::new();
        let req = request(&transport, 4, 1, &RequestMessage::Options);
        let message = format!("x{}", "é".repeat(40_000));
        req.error(0x2200, &message);

        let responses = transport.responses();
        assert_eq!(responses.len(), 1);
        match &responses[0].message {
            ResponseMessage::Error { code, message: sent } => {
                assert_eq!(*code, 0x2200);
                assert!(sent.len() <= u16::MAX as usize);
                assert!(message.starts_with(sent.as_str()));
            }
            other => panic!("expected error, got {:?}", other),
        }
    }

    #[test]
    fn test_clamp_string() {
        assert_eq!(clamp_string("short"), "short");
        let long = "a".repeat(70_000);
        assert_eq!(clamp_string(&long).len(), u16::MAX as usize);
    }

    #[test]
    fn test_drop_releases() {
        let transport = RecordingTransport::new();
        let req = request(&transport, 4, 1, &RequestMessage::Options);
        let handle = req.connection().clone();
        assert_eq!(handle.in_flight(), 1);
        drop(req);
        assert_eq!(handle.in_flight(), 0);
    }

    #[test]
    fn test_decode_query() {
        let transport = RecordingTransport::new();
        let params = QueryParameters {
            consistency: 1,
            flags: QueryFlags::new().with(QueryFlags::VALUES),
            values: vec![Value::bytes("a")],
            ..Default::default()
        };
        let req = request(
            &transport,
            4,
            1,
            &RequestMessage::Query {
                query: "SELECT * FROM t".into(),
                params: params.clone(),
            },
        );
        let (query, decoded) = req.decode_query().unwrap();
        assert_eq!(query, "SELECT * FROM t");
        assert_eq!(decoded.values, params.values);
    }

    #[test]
    fn test_decode_rejects_trailing_bytes() {
        let transport = RecordingTransport::new();
        let mut body = RequestMessage::Register {
            event_types: vec!["STATUS_CHANGE".into()],
        }
        .encode(4)
        .unwrap()
        .to_vec();
        body.push(0);

        let req = crate::test_util::raw_request(&transport, 4, 1, Opcode::Register.as_u8(), &body);
        assert!(matches!(
            req.decode_register(),
            Err(ProtocolError::TrailingBytes(1))
        ));
    }

    #[test]
    fn test_decode_auth_response_null_token() {
        let transport = RecordingTransport::new();
        let req = request(
            &transport,
            2,
            1,
            &RequestMessage::AuthResponse { token: None },
        );
        assert_eq!(req.decode_auth_response().unwrap(), None);
    }

    #[test]
    fn test_decode_execute_and_prepare() {
        let transport = RecordingTransport::new();
        let req = request(
            &transport,
            5,
            1,
            &RequestMessage::Execute {
                id: Buffer::from(&b"\x01\x02"[..]),
                params: QueryParameters::default(),
            },
        );
        let (id, _) = req.decode_execute().unwrap();
        assert_eq!(id.as_slice(), &[1, 2]);

        let req = request(
            &transport,
            5,
            2,
            &RequestMessage::Prepare {
                query: "SELECT 1".into(),
                params: PrepareParameters::default(),
            },
        );
        assert_eq!(req.decode_prepare().unwrap().0, "SELECT 1");
    }
}
