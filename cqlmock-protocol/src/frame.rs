//! Frame format and the incremental frame decoder.
//!
//! Frame layout (8 byte header for v1/v2, 9 byte header for v3 and later):
//!
//! ```text
//! +---------+-------+-----------------+--------+-----------+
//! | version | flags | stream          | opcode | length    |
//! | 1 byte  | 1 byte| 1 byte (v1, v2) | 1 byte | 4 bytes   |
//! |         |       | 2 bytes (v3+)   |        |           |
//! +---------+-------+-----------------+--------+-----------+
//! | body                                                   |
//! | length bytes                                           |
//! +--------------------------------------------------------+
//! ```
//!
//! The top bit of the version byte marks the direction: set for responses,
//! clear for requests.

use crate::buffer::Buffer;
use crate::error::ProtocolError;
use crate::message::Opcode;
use crate::{HIGHEST_SUPPORTED_VERSION, LOWEST_SUPPORTED_VERSION, MAX_BODY_SIZE};
use bytes::{Buf, BytesMut};

/// Header size for protocol v1 and v2.
pub const HEADER_SIZE_V1: usize = 8;

/// Header size for protocol v3 and later.
pub const HEADER_SIZE_V3: usize = 9;

/// Direction bit of the version byte.
pub const RESPONSE_BIT: u8 = 0x80;

/// Returns the full header size, version byte included.
pub fn header_size(version: u8) -> usize {
    if version >= 3 {
        HEADER_SIZE_V3
    } else {
        HEADER_SIZE_V1
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Request,
    Response,
}

/// A complete protocol frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub version: u8,
    pub direction: Direction,
    pub flags: u8,
    /// One unsigned byte on the wire for v1/v2, two signed bytes after.
    pub stream: i16,
    pub opcode: u8,
    pub body: Buffer,
}

impl Frame {
    pub fn request(version: u8, stream: i16, opcode: Opcode, body: Buffer) -> Self {
        Self {
            version,
            direction: Direction::Request,
            flags: 0,
            stream,
            opcode: opcode.as_u8(),
            body,
        }
    }

    pub fn response(version: u8, stream: i16, opcode: Opcode, body: Buffer) -> Self {
        Self {
            version,
            direction: Direction::Response,
            flags: 0,
            stream,
            opcode: opcode.as_u8(),
            body,
        }
    }

    pub fn encoded_len(&self) -> usize {
        header_size(self.version) + self.body.len()
    }

    /// Encodes header and body into one buffer.
    pub fn encode(&self) -> Result<Buffer, ProtocolError> {
        if self.version == 0 || self.version & RESPONSE_BIT != 0 {
            return Err(ProtocolError::UnsupportedVersion(self.version));
        }
        if self.body.len() > i32::MAX as usize {
            return Err(ProtocolError::TooLarge {
                size: self.body.len(),
                max: i32::MAX as usize,
            });
        }

        let mut buffer = Buffer::with_size(self.encoded_len());
        let pos = encode_header(
            &mut buffer,
            0,
            self.version,
            self.direction,
            self.flags,
            self.stream,
            self.opcode,
            self.body.len() as u32,
        );
        buffer.copy(pos, &self.body);
        Ok(buffer)
    }
}

/// Writes a frame header at `offset` and returns the offset of the body.
#[allow(clippy::too_many_arguments)]
pub fn encode_header(
    buffer: &mut Buffer,
    offset: usize,
    version: u8,
    direction: Direction,
    flags: u8,
    stream: i16,
    opcode: u8,
    length: u32,
) -> usize {
    let version_byte = match direction {
        Direction::Request => version,
        Direction::Response => version | RESPONSE_BIT,
    };
    let mut pos = buffer.encode_byte(offset, version_byte);
    pos = buffer.encode_byte(pos, flags);
    pos = if version >= 3 {
        buffer.encode_int16(pos, stream)
    } else {
        buffer.encode_byte(pos, stream as u8)
    };
    pos = buffer.encode_byte(pos, opcode);
    buffer.encode_uint32(pos, length)
}

/// Output of [`FrameDecoder::decode`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FrameEvent {
    Frame(Frame),
    /// The version byte was outside the accepted range. Replies should be
    /// framed with `reply_version`.
    InvalidVersion { received: u8, reply_version: u8 },
    /// The header declared a body above the decoder's limit. Everything
    /// buffered was dropped.
    TooLarge {
        version: u8,
        stream: i16,
        size: usize,
        max: usize,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    ExpectVersion,
    ExpectHeader,
    ExpectBody,
}

/// Incremental frame decoder.
///
/// Bytes can arrive split at any point; frames come out the same either way.
#[derive(Debug)]
pub struct FrameDecoder {
    buffer: BytesMut,
    state: State,
    lowest_version: u8,
    highest_version: u8,
    max_body_size: usize,
    version: u8,
    direction: Direction,
    flags: u8,
    stream: i16,
    opcode: u8,
    length: usize,
}

impl FrameDecoder {
    pub fn new() -> Self {
        Self::with_versions(LOWEST_SUPPORTED_VERSION, HIGHEST_SUPPORTED_VERSION)
    }

    /// Accepts only versions within `lowest..=highest`.
    pub fn with_versions(lowest: u8, highest: u8) -> Self {
        Self {
            buffer: BytesMut::with_capacity(8192),
            state: State::ExpectVersion,
            lowest_version: lowest,
            highest_version: highest,
            max_body_size: MAX_BODY_SIZE,
            version: 0,
            direction: Direction::Request,
            flags: 0,
            stream: 0,
            opcode: 0,
            length: 0,
        }
    }

    /// Rejects frames whose declared body is longer than `max` bytes.
    pub fn with_max_body_size(mut self, max: usize) -> Self {
        self.max_body_size = max;
        self
    }

    pub fn highest_version(&self) -> u8 {
        self.highest_version
    }

    pub fn max_body_size(&self) -> usize {
        self.max_body_size
    }

    /// Appends `data` and hands every event it completes to `sink`.
    ///
    /// Processing stops when more bytes are needed, right after an invalid
    /// version byte, or after an oversized header. Returns the number of bytes consumed by this
    /// call, which may include bytes buffered by earlier calls.
    pub fn decode<F>(&mut self, data: &[u8], mut sink: F) -> usize
    where
        F: FnMut(FrameEvent),
    {
        self.buffer.extend_from_slice(data);
        let mut consumed = 0;

        loop {
            match self.state {
                State::ExpectVersion => {
                    if self.buffer.is_empty() {
                        break;
                    }
                    let byte = self.buffer.get_u8();
                    consumed += 1;

                    let version = byte & !RESPONSE_BIT;
                    if version < self.lowest_version || version > self.highest_version {
                        sink(FrameEvent::InvalidVersion {
                            received: version,
                            reply_version: self.highest_version,
                        });
                        break;
                    }
                    self.version = version;
                    self.direction = if byte & RESPONSE_BIT != 0 {
                        Direction::Response
                    } else {
                        Direction::Request
                    };
                    self.state = State::ExpectHeader;
                }
                State::ExpectHeader => {
                    let needed = header_size(self.version) - 1;
                    if self.buffer.len() < needed {
                        break;
                    }
                    self.flags = self.buffer.get_u8();
                    self.stream = if self.version >= 3 {
                        self.buffer.get_i16()
                    } else {
                        i16::from(self.buffer.get_u8())
                    };
                    self.opcode = self.buffer.get_u8();
                    self.length = self.buffer.get_u32() as usize;
                    consumed += needed;
                    if self.length > self.max_body_size {
                        let event = FrameEvent::TooLarge {
                            version: self.version,
                            stream: self.stream,
                            size: self.length,
                            max: self.max_body_size,
                        };
                        consumed += self.buffer.len();
                        self.clear();
                        sink(event);
                        break;
                    }
                    self.state = State::ExpectBody;
                }
                State::ExpectBody => {
                    if self.buffer.len() < self.length {
                        break;
                    }
                    let body = self.buffer.split_to(self.length);
                    consumed += self.length;

                    let frame = Frame {
                        version: self.version,
                        direction: self.direction,
                        flags: self.flags,
                        stream: self.stream,
                        opcode: self.opcode,
                        body: Buffer::from_slice(&body),
                    };
                    self.reset_header();
                    sink(FrameEvent::Frame(frame));
                }
            }
        }

        consumed
    }

    /// Like [`decode`](Self::decode), collecting the events.
    pub fn decode_all(&mut self, data: &[u8]) -> Vec<FrameEvent> {
        let mut events = Vec::new();
        self.decode(data, |event| events.push(event));
        events
    }

    fn reset_header(&mut self) {
        self.version = 0;
        self.direction = Direction::Request;
        self.flags = 0;
        self.stream = 0;
        self.opcode = 0;
        self.length = 0;
        self.state = State::ExpectVersion;
    }

    /// Returns the number of bytes buffered but not yet consumed.
    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }

    /// Drops buffered bytes and any partially read header.
    pub fn clear(&mut self) {
        self.buffer.clear();
        self.reset_header();
    }
}

impl Default for FrameDecoder {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn frames(events: Vec<FrameEvent>) -> Vec<Frame> {
        events
            .into_iter()
            .map(|event| match event {
                FrameEvent::Frame(frame) => frame,
                other => panic!("unexpected event: {:?}", other),
            })
            .collect()
    }

    #[test]
    fn test_frame_roundtrip() {
        let frame = Frame::request(4, 7, Opcode::Query, Buffer::from_slice(b"body"));
        let encoded = frame.encode().unwrap();
        assert_eq!(encoded.len(), HEADER_SIZE_V3 + 4);

        let mut decoder = FrameDecoder::new();
        let decoded = frames(decoder.decode_all(&encoded));
        assert_eq!(decoded, vec![frame]);
        assert_eq!(decoder.buffered(), 0);
    }

    #[test]
    fn test_header_size_by_version() {
        for version in 1..=5u8 {
            let frame = Frame::response(version, 1, Opcode::Ready, Buffer::new());
            let encoded = frame.encode().unwrap();
            let expected = if version <= 2 { 8 } else { 9 };
            assert_eq!(encoded.len(), expected);
            assert_eq!(encoded[0], 0x80 | version);
        }
    }

    #[test]
    fn test_v2_stream_is_one_unsigned_byte() {
        let mut decoder = FrameDecoder::new();
        let decoded = frames(decoder.decode_all(&[0x02, 0x00, 0xff, 0x05, 0, 0, 0, 0]));
        assert_eq!(decoded[0].stream, 255);
        assert_eq!(decoded[0].opcode, Opcode::Options.as_u8());
    }

    #[test]
    fn test_v4_stream_is_signed() {
        let mut decoder = FrameDecoder::new();
        let decoded = frames(decoder.decode_all(&[0x84, 0x00, 0xff, 0xff, 0x0c, 0, 0, 0, 0]));
        assert_eq!(decoded[0].stream, -1);
        assert_eq!(decoded[0].direction, Direction::Response);
    }

    #[test]
    fn test_version_boundaries() {
        for version in [0u8, 6] {
            let mut decoder = FrameDecoder::new();
            let events = decoder.decode_all(&[version, 0, 0, 0, 1, 0, 0, 0, 0]);
            assert_eq!(
                events,
                vec![FrameEvent::InvalidVersion {
                    received: version,
                    reply_version: 5
                }]
            );
        }
        for version in [1u8, 5] {
            let frame = Frame::request(version, 0, Opcode::Options, Buffer::new());
            let mut decoder = FrameDecoder::new();
            let events = decoder.decode_all(&frame.encode().unwrap());
            assert_eq!(events, vec![FrameEvent::Frame(frame)]);
        }
    }

    #[test]
    fn test_restricted_version_range() {
        let mut decoder = FrameDecoder::with_versions(3, 4);
        let events = decoder.decode_all(&[0x05]);
        assert_eq!(
            events,
            vec![FrameEvent::InvalidVersion {
                received: 5,
                reply_version: 4
            }]
        );
    }

    #[test]
    fn test_invalid_version_stops_pass() {
        let valid = Frame::request(4, 1, Opcode::Options, Buffer::new())
            .encode()
            .unwrap();
        let mut input = vec![0x07];
        input.extend_from_slice(&valid);

        let mut decoder = FrameDecoder::new();
        let mut events = Vec::new();
        let consumed = decoder.decode(&input, |event| events.push(event));
        assert_eq!(consumed, 1);
        assert_eq!(events.len(), 1);
        assert_eq!(decoder.buffered(), valid.len());

        // The next read resumes with the bytes left behind.
        let events = decoder.decode_all(&[]);
        assert_eq!(frames(events).len(), 1);
    }

    #[test]
    fn test_oversized_body_rejected() {
        let mut decoder = FrameDecoder::new().with_max_body_size(16);
        let mut input = vec![0x04, 0, 0x00, 0x09, Opcode::Query.as_u8()];
        input.extend_from_slice(&17u32.to_be_bytes());
        input.extend_from_slice(&[0xab; 10]);

        let mut events = Vec::new();
        let consumed = decoder.decode(&input, |event| events.push(event));
        assert_eq!(
            events,
            vec![FrameEvent::TooLarge {
                version: 4,
                stream: 9,
                size: 17,
                max: 16
            }]
        );
        assert_eq!(consumed, input.len());
        assert_eq!(decoder.buffered(), 0);

        // A body at the limit still decodes.
        let frame = Frame::request(4, 2, Opcode::Query, Buffer::from_slice(&[1; 16]));
        let events = decoder.decode_all(&frame.encode().unwrap());
        assert_eq!(events, vec![FrameEvent::Frame(frame)]);
    }

    #[test]
    fn test_default_max_body_size() {
        assert_eq!(FrameDecoder::new().max_body_size(), MAX_BODY_SIZE);
    }

    #[test]
    fn test_incomplete_frame() {
        let frame = Frame::request(3, 2, Opcode::Query, Buffer::from_slice(&[1; 40]));
        let encoded = frame.encode().unwrap();

        let mut decoder = FrameDecoder::new();
        assert!(decoder.decode_all(&encoded[..5]).is_empty());
        assert!(decoder.decode_all(&encoded[5..20]).is_empty());
        let decoded = frames(decoder.decode_all(&encoded[20..]));
        assert_eq!(decoded, vec![frame]);
    }

    #[test]
    fn test_multiple_frames_in_buffer() {
        let first = Frame::request(4, 1, Opcode::Startup, Buffer::from_slice(b"a"));
        let second = Frame::request(4, 2, Opcode::Options, Buffer::new());
        let mut input = first.encode().unwrap().to_vec();
        input.extend_from_slice(&second.encode().unwrap());

        let mut decoder = FrameDecoder::new();
        let decoded = frames(decoder.decode_all(&input));
        assert_eq!(decoded, vec![first, second]);
    }

    #[test]
    fn test_clear_resets_partial_header() {
        let mut decoder = FrameDecoder::new();
        decoder.decode_all(&[0x04, 0x00]);
        decoder.clear();
        assert_eq!(decoder.buffered(), 0);

        let frame = Frame::request(2, 3, Opcode::Options, Buffer::new());
        let decoded = frames(decoder.decode_all(&frame.encode().unwrap()));
        assert_eq!(decoded, vec![frame]);
    }

    #[test]
    fn test_encode_rejects_bad_version() {
        let frame = Frame::request(0, 0, Opcode::Options, Buffer::new());
        assert!(matches!(
            frame.encode(),
            Err(ProtocolError::UnsupportedVersion(0))
        ));
    }

    fn arb_frame() -> impl Strategy<Value = Frame> {
        (1u8..=5, any::<bool>(), any::<u8>(), 0u8..=0x10, any::<i16>())
            .prop_flat_map(|(version, response, flags, opcode, stream)| {
                let stream = if version <= 2 {
                    (stream as u16 % 256) as i16
                } else {
                    stream
                };
                proptest::collection::vec(any::<u8>(), 0..64).prop_map(move |body| Frame {
                    version,
                    direction: if response {
                        Direction::Response
                    } else {
                        Direction::Request
                    },
                    flags,
                    stream,
                    opcode,
                    body: Buffer::from(body),
                })
            })
    }

    proptest! {
        #[test]
        fn test_chunking_invariance(
            input in proptest::collection::vec(arb_frame(), 1..6),
            splits in proptest::collection::vec(any::<proptest::sample::Index>(), 0..8),
        ) {
            let mut bytes = Vec::new();
            for frame in &input {
                bytes.extend_from_slice(&frame.encode().unwrap());
            }

            let mut whole = FrameDecoder::new();
            let at_once = frames(whole.decode_all(&bytes));
            prop_assert_eq!(&at_once, &input);

            let mut cuts: Vec<usize> = splits.iter().map(|i| i.index(bytes.len() + 1)).collect();
            cuts.push(0);
            cuts.push(bytes.len());
            cuts.sort_unstable();

            let mut chunked = FrameDecoder::new();
            let mut events = Vec::new();
            for window in cuts.windows(2) {
                events.extend(chunked.decode_all(&bytes[window[0]..window[1]]));
            }
            prop_assert_eq!(frames(events), input);
            prop_assert_eq!(chunked.buffered(), 0);
        }

        #[test]
        fn test_byte_at_a_time(frame in arb_frame()) {
            let bytes = frame.encode().unwrap();
            let mut decoder = FrameDecoder::new();
            let mut events = Vec::new();
            for byte in bytes.iter() {
                events.extend(decoder.decode_all(std::slice::from_ref(byte)));
            }
            prop_assert_eq!(frames(events), vec![frame]);
        }
    }
}
