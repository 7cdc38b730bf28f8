//! Opcodes and typed message bodies.
//!
//! Requests are encoded by clients and decoded piecewise by the server's
//! request pipeline. Responses are encoded by the server's actions and
//! decoded by clients.

use crate::buffer::Buffer;
use crate::codec::{self, Value};
use crate::error::ProtocolError;
use crate::params::{self, PrepareParameters, QueryParameters};
use std::fmt;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};

/// Frame opcodes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[repr(u8)]
pub enum Opcode {
    Error = 0x00,
    Startup = 0x01,
    Ready = 0x02,
    Authenticate = 0x03,
    Credentials = 0x04,
    Options = 0x05,
    Supported = 0x06,
    Query = 0x07,
    Result = 0x08,
    Prepare = 0x09,
    Execute = 0x0A,
    Register = 0x0B,
    Event = 0x0C,
    Batch = 0x0D,
    AuthChallenge = 0x0E,
    AuthResponse = 0x0F,
    AuthSuccess = 0x10,
}

impl Opcode {
    /// Number of defined opcodes; every opcode value is below this.
    pub const COUNT: usize = 17;

    pub const ALL: [Opcode; Opcode::COUNT] = [
        Opcode::Error,
        Opcode::Startup,
        Opcode::Ready,
        Opcode::Authenticate,
        Opcode::Credentials,
        Opcode::Options,
        Opcode::Supported,
        Opcode::Query,
        Opcode::Result,
        Opcode::Prepare,
        Opcode::Execute,
        Opcode::Register,
        Opcode::Event,
        Opcode::Batch,
        Opcode::AuthChallenge,
        Opcode::AuthResponse,
        Opcode::AuthSuccess,
    ];

    pub fn from_u8(value: u8) -> Option<Self> {
        Self::ALL.get(value as usize).copied()
    }

    pub fn as_u8(self) -> u8 {
        self as u8
    }

    pub fn name(self) -> &'static str {
        match self {
            Opcode::Error => "ERROR",
            Opcode::Startup => "STARTUP",
            Opcode::Ready => "READY",
            Opcode::Authenticate => "AUTHENTICATE",
            Opcode::Credentials => "CREDENTIALS",
            Opcode::Options => "OPTIONS",
            Opcode::Supported => "SUPPORTED",
            Opcode::Query => "QUERY",
            Opcode::Result => "RESULT",
            Opcode::Prepare => "PREPARE",
            Opcode::Execute => "EXECUTE",
            Opcode::Register => "REGISTER",
            Opcode::Event => "EVENT",
            Opcode::Batch => "BATCH",
            Opcode::AuthChallenge => "AUTH_CHALLENGE",
            Opcode::AuthResponse => "AUTH_RESPONSE",
            Opcode::AuthSuccess => "AUTH_SUCCESS",
        }
    }
}

impl fmt::Display for Opcode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// The `<kind>` that starts every RESULT body.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(i32)]
pub enum ResultKind {
    Void = 0x0001,
    Rows = 0x0002,
    SetKeyspace = 0x0003,
    Prepared = 0x0004,
    SchemaChange = 0x0005,
}

impl ResultKind {
    pub fn from_i32(value: i32) -> Option<Self> {
        match value {
            0x0001 => Some(ResultKind::Void),
            0x0002 => Some(ResultKind::Rows),
            0x0003 => Some(ResultKind::SetKeyspace),
            0x0004 => Some(ResultKind::Prepared),
            0x0005 => Some(ResultKind::SchemaChange),
            _ => None,
        }
    }
}

/// Column types that can appear in rows metadata.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DataType {
    Ascii,
    Bigint,
    Blob,
    Boolean,
    Double,
    Int,
    Timestamp,
    Uuid,
    Varchar,
    Inet,
    List(Box<DataType>),
    Set(Box<DataType>),
    Map(Box<DataType>, Box<DataType>),
}

impl DataType {
    pub fn id(&self) -> u16 {
        match self {
            DataType::Ascii => 0x0001,
            DataType::Bigint => 0x0002,
            DataType::Blob => 0x0003,
            DataType::Boolean => 0x0004,
            DataType::Double => 0x0007,
            DataType::Int => 0x0009,
            DataType::Timestamp => 0x000B,
            DataType::Uuid => 0x000C,
            DataType::Varchar => 0x000D,
            DataType::Inet => 0x0010,
            DataType::List(_) => 0x0020,
            DataType::Map(_, _) => 0x0021,
            DataType::Set(_) => 0x0022,
        }
    }

    fn encoded_size(&self) -> usize {
        2 + match self {
            DataType::List(inner) | DataType::Set(inner) => inner.encoded_size(),
            DataType::Map(key, value) => key.encoded_size() + value.encoded_size(),
            _ => 0,
        }
    }

    fn encode(&self, buffer: &mut Buffer, offset: usize) -> usize {
        let pos = buffer.encode_uint16(offset, self.id());
        match self {
            DataType::List(inner) | DataType::Set(inner) => inner.encode(buffer, pos),
            DataType::Map(key, value) => {
                let pos = key.encode(buffer, pos);
                value.encode(buffer, pos)
            }
            _ => pos,
        }
    }

    fn decode(input: &[u8]) -> codec::Decoded<'_, DataType> {
        let (id, rest) = codec::decode_uint16(input)?;
        let simple = match id {
            0x0001 => DataType::Ascii,
            0x0002 => DataType::Bigint,
            0x0003 => DataType::Blob,
            0x0004 => DataType::Boolean,
            0x0007 => DataType::Double,
            0x0009 => DataType::Int,
            0x000B => DataType::Timestamp,
            0x000C => DataType::Uuid,
            0x000D => DataType::Varchar,
            0x0010 => DataType::Inet,
            0x0020 => {
                let (inner, rest) = DataType::decode(rest)?;
                return Ok((DataType::List(Box::new(inner)), rest));
            }
            0x0022 => {
                let (inner, rest) = DataType::decode(rest)?;
                return Ok((DataType::Set(Box::new(inner)), rest));
            }
            0x0021 => {
                let (key, rest) = DataType::decode(rest)?;
                let (value, rest) = DataType::decode(rest)?;
                return Ok((DataType::Map(Box::new(key), Box::new(value)), rest));
            }
            other => return Err(ProtocolError::UnknownDataType(other)),
        };
        Ok((simple, rest))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ColumnSpec {
    pub name: String,
    pub data_type: DataType,
}

/// Flags in the rows metadata.
pub mod rows_flags {
    pub const GLOBAL_TABLES_SPEC: i32 = 0x0001;
    pub const HAS_MORE_PAGES: i32 = 0x0002;
    pub const NO_METADATA: i32 = 0x0004;
}

/// A RESULT of kind ROWS.
///
/// Columns share one global table spec. A result without columns is
/// encoded without a table spec, which is how row counts alone are sent.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RowsResult {
    pub keyspace: String,
    pub table: String,
    pub columns: Vec<ColumnSpec>,
    pub rows: Vec<Vec<Value>>,
    pub paging_state: Option<Buffer>,
}

impl RowsResult {
    pub fn new(keyspace: impl Into<String>, table: impl Into<String>) -> Self {
        Self {
            keyspace: keyspace.into(),
            table: table.into(),
            ..Default::default()
        }
    }

    /// A result with `row_count` rows and no columns.
    pub fn empty(row_count: usize) -> Self {
        Self {
            rows: vec![Vec::new(); row_count],
            ..Default::default()
        }
    }

    pub fn column(mut self, name: impl Into<String>, data_type: DataType) -> Self {
        self.columns.push(ColumnSpec {
            name: name.into(),
            data_type,
        });
        self
    }

    pub fn row(mut self, values: Vec<Value>) -> Self {
        self.rows.push(values);
        self
    }

    fn flags(&self) -> i32 {
        let mut flags = 0;
        if !self.columns.is_empty() {
            flags |= rows_flags::GLOBAL_TABLES_SPEC;
        }
        if self.paging_state.is_some() {
            flags |= rows_flags::HAS_MORE_PAGES;
        }
        flags
    }

    /// Size of the body after the result kind.
    pub fn encoded_size(&self) -> usize {
        let mut size = 4 + 4;
        if let Some(paging_state) = &self.paging_state {
            size += codec::sizeof_bytes(Some(paging_state.as_slice()));
        }
        if !self.columns.is_empty() {
            size += codec::sizeof_string(&self.keyspace) + codec::sizeof_string(&self.table);
            for column in &self.columns {
                size += codec::sizeof_string(&column.name) + column.data_type.encoded_size();
            }
        }
        size += 4;
        for row in &self.rows {
            size += row.iter().map(codec::sizeof_value).sum::<usize>();
        }
        size
    }

    pub fn encode(&self, buffer: &mut Buffer, offset: usize) -> usize {
        let mut pos = buffer.encode_int32(offset, self.flags());
        pos = buffer.encode_int32(pos, self.columns.len() as i32);
        if let Some(paging_state) = &self.paging_state {
            pos = buffer.encode_bytes(pos, Some(paging_state.as_slice()));
        }
        if !self.columns.is_empty() {
            pos = buffer.encode_string(pos, &self.keyspace);
            pos = buffer.encode_string(pos, &self.table);
            for column in &self.columns {
                pos = buffer.encode_string(pos, &column.name);
                pos = column.data_type.encode(buffer, pos);
            }
        }
        pos = buffer.encode_int32(pos, self.rows.len() as i32);
        for row in &self.rows {
            for value in row {
                pos = buffer.encode_value(pos, value);
            }
        }
        pos
    }

    pub fn decode(input: &[u8]) -> codec::Decoded<'_, RowsResult> {
        let mut result = RowsResult::default();
        let (flags, rest) = codec::decode_int32(input)?;
        let (column_count, mut rest) = codec::decode_int32(rest)?;
        if column_count < 0 {
            return Err(ProtocolError::InvalidLength(column_count));
        }

        if flags & rows_flags::HAS_MORE_PAGES != 0 {
            let (paging_state, next) = codec::decode_bytes(rest)?;
            result.paging_state = paging_state;
            rest = next;
        }

        if flags & rows_flags::NO_METADATA == 0 {
            let global = flags & rows_flags::GLOBAL_TABLES_SPEC != 0;
            if global {
                let (keyspace, next) = codec::decode_string(rest)?;
                let (table, next) = codec::decode_string(next)?;
                result.keyspace = keyspace;
                result.table = table;
                rest = next;
            }
            for _ in 0..column_count {
                if !global {
                    let (keyspace, next) = codec::decode_string(rest)?;
                    let (table, next) = codec::decode_string(next)?;
                    result.keyspace = keyspace;
                    result.table = table;
                    rest = next;
                }
                let (name, next) = codec::decode_string(rest)?;
                let (data_type, next) = DataType::decode(next)?;
                result.columns.push(ColumnSpec { name, data_type });
                rest = next;
            }
        }

        let (row_count, mut rest) = codec::decode_int32(rest)?;
        if row_count < 0 {
            return Err(ProtocolError::InvalidLength(row_count));
        }
        for _ in 0..row_count {
            let mut row = Vec::with_capacity(column_count as usize);
            for _ in 0..column_count {
                let (value, next) = codec::decode_value(rest)?;
                row.push(value);
                rest = next;
            }
            result.rows.push(row);
        }
        Ok((result, rest))
    }
}

/// The body of a RESULT frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResultMessage {
    Void,
    Rows(RowsResult),
    SetKeyspace(String),
    /// Statement id followed by the undecoded metadata.
    Prepared { id: Buffer, metadata: Buffer },
    /// Undecoded schema change description.
    SchemaChange(Buffer),
}

impl ResultMessage {
    pub fn kind(&self) -> ResultKind {
        match self {
            ResultMessage::Void => ResultKind::Void,
            ResultMessage::Rows(_) => ResultKind::Rows,
            ResultMessage::SetKeyspace(_) => ResultKind::SetKeyspace,
            ResultMessage::Prepared { .. } => ResultKind::Prepared,
            ResultMessage::SchemaChange(_) => ResultKind::SchemaChange,
        }
    }

    fn encoded_size(&self) -> usize {
        4 + match self {
            ResultMessage::Void => 0,
            ResultMessage::Rows(rows) => rows.encoded_size(),
            ResultMessage::SetKeyspace(keyspace) => codec::sizeof_string(keyspace),
            ResultMessage::Prepared { id, metadata } => {
                codec::sizeof_short_bytes(id) + metadata.len()
            }
            ResultMessage::SchemaChange(change) => change.len(),
        }
    }

    fn encode(&self, buffer: &mut Buffer, offset: usize) -> usize {
        let pos = buffer.encode_int32(offset, self.kind() as i32);
        match self {
            ResultMessage::Void => pos,
            ResultMessage::Rows(rows) => rows.encode(buffer, pos),
            ResultMessage::SetKeyspace(keyspace) => buffer.encode_string(pos, keyspace),
            ResultMessage::Prepared { id, metadata } => {
                let pos = buffer.encode_short_bytes(pos, id);
                buffer.copy(pos, metadata)
            }
            ResultMessage::SchemaChange(change) => buffer.copy(pos, change),
        }
    }

    fn decode(input: &[u8]) -> Result<Self, ProtocolError> {
        let (kind, rest) = codec::decode_int32(input)?;
        match ResultKind::from_i32(kind) {
            Some(ResultKind::Void) => Ok(ResultMessage::Void),
            Some(ResultKind::Rows) => Ok(ResultMessage::Rows(RowsResult::decode(rest)?.0)),
            Some(ResultKind::SetKeyspace) => {
                Ok(ResultMessage::SetKeyspace(codec::decode_string(rest)?.0))
            }
            Some(ResultKind::Prepared) => {
                let (id, rest) = codec::decode_short_bytes(rest)?;
                Ok(ResultMessage::Prepared {
                    id,
                    metadata: Buffer::from_slice(rest),
                })
            }
            Some(ResultKind::SchemaChange) => {
                Ok(ResultMessage::SchemaChange(Buffer::from_slice(rest)))
            }
            None => Err(ProtocolError::UnknownResultKind(kind)),
        }
    }
}

/// The body of an EVENT frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
    /// `UP` or `DOWN`.
    StatusChange { change: String, address: SocketAddr },
    /// `NEW_NODE`, `REMOVED_NODE` or `MOVED_NODE`.
    TopologyChange { change: String, address: SocketAddr },
    /// Any other event type with its undecoded body.
    Other { event_type: String, body: Buffer },
}

impl Event {
    pub fn status_up(address: SocketAddr) -> Self {
        Event::StatusChange {
            change: "UP".to_string(),
            address,
        }
    }

    pub fn status_down(address: SocketAddr) -> Self {
        Event::StatusChange {
            change: "DOWN".to_string(),
            address,
        }
    }
}

fn sizeof_inet(address: &SocketAddr) -> usize {
    let ip = match address.ip() {
        IpAddr::V4(_) => 4,
        IpAddr::V6(_) => 16,
    };
    1 + ip + 4
}

fn encode_inet(buffer: &mut Buffer, offset: usize, address: &SocketAddr) -> usize {
    let pos = match address.ip() {
        IpAddr::V4(ip) => {
            let pos = buffer.encode_byte(offset, 4);
            buffer.copy(pos, &ip.octets())
        }
        IpAddr::V6(ip) => {
            let pos = buffer.encode_byte(offset, 16);
            buffer.copy(pos, &ip.octets())
        }
    };
    buffer.encode_int32(pos, i32::from(address.port()))
}

fn decode_inet(input: &[u8]) -> codec::Decoded<'_, SocketAddr> {
    let (size, rest) = codec::decode_byte(input)?;
    let (ip, rest) = match size {
        4 => {
            let (octets, rest) = codec::decode_array::<4>(rest)?;
            (IpAddr::V4(Ipv4Addr::from(octets)), rest)
        }
        16 => {
            let (octets, rest) = codec::decode_array::<16>(rest)?;
            (IpAddr::V6(Ipv6Addr::from(octets)), rest)
        }
        other => return Err(ProtocolError::InvalidLength(i32::from(other))),
    };
    let (port, rest) = codec::decode_int32(rest)?;
    Ok((SocketAddr::new(ip, port as u16), rest))
}

/// Request bodies, as sent by a client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RequestMessage {
    Startup { options: Vec<(String, String)> },
    Options,
    /// Protocol v1 authentication.
    Credentials { credentials: Vec<(String, String)> },
    Query { query: String, params: QueryParameters },
    Prepare { query: String, params: PrepareParameters },
    Execute { id: Buffer, params: QueryParameters },
    Register { event_types: Vec<String> },
    AuthResponse { token: Option<Buffer> },
}

impl RequestMessage {
    pub fn opcode(&self) -> Opcode {
        match self {
            RequestMessage::Startup { .. } => Opcode::Startup,
            RequestMessage::Options => Opcode::Options,
            RequestMessage::Credentials { .. } => Opcode::Credentials,
            RequestMessage::Query { .. } => Opcode::Query,
            RequestMessage::Prepare { .. } => Opcode::Prepare,
            RequestMessage::Execute { .. } => Opcode::Execute,
            RequestMessage::Register { .. } => Opcode::Register,
            RequestMessage::AuthResponse { .. } => Opcode::AuthResponse,
        }
    }

    /// Encodes the body for `version`.
    pub fn encode(&self, version: u8) -> Result<Buffer, ProtocolError> {
        let size = match self {
            RequestMessage::Startup { options } => codec::sizeof_string_map(options),
            RequestMessage::Options => 0,
            RequestMessage::Credentials { credentials } => codec::sizeof_string_map(credentials),
            RequestMessage::Query { query, params } => {
                codec::sizeof_long_string(query)
                    + params::encoded_query_params_size(version, params, false)?
            }
            RequestMessage::Prepare { query, params } => {
                codec::sizeof_long_string(query)
                    + params::encoded_prepare_params_size(version, params)?
            }
            RequestMessage::Execute { id, params } => {
                codec::sizeof_short_bytes(id)
                    + params::encoded_query_params_size(version, params, true)?
            }
            RequestMessage::Register { event_types } => codec::sizeof_string_list(event_types),
            RequestMessage::AuthResponse { token } => codec::sizeof_bytes(token.as_deref()),
        };

        let mut buffer = Buffer::with_size(size);
        match self {
            RequestMessage::Startup { options } => {
                buffer.encode_string_map(0, options);
            }
            RequestMessage::Options => {}
            RequestMessage::Credentials { credentials } => {
                buffer.encode_string_map(0, credentials);
            }
            RequestMessage::Query { query, params } => {
                let pos = buffer.encode_long_string(0, query);
                params::encode_query_params(version, params, false, &mut buffer, pos)?;
            }
            RequestMessage::Prepare { query, params } => {
                let pos = buffer.encode_long_string(0, query);
                params::encode_prepare_params(version, params, &mut buffer, pos)?;
            }
            RequestMessage::Execute { id, params } => {
                let pos = buffer.encode_short_bytes(0, id);
                params::encode_query_params(version, params, true, &mut buffer, pos)?;
            }
            RequestMessage::Register { event_types } => {
                buffer.encode_string_list(0, event_types);
            }
            RequestMessage::AuthResponse { token } => {
                buffer.encode_bytes(0, token.as_deref());
            }
        }
        Ok(buffer)
    }
}

/// Response bodies, as sent by a server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResponseMessage {
    Error { code: i32, message: String },
    Ready,
    Authenticate { authenticator: String },
    Supported { options: Vec<(String, Vec<String>)> },
    Result(ResultMessage),
    Event(Event),
    AuthChallenge { token: Option<Buffer> },
    AuthSuccess { token: Option<Buffer> },
}

impl ResponseMessage {
    pub fn opcode(&self) -> Opcode {
        match self {
            ResponseMessage::Error { .. } => Opcode::Error,
            ResponseMessage::Ready => Opcode::Ready,
            ResponseMessage::Authenticate { .. } => Opcode::Authenticate,
            ResponseMessage::Supported { .. } => Opcode::Supported,
            ResponseMessage::Result(_) => Opcode::Result,
            ResponseMessage::Event(_) => Opcode::Event,
            ResponseMessage::AuthChallenge { .. } => Opcode::AuthChallenge,
            ResponseMessage::AuthSuccess { .. } => Opcode::AuthSuccess,
        }
    }

    fn encoded_size(&self) -> usize {
        match self {
            ResponseMessage::Error { message, .. } => 4 + codec::sizeof_string(message),
            ResponseMessage::Ready => 0,
            ResponseMessage::Authenticate { authenticator } => codec::sizeof_string(authenticator),
            ResponseMessage::Supported { options } => codec::sizeof_string_multimap(options),
            ResponseMessage::Result(result) => result.encoded_size(),
            ResponseMessage::Event(event) => match event {
                Event::StatusChange { change, address } => {
                    codec::sizeof_string("STATUS_CHANGE")
                        + codec::sizeof_string(change)
                        + sizeof_inet(address)
                }
                Event::TopologyChange { change, address } => {
                    codec::sizeof_string("TOPOLOGY_CHANGE")
                        + codec::sizeof_string(change)
                        + sizeof_inet(address)
                }
                Event::Other { event_type, body } => codec::sizeof_string(event_type) + body.len(),
            },
            ResponseMessage::AuthChallenge { token } | ResponseMessage::AuthSuccess { token } => {
                codec::sizeof_bytes(token.as_deref())
            }
        }
    }

    /// Encodes the body into a buffer of exactly the right size.
    pub fn encode(&self) -> Buffer {
        let mut buffer = Buffer::with_size(self.encoded_size());
        match self {
            ResponseMessage::Error { code, message } => {
                let pos = buffer.encode_int32(0, *code);
                buffer.encode_string(pos, message);
            }
            ResponseMessage::Ready => {}
            ResponseMessage::Authenticate { authenticator } => {
                buffer.encode_string(0, authenticator);
            }
            ResponseMessage::Supported { options } => {
                buffer.encode_string_multimap(0, options);
            }
            ResponseMessage::Result(result) => {
                result.encode(&mut buffer, 0);
            }
            ResponseMessage::Event(event) => match event {
                Event::StatusChange { change, address } => {
                    let pos = buffer.encode_string(0, "STATUS_CHANGE");
                    let pos = buffer.encode_string(pos, change);
                    encode_inet(&mut buffer, pos, address);
                }
                Event::TopologyChange { change, address } => {
                    let pos = buffer.encode_string(0, "TOPOLOGY_CHANGE");
                    let pos = buffer.encode_string(pos, change);
                    encode_inet(&mut buffer, pos, address);
                }
                Event::Other { event_type, body } => {
                    let pos = buffer.encode_string(0, event_type);
                    buffer.copy(pos, body);
                }
            },
            ResponseMessage::AuthChallenge { token } | ResponseMessage::AuthSuccess { token } => {
                buffer.encode_bytes(0, token.as_deref());
            }
        }
        buffer
    }

    /// Decodes a response body. Trailing bytes are tolerated, since servers
    /// append code-specific details to some error bodies.
    pub fn decode(opcode: u8, body: &[u8]) -> Result<Self, ProtocolError> {
        let opcode = Opcode::from_u8(opcode).ok_or(ProtocolError::UnknownOpcode(opcode))?;
        match opcode {
            Opcode::Error => {
                let (code, rest) = codec::decode_int32(body)?;
                let (message, _) = codec::decode_string(rest)?;
                Ok(ResponseMessage::Error { code, message })
            }
            Opcode::Ready => Ok(ResponseMessage::Ready),
            Opcode::Authenticate => Ok(ResponseMessage::Authenticate {
                authenticator: codec::decode_string(body)?.0,
            }),
            Opcode::Supported => Ok(ResponseMessage::Supported {
                options: codec::decode_string_multimap(body)?.0,
            }),
            Opcode::Result => Ok(ResponseMessage::Result(ResultMessage::decode(body)?)),
            Opcode::Event => {
                let (event_type, rest) = codec::decode_string(body)?;
                let event = match event_type.as_str() {
                    "STATUS_CHANGE" => {
                        let (change, rest) = codec::decode_string(rest)?;
                        let (address, _) = decode_inet(rest)?;
                        Event::StatusChange { change, address }
                    }
                    "TOPOLOGY_CHANGE" => {
                        let (change, rest) = codec::decode_string(rest)?;
                        let (address, _) = decode_inet(rest)?;
                        Event::TopologyChange { change, address }
                    }
                    _ => Event::Other {
                        event_type,
                        body: Buffer::from_slice(rest),
                    },
                };
                Ok(ResponseMessage::Event(event))
            }
            Opcode::AuthChallenge => Ok(ResponseMessage::AuthChallenge {
                token: codec::decode_bytes(body)?.0,
            }),
            Opcode::AuthSuccess => Ok(ResponseMessage::AuthSuccess {
                token: codec::decode_bytes(body)?.0,
            }),
            other => Err(ProtocolError::UnexpectedOpcode {
                actual: other.as_u8(),
                context: "response",
            }),
        }
    }
}
