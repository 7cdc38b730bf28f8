//! # cqlmock-protocol
//!
//! Wire protocol implementation for the CQL native protocol, versions 1 to 5.
//!
//! This crate provides:
//! - `Buffer`, a byte container with inline storage for small values
//! - Primitive codec for the protocol's integers, strings, bytes and collections
//! - Version-aware codec for query, execute and prepare parameters
//! - An incremental frame decoder that tolerates arbitrary read boundaries
//! - Opcodes, error codes and typed request/response bodies

pub mod buffer;
pub mod codec;
pub mod error;
pub mod frame;
pub mod message;
pub mod params;

pub use buffer::Buffer;
pub use codec::Value;
pub use error::{ErrorCode, ProtocolError};
pub use frame::{header_size, Direction, Frame, FrameDecoder, FrameEvent};
pub use message::{
    ColumnSpec, DataType, Event, Opcode, RequestMessage, ResponseMessage, ResultKind, ResultMessage,
    RowsResult,
};
pub use params::{PrepareParameters, QueryFlags, QueryParameters};

/// Lowest protocol version accepted by default.
pub const LOWEST_SUPPORTED_VERSION: u8 = 1;

/// Highest protocol version accepted by default.
pub const HIGHEST_SUPPORTED_VERSION: u8 = 5;

/// Largest frame body a decoder accepts by default.
pub const MAX_BODY_SIZE: usize = 256 * 1024 * 1024;

/// Default port for CQL servers.
pub const DEFAULT_PORT: u16 = 9042;
