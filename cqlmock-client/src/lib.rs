//! # cqlmock-client
//!
//! Minimal client for the CQL native protocol, used to drive cqlmock nodes.
//!
//! This crate provides:
//! - Async TCP connection with the STARTUP and PLAIN authentication handshake
//! - Stream id allocation and concurrent in-flight requests
//! - High-level API for query, prepare, execute, register and options

pub mod client;
pub mod connection;
pub mod error;

pub use client::Client;
pub use connection::{Connection, ConnectionConfig};
pub use error::ClientError;
