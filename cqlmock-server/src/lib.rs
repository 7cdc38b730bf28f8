//! # cqlmock-server
//!
//! Mock CQL server.
//!
//! This crate provides:
//! - Requests and composable action chains that answer them
//! - A request handler keyed by opcode, with simple and authenticating presets
//! - A per-connection engine that tolerates arbitrary read boundaries
//! - Per-connection timers for delayed responses
//! - A tokio TCP server with optional TLS, and multi-node clusters
//! - YAML/env configuration and Prometheus metrics

pub mod action;
pub mod cluster;
pub mod config;
pub mod connection;
pub mod error;
pub mod handler;
pub mod metrics;
pub mod request;
pub mod server;
pub mod stream;
pub mod timer;
pub mod tls;

#[cfg(test)]
mod test_util;

pub use action::{Action, ActionBuilder, ActionNode, Continuation, Next};
pub use cluster::{AddressGenerator, Cluster, Ipv4AddressGenerator};
pub use config::{AuthConfig, Config, ConfigError, MetricsConfig, NetworkConfig, ProtocolConfig, TlsConfig};
pub use connection::{ClientConnection, ConnectionHandle, ConnectionOptions, Transport};
pub use error::ServerError;
pub use handler::{RequestHandler, RequestHandlerBuilder};
pub use metrics::Metrics;
pub use request::Request;
pub use server::{Server, ServerConfig};
pub use timer::{TimerQueue, TimerService};
