//! Request dispatch.

use crate::action::{run_node, ActionBuilder, ActionNode, ChainKey};
use crate::request::Request;
use cqlmock_protocol::{ErrorCode, Opcode};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

/// Authenticator class name announced by [`RequestHandlerBuilder::with_auth`].
pub const PASSWORD_AUTHENTICATOR: &str = "org.apache.cassandra.auth.PasswordAuthenticator";

/// Immutable set of action chains, one per opcode.
pub struct RequestHandler {
    chains: HashMap<u8, ActionNode>,
    invalid_protocol: Option<ActionNode>,
    invalid_opcode: Option<ActionNode>,
}

impl RequestHandler {
    /// Head of the chain for `key`.
    pub fn chain(&self, key: ChainKey) -> Option<&ActionNode> {
        match key {
            ChainKey::Opcode(opcode) => self.chains.get(&opcode),
            ChainKey::InvalidProtocol => self.invalid_protocol.as_ref(),
            ChainKey::InvalidOpcode => self.invalid_opcode.as_ref(),
        }
    }

    /// Runs the chain for the request's opcode. Opcodes without a chain
    /// (including unknown ones) take the invalid-opcode chain.
    pub fn run(self: &Arc<Self>, request: Request) {
        let key = if self.chains.contains_key(&request.opcode()) {
            ChainKey::Opcode(request.opcode())
        } else {
            tracing::debug!(
                "[{}] No chain for opcode {:#04x}",
                request.connection().id(),
                request.opcode()
            );
            ChainKey::InvalidOpcode
        };
        self.run_chain(key, request);
    }

    /// Runs the invalid-protocol chain.
    pub fn invalid_protocol(self: &Arc<Self>, request: Request) {
        self.run_chain(ChainKey::InvalidProtocol, request);
    }

    fn run_chain(self: &Arc<Self>, key: ChainKey, request: Request) {
        match self.chain(key) {
            Some(head) => run_node(self, key, 0, head, request),
            None => drop(request),
        }
    }
}

impl fmt::Debug for RequestHandler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut opcodes: Vec<_> = self.chains.keys().copied().collect();
        opcodes.sort_unstable();
        f.debug_struct("RequestHandler")
            .field("opcodes", &opcodes)
            .finish()
    }
}

/// Builds a [`RequestHandler`].
#[derive(Debug)]
pub struct RequestHandlerBuilder {
    chains: HashMap<Opcode, ActionBuilder>,
    invalid_protocol: ActionBuilder,
    invalid_opcode: ActionBuilder,
}

impl Default for RequestHandlerBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl RequestHandlerBuilder {
    /// Empty handler: every opcode falls through to the invalid-opcode chain.
    pub fn new() -> Self {
        let mut invalid_protocol = ActionBuilder::new();
        invalid_protocol.error(ErrorCode::Protocol, "Invalid or unsupported protocol version");
        let mut invalid_opcode = ActionBuilder::new();
        invalid_opcode.error(ErrorCode::Protocol, "Invalid opcode (or not implemented)");
        Self {
            chains: HashMap::new(),
            invalid_protocol,
            invalid_opcode,
        }
    }

    /// Handler that accepts a driver without authentication.
    pub fn simple() -> Self {
        let mut builder = Self::new();
        builder.on(Opcode::Startup).validate_startup().ready();
        builder.on(Opcode::Options).supported();
        builder.on(Opcode::Register).validate_register().ready();
        builder.on(Opcode::Credentials).validate_credentials().ready();
        builder
            .on(Opcode::AuthResponse)
            .validate_auth_response()
            .auth_success("");
        builder.on(Opcode::Query).validate_query().void_result();
        builder
    }

    /// Like [`simple`](Self::simple), but STARTUP demands password
    /// authentication with the given credentials.
    pub fn with_auth(username: impl Into<String>, password: impl Into<String>) -> Self {
        let mut builder = Self::simple();
        builder
            .on(Opcode::Startup)
            .validate_startup()
            .authenticate(PASSWORD_AUTHENTICATOR);
        builder
            .on(Opcode::AuthResponse)
            .plaintext_auth(username, password);
        builder
    }

    /// Replaces the chain for `opcode` and returns its builder.
    pub fn on(&mut self, opcode: Opcode) -> &mut ActionBuilder {
        let builder = self.chains.entry(opcode).or_default();
        builder.clear();
        builder
    }

    /// Chain run when a frame carries an unsupported version. Not cleared.
    pub fn on_invalid_protocol(&mut self) -> &mut ActionBuilder {
        &mut self.invalid_protocol
    }

    /// Chain run for opcodes with no chain. Not cleared.
    pub fn on_invalid_opcode(&mut self) -> &mut ActionBuilder {
        &mut self.invalid_opcode
    }

    /// Builds the handler, consuming the configured chains.
    pub fn build(&mut self) -> Arc<RequestHandler> {
        let chains = self
            .chains
            .drain()
            .filter_map(|(opcode, mut builder)| builder.build().map(|node| (opcode.as_u8(), node)))
            .collect();
        Arc::new(RequestHandler {
            chains,
            invalid_protocol: self.invalid_protocol.build(),
            invalid_opcode: self.invalid_opcode.build(),
        })
    }
}
