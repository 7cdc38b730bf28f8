//! Action chains.
//!
//! Each opcode maps to a singly linked chain of [`Action`]s. A request enters
//! at the head; every action either finishes it (returning it so it is
//! released), forwards it with [`Next::run`], or parks it behind a timer with
//! [`Request::wait`].

use crate::handler::RequestHandler;
use crate::request::Request;
use cqlmock_protocol::{
    Buffer, ErrorCode, Event, Opcode, ResponseMessage, ResultMessage, RowsResult,
};
use std::fmt;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

/// One step of a chain.
pub trait Action: fmt::Debug + Send + Sync {
    /// Handles the request. Return `Some(request)` when done with it; return
    /// `None` after handing it to `next` or to a timer.
    fn on_run(&self, request: Request, next: Next<'_>) -> Option<Request>;
}

/// Identifies a chain within a [`RequestHandler`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ChainKey {
    Opcode(u8),
    InvalidProtocol,
    InvalidOpcode,
}

/// A node of an action chain.
#[derive(Debug)]
pub struct ActionNode {
    action: Box<dyn Action>,
    next: Option<Box<ActionNode>>,
}

impl ActionNode {
    pub fn new(action: Box<dyn Action>, next: Option<Box<ActionNode>>) -> Self {
        Self { action, next }
    }

    pub fn action(&self) -> &dyn Action {
        self.action.as_ref()
    }

    pub fn next(&self) -> Option<&ActionNode> {
        self.next.as_deref()
    }

    /// Number of nodes from here to the tail.
    pub fn len(&self) -> usize {
        let mut len = 1;
        let mut node = self.next();
        while let Some(n) = node {
            len += 1;
            node = n.next();
        }
        len
    }

    /// Node `depth` steps down the chain.
    pub fn nth(&self, depth: usize) -> Option<&ActionNode> {
        let mut node = Some(self);
        for _ in 0..depth {
            node = node?.next();
        }
        node
    }
}

/// Runs `node` (at `depth` in `chain`) and everything it forwards to.
pub(crate) fn run_node(
    handler: &Arc<RequestHandler>,
    chain: ChainKey,
    depth: usize,
    node: &ActionNode,
    request: Request,
) {
    let next = Next {
        node: node.next(),
        handler,
        chain,
        depth: depth + 1,
    };
    // A returned request is released here.
    drop(node.action.on_run(request, next));
}

/// The rest of the chain after the running action.
pub struct Next<'a> {
    node: Option<&'a ActionNode>,
    handler: &'a Arc<RequestHandler>,
    chain: ChainKey,
    depth: usize,
}

impl<'a> Next<'a> {
    /// Forwards the request. With nothing left in the chain the request is
    /// released without a response.
    pub fn run(self, request: Request) {
        match self.node {
            Some(node) => run_node(self.handler, self.chain, self.depth, node, request),
            None => {
                tracing::debug!("End of chain {:?} for request {}", self.chain, request.id());
            }
        }
    }

    pub fn is_end(&self) -> bool {
        self.node.is_none()
    }

    /// An owned position in the chain, for resuming later.
    pub fn continuation(&self) -> Continuation {
        Continuation {
            handler: self.handler.clone(),
            chain: self.chain,
            depth: self.depth,
        }
    }
}

/// Owned pointer back into a chain, used to resume after a wait.
#[derive(Clone)]
pub struct Continuation {
    handler: Arc<RequestHandler>,
    chain: ChainKey,
    depth: usize,
}

impl Continuation {
    /// Runs the rest of the chain, or releases the request if nothing is left.
    pub fn resume(self, request: Request) {
        match self.handler.chain(self.chain).and_then(|head| head.nth(self.depth)) {
            Some(node) => run_node(&self.handler, self.chain, self.depth, node, request),
            None => drop(request),
        }
    }
}

impl fmt::Debug for Continuation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Continuation")
            .field("chain", &self.chain)
            .field("depth", &self.depth)
            .finish()
    }
}

#[derive(Debug)]
pub struct Nop;

impl Action for Nop {
    fn on_run(&self, request: Request, _next: Next<'_>) -> Option<Request> {
        Some(request)
    }
}

/// Delays the rest of the chain.
#[derive(Debug)]
pub struct Wait {
    pub timeout: Duration,
}

impl Action for Wait {
    fn on_run(&self, request: Request, next: Next<'_>) -> Option<Request> {
        request.wait(self.timeout, next.continuation());
        None
    }
}

#[derive(Debug)]
pub struct Close;

impl Action for Close {
    fn on_run(&self, request: Request, _next: Next<'_>) -> Option<Request> {
        request.close();
        Some(request)
    }
}

#[derive(Debug)]
pub struct SendError {
    pub code: i32,
    pub message: String,
}

impl Action for SendError {
    fn on_run(&self, request: Request, _next: Next<'_>) -> Option<Request> {
        request.error(self.code, &self.message);
        Some(request)
    }
}

/// Writes a fixed response, encoded once up front.
pub struct SendResponse {
    opcode: Opcode,
    body: Buffer,
}

impl SendResponse {
    pub fn new(message: &ResponseMessage) -> Self {
        Self {
            opcode: message.opcode(),
            body: message.encode(),
        }
    }
}

impl fmt::Debug for SendResponse {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SendResponse")
            .field("opcode", &self.opcode)
            .field("body_len", &self.body.len())
            .finish()
    }
}

impl Action for SendResponse {
    fn on_run(&self, request: Request, _next: Next<'_>) -> Option<Request> {
        request.write(self.opcode, &self.body);
        Some(request)
    }
}

/// RESULT/ROWS with no columns and `row_count` empty rows. The body must be a
/// valid QUERY.
#[derive(Debug)]
pub struct EmptyRowsResult {
    body: Buffer,
}

impl EmptyRowsResult {
    pub fn new(row_count: usize) -> Self {
        let message = ResponseMessage::Result(ResultMessage::Rows(RowsResult::empty(row_count)));
        Self {
            body: message.encode(),
        }
    }
}

impl Action for EmptyRowsResult {
    fn on_run(&self, request: Request, _next: Next<'_>) -> Option<Request> {
        match request.decode_query() {
            Ok(_) => request.write(Opcode::Result, &self.body),
            Err(_) => request.error(ErrorCode::Protocol.code(), "Invalid query message"),
        }
        Some(request)
    }
}

/// Answers a QUERY whose text matches exactly (ignoring surrounding
/// whitespace) with a rows result; forwards anything else.
#[derive(Debug)]
pub struct MatchQuery {
    query: String,
    body: Buffer,
}

impl MatchQuery {
    pub fn new(query: impl Into<String>, rows: RowsResult) -> Self {
        let message = ResponseMessage::Result(ResultMessage::Rows(rows));
        Self {
            query: query.into().trim().to_string(),
            body: message.encode(),
        }
    }
}

impl Action for MatchQuery {
    fn on_run(&self, request: Request, next: Next<'_>) -> Option<Request> {
        match request.decode_query() {
            Ok((query, _)) if query.trim() == self.query => {
                request.write(Opcode::Result, &self.body);
                Some(request)
            }
            Ok(_) => {
                next.run(request);
                None
            }
            Err(_) => {
                request.error(ErrorCode::Protocol.code(), "Invalid query message");
                Some(request)
            }
        }
    }
}

/// Quotes a CQL identifier unless it is a plain lowercase name.
pub fn escape_id(id: &str) -> String {
    let plain = id.starts_with(|c: char| c.is_ascii_lowercase())
        && id
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_');
    if plain {
        id.to_string()
    } else {
        format!("\"{}\"", id.replace('"', "\"\""))
    }
}

/// Handles `USE <keyspace>` queries against a fixed set of keyspaces.
#[derive(Debug)]
pub struct UseKeyspace {
    keyspaces: Vec<String>,
}

impl UseKeyspace {
    pub fn new(keyspaces: Vec<String>) -> Self {
        Self { keyspaces }
    }
}

impl Action for UseKeyspace {
    fn on_run(&self, request: Request, next: Next<'_>) -> Option<Request> {
        let query = match request.decode_query() {
            Ok((query, _)) => query,
            Err(_) => {
                request.error(ErrorCode::Protocol.code(), "Invalid query message");
                return Some(request);
            }
        };

        let query = query.trim();
        let target = match query.strip_prefix("USE").or_else(|| query.strip_prefix("use")) {
            Some(rest) => rest.trim_start_matches([' ', '\t']),
            None => {
                next.run(request);
                return None;
            }
        };

        match self.keyspaces.iter().find(|ks| escape_id(ks) == target) {
            Some(keyspace) => {
                request.connection().set_keyspace(keyspace.as_str());
                request.respond(&ResponseMessage::Result(ResultMessage::SetKeyspace(
                    keyspace.clone(),
                )));
            }
            None => request.error(
                ErrorCode::Invalid.code(),
                &format!("Keyspace '{}' does not exist", self.keyspaces.join("', '")),
            ),
        }
        Some(request)
    }
}

/// Checks a SASL PLAIN token (`authzid\0username\0password`).
#[derive(Debug)]
pub struct PlaintextAuth {
    username: String,
    password: String,
}

impl PlaintextAuth {
    pub fn new(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            password: password.into(),
        }
    }
}

/// Splits a PLAIN token from the right into username and password.
fn split_plain_token(token: &[u8]) -> (&[u8], &[u8]) {
    let mut fields = token.rsplitn(3, |&b| b == 0);
    match (fields.next(), fields.next(), fields.next()) {
        (Some(password), Some(username), Some(_)) => (username, password),
        (Some(password), Some(_), None) => (&[], password),
        _ => (&[], &[]),
    }
}

impl Action for PlaintextAuth {
    fn on_run(&self, request: Request, _next: Next<'_>) -> Option<Request> {
        let token = match request.decode_auth_response() {
            Ok(token) => token.unwrap_or_default(),
            Err(_) => {
                request.error(ErrorCode::Protocol.code(), "Invalid auth response message");
                return Some(request);
            }
        };

        let (username, password) = split_plain_token(&token);
        if username == self.username.as_bytes() && password == self.password.as_bytes() {
            request.respond(&ResponseMessage::AuthSuccess { token: None });
        } else {
            tracing::debug!(
                "[{}] Rejected credentials for '{}'",
                request.connection().id(),
                String::from_utf8_lossy(username)
            );
            request.error(ErrorCode::BadCredentials.code(), "Invalid credentials");
        }
        Some(request)
    }
}

/// Pushes a STATUS_CHANGE UP event on stream -1, then forwards.
#[derive(Debug)]
pub struct UpEvent {
    body: Buffer,
}

impl UpEvent {
    pub fn new(address: SocketAddr) -> Self {
        Self {
            body: ResponseMessage::Event(Event::status_up(address)).encode(),
        }
    }
}

impl Action for UpEvent {
    fn on_run(&self, request: Request, next: Next<'_>) -> Option<Request> {
        request.write_on_stream(-1, Opcode::Event, &self.body);
        next.run(request);
        None
    }
}

/// Which message shape a [`Validate`] step checks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageKind {
    Startup,
    Credentials,
    AuthResponse,
    Register,
    Query,
    Execute,
    Prepare,
}

impl MessageKind {
    fn error_message(self) -> &'static str {
        match self {
            MessageKind::Startup => "Invalid startup message",
            MessageKind::Credentials => "Invalid credentials message",
            MessageKind::AuthResponse => "Invalid auth response message",
            MessageKind::Register => "Invalid register message",
            MessageKind::Query => "Invalid query message",
            MessageKind::Execute => "Invalid execute message",
            MessageKind::Prepare => "Invalid prepare message",
        }
    }
}

/// Decodes the body as the given message; answers PROTOCOL_ERROR if that
/// fails, forwards otherwise.
#[derive(Debug)]
pub struct Validate(pub MessageKind);

impl Action for Validate {
    fn on_run(&self, request: Request, next: Next<'_>) -> Option<Request> {
        let valid = match self.0 {
            MessageKind::Startup => request
                .decode_startup()
                .map(|options| request.connection().set_options(options)),
            MessageKind::Credentials => request.decode_credentials().map(|_| ()),
            MessageKind::AuthResponse => request.decode_auth_response().map(|_| ()),
            MessageKind::Register => request
                .decode_register()
                .map(|events| request.connection().set_registered_events(events)),
            MessageKind::Query => request.decode_query().map(|_| ()),
            MessageKind::Execute => request.decode_execute().map(|_| ()),
            MessageKind::Prepare => request.decode_prepare().map(|_| ()),
        };

        match valid {
            Ok(()) => {
                next.run(request);
                None
            }
            Err(e) => {
                tracing::debug!(
                    "[{}] {:?} failed validation: {}",
                    request.connection().id(),
                    self.0,
                    e
                );
                request.error(ErrorCode::Protocol.code(), self.0.error_message());
                Some(request)
            }
        }
    }
}

/// Fluent builder for one chain.
#[derive(Debug, Default)]
pub struct ActionBuilder {
    actions: Vec<Box<dyn Action>>,
}

impl ActionBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.actions.is_empty()
    }

    pub fn len(&self) -> usize {
        self.actions.len()
    }

    pub fn clear(&mut self) -> &mut Self {
        self.actions.clear();
        self
    }

    /// Appends a custom action.
    pub fn execute(&mut self, action: Box<dyn Action>) -> &mut Self {
        self.actions.push(action);
        self
    }

    pub fn nop(&mut self) -> &mut Self {
        self.execute(Box::new(Nop))
    }

    pub fn wait(&mut self, timeout: Duration) -> &mut Self {
        self.execute(Box::new(Wait { timeout }))
    }

    pub fn close(&mut self) -> &mut Self {
        self.execute(Box::new(Close))
    }

    pub fn error(&mut self, code: impl Into<i32>, message: impl Into<String>) -> &mut Self {
        self.execute(Box::new(SendError {
            code: code.into(),
            message: message.into(),
        }))
    }

    pub fn respond(&mut self, message: &ResponseMessage) -> &mut Self {
        self.execute(Box::new(SendResponse::new(message)))
    }

    pub fn ready(&mut self) -> &mut Self {
        self.respond(&ResponseMessage::Ready)
    }

    pub fn authenticate(&mut self, authenticator: impl Into<String>) -> &mut Self {
        self.respond(&ResponseMessage::Authenticate {
            authenticator: authenticator.into(),
        })
    }

    pub fn auth_challenge(&mut self, token: impl Into<Buffer>) -> &mut Self {
        self.respond(&ResponseMessage::AuthChallenge {
            token: Some(token.into()),
        })
    }

    pub fn auth_success(&mut self, token: impl Into<Buffer>) -> &mut Self {
        self.respond(&ResponseMessage::AuthSuccess {
            token: Some(token.into()),
        })
    }

    /// SUPPORTED with no options.
    pub fn supported(&mut self) -> &mut Self {
        self.supported_with(Vec::new())
    }

    pub fn supported_with(&mut self, options: Vec<(String, Vec<String>)>) -> &mut Self {
        self.respond(&ResponseMessage::Supported { options })
    }

    pub fn void_result(&mut self) -> &mut Self {
        self.respond(&ResponseMessage::Result(ResultMessage::Void))
    }

    /// Finishes without a response; the client is left to time out.
    pub fn no_result(&mut self) -> &mut Self {
        self.nop()
    }

    pub fn empty_rows_result(&mut self, row_count: usize) -> &mut Self {
        self.execute(Box::new(EmptyRowsResult::new(row_count)))
    }

    pub fn rows_result(&mut self, rows: RowsResult) -> &mut Self {
        self.respond(&ResponseMessage::Result(ResultMessage::Rows(rows)))
    }

    pub fn match_query(&mut self, query: impl Into<String>, rows: RowsResult) -> &mut Self {
        self.execute(Box::new(MatchQuery::new(query, rows)))
    }

    pub fn use_keyspace(&mut self, keyspace: impl Into<String>) -> &mut Self {
        self.use_keyspaces(vec![keyspace.into()])
    }

    pub fn use_keyspaces(&mut self, keyspaces: Vec<String>) -> &mut Self {
        self.execute(Box::new(UseKeyspace::new(keyspaces)))
    }

    pub fn plaintext_auth(
        &mut self,
        username: impl Into<String>,
        password: impl Into<String>,
    ) -> &mut Self {
        self.execute(Box::new(PlaintextAuth::new(username, password)))
    }

    pub fn up_event(&mut self, address: SocketAddr) -> &mut Self {
        self.execute(Box::new(UpEvent::new(address)))
    }

    pub fn validate_startup(&mut self) -> &mut Self {
        self.execute(Box::new(Validate(MessageKind::Startup)))
    }

    pub fn validate_credentials(&mut self) -> &mut Self {
        self.execute(Box::new(Validate(MessageKind::Credentials)))
    }

    pub fn validate_auth_response(&mut self) -> &mut Self {
        self.execute(Box::new(Validate(MessageKind::AuthResponse)))
    }

    pub fn validate_register(&mut self) -> &mut Self {
        self.execute(Box::new(Validate(MessageKind::Register)))
    }

    pub fn validate_query(&mut self) -> &mut Self {
        self.execute(Box::new(Validate(MessageKind::Query)))
    }

    pub fn validate_execute(&mut self) -> &mut Self {
        self.execute(Box::new(Validate(MessageKind::Execute)))
    }

    pub fn validate_prepare(&mut self) -> &mut Self {
        self.execute(Box::new(Validate(MessageKind::Prepare)))
    }

    /// Links the actions into a chain, leaving the builder empty.
    pub fn build(&mut self) -> Option<ActionNode> {
        let mut head: Option<Box<ActionNode>> = None;
        while let Some(action) = self.actions.pop() {
            head = Some(Box::new(ActionNode::new(action, head)));
        }
        head.map(|node| *node)
    }
}
