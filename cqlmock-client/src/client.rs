//! High-level client API.

use crate::connection::{Connection, ConnectionConfig};
use crate::error::ClientError;
use cqlmock_protocol::{
    Buffer, Event, PrepareParameters, QueryParameters, RequestMessage, ResponseMessage,
    ResultKind, ResultMessage,
};
use std::sync::Arc;
use tokio::sync::{broadcast, Mutex};
use tokio::task::JoinHandle;

/// Consistency ONE.
const DEFAULT_CONSISTENCY: u16 = 0x0001;

/// High-level client for a CQL server.
pub struct Client {
    conn: Arc<Connection>,
    read_task: Mutex<Option<JoinHandle<Result<(), ClientError>>>>,
}

impl Client {
    /// Creates a new client with the given configuration.
    pub fn new(config: ConnectionConfig) -> Self {
        Self {
            conn: Arc::new(Connection::new(config)),
            read_task: Mutex::new(None),
        }
    }

    /// Connects, performs the handshake and starts the background read loop.
    pub async fn connect(&self) -> Result<(), ClientError> {
        self.conn.connect().await?;
        let conn = self.conn.clone();
        let task = tokio::spawn(async move {
            let result = conn.read_loop().await;
            if let Err(ref e) = result {
                tracing::debug!("Read loop ended: {}", e);
            }
            result
        });
        *self.read_task.lock().await = Some(task);
        Ok(())
    }

    /// Returns whether the client is connected.
    pub fn is_connected(&self) -> bool {
        self.conn.is_connected()
    }

    /// Closes the connection and stops the read loop.
    pub async fn close(&self) -> Result<(), ClientError> {
        self.conn.close().await?;
        if let Some(task) = self.read_task.lock().await.take() {
            task.abort();
        }
        Ok(())
    }

    /// Returns the underlying connection.
    pub fn connection(&self) -> Arc<Connection> {
        self.conn.clone()
    }

    /// Subscribes to server events. Events arrive only after [`register`](Self::register).
    pub fn events(&self) -> broadcast::Receiver<Event> {
        self.conn.subscribe_events()
    }

    async fn result(&self, message: RequestMessage) -> Result<ResultMessage, ClientError> {
        match self.conn.request(&message).await? {
            ResponseMessage::Result(result) => Ok(result),
            other => Err(ClientError::UnexpectedResponse(other.opcode().name())),
        }
    }

    /// Sends OPTIONS and returns the supported options.
    pub async fn options(&self) -> Result<Vec<(String, Vec<String>)>, ClientError> {
        match self.conn.request(&RequestMessage::Options).await? {
            ResponseMessage::Supported { options } => Ok(options),
            other => Err(ClientError::UnexpectedResponse(other.opcode().name())),
        }
    }

    /// Runs a query at consistency ONE without values.
    pub async fn query(&self, query: &str) -> Result<ResultMessage, ClientError> {
        self.query_with(
            query,
            QueryParameters {
                consistency: DEFAULT_CONSISTENCY,
                ..Default::default()
            },
        )
        .await
    }

    pub async fn query_with(
        &self,
        query: &str,
        params: QueryParameters,
    ) -> Result<ResultMessage, ClientError> {
        self.result(RequestMessage::Query {
            query: query.to_string(),
            params,
        })
        .await
    }

    /// Prepares a statement and returns its id.
    pub async fn prepare(&self, query: &str) -> Result<Buffer, ClientError> {
        let message = RequestMessage::Prepare {
            query: query.to_string(),
            params: PrepareParameters::default(),
        };
        match self.result(message).await? {
            ResultMessage::Prepared { id, .. } => Ok(id),
            other => Err(ClientError::UnexpectedResponse(result_name(&other))),
        }
    }

    pub async fn execute(
        &self,
        id: Buffer,
        params: QueryParameters,
    ) -> Result<ResultMessage, ClientError> {
        self.result(RequestMessage::Execute { id, params }).await
    }

    /// Subscribes this connection to the given event types.
    pub async fn register(&self, event_types: &[&str]) -> Result<(), ClientError> {
        let message = RequestMessage::Register {
            event_types: event_types.iter().map(|e| e.to_string()).collect(),
        };
        match self.conn.request(&message).await? {
            ResponseMessage::Ready => Ok(()),
            other => Err(ClientError::UnexpectedResponse(other.opcode().name())),
        }
    }
}

fn result_name(result: &ResultMessage) -> &'static str {
    match result.kind() {
        ResultKind::Void => "VOID result",
        ResultKind::Rows => "ROWS result",
        ResultKind::SetKeyspace => "SET_KEYSPACE result",
        ResultKind::Prepared => "PREPARED result",
        ResultKind::SchemaChange => "SCHEMA_CHANGE result",
    }
}
