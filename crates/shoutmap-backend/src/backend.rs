//! The request/response and event-emitting boundary to the backend.

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::mpsc;

use crate::{BackendError, Binding, ChangeEvent, Query, Row};

/// Row-level CRUD, RPC and object storage.
#[async_trait]
pub trait Backend: Send + Sync {
    /// Fetch rows matching a query.
    async fn select(&self, query: &Query) -> Result<Vec<Row>, BackendError>;

    /// Insert one row and return it as stored (with generated columns).
    async fn insert(&self, table: &str, row: Row) -> Result<Row, BackendError>;

    /// Patch every row matching a query and return the updated rows.
    async fn update(&self, query: &Query, patch: Row) -> Result<Vec<Row>, BackendError>;

    /// Delete every row matching a query and return the deleted rows.
    async fn delete(&self, query: &Query) -> Result<Vec<Row>, BackendError>;

    /// Call a server function.
    async fn rpc(&self, function: &str, args: Value) -> Result<Value, BackendError>;

    /// Upload an object and return its public URL.
    async fn upload(
        &self,
        bucket: &str,
        path: &str,
        bytes: Vec<u8>,
        content_type: &str,
    ) -> Result<String, BackendError>;
}

/// The realtime change feed.
///
/// Joining a topic that is already joined is an error, as it is on the
/// hosted service.
#[async_trait]
pub trait RealtimeTransport: Send + Sync {
    /// Join a topic and receive every event matching one of the bindings.
    async fn join(
        &self,
        topic: &str,
        bindings: Vec<Binding>,
    ) -> Result<mpsc::Receiver<ChangeEvent>, BackendError>;

    /// Leave a topic. Leaving an unknown topic is not an error.
    async fn leave(&self, topic: &str) -> Result<(), BackendError>;
}
