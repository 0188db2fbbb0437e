//! Threads client collaborator
//!
//! Everything the shell does is a call on a [`ThreadsClient`]. The trait
//! mirrors the capability set of a threads database client:
//! - store lifecycle (`new_store`, `start`, `get_store_link`)
//! - schema registration and model CRUD/query
//! - read/write transactions
//! - push subscriptions for entity updates
//!
//! Implementations:
//! - [`MemoryClient`] - embedded in-process backend (also used by tests)
//! - [`HttpClient`] - JSON bridge to a threads gateway, local or cloud
//! - [`MockClient`] - scripted client recording calls, for tests
//!
//! Payloads are opaque `serde_json::Value`s; nothing here inspects them.

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::mpsc;

use crate::error::ClientError;

mod factory;
mod http;
mod memory;
mod mock;

pub use factory::{connect, ClientMode, Credentials, DEFAULT_DEVICE_ID};
pub use http::HttpClient;
pub use memory::MemoryClient;
pub use mock::{Call, MockClient};

/// Result of a client call
pub type ClientResult<T> = std::result::Result<T, ClientError>;

/// Store as returned by `new_store`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoreInfo {
    pub id: String,
}

/// Kind of change carried by an [`Update`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Action {
    Create,
    Save,
    Delete,
}

/// A single pushed change to a listened entity
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Update {
    pub model: String,
    pub entity_id: String,
    pub action: Action,
    /// Entity body after the change (absent for deletes)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub entity: Option<Value>,
}

/// Transaction flavour
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TxnKind {
    Read,
    Write,
}

impl std::fmt::Display for TxnKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TxnKind::Read => write!(f, "read"),
            TxnKind::Write => write!(f, "write"),
        }
    }
}

/// Live update stream returned by [`ThreadsClient::listen`]
///
/// Ends when the client drops its sending side.
pub struct Subscription {
    rx: mpsc::UnboundedReceiver<Update>,
}

impl Subscription {
    /// Create a subscription and the sender that feeds it
    pub fn channel() -> (mpsc::UnboundedSender<Update>, Self) {
        let (tx, rx) = mpsc::unbounded_channel();
        (tx, Self { rx })
    }

    /// Wait for the next update, `None` once the stream has ended
    pub async fn next(&mut self) -> Option<Update> {
        self.rx.recv().await
    }
}

/// A transaction opened against one model of one store
///
/// Returned unchanged from the client to the caller. Write operations on a
/// read transaction are rejected by the implementation.
#[async_trait]
pub trait Transaction: Send + Sync {
    fn kind(&self) -> TxnKind;

    async fn has(&self, ids: Value) -> ClientResult<Value>;

    async fn find(&self, query: Value) -> ClientResult<Value>;

    async fn find_by_id(&self, id: &str) -> ClientResult<Value>;

    async fn create(&self, entities: Value) -> ClientResult<Value>;

    async fn save(&self, entities: Value) -> ClientResult<Value>;

    async fn delete(&self, ids: Value) -> ClientResult<Value>;

    /// Close the transaction, committing buffered writes
    async fn end(&self) -> ClientResult<()>;
}

/// Capability set of a threads database client
#[async_trait]
pub trait ThreadsClient: Send + Sync {
    /// API address used by the connectivity check, if any
    fn host(&self) -> Option<&str>;

    async fn new_store(&self) -> ClientResult<StoreInfo>;

    /// Resume an existing remote store
    async fn start(&self, store_id: &str) -> ClientResult<()>;

    async fn register_schema(&self, store_id: &str, model: &str, schema: Value)
        -> ClientResult<()>;

    async fn model_create(&self, store_id: &str, model: &str, entities: Value)
        -> ClientResult<Value>;

    async fn model_save(&self, store_id: &str, model: &str, entities: Value)
        -> ClientResult<Value>;

    async fn model_delete(&self, store_id: &str, model: &str, ids: Value) -> ClientResult<Value>;

    async fn model_has(&self, store_id: &str, model: &str, ids: Value) -> ClientResult<Value>;

    async fn model_find(&self, store_id: &str, model: &str, query: Value) -> ClientResult<Value>;

    async fn read_transaction(
        &self,
        store_id: &str,
        model: &str,
    ) -> ClientResult<Box<dyn Transaction>>;

    async fn write_transaction(
        &self,
        store_id: &str,
        model: &str,
    ) -> ClientResult<Box<dyn Transaction>>;

    /// Register a push subscription for one entity
    async fn listen(&self, store_id: &str, model: &str, entity_id: &str)
        -> ClientResult<Subscription>;

    async fn get_store_link(&self, store_id: &str) -> ClientResult<Value>;
}

/// Default deadline for a single delegated call
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

/// Run a client call with a deadline
///
/// Expiry is reported as [`ClientError::Timeout`] naming the operation; the
/// call's own rejection is returned unchanged.
pub async fn bounded<T, F>(operation: &str, limit: Duration, call: F) -> ClientResult<T>
where
    F: std::future::Future<Output = ClientResult<T>>,
{
    tracing::debug!(operation, "client call");
    match tokio::time::timeout(limit, call).await {
        Ok(result) => result,
        Err(_) => {
            tracing::warn!(operation, millis = limit.as_millis() as u64, "client call timed out");
            Err(ClientError::Timeout {
                operation: operation.to_string(),
                millis: limit.as_millis() as u64,
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn bounded_passes_result_through() {
        let ok = bounded("op", Duration::from_secs(1), async { Ok::<_, ClientError>(7) }).await;
        assert_eq!(ok, Ok(7));

        let err = bounded("op", Duration::from_secs(1), async {
            Err::<(), _>(ClientError::not_found("model Person"))
        })
        .await;
        assert_eq!(err, Err(ClientError::not_found("model Person")));
    }

    #[tokio::test]
    async fn bounded_times_out() {
        let result = bounded("new_store", Duration::from_millis(10), async {
            tokio::time::sleep(Duration::from_secs(60)).await;
            Ok::<_, ClientError>(())
        })
        .await;

        assert_eq!(
            result,
            Err(ClientError::Timeout {
                operation: "new_store".to_string(),
                millis: 10
            })
        );
    }

    #[tokio::test]
    async fn subscription_ends_when_sender_dropped() {
        let (tx, mut sub) = Subscription::channel();
        tx.send(Update {
            model: "Person".into(),
            entity_id: "e1".into(),
            action: Action::Delete,
            entity: None,
        })
        .unwrap();
        drop(tx);

        assert_eq!(sub.next().await.map(|u| u.entity_id), Some("e1".to_string()));
        assert!(sub.next().await.is_none());
    }
}
