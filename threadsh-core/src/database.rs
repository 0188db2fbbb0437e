//! Database and collection wrappers
//!
//! Pure forwarding: each method calls the client with the owning store's id,
//! bounded by the registry deadline, and returns the client's result or
//! rejection unchanged. No validation, retry or caching happens here.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use serde_json::Value;
use tokio::task::JoinHandle;
use tracing::debug;

use crate::client::{bounded, ClientResult, ThreadsClient, Transaction, Update, DEFAULT_TIMEOUT};
use crate::registry::{Registry, StoreHandle};

/// One store, plus the collections registered through it
#[derive(Clone)]
pub struct Database {
    inner: Arc<DatabaseInner>,
}

struct DatabaseInner {
    client: Arc<dyn ThreadsClient>,
    handle: StoreHandle,
    timeout: Duration,
    collections: Mutex<Vec<Collection>>,
}

impl Database {
    pub fn new(client: Arc<dyn ThreadsClient>, handle: StoreHandle) -> Self {
        Self::with_timeout(client, handle, DEFAULT_TIMEOUT)
    }

    pub fn with_timeout(client: Arc<dyn ThreadsClient>, handle: StoreHandle, timeout: Duration) -> Self {
        Self {
            inner: Arc::new(DatabaseInner {
                client,
                handle,
                timeout,
                collections: Mutex::new(Vec::new()),
            }),
        }
    }

    /// Wrap a handle owned by `registry`, sharing its client and deadline
    pub fn from_registry(registry: &Registry, handle: StoreHandle) -> Self {
        Self::with_timeout(Arc::clone(registry.client()), handle, registry.timeout())
    }

    pub fn handle(&self) -> &StoreHandle {
        &self.inner.handle
    }

    pub fn id(&self) -> &str {
        self.inner.handle.id()
    }

    pub fn name(&self) -> &str {
        self.inner.handle.name()
    }

    fn collections_mut(&self) -> MutexGuard<'_, Vec<Collection>> {
        self.inner
            .collections
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// Register `schema` as model `name`; the collection exists only on success
    pub async fn create_collection(&self, name: &str, schema: Value) -> ClientResult<Collection> {
        let inner = &self.inner;
        bounded(
            "register_schema",
            inner.timeout,
            inner.client.register_schema(self.id(), name, schema.clone()),
        )
        .await?;

        let collection = Collection {
            client: Arc::clone(&inner.client),
            store: inner.handle.clone(),
            name: name.to_string(),
            schema,
            timeout: inner.timeout,
        };
        let mut collections = self.collections_mut();
        collections.retain(|c| c.name != name);
        collections.push(collection.clone());
        debug!(store = %self.id(), collection = name, "collection registered");
        Ok(collection)
    }

    pub async fn get_links(&self) -> ClientResult<Value> {
        bounded(
            "get_store_link",
            self.inner.timeout,
            self.inner.client.get_store_link(self.id()),
        )
        .await
    }

    /// Collection registered under `name` through this database
    pub fn collection(&self, name: &str) -> Option<Collection> {
        self.collections_mut().iter().find(|c| c.name == name).cloned()
    }

    /// Registered collection names in creation order
    pub fn collections(&self) -> Vec<String> {
        self.collections_mut().iter().map(|c| c.name.clone()).collect()
    }
}

/// A registered model within a store
#[derive(Clone)]
pub struct Collection {
    client: Arc<dyn ThreadsClient>,
    store: StoreHandle,
    name: String,
    schema: Value,
    timeout: Duration,
}

impl std::fmt::Debug for Collection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Collection")
            .field("store", &self.store)
            .field("name", &self.name)
            .finish_non_exhaustive()
    }
}

impl Collection {
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Schema as registered, never interpreted locally
    pub fn schema(&self) -> &Value {
        &self.schema
    }

    pub fn store(&self) -> &StoreHandle {
        &self.store
    }

    pub async fn create(&self, entities: Value) -> ClientResult<Value> {
        bounded(
            "model_create",
            self.timeout,
            self.client.model_create(self.store.id(), &self.name, entities),
        )
        .await
    }

    pub async fn save(&self, entities: Value) -> ClientResult<Value> {
        bounded(
            "model_save",
            self.timeout,
            self.client.model_save(self.store.id(), &self.name, entities),
        )
        .await
    }

    pub async fn delete(&self, ids: Value) -> ClientResult<Value> {
        bounded(
            "model_delete",
            self.timeout,
            self.client.model_delete(self.store.id(), &self.name, ids),
        )
        .await
    }

    pub async fn has(&self, ids: Value) -> ClientResult<Value> {
        bounded(
            "model_has",
            self.timeout,
            self.client.model_has(self.store.id(), &self.name, ids),
        )
        .await
    }

    pub async fn find(&self, query: Value) -> ClientResult<Value> {
        bounded(
            "model_find",
            self.timeout,
            self.client.model_find(self.store.id(), &self.name, query),
        )
        .await
    }

    /// Fetch one entity; forwarded as `model_find` with the bare id
    pub async fn get(&self, id: &str) -> ClientResult<Value> {
        bounded(
            "model_find",
            self.timeout,
            self.client
                .model_find(self.store.id(), &self.name, Value::String(id.to_string())),
        )
        .await
    }

    pub async fn read_transaction(&self) -> ClientResult<Box<dyn Transaction>> {
        bounded(
            "read_transaction",
            self.timeout,
            self.client.read_transaction(self.store.id(), &self.name),
        )
        .await
    }

    pub async fn write_transaction(&self) -> ClientResult<Box<dyn Transaction>> {
        bounded(
            "write_transaction",
            self.timeout,
            self.client.write_transaction(self.store.id(), &self.name),
        )
        .await
    }

    /// Subscribe to updates of entity `id`
    ///
    /// `callback` runs once per update on a spawned task until the client
    /// ends the stream. Aborting the returned handle unsubscribes.
    pub async fn listen<F>(&self, id: &str, mut callback: F) -> ClientResult<JoinHandle<()>>
    where
        F: FnMut(Update) + Send + 'static,
    {
        let mut subscription = bounded(
            "listen",
            self.timeout,
            self.client.listen(self.store.id(), &self.name, id),
        )
        .await?;

        let collection = self.name.clone();
        let entity = id.to_string();
        Ok(tokio::spawn(async move {
            while let Some(update) = subscription.next().await {
                callback(update);
            }
            debug!(collection = %collection, entity = %entity, "subscription ended");
        }))
    }
}
