//! Scriptable client for tests
//!
//! Records every call, numbers new stores `s1`, `s2`, ..., echoes model
//! payloads back, and fails any operation queued with [`MockClient::fail`].

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value};
use tokio::sync::mpsc;

use super::{ClientResult, StoreInfo, Subscription, ThreadsClient, Transaction, Update};
use crate::error::ClientError;

/// One recorded client call
#[derive(Debug, Clone, PartialEq)]
pub struct Call {
    pub op: &'static str,
    pub store_id: String,
    pub model: Option<String>,
    pub payload: Value,
}

#[derive(Clone, Default)]
pub struct MockClient {
    inner: Arc<Mutex<MockState>>,
    latency: Option<Duration>,
}

#[derive(Default)]
struct MockState {
    calls: Vec<Call>,
    next_store: usize,
    failures: HashMap<&'static str, Vec<ClientError>>,
    listeners: Vec<mpsc::UnboundedSender<Update>>,
}

impl MockClient {
    pub fn new() -> Self {
        Self::default()
    }

    /// Delay every call by `latency`
    pub fn with_latency(latency: Duration) -> Self {
        Self {
            latency: Some(latency),
            ..Self::default()
        }
    }

    /// Make the next call to `op` fail with `error`
    pub fn fail(&self, op: &'static str, error: ClientError) {
        self.lock().failures.entry(op).or_default().push(error);
    }

    /// All calls so far, in order
    pub fn calls(&self) -> Vec<Call> {
        self.lock().calls.clone()
    }

    /// Number of calls made to `op`
    pub fn count(&self, op: &str) -> usize {
        self.lock().calls.iter().filter(|c| c.op == op).count()
    }

    /// Deliver `update` to every open subscription
    pub fn push_update(&self, update: Update) {
        let mut state = self.lock();
        state.listeners.retain(|tx| tx.send(update.clone()).is_ok());
    }

    fn lock(&self) -> MutexGuard<'_, MockState> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    async fn record(
        &self,
        op: &'static str,
        store_id: &str,
        model: Option<&str>,
        payload: Value,
    ) -> ClientResult<()> {
        {
            let mut state = self.lock();
            state.calls.push(Call {
                op,
                store_id: store_id.to_string(),
                model: model.map(str::to_string),
                payload,
            });
        }
        if let Some(latency) = self.latency {
            tokio::time::sleep(latency).await;
        }
        let mut state = self.lock();
        match state.failures.get_mut(op) {
            Some(queued) if !queued.is_empty() => Err(queued.remove(0)),
            _ => Ok(()),
        }
    }

    async fn echo(&self, op: &'static str, store_id: &str, model: &str, payload: Value) -> ClientResult<Value> {
        self.record(op, store_id, Some(model), payload.clone()).await?;
        Ok(payload)
    }
}

#[async_trait]
impl ThreadsClient for MockClient {
    fn host(&self) -> Option<&str> {
        None
    }

    async fn new_store(&self) -> ClientResult<StoreInfo> {
        self.record("new_store", "", None, Value::Null).await?;
        let mut state = self.lock();
        state.next_store += 1;
        Ok(StoreInfo {
            id: format!("s{}", state.next_store),
        })
    }

    async fn start(&self, store_id: &str) -> ClientResult<()> {
        self.record("start", store_id, None, Value::Null).await
    }

    async fn register_schema(&self, store_id: &str, model: &str, schema: Value) -> ClientResult<()> {
        self.record("register_schema", store_id, Some(model), schema).await
    }

    async fn model_create(&self, store_id: &str, model: &str, entities: Value) -> ClientResult<Value> {
        self.echo("model_create", store_id, model, entities).await
    }

    async fn model_save(&self, store_id: &str, model: &str, entities: Value) -> ClientResult<Value> {
        self.echo("model_save", store_id, model, entities).await
    }

    async fn model_delete(&self, store_id: &str, model: &str, ids: Value) -> ClientResult<Value> {
        self.echo("model_delete", store_id, model, ids).await
    }

    async fn model_has(&self, store_id: &str, model: &str, ids: Value) -> ClientResult<Value> {
        self.echo("model_has", store_id, model, ids).await
    }

    async fn model_find(&self, store_id: &str, model: &str, query: Value) -> ClientResult<Value> {
        self.echo("model_find", store_id, model, query).await
    }

    async fn read_transaction(&self, store_id: &str, model: &str) -> ClientResult<Box<dyn Transaction>> {
        self.record("read_transaction", store_id, Some(model), Value::Null).await?;
        Err(ClientError::remote("transactions are not scripted by the mock"))
    }

    async fn write_transaction(&self, store_id: &str, model: &str) -> ClientResult<Box<dyn Transaction>> {
        self.record("write_transaction", store_id, Some(model), Value::Null).await?;
        Err(ClientError::remote("transactions are not scripted by the mock"))
    }

    async fn listen(&self, store_id: &str, model: &str, entity_id: &str) -> ClientResult<Subscription> {
        self.record("listen", store_id, Some(model), json!(entity_id)).await?;
        let (tx, subscription) = Subscription::channel();
        self.lock().listeners.push(tx);
        Ok(subscription)
    }

    async fn get_store_link(&self, store_id: &str) -> ClientResult<Value> {
        self.record("get_store_link", store_id, None, Value::Null).await?;
        Ok(json!({ "addrs": [format!("/thread/{}", store_id)] }))
    }
}
