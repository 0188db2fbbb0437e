//! Embedded in-process threads backend
//!
//! Keeps stores, registered schemas and entities in memory so the shell can
//! run without a daemon. Entities are keyed by their `ID` field, queries are
//! top-level field equality filters, and registered schemas only enforce
//! `required` fields and primitive property types.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Map, Value};
use tokio::sync::mpsc;
use tracing::debug;
use uuid::Uuid;

use super::{
    Action, ClientResult, StoreInfo, Subscription, ThreadsClient, Transaction, TxnKind, Update,
};
use crate::error::ClientError;

/// Field holding an entity's identifier
const ID_FIELD: &str = "ID";

#[derive(Clone)]
pub struct MemoryClient {
    inner: Arc<Inner>,
}

struct Inner {
    peer_id: String,
    latency: Option<Duration>,
    stores: Mutex<HashMap<String, StoreState>>,
}

#[derive(Default)]
struct StoreState {
    models: HashMap<String, Model>,
}

#[derive(Clone)]
struct Model {
    schema: Value,
    entities: BTreeMap<String, Value>,
    listeners: Vec<Listener>,
}

#[derive(Clone)]
struct Listener {
    entity_id: String,
    tx: mpsc::UnboundedSender<Update>,
}

impl Default for MemoryClient {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryClient {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Inner {
                peer_id: Uuid::new_v4().simple().to_string(),
                latency: None,
                stores: Mutex::new(HashMap::new()),
            }),
        }
    }

    /// Delay every call by `latency`, emulating a round trip
    pub fn with_latency(latency: Duration) -> Self {
        Self {
            inner: Arc::new(Inner {
                peer_id: Uuid::new_v4().simple().to_string(),
                latency: Some(latency),
                stores: Mutex::new(HashMap::new()),
            }),
        }
    }

    /// Number of stores created or known to this backend
    pub fn store_count(&self) -> usize {
        self.lock().map(|stores| stores.len()).unwrap_or(0)
    }

    async fn round_trip(&self) {
        if let Some(latency) = self.inner.latency {
            tokio::time::sleep(latency).await;
        }
    }

    fn lock(&self) -> ClientResult<MutexGuard<'_, HashMap<String, StoreState>>> {
        self.inner
            .stores
            .lock()
            .map_err(|_| ClientError::remote("backend state poisoned"))
    }

    /// Run `f` against a registered model of a store
    fn with_model<T>(
        &self,
        store_id: &str,
        model: &str,
        f: impl FnOnce(&mut Model) -> ClientResult<T>,
    ) -> ClientResult<T> {
        let mut stores = self.lock()?;
        let store = stores
            .get_mut(store_id)
            .ok_or_else(|| ClientError::not_found(format!("store {}", store_id)))?;
        let model = store
            .models
            .get_mut(model)
            .ok_or_else(|| ClientError::not_found(format!("model {}", model)))?;
        f(model)
    }

    /// Apply a write and deliver the resulting updates to listeners
    fn write(
        &self,
        store_id: &str,
        model_name: &str,
        f: impl FnOnce(&mut Model) -> ClientResult<(Value, Vec<Update>)>,
    ) -> ClientResult<Value> {
        self.with_model(store_id, model_name, |model| {
            let (result, updates) = f(model)?;
            model.notify(&updates);
            Ok(result)
        })
    }
}

impl Model {
    fn new(schema: Value) -> Self {
        Self {
            schema,
            entities: BTreeMap::new(),
            listeners: Vec::new(),
        }
    }

    fn notify(&mut self, updates: &[Update]) {
        self.listeners.retain(|listener| !listener.tx.is_closed());
        for update in updates {
            for listener in &self.listeners {
                if listener.entity_id.is_empty() || listener.entity_id == update.entity_id {
                    let _ = listener.tx.send(update.clone());
                }
            }
        }
    }

    fn create(&mut self, name: &str, entities: Value) -> ClientResult<(Value, Vec<Update>)> {
        let mut staged = Vec::new();
        for entity in as_list(entities) {
            validate(&self.schema, &entity)?;
            let mut entity = entity;
            let id = match entity.get(ID_FIELD).and_then(Value::as_str) {
                Some(id) if !id.is_empty() => id.to_string(),
                _ => Uuid::new_v4().to_string(),
            };
            if self.entities.contains_key(&id) || staged.iter().any(|(s, _)| s == &id) {
                return Err(ClientError::conflict(format!("entity {} already exists", id)));
            }
            if let Some(fields) = entity.as_object_mut() {
                fields.insert(ID_FIELD.to_string(), Value::String(id.clone()));
            }
            staged.push((id, entity));
        }

        let mut ids = Vec::with_capacity(staged.len());
        let mut updates = Vec::with_capacity(staged.len());
        for (id, entity) in staged {
            updates.push(update(name, &id, Action::Create, Some(entity.clone())));
            self.entities.insert(id.clone(), entity);
            ids.push(Value::String(id));
        }
        Ok((Value::Array(ids), updates))
    }

    fn save(&mut self, name: &str, entities: Value) -> ClientResult<(Value, Vec<Update>)> {
        let mut staged = Vec::new();
        for entity in as_list(entities) {
            validate(&self.schema, &entity)?;
            let id = entity
                .get(ID_FIELD)
                .and_then(Value::as_str)
                .ok_or_else(|| ClientError::schema("entity is missing its ID"))?
                .to_string();
            if !self.entities.contains_key(&id) {
                return Err(ClientError::not_found(format!("entity {}", id)));
            }
            staged.push((id, entity));
        }

        let mut updates = Vec::with_capacity(staged.len());
        for (id, entity) in staged {
            updates.push(update(name, &id, Action::Save, Some(entity.clone())));
            self.entities.insert(id, entity);
        }
        Ok((Value::Null, updates))
    }

    fn delete(&mut self, name: &str, ids: Value) -> ClientResult<(Value, Vec<Update>)> {
        let ids = id_list(ids)?;
        if let Some(missing) = ids.iter().find(|id| !self.entities.contains_key(*id)) {
            return Err(ClientError::not_found(format!("entity {}", missing)));
        }

        let mut updates = Vec::with_capacity(ids.len());
        for id in ids {
            self.entities.remove(&id);
            updates.push(update(name, &id, Action::Delete, None));
        }
        Ok((Value::Null, updates))
    }

    fn has(&self, ids: Value) -> ClientResult<Value> {
        let ids = id_list(ids)?;
        Ok(Value::Bool(ids.iter().all(|id| self.entities.contains_key(id))))
    }

    fn find(&self, query: Value) -> ClientResult<Value> {
        match query {
            Value::String(id) => self.find_by_id(&id),
            Value::Null => Ok(Value::Array(self.entities.values().cloned().collect())),
            Value::Object(filter) => Ok(Value::Array(
                self.entities
                    .values()
                    .filter(|entity| matches(entity, &filter))
                    .cloned()
                    .collect(),
            )),
            other => Err(ClientError::schema(format!("unsupported query: {}", other))),
        }
    }

    fn find_by_id(&self, id: &str) -> ClientResult<Value> {
        self.entities
            .get(id)
            .cloned()
            .ok_or_else(|| ClientError::not_found(format!("entity {}", id)))
    }
}

fn update(model: &str, id: &str, action: Action, entity: Option<Value>) -> Update {
    Update {
        model: model.to_string(),
        entity_id: id.to_string(),
        action,
        entity,
    }
}

fn as_list(value: Value) -> Vec<Value> {
    match value {
        Value::Array(items) => items,
        other => vec![other],
    }
}

fn id_list(ids: Value) -> ClientResult<Vec<String>> {
    as_list(ids)
        .into_iter()
        .map(|id| match id {
            Value::String(id) => Ok(id),
            other => Err(ClientError::schema(format!("expected an entity ID, got {}", other))),
        })
        .collect()
}

fn matches(entity: &Value, filter: &Map<String, Value>) -> bool {
    filter
        .iter()
        .all(|(field, expected)| entity.get(field) == Some(expected))
}

/// Check `required` fields and primitive `type`s declared by the schema
fn validate(schema: &Value, entity: &Value) -> ClientResult<()> {
    let fields = entity
        .as_object()
        .ok_or_else(|| ClientError::schema(format!("entity must be an object, got {}", entity)))?;

    if let Some(required) = schema.get("required").and_then(Value::as_array) {
        for field in required.iter().filter_map(Value::as_str) {
            if !fields.contains_key(field) {
                return Err(ClientError::schema(format!(
                    "missing required field '{}'",
                    field
                )));
            }
        }
    }

    if let Some(properties) = schema.get("properties").and_then(Value::as_object) {
        for (field, value) in fields {
            let Some(expected) = properties
                .get(field)
                .and_then(|p| p.get("type"))
                .and_then(Value::as_str)
            else {
                continue;
            };
            let ok = match expected {
                "string" => value.is_string(),
                "integer" => value.is_i64() || value.is_u64(),
                "number" => value.is_number(),
                "boolean" => value.is_boolean(),
                "object" => value.is_object(),
                "array" => value.is_array(),
                "null" => value.is_null(),
                _ => true,
            };
            if !ok {
                return Err(ClientError::schema(format!(
                    "field '{}' must be of type {}",
                    field, expected
                )));
            }
        }
    }

    Ok(())
}

#[async_trait]
impl ThreadsClient for MemoryClient {
    fn host(&self) -> Option<&str> {
        None
    }

    async fn new_store(&self) -> ClientResult<StoreInfo> {
        self.round_trip().await;
        let id = Uuid::new_v4().simple().to_string();
        self.lock()?.insert(id.clone(), StoreState::default());
        debug!(store = %id, "created store");
        Ok(StoreInfo { id })
    }

    async fn start(&self, store_id: &str) -> ClientResult<()> {
        self.round_trip().await;
        if self.lock()?.contains_key(store_id) {
            Ok(())
        } else {
            Err(ClientError::not_found(format!("store {}", store_id)))
        }
    }

    async fn register_schema(
        &self,
        store_id: &str,
        model: &str,
        schema: Value,
    ) -> ClientResult<()> {
        self.round_trip().await;
        if !schema.is_object() {
            return Err(ClientError::schema("schema must be a JSON object"));
        }
        let mut stores = self.lock()?;
        let store = stores
            .get_mut(store_id)
            .ok_or_else(|| ClientError::not_found(format!("store {}", store_id)))?;
        if store.models.contains_key(model) {
            return Err(ClientError::conflict(format!("model {} already registered", model)));
        }
        store.models.insert(model.to_string(), Model::new(schema));
        Ok(())
    }

    async fn model_create(&self, store_id: &str, model: &str, entities: Value) -> ClientResult<Value> {
        self.round_trip().await;
        self.write(store_id, model, |m| m.create(model, entities))
    }

    async fn model_save(&self, store_id: &str, model: &str, entities: Value) -> ClientResult<Value> {
        self.round_trip().await;
        self.write(store_id, model, |m| m.save(model, entities))
    }

    async fn model_delete(&self, store_id: &str, model: &str, ids: Value) -> ClientResult<Value> {
        self.round_trip().await;
        self.write(store_id, model, |m| m.delete(model, ids))
    }

    async fn model_has(&self, store_id: &str, model: &str, ids: Value) -> ClientResult<Value> {
        self.round_trip().await;
        self.with_model(store_id, model, |m| m.has(ids))
    }

    async fn model_find(&self, store_id: &str, model: &str, query: Value) -> ClientResult<Value> {
        self.round_trip().await;
        self.with_model(store_id, model, |m| m.find(query))
    }

    async fn read_transaction(
        &self,
        store_id: &str,
        model: &str,
    ) -> ClientResult<Box<dyn Transaction>> {
        self.round_trip().await;
        self.with_model(store_id, model, |_| Ok(()))?;
        Ok(Box::new(MemoryTransaction::new(self.clone(), store_id, model, TxnKind::Read)))
    }

    async fn write_transaction(
        &self,
        store_id: &str,
        model: &str,
    ) -> ClientResult<Box<dyn Transaction>> {
        self.round_trip().await;
        self.with_model(store_id, model, |_| Ok(()))?;
        Ok(Box::new(MemoryTransaction::new(self.clone(), store_id, model, TxnKind::Write)))
    }

    async fn listen(&self, store_id: &str, model: &str, entity_id: &str) -> ClientResult<Subscription> {
        self.round_trip().await;
        let (tx, subscription) = Subscription::channel();
        self.with_model(store_id, model, |m| {
            m.listeners.push(Listener {
                entity_id: entity_id.to_string(),
                tx,
            });
            Ok(())
        })?;
        Ok(subscription)
    }

    async fn get_store_link(&self, store_id: &str) -> ClientResult<Value> {
        self.round_trip().await;
        if !self.lock()?.contains_key(store_id) {
            return Err(ClientError::not_found(format!("store {}", store_id)));
        }
        Ok(json!({
            "addrs": [format!(
                "/ip4/127.0.0.1/tcp/4006/p2p/{}/thread/{}",
                self.inner.peer_id, store_id
            )],
            "followKey": Uuid::new_v5(&Uuid::NAMESPACE_OID, store_id.as_bytes()).simple().to_string(),
            "readKey": Uuid::new_v5(&Uuid::NAMESPACE_URL, store_id.as_bytes()).simple().to_string(),
        }))
    }
}

/// Buffered transaction; writes are applied atomically on `end`
struct MemoryTransaction {
    client: MemoryClient,
    store_id: String,
    model: String,
    kind: TxnKind,
    pending: Mutex<Vec<PendingWrite>>,
    ended: AtomicBool,
}

enum PendingWrite {
    Create(Value),
    Save(Value),
    Delete(Value),
}

impl MemoryTransaction {
    fn new(client: MemoryClient, store_id: &str, model: &str, kind: TxnKind) -> Self {
        Self {
            client,
            store_id: store_id.to_string(),
            model: model.to_string(),
            kind,
            pending: Mutex::new(Vec::new()),
            ended: AtomicBool::new(false),
        }
    }

    fn ensure_open(&self) -> ClientResult<()> {
        if self.ended.load(Ordering::SeqCst) {
            Err(ClientError::remote("transaction already ended"))
        } else {
            Ok(())
        }
    }

    fn stage(&self, write: PendingWrite) -> ClientResult<()> {
        self.ensure_open()?;
        if self.kind == TxnKind::Read {
            return Err(ClientError::remote("cannot write in a read transaction"));
        }
        self.pending
            .lock()
            .map_err(|_| ClientError::remote("transaction state poisoned"))?
            .push(write);
        Ok(())
    }
}

#[async_trait]
impl Transaction for MemoryTransaction {
    fn kind(&self) -> TxnKind {
        self.kind
    }

    async fn has(&self, ids: Value) -> ClientResult<Value> {
        self.ensure_open()?;
        self.client.with_model(&self.store_id, &self.model, |m| m.has(ids))
    }

    async fn find(&self, query: Value) -> ClientResult<Value> {
        self.ensure_open()?;
        self.client.with_model(&self.store_id, &self.model, |m| m.find(query))
    }

    async fn find_by_id(&self, id: &str) -> ClientResult<Value> {
        self.ensure_open()?;
        self.client.with_model(&self.store_id, &self.model, |m| m.find_by_id(id))
    }

    async fn create(&self, entities: Value) -> ClientResult<Value> {
        // IDs are assigned up front so the caller can refer to them before commit
        let mut entities = as_list(entities);
        let mut ids = Vec::with_capacity(entities.len());
        for entity in entities.iter_mut() {
            let id = match entity.get(ID_FIELD).and_then(Value::as_str) {
                Some(id) if !id.is_empty() => id.to_string(),
                _ => Uuid::new_v4().to_string(),
            };
            if let Some(fields) = entity.as_object_mut() {
                fields.insert(ID_FIELD.to_string(), Value::String(id.clone()));
            }
            ids.push(Value::String(id));
        }
        self.stage(PendingWrite::Create(Value::Array(entities)))?;
        Ok(Value::Array(ids))
    }

    async fn save(&self, entities: Value) -> ClientResult<Value> {
        self.stage(PendingWrite::Save(entities))?;
        Ok(Value::Null)
    }

    async fn delete(&self, ids: Value) -> ClientResult<Value> {
        self.stage(PendingWrite::Delete(ids))?;
        Ok(Value::Null)
    }

    async fn end(&self) -> ClientResult<()> {
        if self.ended.swap(true, Ordering::SeqCst) {
            return Err(ClientError::remote("transaction already ended"));
        }
        let pending = std::mem::take(
            &mut *self
                .pending
                .lock()
                .map_err(|_| ClientError::remote("transaction state poisoned"))?,
        );
        if pending.is_empty() {
            return Ok(());
        }

        let model_name = self.model.clone();
        self.client.with_model(&self.store_id, &self.model, move |model| {
            let mut draft = model.clone();
            let mut updates = Vec::new();
            for write in pending {
                let (_, mut applied) = match write {
                    PendingWrite::Create(entities) => draft.create(&model_name, entities)?,
                    PendingWrite::Save(entities) => draft.save(&model_name, entities)?,
                    PendingWrite::Delete(ids) => draft.delete(&model_name, ids)?,
                };
                updates.append(&mut applied);
            }
            model.entities = draft.entities;
            model.notify(&updates);
            Ok(())
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn person_schema() -> Value {
        json!({
            "type": "object",
            "required": ["firstName"],
            "properties": {
                "firstName": { "type": "string" },
                "age": { "type": "integer" }
            }
        })
    }

    async fn people() -> (MemoryClient, String) {
        let client = MemoryClient::new();
        let store = client.new_store().await.unwrap();
        client
            .register_schema(&store.id, "Person", person_schema())
            .await
            .unwrap();
        (client, store.id)
    }

    #[tokio::test]
    async fn create_assigns_ids_and_find_filters() {
        let (client, store) = people().await;
        let ids = client
            .model_create(
                &store,
                "Person",
                json!([{ "firstName": "Adam", "age": 21 }, { "firstName": "Eve", "age": 21 }]),
            )
            .await
            .unwrap();
        assert_eq!(ids.as_array().unwrap().len(), 2);

        let found = client
            .model_find(&store, "Person", json!({ "firstName": "Adam" }))
            .await
            .unwrap();
        let found = found.as_array().unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0]["ID"], ids[0]);
    }

    #[tokio::test]
    async fn schema_rejects_missing_required_field() {
        let (client, store) = people().await;
        let err = client
            .model_create(&store, "Person", json!([{ "age": 3 }]))
            .await
            .unwrap_err();
        assert!(matches!(err, ClientError::Schema(_)));

        // Nothing was stored
        let all = client.model_find(&store, "Person", Value::Null).await.unwrap();
        assert_eq!(all, json!([]));
    }

    #[tokio::test]
    async fn duplicate_schema_is_a_conflict() {
        let (client, store) = people().await;
        let err = client
            .register_schema(&store, "Person", person_schema())
            .await
            .unwrap_err();
        assert!(matches!(err, ClientError::Conflict(_)));
    }

    #[tokio::test]
    async fn unknown_store_and_model_are_not_found() {
        let client = MemoryClient::new();
        assert!(matches!(
            client.start("missing").await,
            Err(ClientError::NotFound(_))
        ));

        let (client, store) = people().await;
        assert!(matches!(
            client.model_has(&store, "Dog", json!(["x"])).await,
            Err(ClientError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn listen_receives_save_and_delete() {
        let (client, store) = people().await;
        let ids = client
            .model_create(&store, "Person", json!({ "firstName": "Adam" }))
            .await
            .unwrap();
        let id = ids[0].as_str().unwrap().to_string();

        let mut sub = client.listen(&store, "Person", &id).await.unwrap();
        client
            .model_save(&store, "Person", json!([{ "ID": id, "firstName": "Adam", "age": 22 }]))
            .await
            .unwrap();
        client.model_delete(&store, "Person", json!([id])).await.unwrap();

        let saved = sub.next().await.unwrap();
        assert_eq!(saved.action, Action::Save);
        assert_eq!(saved.entity.unwrap()["age"], json!(22));
        assert_eq!(sub.next().await.unwrap().action, Action::Delete);
    }

    #[tokio::test]
    async fn write_transaction_commits_on_end() {
        let (client, store) = people().await;
        let txn = client.write_transaction(&store, "Person").await.unwrap();
        let ids = txn.create(json!([{ "firstName": "Eve" }])).await.unwrap();
        let id = ids[0].as_str().unwrap();

        // Not visible before commit
        assert_eq!(client.model_has(&store, "Person", json!([id])).await.unwrap(), json!(false));

        txn.end().await.unwrap();
        assert_eq!(client.model_has(&store, "Person", json!([id])).await.unwrap(), json!(true));
        assert!(txn.end().await.is_err());
    }

    #[tokio::test]
    async fn read_transaction_rejects_writes() {
        let (client, store) = people().await;
        let txn = client.read_transaction(&store, "Person").await.unwrap();
        assert_eq!(txn.kind(), TxnKind::Read);
        assert!(txn.create(json!([{ "firstName": "Eve" }])).await.is_err());
        assert_eq!(txn.find(Value::Null).await.unwrap(), json!([]));
    }

    #[tokio::test]
    async fn failed_commit_leaves_model_untouched() {
        let (client, store) = people().await;
        let txn = client.write_transaction(&store, "Person").await.unwrap();
        txn.create(json!([{ "firstName": "Eve" }])).await.unwrap();
        txn.delete(json!(["no-such-entity"])).await.unwrap();

        assert!(matches!(txn.end().await, Err(ClientError::NotFound(_))));
        assert_eq!(client.model_find(&store, "Person", Value::Null).await.unwrap(), json!([]));
    }
}
