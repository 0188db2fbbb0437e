use std::sync::Arc;
use std::time::Duration;

use serde_json::{json, Value};
use threadsh_core::client::{Action, Call};
use threadsh_core::{
    ClientError, Database, MemoryClient, MockClient, Registry, StoreHandle, TxnKind, Update,
};
use tokio::sync::mpsc;

fn person_schema() -> Value {
    json!({
        "$id": "https://example.com/person.schema.json",
        "title": "Person",
        "type": "object",
        "properties": {
            "firstName": { "type": "string" },
            "age": { "type": "integer", "minimum": 0 }
        }
    })
}

fn mock_db() -> (MockClient, Database) {
    let mock = MockClient::new();
    let db = Database::new(Arc::new(mock.clone()), StoreHandle::new("s1", "people"));
    (mock, db)
}

#[tokio::test]
async fn create_collection_registers_then_binds() {
    let (mock, db) = mock_db();
    assert!(db.collection("Person").is_none());

    let collection = db.create_collection("Person", person_schema()).await.unwrap();
    assert_eq!(collection.name(), "Person");
    assert_eq!(collection.schema(), &person_schema());
    assert_eq!(db.collection("Person").unwrap().name(), "Person");
    assert_eq!(db.collections(), vec!["Person".to_string()]);

    assert_eq!(
        mock.calls(),
        vec![Call {
            op: "register_schema",
            store_id: "s1".to_string(),
            model: Some("Person".to_string()),
            payload: person_schema(),
        }]
    );
}

#[tokio::test]
async fn rejected_schema_creates_no_collection() {
    let (mock, db) = mock_db();
    let rejection = ClientError::schema("schema must declare a type");
    mock.fail("register_schema", rejection.clone());

    let err = db.create_collection("Person", json!({})).await.unwrap_err();
    assert_eq!(err, rejection);
    assert!(db.collection("Person").is_none());
    assert!(db.collections().is_empty());
}

#[tokio::test]
async fn collection_ops_forward_payloads_unchanged() {
    let (mock, db) = mock_db();
    let people = db.create_collection("Person", person_schema()).await.unwrap();

    let entities = json!([{ "firstName": "Adam", "age": 21 }]);
    let ids = json!(["e1", "e2"]);
    let query = json!({ "firstName": "Adam" });

    assert_eq!(people.create(entities.clone()).await.unwrap(), entities);
    assert_eq!(people.save(entities.clone()).await.unwrap(), entities);
    assert_eq!(people.delete(ids.clone()).await.unwrap(), ids);
    assert_eq!(people.has(ids.clone()).await.unwrap(), ids);
    assert_eq!(people.find(query.clone()).await.unwrap(), query);
    assert_eq!(people.get("e1").await.unwrap(), json!("e1"));

    let ops: Vec<(&str, Value)> = mock
        .calls()
        .into_iter()
        .skip(1)
        .map(|c| {
            assert_eq!(c.store_id, "s1");
            assert_eq!(c.model.as_deref(), Some("Person"));
            (c.op, c.payload)
        })
        .collect();
    assert_eq!(
        ops,
        vec![
            ("model_create", entities.clone()),
            ("model_save", entities),
            ("model_delete", ids.clone()),
            ("model_has", ids),
            ("model_find", query),
            ("model_find", json!("e1")),
        ]
    );
}

#[tokio::test]
async fn failures_are_the_client_rejection() {
    let (mock, db) = mock_db();
    let people = db.create_collection("Person", person_schema()).await.unwrap();

    let rejection = ClientError::conflict("entity e1 already exists");
    mock.fail("model_create", rejection.clone());
    assert_eq!(people.create(json!([{}])).await.unwrap_err(), rejection);

    mock.fail("get_store_link", ClientError::Connection("reset".into()));
    assert_eq!(
        db.get_links().await.unwrap_err(),
        ClientError::Connection("reset".into())
    );
}

#[tokio::test]
async fn slow_client_call_times_out() {
    let mock = MockClient::with_latency(Duration::from_millis(200));
    let db = Database::with_timeout(
        Arc::new(mock.clone()),
        StoreHandle::new("s1", "people"),
        Duration::from_millis(20),
    );

    let err = db.get_links().await.unwrap_err();
    assert_eq!(
        err,
        ClientError::Timeout {
            operation: "get_store_link".to_string(),
            millis: 20
        }
    );
}

#[tokio::test]
async fn listen_invokes_callback_per_update() {
    let (mock, db) = mock_db();
    let people = db.create_collection("Person", person_schema()).await.unwrap();

    let (tx, mut rx) = mpsc::unbounded_channel();
    let task = people
        .listen("e1", move |update: Update| {
            let _ = tx.send(update.action);
        })
        .await
        .unwrap();

    for action in [Action::Save, Action::Save, Action::Delete] {
        mock.push_update(Update {
            model: "Person".into(),
            entity_id: "e1".into(),
            action,
            entity: None,
        });
    }

    assert_eq!(rx.recv().await, Some(Action::Save));
    assert_eq!(rx.recv().await, Some(Action::Save));
    assert_eq!(rx.recv().await, Some(Action::Delete));
    task.abort();
}

#[tokio::test]
async fn create_then_find_round_trips_through_backend() {
    let client: Arc<MemoryClient> = Arc::new(MemoryClient::new());
    let registry = Registry::new(client);
    let handle = registry.activate("people", None).await.unwrap();
    let db = Database::from_registry(&registry, handle);
    let people = db.create_collection("Person", person_schema()).await.unwrap();

    let adam = json!({ "ID": "adam", "firstName": "Adam", "lastName": "Doe", "age": 21 });
    people.create(json!([adam.clone()])).await.unwrap();

    let found = people.find(json!({ "firstName": "Adam" })).await.unwrap();
    assert_eq!(found, json!([adam.clone()]));
    assert_eq!(people.get("adam").await.unwrap(), adam);
    assert_eq!(people.has(json!(["adam"])).await.unwrap(), json!(true));
}

#[tokio::test]
async fn transactions_come_back_from_the_client() {
    let registry = Registry::new(Arc::new(MemoryClient::new()));
    let handle = registry.activate("people", None).await.unwrap();
    let db = Database::from_registry(&registry, handle);
    let people = db.create_collection("Person", person_schema()).await.unwrap();

    let write = people.write_transaction().await.unwrap();
    assert_eq!(write.kind(), TxnKind::Write);
    write.create(json!([{ "ID": "eve", "firstName": "Eve" }])).await.unwrap();
    write.end().await.unwrap();

    let read = people.read_transaction().await.unwrap();
    assert_eq!(read.kind(), TxnKind::Read);
    assert_eq!(read.find_by_id("eve").await.unwrap()["firstName"], json!("Eve"));
    read.end().await.unwrap();
}
