//! Shell state and command execution
//!
//! A `Session` owns everything the shell binds between lines: the client and
//! its registry (replaced on every `auth`), one `Database` per activated
//! store, the open transaction and live subscriptions. Subscription output
//! arrives on the notice channel handed out by [`Session::new`].

use std::collections::HashMap;
use std::time::Duration;

use anyhow::{anyhow, bail, Context, Result};
use serde_json::Value;
use threadsh_core::client::{bounded, DEFAULT_DEVICE_ID};
use threadsh_core::connectivity::probe;
use threadsh_core::{
    connect, ClientMode, Collection, Credentials, Database, Registry, ThreadsError,
    ThreadshConfig, Transaction, TxnKind, Update,
};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info};

use super::command::{help_text, Command, CollectionOp, TxOp};
use super::playground;
use crate::ui;

/// How long the post-auth reachability check waits for the API
const PROBE_TIMEOUT: Duration = Duration::from_secs(3);

/// What the shell should do after a command
#[derive(Debug, Clone, PartialEq)]
pub enum Reply {
    /// Print this and keep going
    Say(String),
    /// Nothing to print
    Quiet,
    /// Leave the shell normally
    Exit,
    /// Print this as an error and leave the shell with status 1
    Abort(String),
}

pub struct Session {
    config: ThreadshConfig,
    mode: ClientMode,
    registry: Option<Registry>,
    databases: HashMap<String, Database>,
    tx: Option<Box<dyn Transaction>>,
    listeners: Vec<JoinHandle<()>>,
    notices: mpsc::UnboundedSender<String>,
}

impl Session {
    /// New, unauthenticated session; `mode` is what a bare `auth` connects to
    pub fn new(config: ThreadshConfig, mode: ClientMode) -> (Self, mpsc::UnboundedReceiver<String>) {
        let (notices, rx) = mpsc::unbounded_channel();
        let session = Self {
            config,
            mode,
            registry: None,
            databases: HashMap::new(),
            tx: None,
            listeners: Vec::new(),
            notices,
        };
        (session, rx)
    }

    pub async fn execute(&mut self, command: Command) -> Result<Reply> {
        debug!(?command, "executing");
        match command {
            Command::Empty => Ok(Reply::Quiet),
            Command::Help => Ok(Reply::Say(help_text().to_string())),
            Command::Exit => Ok(Reply::Exit),
            Command::Playground => Ok(Reply::Say(playground::describe())),
            Command::Usage(usage) => bail!("usage: {}", usage),
            Command::Unknown { cmd } => bail!("unknown command '{}', try `help`", cmd),
            Command::Auth { token } => self.auth(token).await,
            Command::Use { name, id } => self.use_store(&name, id.as_deref()).await,
            Command::Show => self.show(),
            Command::Store => {
                let handle = self.registry()?.active().ok_or(ThreadsError::NoActiveStore)?;
                Ok(Reply::Say(format!("{}  {}", handle.name(), handle.id())))
            }
            Command::CreateCollection { name, schema } => {
                let schema = payload(&schema)?;
                self.db()?.create_collection(&name, schema).await?;
                Ok(Reply::Say(format!("Collection {} created.", name)))
            }
            Command::GetLinks => {
                let links = self.db()?.get_links().await?;
                Ok(show_value(&links))
            }
            Command::Collection {
                collection,
                op,
                arg,
            } => self.collection_op(&collection, op, &arg).await,
            Command::Transaction { op, arg } => self.transaction_op(op, &arg).await,
            Command::EndTransaction => {
                let tx = self.tx.take().ok_or_else(no_transaction)?;
                bounded("tx.end", self.config.timeout(), tx.end()).await?;
                Ok(Reply::Say("Transaction ended".into()))
            }
        }
    }

    /// Run the `--project-*` startup options before the first prompt
    pub async fn bootstrap(
        &mut self,
        token: Option<String>,
        db_name: Option<String>,
        db_id: Option<String>,
    ) -> Result<Vec<Reply>> {
        let mut replies = Vec::new();
        if token.is_none() && db_name.is_none() {
            return Ok(replies);
        }

        let reply = self.auth(token).await?;
        let aborted = matches!(reply, Reply::Abort(_));
        replies.push(reply);
        if aborted {
            return Ok(replies);
        }

        if let Some(name) = db_name {
            replies.push(self.use_store(&name, db_id.as_deref()).await?);
        } else if db_id.is_some() {
            bail!("--project-db-id needs --project-db-name");
        }
        Ok(replies)
    }

    pub fn registry(&self) -> Result<&Registry> {
        self.registry
            .as_ref()
            .ok_or_else(|| anyhow!("not authenticated, run `auth` first"))
    }

    /// Database bound to the active store
    pub fn db(&self) -> Result<&Database> {
        let active = self.registry()?.active().ok_or(ThreadsError::NoActiveStore)?;
        self.databases
            .get(active.name())
            .ok_or_else(|| ThreadsError::NoActiveStore.into())
    }

    async fn auth(&mut self, token: Option<String>) -> Result<Reply> {
        let mode = match token {
            Some(token) => ClientMode::Cloud {
                host: self.config.client.host.clone(),
                credentials: Credentials {
                    token,
                    device_id: self
                        .config
                        .client
                        .device_id
                        .clone()
                        .unwrap_or_else(|| DEFAULT_DEVICE_ID.to_string()),
                },
            },
            None => self.mode.clone(),
        };

        let pb = ui::spinner("Authenticating...");
        let client = match connect(&mode).await {
            Ok(client) => {
                ui::finish_success(pb, "Authenticated");
                client
            }
            Err(e) => {
                ui::finish_error(pb, format!("Auth: {}", e));
                return Err(e).context("authentication failed");
            }
        };

        self.reset();
        let host = client.host().map(str::to_string);
        self.registry = Some(Registry::with_timeout(client, self.config.timeout()));

        let Some(host) = host else {
            return Ok(Reply::Say("Authenticated! Using the embedded threads backend".into()));
        };
        match probe(&host, PROBE_TIMEOUT).await {
            Ok(()) => {
                info!(%host, "threads API reachable");
                Ok(Reply::Say(format!("Authenticated! Connected to threads API: {}", host)))
            }
            Err(e) => Ok(Reply::Abort(format!(
                "Shoot, unable to connect to the Threads API: {}",
                e
            ))),
        }
    }

    /// Drop everything bound to the previous client
    fn reset(&mut self) {
        for listener in self.listeners.drain(..) {
            listener.abort();
        }
        self.tx = None;
        self.databases.clear();
        self.registry = None;
    }

    async fn use_store(&mut self, name: &str, id: Option<&str>) -> Result<Reply> {
        let registry = self.registry()?;
        let handle = registry.activate(name, id).await?;
        let db = Database::from_registry(registry, handle.clone());
        self.databases.entry(handle.name().to_string()).or_insert(db);
        Ok(Reply::Say(format!(
            "Switched to {} ({})",
            handle.name(),
            handle.id()
        )))
    }

    fn show(&self) -> Result<Reply> {
        let registry = self.registry()?;
        let handles = registry.handles();
        if handles.is_empty() {
            return Ok(Reply::Say("no stores yet, run `use <name>`".into()));
        }
        let active = registry.active();
        let lines: Vec<String> = handles
            .iter()
            .map(|handle| {
                let marker = if active.as_ref() == Some(handle) { "*" } else { " " };
                format!("{} {}  {}", marker, handle.name(), handle.id())
            })
            .collect();
        Ok(Reply::Say(lines.join("\n")))
    }

    fn collection(&self, name: &str) -> Result<Collection> {
        self.db()?
            .collection(name)
            .ok_or_else(|| ThreadsError::UnknownCollection(name.to_string()).into())
    }

    async fn collection_op(&mut self, name: &str, op: CollectionOp, arg: &str) -> Result<Reply> {
        let collection = self.collection(name)?;
        match op {
            CollectionOp::Create => {
                let created = collection.create(payload(arg)?).await?;
                Ok(say_with(format!("Entities created in collection {}", name), &created))
            }
            CollectionOp::Save => {
                collection.save(payload(arg)?).await?;
                Ok(Reply::Say(format!("Entities saved to collection {}", name)))
            }
            CollectionOp::Delete => {
                collection.delete(payload(arg)?).await?;
                Ok(Reply::Say(format!("Entities deleted from collection {}", name)))
            }
            CollectionOp::Has => Ok(show_value(&collection.has(payload(arg)?).await?)),
            CollectionOp::Find => Ok(show_value(&collection.find(payload(arg)?).await?)),
            CollectionOp::Get => Ok(show_value(&collection.get(&entity_id(arg)).await?)),
            CollectionOp::Listen => {
                let id = entity_id(arg);
                let notices = self.notices.clone();
                let listener = collection
                    .listen(&id, move |update: Update| {
                        let _ = notices.send(describe_update(&update));
                    })
                    .await?;
                self.listeners.retain(|l| !l.is_finished());
                self.listeners.push(listener);
                Ok(Reply::Say(format!("Listening to {}:{}...", name, id)))
            }
            CollectionOp::ReadTransaction | CollectionOp::WriteTransaction => {
                if let Some(open) = &self.tx {
                    bail!("a {} transaction is already open, run `tx.end` first", open.kind());
                }
                let tx = if op == CollectionOp::ReadTransaction {
                    collection.read_transaction().await?
                } else {
                    collection.write_transaction().await?
                };
                let kind = tx.kind();
                self.tx = Some(tx);
                let label = match kind {
                    TxnKind::Read => "read-only",
                    TxnKind::Write => "writeable",
                };
                Ok(Reply::Say(format!(
                    "Started {} transaction for {}, available as tx",
                    label, name
                )))
            }
        }
    }

    async fn transaction_op(&self, op: TxOp, arg: &str) -> Result<Reply> {
        let limit = self.config.timeout();
        let tx = self.tx.as_ref().ok_or_else(no_transaction)?;
        let result = match op {
            TxOp::Create => bounded("tx.create", limit, tx.create(payload(arg)?)).await?,
            TxOp::Save => bounded("tx.save", limit, tx.save(payload(arg)?)).await?,
            TxOp::Delete => bounded("tx.delete", limit, tx.delete(payload(arg)?)).await?,
            TxOp::Has => bounded("tx.has", limit, tx.has(payload(arg)?)).await?,
            TxOp::Find => bounded("tx.find", limit, tx.find(payload(arg)?)).await?,
            TxOp::Get => bounded("tx.get", limit, tx.find_by_id(&entity_id(arg))).await?,
        };
        Ok(show_value(&result))
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        for listener in &self.listeners {
            listener.abort();
        }
    }
}

fn no_transaction() -> anyhow::Error {
    anyhow!("no open transaction, start one with db.<collection>.readTransaction or writeTransaction")
}

/// Parse a JSON argument after fixture expansion
fn payload(text: &str) -> Result<Value> {
    serde_json::from_str(&playground::expand(text))
        .map_err(|e| ThreadsError::json(format!("argument `{}`", text), e).into())
}

/// An entity id given bare (`abc`) or as a JSON string (`"abc"`)
fn entity_id(text: &str) -> String {
    match serde_json::from_str::<Value>(text) {
        Ok(Value::String(id)) => id,
        _ => text.trim().to_string(),
    }
}

fn show_value(value: &Value) -> Reply {
    match value {
        Value::Null => Reply::Say("Success".into()),
        other => Reply::Say(pretty(other)),
    }
}

fn say_with(message: String, value: &Value) -> Reply {
    match value {
        Value::Null => Reply::Say(message),
        other => Reply::Say(format!("{}\n{}", message, pretty(other))),
    }
}

fn pretty(value: &Value) -> String {
    serde_json::to_string_pretty(value).unwrap_or_else(|_| value.to_string())
}

fn describe_update(update: &Update) -> String {
    match &update.entity {
        Some(entity) => format!(
            "{:?} {}:{} {}",
            update.action, update.model, update.entity_id, entity
        ),
        None => format!("{:?} {}:{}", update.action, update.model, update.entity_id),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::repl::command::parse_line;
    use serde_json::json;

    fn embedded() -> (Session, mpsc::UnboundedReceiver<String>) {
        Session::new(ThreadshConfig::default(), ClientMode::Embedded)
    }

    async fn run(session: &mut Session, line: &str) -> Result<Reply> {
        session.execute(parse_line(line)).await
    }

    fn said(reply: Reply) -> String {
        match reply {
            Reply::Say(text) => text,
            other => panic!("expected Say, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_use_requires_auth() {
        let (mut session, _) = embedded();
        let err = run(&mut session, "use people").await.unwrap_err();
        assert!(err.to_string().contains("auth"));
    }

    #[tokio::test]
    async fn test_use_show_store() {
        let (mut session, _) = embedded();
        said(run(&mut session, "auth").await.unwrap());

        let first = said(run(&mut session, "use people").await.unwrap());
        assert!(first.starts_with("Switched to people"));
        run(&mut session, "use pets").await.unwrap();
        let again = said(run(&mut session, "use people").await.unwrap());
        assert_eq!(first, again);

        let shown = said(run(&mut session, "show").await.unwrap());
        let lines: Vec<&str> = shown.lines().collect();
        assert_eq!(lines.len(), 2);
        assert!(lines[0].starts_with("* people"));
        assert!(lines[1].starts_with("  pets"));

        let store = said(run(&mut session, "store").await.unwrap());
        assert!(store.starts_with("people  "));
    }

    #[tokio::test]
    async fn test_collection_needs_active_store() {
        let (mut session, _) = embedded();
        run(&mut session, "auth").await.unwrap();
        let err = run(&mut session, "db.createCollection @model @schema")
            .await
            .unwrap_err();
        assert!(matches!(
            err.downcast_ref::<ThreadsError>(),
            Some(ThreadsError::NoActiveStore)
        ));
    }

    #[tokio::test]
    async fn test_playground_flow() {
        let (mut session, _) = embedded();
        run(&mut session, "auth").await.unwrap();
        run(&mut session, "use people").await.unwrap();

        let created = said(run(&mut session, "db.createCollection @model @schema").await.unwrap());
        assert_eq!(created, "Collection Person created.");

        let err = run(&mut session, "db.Pets.find {}").await.unwrap_err();
        assert!(matches!(
            err.downcast_ref::<ThreadsError>(),
            Some(ThreadsError::UnknownCollection(name)) if name == "Pets"
        ));

        said(run(&mut session, "db.Person.create [@adam, @eve]").await.unwrap());
        let found = said(run(&mut session, "db.Person.find @query").await.unwrap());
        let found: Value = serde_json::from_str(&found).unwrap();
        let found = found.as_array().unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0]["lastName"], json!("Doe"));

        let id = found[0]["ID"].as_str().unwrap().to_string();
        let got = said(run(&mut session, &format!("db.Person.get {}", id)).await.unwrap());
        assert!(got.contains("Adam"));
        let has = said(run(&mut session, &format!("db.Person.has [\"{}\"]", id)).await.unwrap());
        assert_eq!(has, "true");
    }

    #[tokio::test]
    async fn test_collections_survive_store_switch() {
        let (mut session, _) = embedded();
        run(&mut session, "auth").await.unwrap();
        run(&mut session, "use people").await.unwrap();
        run(&mut session, "db.createCollection @model @schema").await.unwrap();
        run(&mut session, "use pets").await.unwrap();
        assert!(run(&mut session, "db.Person.find {}").await.is_err());

        run(&mut session, "use people").await.unwrap();
        said(run(&mut session, "db.Person.find {}").await.unwrap());
    }

    #[tokio::test]
    async fn test_bad_json_is_reported() {
        let (mut session, _) = embedded();
        run(&mut session, "auth").await.unwrap();
        run(&mut session, "use people").await.unwrap();
        run(&mut session, "db.createCollection @model @schema").await.unwrap();

        let err = run(&mut session, "db.Person.create [{oops").await.unwrap_err();
        assert!(matches!(
            err.downcast_ref::<ThreadsError>(),
            Some(ThreadsError::Json { .. })
        ));
    }

    #[tokio::test]
    async fn test_transaction_lifecycle() {
        let (mut session, _) = embedded();
        run(&mut session, "auth").await.unwrap();
        run(&mut session, "use people").await.unwrap();
        run(&mut session, "db.createCollection @model @schema").await.unwrap();

        assert!(run(&mut session, "tx.end").await.is_err());

        said(run(&mut session, "db.Person.writeTransaction").await.unwrap());
        assert!(run(&mut session, "db.Person.readTransaction").await.is_err());
        run(&mut session, r#"tx.create [{"ID": "adam", "firstName": "Adam"}]"#)
            .await
            .unwrap();
        said(run(&mut session, "tx.end").await.unwrap());

        said(run(&mut session, "db.Person.readTransaction").await.unwrap());
        let got = said(run(&mut session, "tx.get adam").await.unwrap());
        assert!(got.contains("Adam"));
        assert!(run(&mut session, "tx.save [@eve]").await.is_err());
        run(&mut session, "tx.end").await.unwrap();
    }

    #[tokio::test]
    async fn test_listen_forwards_updates_to_notices() {
        let (mut session, mut notices) = embedded();
        run(&mut session, "auth").await.unwrap();
        run(&mut session, "use people").await.unwrap();
        run(&mut session, "db.createCollection @model @schema").await.unwrap();
        run(&mut session, r#"db.Person.create [{"ID": "adam", "firstName": "Adam"}]"#)
            .await
            .unwrap();

        let listening = said(run(&mut session, "db.Person.listen adam").await.unwrap());
        assert_eq!(listening, "Listening to Person:adam...");

        run(&mut session, r#"db.Person.save [{"ID": "adam", "firstName": "Adama"}]"#)
            .await
            .unwrap();
        let notice = tokio::time::timeout(Duration::from_secs(2), notices.recv())
            .await
            .unwrap()
            .unwrap();
        assert!(notice.starts_with("Save Person:adam"));
    }

    #[tokio::test]
    async fn test_auth_resets_bindings() {
        let (mut session, _) = embedded();
        run(&mut session, "auth").await.unwrap();
        run(&mut session, "use people").await.unwrap();
        run(&mut session, "auth").await.unwrap();

        let shown = said(run(&mut session, "show").await.unwrap());
        assert!(shown.starts_with("no stores"));
    }

    #[tokio::test]
    async fn test_unreachable_api_aborts() {
        let mode = ClientMode::Local {
            host: "http://127.0.0.1:9".to_string(),
        };
        let (mut session, _) = Session::new(ThreadshConfig::default(), mode);
        let reply = run(&mut session, "auth").await.unwrap();
        assert!(matches!(reply, Reply::Abort(msg) if msg.contains("unable to connect")));
    }

    #[tokio::test]
    async fn test_bootstrap_activates_project_db() {
        let (mut session, _) = embedded();
        let replies = session
            .bootstrap(None, Some("people".into()), None)
            .await
            .unwrap();
        assert_eq!(replies.len(), 2);
        let active = session.registry().unwrap().active().unwrap();
        assert_eq!(active.name(), "people");
    }

    #[tokio::test]
    async fn test_bootstrap_unknown_project_db_id_fails() {
        let (mut session, _) = embedded();
        let err = session
            .bootstrap(None, Some("people".into()), Some("missing".into()))
            .await
            .unwrap_err();
        assert!(matches!(
            err.downcast_ref::<ThreadsError>(),
            Some(ThreadsError::Client(threadsh_core::ClientError::NotFound(_)))
        ));
        assert!(session.registry().unwrap().is_empty());
    }

    #[test]
    fn test_entity_id_forms() {
        assert_eq!(entity_id("abc"), "abc");
        assert_eq!(entity_id("\"abc\""), "abc");
        assert_eq!(entity_id(" abc "), "abc");
    }
}
