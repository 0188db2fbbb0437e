//! Store registry: human-chosen names to store handles
//!
//! `activate` is create-or-reuse. A known name costs no client call; an
//! unknown name costs exactly one `new_store` (or `start` when an explicit
//! id is given). Concurrent activations of the same unknown name share one
//! in-flight call, and a failed call leaves the name unregistered so the
//! next activation tries again.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use futures::future::{BoxFuture, FutureExt, Shared};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::client::{bounded, ClientResult, ThreadsClient, DEFAULT_TIMEOUT};
use crate::error::{ClientError, Result, ThreadsError};

/// Local representation of a remote store
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct StoreHandle {
    id: String,
    name: String,
}

impl StoreHandle {
    pub fn new(id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
        }
    }

    /// Server-issued identifier
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Local name annotation
    pub fn name(&self) -> &str {
        &self.name
    }
}

type Flight = Shared<BoxFuture<'static, ClientResult<StoreHandle>>>;

#[derive(Default)]
struct State {
    stores: HashMap<String, StoreHandle>,
    order: Vec<String>,
    active: Option<String>,
    /// Pending activations by name, with the id each one resumes
    in_flight: HashMap<String, (Option<String>, Flight)>,
}

impl State {
    fn insert(&mut self, handle: StoreHandle) {
        if !self.stores.contains_key(handle.name()) {
            self.order.push(handle.name().to_string());
        }
        self.stores.insert(handle.name().to_string(), handle);
    }

    /// Name already holding `id`, registered or being resumed
    fn claimed_by(&self, id: &str, except: &str) -> Option<String> {
        let stored = self
            .stores
            .values()
            .find(|h| h.id() == id && h.name() != except)
            .map(|h| h.name().to_string());
        stored.or_else(|| {
            self.in_flight
                .iter()
                .find(|(name, (pending, _))| {
                    name.as_str() != except && pending.as_deref() == Some(id)
                })
                .map(|(name, _)| name.clone())
        })
    }
}

fn lock(state: &Mutex<State>) -> MutexGuard<'_, State> {
    state.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Name-to-handle registry with a single active store
pub struct Registry {
    client: Arc<dyn ThreadsClient>,
    timeout: Duration,
    state: Arc<Mutex<State>>,
}

impl Registry {
    pub fn new(client: Arc<dyn ThreadsClient>) -> Self {
        Self::with_timeout(client, DEFAULT_TIMEOUT)
    }

    /// Registry whose store creation/resume calls are bounded by `timeout`
    pub fn with_timeout(client: Arc<dyn ThreadsClient>, timeout: Duration) -> Self {
        Self {
            client,
            timeout,
            state: Arc::new(Mutex::new(State::default())),
        }
    }

    /// The client handles were created through
    pub fn client(&self) -> &Arc<dyn ThreadsClient> {
        &self.client
    }

    /// Deadline applied to delegated calls
    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Activate `name`, creating (or resuming `explicit_id`) on first use
    ///
    /// A known name is reused and no client call is made; passing an
    /// `explicit_id` that differs from the stored one is a
    /// [`ThreadsError::NameConflict`]. An `explicit_id` already registered
    /// under another name, or being resumed under another name right now,
    /// is a [`ThreadsError::IdConflict`].
    pub async fn activate(&self, name: &str, explicit_id: Option<&str>) -> Result<StoreHandle> {
        let flight = {
            let mut state = lock(&self.state);

            if let Some(handle) = state.stores.get(name).cloned() {
                if let Some(id) = explicit_id {
                    if id != handle.id() {
                        return Err(ThreadsError::NameConflict {
                            name: name.to_string(),
                            id: handle.id().to_string(),
                        });
                    }
                }
                debug!(store = %handle.id(), name, "reusing store");
                state.active = Some(name.to_string());
                return Ok(handle);
            }

            if let Some(flight) = state.in_flight.get(name).map(|(_, f)| f.clone()) {
                debug!(name, "joining in-flight activation");
                flight
            } else {
                if let Some(id) = explicit_id {
                    if let Some(existing) = state.claimed_by(id, name) {
                        return Err(ThreadsError::IdConflict {
                            id: id.to_string(),
                            existing,
                        });
                    }
                }
                let flight = self.launch(name, explicit_id);
                state.in_flight.insert(
                    name.to_string(),
                    (explicit_id.map(str::to_string), flight.clone()),
                );
                flight
            }
        };

        let handle = flight.await?;
        lock(&self.state).active = Some(handle.name().to_string());
        Ok(handle)
    }

    /// Start the one client call backing an activation
    ///
    /// Runs on its own task and records the handle itself, so a store the
    /// client created is registered even if every caller awaiting it goes
    /// away.
    fn launch(&self, name: &str, explicit_id: Option<&str>) -> Flight {
        let client = Arc::clone(&self.client);
        let state = Arc::clone(&self.state);
        let timeout = self.timeout;
        let name = name.to_string();
        let explicit_id = explicit_id.map(str::to_string);

        let task = tokio::spawn(async move {
            let created = match explicit_id {
                None => bounded("new_store", timeout, client.new_store())
                    .await
                    .map(|info| info.id),
                Some(id) => {
                    let started = bounded("start", timeout, client.start(&id)).await;
                    started.map(|()| id)
                }
            };

            let mut state = lock(&state);
            state.in_flight.remove(&name);
            let id = created?;
            if let Some(existing) = state.claimed_by(&id, &name) {
                return Err(ClientError::conflict(format!(
                    "store '{}' is already registered as '{}'",
                    id, existing
                )));
            }
            let handle = StoreHandle::new(id, name);
            info!(store = %handle.id(), name = %handle.name(), "registered store");
            state.insert(handle.clone());
            Ok::<_, ClientError>(handle)
        });

        async move {
            task.await.unwrap_or_else(|e| {
                Err(ClientError::remote(format!("store activation aborted: {}", e)))
            })
        }
        .boxed()
        .shared()
    }

    /// The active store, if any
    pub fn active(&self) -> Option<StoreHandle> {
        let state = lock(&self.state);
        state
            .active
            .as_ref()
            .and_then(|name| state.stores.get(name))
            .cloned()
    }

    /// Look up a store without changing the active one
    pub fn get(&self, name: &str) -> Option<StoreHandle> {
        lock(&self.state).stores.get(name).cloned()
    }

    pub fn exists(&self, name: &str) -> bool {
        lock(&self.state).stores.contains_key(name)
    }

    /// Registered names in insertion order
    pub fn list(&self) -> Vec<String> {
        lock(&self.state).order.clone()
    }

    /// Registered handles in insertion order
    pub fn handles(&self) -> Vec<StoreHandle> {
        let state = lock(&self.state);
        state
            .order
            .iter()
            .filter_map(|name| state.stores.get(name).cloned())
            .collect()
    }

    pub fn len(&self) -> usize {
        lock(&self.state).stores.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
