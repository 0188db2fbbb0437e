//! JSON-over-HTTP bridge to a threads gateway
//!
//! Every client call maps to one request under `{host}/v1`:
//!
//! ```text
//! POST /v1/auth                                   cloud session exchange
//! POST /v1/stores                                 new_store
//! POST /v1/stores/{id}/start                      start
//! GET  /v1/stores/{id}/link                       get_store_link
//! PUT  /v1/stores/{id}/models/{model}             register_schema
//! POST /v1/stores/{id}/models/{model}/{op}        create|save|delete|has|find
//! POST /v1/stores/{id}/models/{model}/transactions
//! POST /v1/transactions/{txn}/{op}                has|find|find_by_id|create|save|delete|end
//! GET  /v1/stores/{id}/models/{model}/listen      NDJSON stream of updates
//! ```
//!
//! Ids and model names are percent-encoded as single path segments.
//!
//! Non-2xx responses carry `{"error": "...", "details": "..."}` and are
//! mapped onto [`ClientError`] by status code.

use async_trait::async_trait;
use reqwest::{Client, RequestBuilder, Response, StatusCode, Url};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::{debug, info};

use super::{ClientResult, StoreInfo, Subscription, ThreadsClient, Transaction, TxnKind, Update};
use crate::error::ClientError;

/// Header carrying the cloud session token
const SESSION_HEADER: &str = "x-threads-session";

#[derive(Clone)]
pub struct HttpClient {
    http: Client,
    host: String,
    session: Option<String>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct AuthRequest<'a> {
    token: &'a str,
    device_id: &'a str,
}

#[derive(Deserialize)]
struct AuthResponse {
    session: String,
}

#[derive(Serialize)]
struct Payload {
    values: Value,
}

#[derive(Deserialize)]
struct ResultEnvelope {
    #[serde(default)]
    result: Value,
}

#[derive(Deserialize)]
struct TxnOpened {
    id: String,
}

#[derive(Deserialize, Debug)]
struct ErrorResponse {
    error: String,
    #[serde(default)]
    details: Option<String>,
}

impl HttpClient {
    /// Client for a local daemon, no credentials
    pub fn local(host: impl Into<String>) -> ClientResult<Self> {
        let http = Client::builder()
            .build()
            .map_err(|e| ClientError::Transport(format!("failed to build HTTP client: {}", e)))?;
        Ok(Self {
            http,
            host: host.into().trim_end_matches('/').to_string(),
            session: None,
        })
    }

    /// Client authenticated against the cloud gateway
    ///
    /// The token/device pair is exchanged for a session before the client is
    /// returned, so a bad token fails here rather than on first use.
    pub async fn cloud(host: impl Into<String>, token: &str, device_id: &str) -> ClientResult<Self> {
        let mut client = Self::local(host)?;
        let response = client
            .http
            .post(client.url(&["auth"])?)
            .json(&AuthRequest { token, device_id })
            .send()
            .await
            .map_err(request_error)?;
        let auth: AuthResponse = handle_response(response).await.map_err(|e| match e {
            ClientError::Remote(reason) | ClientError::NotFound(reason) => ClientError::Auth(reason),
            other => other,
        })?;
        info!(host = %client.host, "authenticated against threads gateway");
        client.session = Some(auth.session);
        Ok(client)
    }

    /// `{host}/v1/` followed by `segments`, each encoded on its own
    fn url(&self, segments: &[&str]) -> ClientResult<Url> {
        let invalid = |reason: String| {
            ClientError::Connection(format!("invalid API address '{}': {}", self.host, reason))
        };
        let mut url = Url::parse(&self.host).map_err(|e| invalid(e.to_string()))?;
        url.path_segments_mut()
            .map_err(|()| invalid("cannot carry a path".to_string()))?
            .pop_if_empty()
            .push("v1")
            .extend(segments);
        Ok(url)
    }

    fn model_url(&self, store_id: &str, model: &str, op: &str) -> ClientResult<Url> {
        self.url(&["stores", store_id, "models", model, op])
    }

    fn authorize(&self, request: RequestBuilder) -> RequestBuilder {
        match &self.session {
            Some(session) => request.header(SESSION_HEADER, session),
            None => request,
        }
    }

    async fn send<T: DeserializeOwned>(&self, request: RequestBuilder) -> ClientResult<T> {
        let response = self.authorize(request).send().await.map_err(request_error)?;
        handle_response(response).await
    }

    async fn send_empty(&self, request: RequestBuilder) -> ClientResult<()> {
        let response = self.authorize(request).send().await.map_err(request_error)?;
        if response.status().is_success() {
            Ok(())
        } else {
            Err(error_from(response).await)
        }
    }

    async fn model_op(&self, store_id: &str, model: &str, op: &str, values: Value) -> ClientResult<Value> {
        debug!(store = store_id, model, op, "model request");
        let envelope: ResultEnvelope = self
            .send(self.http.post(self.model_url(store_id, model, op)?).json(&Payload { values }))
            .await?;
        Ok(envelope.result)
    }

    async fn open_transaction(
        &self,
        store_id: &str,
        model: &str,
        kind: TxnKind,
    ) -> ClientResult<Box<dyn Transaction>> {
        let opened: TxnOpened = self
            .send(
                self.http
                    .post(self.model_url(store_id, model, "transactions")?)
                    .json(&json!({ "kind": kind })),
            )
            .await?;
        Ok(Box::new(HttpTransaction {
            client: self.clone(),
            id: opened.id,
            kind,
        }))
    }
}

fn request_error(err: reqwest::Error) -> ClientError {
    if err.is_connect() || err.is_timeout() {
        ClientError::Connection(err.to_string())
    } else {
        ClientError::Transport(err.to_string())
    }
}

async fn handle_response<T: DeserializeOwned>(response: Response) -> ClientResult<T> {
    if response.status().is_success() {
        response
            .json::<T>()
            .await
            .map_err(|e| ClientError::Transport(format!("failed to parse response: {}", e)))
    } else {
        Err(error_from(response).await)
    }
}

async fn error_from(response: Response) -> ClientError {
    let status = response.status();
    let text = response
        .text()
        .await
        .unwrap_or_else(|_| "Unknown error".to_string());
    let reason = match serde_json::from_str::<ErrorResponse>(&text) {
        Ok(err) => match err.details {
            Some(details) => format!("{}: {}", err.error, details),
            None => err.error,
        },
        Err(_) => format!("{} {}", status, text.trim()),
    };

    match status {
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => ClientError::Auth(reason),
        StatusCode::NOT_FOUND => ClientError::NotFound(reason),
        StatusCode::CONFLICT => ClientError::Conflict(reason),
        StatusCode::BAD_REQUEST | StatusCode::UNPROCESSABLE_ENTITY => ClientError::Schema(reason),
        _ => ClientError::Remote(reason),
    }
}

/// Split complete NDJSON lines off the front of `buffer`
fn drain_lines(buffer: &mut Vec<u8>) -> Vec<String> {
    let mut lines = Vec::new();
    while let Some(pos) = buffer.iter().position(|b| *b == b'\n') {
        let line: Vec<u8> = buffer.drain(..=pos).collect();
        let line = String::from_utf8_lossy(&line).trim().to_string();
        if !line.is_empty() {
            lines.push(line);
        }
    }
    lines
}

#[async_trait]
impl ThreadsClient for HttpClient {
    fn host(&self) -> Option<&str> {
        Some(&self.host)
    }

    async fn new_store(&self) -> ClientResult<StoreInfo> {
        self.send(self.http.post(self.url(&["stores"])?)).await
    }

    async fn start(&self, store_id: &str) -> ClientResult<()> {
        self.send_empty(self.http.post(self.url(&["stores", store_id, "start"])?))
            .await
    }

    async fn register_schema(&self, store_id: &str, model: &str, schema: Value) -> ClientResult<()> {
        self.send_empty(
            self.http
                .put(self.url(&["stores", store_id, "models", model])?)
                .json(&json!({ "schema": schema })),
        )
        .await
    }

    async fn model_create(&self, store_id: &str, model: &str, entities: Value) -> ClientResult<Value> {
        self.model_op(store_id, model, "create", entities).await
    }

    async fn model_save(&self, store_id: &str, model: &str, entities: Value) -> ClientResult<Value> {
        self.model_op(store_id, model, "save", entities).await
    }

    async fn model_delete(&self, store_id: &str, model: &str, ids: Value) -> ClientResult<Value> {
        self.model_op(store_id, model, "delete", ids).await
    }

    async fn model_has(&self, store_id: &str, model: &str, ids: Value) -> ClientResult<Value> {
        self.model_op(store_id, model, "has", ids).await
    }

    async fn model_find(&self, store_id: &str, model: &str, query: Value) -> ClientResult<Value> {
        self.model_op(store_id, model, "find", query).await
    }

    async fn read_transaction(&self, store_id: &str, model: &str) -> ClientResult<Box<dyn Transaction>> {
        self.open_transaction(store_id, model, TxnKind::Read).await
    }

    async fn write_transaction(&self, store_id: &str, model: &str) -> ClientResult<Box<dyn Transaction>> {
        self.open_transaction(store_id, model, TxnKind::Write).await
    }

    async fn listen(&self, store_id: &str, model: &str, entity_id: &str) -> ClientResult<Subscription> {
        let request = self
            .http
            .get(self.model_url(store_id, model, "listen")?)
            .query(&[("entity", entity_id)]);
        let mut response = self.authorize(request).send().await.map_err(request_error)?;
        if !response.status().is_success() {
            return Err(error_from(response).await);
        }

        let (tx, subscription) = Subscription::channel();
        tokio::spawn(async move {
            let mut buffer = Vec::new();
            while let Ok(Some(chunk)) = response.chunk().await {
                buffer.extend_from_slice(&chunk);
                for line in drain_lines(&mut buffer) {
                    match serde_json::from_str::<Update>(&line) {
                        Ok(update) => {
                            if tx.send(update).is_err() {
                                return;
                            }
                        }
                        Err(e) => debug!(error = %e, "skipping malformed update"),
                    }
                }
            }
        });
        Ok(subscription)
    }

    async fn get_store_link(&self, store_id: &str) -> ClientResult<Value> {
        self.send(self.http.get(self.url(&["stores", store_id, "link"])?))
            .await
    }
}

struct HttpTransaction {
    client: HttpClient,
    id: String,
    kind: TxnKind,
}

impl HttpTransaction {
    async fn op(&self, op: &str, values: Value) -> ClientResult<Value> {
        let url = self.client.url(&["transactions", self.id.as_str(), op])?;
        let envelope: ResultEnvelope = self
            .client
            .send(self.client.http.post(url).json(&Payload { values }))
            .await?;
        Ok(envelope.result)
    }
}

#[async_trait]
impl Transaction for HttpTransaction {
    fn kind(&self) -> TxnKind {
        self.kind
    }

    async fn has(&self, ids: Value) -> ClientResult<Value> {
        self.op("has", ids).await
    }

    async fn find(&self, query: Value) -> ClientResult<Value> {
        self.op("find", query).await
    }

    async fn find_by_id(&self, id: &str) -> ClientResult<Value> {
        self.op("find_by_id", Value::String(id.to_string())).await
    }

    async fn create(&self, entities: Value) -> ClientResult<Value> {
        self.op("create", entities).await
    }

    async fn save(&self, entities: Value) -> ClientResult<Value> {
        self.op("save", entities).await
    }

    async fn delete(&self, ids: Value) -> ClientResult<Value> {
        self.op("delete", ids).await
    }

    async fn end(&self) -> ClientResult<()> {
        let url = self.client.url(&["transactions", self.id.as_str(), "end"])?;
        self.client.send_empty(self.client.http.post(url)).await
    }
}
