//! Client construction: embedded backend, local daemon, or cloud

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::info;

use super::{ClientResult, HttpClient, MemoryClient, ThreadsClient};

/// Device id sent with cloud credentials when none is configured
pub const DEFAULT_DEVICE_ID: &str = "fa92b33d-1c17-4f65-b232-acce460b6ad9";

/// Cloud credentials
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Credentials {
    pub token: String,
    #[serde(default = "default_device_id")]
    pub device_id: String,
}

fn default_device_id() -> String {
    DEFAULT_DEVICE_ID.to_string()
}

impl Credentials {
    pub fn new(token: impl Into<String>) -> Self {
        Self {
            token: token.into(),
            device_id: default_device_id(),
        }
    }
}

/// Which client `connect` builds
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientMode {
    /// In-process backend, nothing leaves the process
    Embedded,
    /// Local daemon at `host`, no authentication
    Local { host: String },
    /// Cloud gateway at `host`, authenticated with `credentials`
    Cloud { host: String, credentials: Credentials },
}

/// Build a client for `mode`
///
/// Cloud mode authenticates before returning; a rejected token surfaces as
/// `ClientError::Auth`.
pub async fn connect(mode: &ClientMode) -> ClientResult<Arc<dyn ThreadsClient>> {
    match mode {
        ClientMode::Embedded => {
            info!("using embedded threads backend");
            Ok(Arc::new(MemoryClient::new()))
        }
        ClientMode::Local { host } => {
            info!(%host, "using local threads daemon");
            Ok(Arc::new(HttpClient::local(host.as_str())?))
        }
        ClientMode::Cloud { host, credentials } => {
            let client =
                HttpClient::cloud(host.as_str(), &credentials.token, &credentials.device_id).await?;
            Ok(Arc::new(client))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn embedded_client_has_no_host() {
        let client = connect(&ClientMode::Embedded).await.unwrap();
        assert!(client.host().is_none());
    }

    #[tokio::test]
    async fn local_client_reports_host() {
        let client = connect(&ClientMode::Local {
            host: "http://127.0.0.1:6007".to_string(),
        })
        .await
        .unwrap();
        assert_eq!(client.host(), Some("http://127.0.0.1:6007"));
    }

    #[test]
    fn credentials_default_device_id() {
        let creds: Credentials = serde_json::from_str(r#"{"token": "abc"}"#).unwrap();
        assert_eq!(creds, Credentials::new("abc"));
    }
}
