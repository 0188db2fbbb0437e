use serde::{Deserialize, Serialize};
use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::client::{ClientMode, Credentials, DEFAULT_DEVICE_ID};
use crate::error::{Result, ThreadsError};

/// Threads daemon API address used when nothing is configured
pub const DEFAULT_HOST: &str = "http://127.0.0.1:6007";

/// Configuration for threadsh, read from ~/.threadsh/config.toml
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ThreadshConfig {
    #[serde(default)]
    pub client: ClientConfig,
    #[serde(default)]
    pub shell: ShellConfig,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ModeName {
    #[default]
    Local,
    Cloud,
    Embedded,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClientConfig {
    #[serde(default)]
    pub mode: ModeName,
    #[serde(default = "default_host")]
    pub host: String,
    pub token: Option<String>,
    pub device_id: Option<String>,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ShellConfig {
    #[serde(default = "default_prompt")]
    pub prompt: String,
}

fn default_host() -> String {
    DEFAULT_HOST.to_string()
}

fn default_timeout_secs() -> u64 {
    30
}

fn default_prompt() -> String {
    "threads> ".to_string()
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            mode: ModeName::default(),
            host: default_host(),
            token: None,
            device_id: None,
            timeout_secs: default_timeout_secs(),
        }
    }
}

impl Default for ShellConfig {
    fn default() -> Self {
        Self {
            prompt: default_prompt(),
        }
    }
}

impl ThreadshConfig {
    /// Load `path`, or the defaults if there is no file there
    pub fn load_or_default(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }
        Self::load_from(path)
    }

    /// Load and expand a specific config file
    pub fn load_from(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path)
            .map_err(|e| ThreadsError::config(path, format!("failed to read: {}", e)))?;

        let mut config: Self = toml::from_str(&content)
            .map_err(|e| ThreadsError::config(path, format!("invalid TOML: {}", e)))?;

        config.expand_variables();
        Ok(config)
    }

    /// Config file path: $THREADSH_CONFIG or ~/.threadsh/config.toml
    pub fn config_path() -> PathBuf {
        if let Ok(path) = env::var("THREADSH_CONFIG") {
            return PathBuf::from(path);
        }
        dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(".threadsh/config.toml")
    }

    /// Expand ${VAR} references from the environment
    fn expand_variables(&mut self) {
        self.client.host = expand_string(&self.client.host);
        if let Some(ref token) = self.client.token {
            self.client.token = Some(expand_string(token));
        }
        if let Some(ref device_id) = self.client.device_id {
            self.client.device_id = Some(expand_string(device_id));
        }
    }

    /// Per-call deadline for delegated client calls
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.client.timeout_secs.max(1))
    }

    /// Resolve the client mode; cloud mode requires a non-empty token
    pub fn client_mode(&self) -> Result<ClientMode> {
        let client = &self.client;
        match client.mode {
            ModeName::Embedded => Ok(ClientMode::Embedded),
            ModeName::Local => Ok(ClientMode::Local {
                host: client.host.clone(),
            }),
            ModeName::Cloud => {
                let token = client
                    .token
                    .as_deref()
                    .filter(|t| !t.is_empty())
                    .ok_or_else(|| {
                        ThreadsError::config(Self::config_path(), "cloud mode needs client.token")
                    })?;
                Ok(ClientMode::Cloud {
                    host: client.host.clone(),
                    credentials: Credentials {
                        token: token.to_string(),
                        device_id: client
                            .device_id
                            .clone()
                            .unwrap_or_else(|| DEFAULT_DEVICE_ID.to_string()),
                    },
                })
            }
        }
    }

    /// Write config to `path`, creating parent directories
    pub fn save_to(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .map_err(|e| ThreadsError::config(path, format!("failed to create dir: {}", e)))?;
        }
        let toml_str = toml::to_string_pretty(self)
            .map_err(|e| ThreadsError::config(path, format!("failed to serialize: {}", e)))?;
        fs::write(path, toml_str)
            .map_err(|e| ThreadsError::config(path, format!("failed to write: {}", e)))
    }
}

/// Replace every ${VAR} with the environment value (empty when unset)
fn expand_string(s: &str) -> String {
    let mut result = String::with_capacity(s.len());
    let mut rest = s;
    while let Some(start) = rest.find("${") {
        result.push_str(&rest[..start]);
        let after = &rest[start + 2..];
        match after.find('}') {
            Some(end) => {
                result.push_str(&env::var(&after[..end]).unwrap_or_default());
                rest = &after[end + 1..];
            }
            None => {
                result.push_str(&rest[start..]);
                rest = "";
            }
        }
    }
    result.push_str(rest);
    result
}
