/// Structured error types for threadsh-core.
///
/// `ClientError` is the opaque rejection reason of the threads client and is
/// passed through unchanged by every wrapper. `ThreadsError` adds the few
/// policy failures owned by this crate (registry conflicts, missing stores).
/// The `threadsh` binary wraps both in `anyhow` for reporting.
use std::path::PathBuf;
use thiserror::Error;

/// Rejection reason reported by a threads client.
///
/// Cloneable so a single failed store creation can be handed to every
/// caller waiting on it.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ClientError {
    /// The backing API could not be reached
    #[error("connection failed: {0}")]
    Connection(String),

    /// Credentials were rejected or the session expired
    #[error("authentication failed: {0}")]
    Auth(String),

    /// Schema registration or entity validation failed
    #[error("schema error: {0}")]
    Schema(String),

    /// Store, model or entity does not exist
    #[error("not found: {0}")]
    NotFound(String),

    /// Entity or model already exists
    #[error("conflict: {0}")]
    Conflict(String),

    /// Delegated call did not complete within the deadline
    #[error("{operation} timed out after {millis}ms")]
    Timeout { operation: String, millis: u64 },

    /// Any other error reported by the remote side
    #[error("{0}")]
    Remote(String),

    /// Request or response could not be encoded/decoded
    #[error("transport error: {0}")]
    Transport(String),
}

impl ClientError {
    pub fn not_found(what: impl Into<String>) -> Self {
        Self::NotFound(what.into())
    }

    pub fn conflict(what: impl Into<String>) -> Self {
        Self::Conflict(what.into())
    }

    pub fn schema(reason: impl Into<String>) -> Self {
        Self::Schema(reason.into())
    }

    pub fn remote(reason: impl Into<String>) -> Self {
        Self::Remote(reason.into())
    }
}

/// Main error type for threadsh-core operations
#[derive(Error, Debug)]
pub enum ThreadsError {
    /// Failure reported by the threads client, unmodified
    #[error(transparent)]
    Client(#[from] ClientError),

    /// Explicit id is already registered under another name
    #[error("store '{id}' is already registered as '{existing}'")]
    IdConflict { id: String, existing: String },

    /// Name is already bound to a different store id
    #[error("'{name}' is already bound to store '{id}'")]
    NameConflict { name: String, id: String },

    /// No collection with this name was created through the database
    #[error("unknown collection '{0}'")]
    UnknownCollection(String),

    /// An operation needed an active store but none was selected
    #[error("no active store, run `use <name>` first")]
    NoActiveStore,

    /// JSON parsing or serialization failed
    #[error("JSON error at {context}: {source}")]
    Json {
        context: String,
        source: serde_json::Error,
    },

    /// Configuration file could not be read or parsed
    #[error("Configuration error in {path:?}: {reason}")]
    Config { path: PathBuf, reason: String },
}

/// Result type alias for threadsh-core operations
pub type Result<T> = std::result::Result<T, ThreadsError>;

impl ThreadsError {
    /// Create a JSON error with context
    pub fn json(context: impl Into<String>, source: serde_json::Error) -> Self {
        Self::Json {
            context: context.into(),
            source,
        }
    }

    /// Create a config error
    pub fn config(path: impl Into<PathBuf>, reason: impl Into<String>) -> Self {
        Self::Config {
            path: path.into(),
            reason: reason.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = ClientError::Timeout {
            operation: "new_store".to_string(),
            millis: 250,
        };
        assert_eq!(err.to_string(), "new_store timed out after 250ms");

        let err = ThreadsError::IdConflict {
            id: "s1".to_string(),
            existing: "people".to_string(),
        };
        assert!(err.to_string().contains("already registered as 'people'"));
    }

    #[test]
    fn test_client_error_passes_through() {
        let rejection = ClientError::schema("missing required field 'firstName'");
        let err: ThreadsError = rejection.clone().into();

        // Transparent: the wrapper adds nothing to the client's reason
        assert_eq!(err.to_string(), rejection.to_string());
        assert!(matches!(err, ThreadsError::Client(ClientError::Schema(_))));
    }
}
