//! Error types

use thiserror::Error;

/// Result type alias
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type
#[derive(Debug, Error)]
pub enum Error {
    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("Unknown server '{0}'")]
    UnknownServer(String),

    #[error("Ambiguous server '{token}' matches: {}", .candidates.join(", "))]
    AmbiguousServer {
        token: String,
        candidates: Vec<String>,
    },

    #[error("No servers matched the requested targets")]
    NoTargets,

    #[error("No configuration loaded and no explicit servers given")]
    NoConfiguration,

    #[error("Lock on {scope} already held by {holder}")]
    LockHeld { scope: String, holder: String },

    #[error("Lock error: {0}")]
    LockError(String),

    #[error("Remote execution error: {0}")]
    RemoteExecutionError(String),

    #[error("Notification error: {0}")]
    NotificationError(String),

    #[error("Unknown task '{0}'")]
    UnknownTask(String),

    #[error("No capability registered for scheme '{0}'")]
    UnknownScheme(String),

    #[error("Invalid option: {0}")]
    OptionError(String),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),

    #[error("Other error: {0}")]
    Other(String),
}

// Convert anyhow::Error to our Error type
impl From<anyhow::Error> for Error {
    fn from(err: anyhow::Error) -> Self {
        Error::Other(err.to_string())
    }
}
