//! Error types for trunk

use thiserror::Error;

/// Result type for trunk operations
pub type Result<T> = std::result::Result<T, TrunkError>;

/// Errors that can occur in trunk operations
#[derive(Error, Debug)]
pub enum TrunkError {
    /// No message or notification became available within the requested wait.
    ///
    /// This is a control-flow signal, not a fault: callers loop on it.
    #[error("Queue is empty")]
    Empty,

    /// Every connect attempt landed on a read-only (recovery/standby) server
    #[error("Database is read-only after {attempts} connection attempts")]
    ConnectionRejected { attempts: u32 },

    /// The session is dead and could not be replaced within the retry policy
    #[error("Connection unavailable: {reason}")]
    ConnectionUnavailable {
        reason: String,
        #[source]
        source: Option<Box<TrunkError>>,
    },

    /// Database connection or query errors
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    /// JSON serialization/deserialization errors
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Invalid configuration value
    #[error("Configuration error: {message}")]
    Configuration { message: String },

    /// Configuration sources could not be loaded or deserialized
    #[error("Configuration loading error: {0}")]
    Config(#[from] config::ConfigError),

    /// Malformed connection string
    #[error("Invalid connection string {url}: {reason}")]
    InvalidDescriptor { url: String, reason: String },
}

impl TrunkError {
    /// Create a configuration error
    pub fn config<S: Into<String>>(message: S) -> Self {
        Self::Configuration {
            message: message.into(),
        }
    }

    /// Create a connection-unavailable error without an underlying cause
    pub fn unavailable<S: Into<String>>(reason: S) -> Self {
        Self::ConnectionUnavailable {
            reason: reason.into(),
            source: None,
        }
    }

    /// Wrap `cause` as the reason a session could not be (re)established.
    ///
    /// Read-only rejections keep their own variant so callers can tell a
    /// replica-only cluster apart from an unreachable one.
    pub fn unavailable_from(cause: TrunkError) -> Self {
        match cause {
            rejected @ Self::ConnectionRejected { .. } => rejected,
            unavailable @ Self::ConnectionUnavailable { .. } => unavailable,
            other => Self::ConnectionUnavailable {
                reason: other.to_string(),
                source: Some(Box::new(other)),
            },
        }
    }

    /// Create an invalid descriptor error
    pub fn invalid_descriptor<U: Into<String>, R: Into<String>>(url: U, reason: R) -> Self {
        Self::InvalidDescriptor {
            url: url.into(),
            reason: reason.into(),
        }
    }

    /// Whether this is the expected "nothing available" signal
    pub fn is_empty(&self) -> bool {
        matches!(self, Self::Empty)
    }

    /// Whether the error means the session itself is gone.
    ///
    /// Server errors count only for SQLSTATE classes `08` (connection
    /// exception) and `57P` (shutdown); ordinary statement failures do not.
    pub fn is_connection_fault(&self) -> bool {
        match self {
            Self::ConnectionRejected { .. } | Self::ConnectionUnavailable { .. } => true,
            Self::Database(sqlx::Error::Database(db)) => db
                .code()
                .is_some_and(|code| code.starts_with("08") || code.starts_with("57P")),
            Self::Database(err) => matches!(
                err,
                sqlx::Error::Io(_)
                    | sqlx::Error::Protocol(_)
                    | sqlx::Error::PoolClosed
                    | sqlx::Error::PoolTimedOut
                    | sqlx::Error::WorkerCrashed
            ),
            _ => false,
        }
    }
}
