use thiserror::Error;

/// Result alias for fallible drctl library operations.
pub type Result<T> = std::result::Result<T, DrError>;

/// Every way a workflow stage can fail.
///
/// Each variant maps to a stable `kind()` string and an HTTP status for the
/// API envelope.
#[derive(Debug, Error)]
pub enum DrError {
    /// The scripting interpreter could not be started. Configuration error, never retried.
    #[error("failed to start interpreter '{interpreter}': {reason}")]
    SpawnFailure { interpreter: String, reason: String },

    /// The remote script ran but reported an error.
    #[error("{operation} exited with status {code}: {stderr}")]
    NonZeroExit {
        operation: String,
        code: i32,
        stderr: String,
    },

    /// A subprocess or array call exceeded its deadline and was abandoned.
    #[error("{operation} timed out after {secs}s")]
    TimedOut { operation: String, secs: u64 },

    /// The output contained no line starting a JSON object or array.
    #[error("no structured payload found in {operation} output")]
    NoPayloadFound { operation: String },

    /// A payload was found but could not be parsed, even after repair.
    #[error("{operation} payload malformed after repair: {reason}")]
    PayloadMalformed {
        operation: String,
        reason: String,
        excerpt: String,
    },

    /// Non-2xx from the storage array, or a required field was missing.
    #[error("storage array {endpoint} failed: {reason}")]
    RemoteApiFailure {
        endpoint: String,
        status: Option<u16>,
        reason: String,
    },

    /// State store read or write failed.
    #[error("state store {operation} failed: {reason}")]
    PersistenceFailure { operation: String, reason: String },

    /// Request rejected before any remote call was attempted.
    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("{kind} not found: {name}")]
    NotFound { kind: &'static str, name: String },

    /// A worker task died without producing a result.
    #[error("internal error: {0}")]
    Internal(String),
}

impl DrError {
    pub fn invalid(msg: impl Into<String>) -> Self {
        Self::InvalidInput(msg.into())
    }

    pub fn persistence(operation: &str, err: impl std::fmt::Display) -> Self {
        Self::PersistenceFailure {
            operation: operation.to_string(),
            reason: err.to_string(),
        }
    }

    pub fn remote(endpoint: &str, status: Option<u16>, reason: impl Into<String>) -> Self {
        Self::RemoteApiFailure {
            endpoint: endpoint.to_string(),
            status,
            reason: reason.into(),
        }
    }

    /// Stable machine-readable name for the failure class.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::SpawnFailure { .. } => "spawn_failure",
            Self::NonZeroExit { .. } => "non_zero_exit",
            Self::TimedOut { .. } => "timed_out",
            Self::NoPayloadFound { .. } => "no_payload_found",
            Self::PayloadMalformed { .. } => "payload_malformed",
            Self::RemoteApiFailure { .. } => "remote_api_failure",
            Self::PersistenceFailure { .. } => "persistence_failure",
            Self::InvalidInput(_) => "invalid_input",
            Self::NotFound { .. } => "not_found",
            Self::Internal(_) => "internal",
        }
    }

    /// HTTP status for the API envelope: 4xx for caller mistakes, 5xx for
    /// execution, parsing, and remote failures.
    pub fn http_status(&self) -> u16 {
        match self {
            Self::InvalidInput(_) => 400,
            Self::NotFound { .. } => 404,
            Self::RemoteApiFailure { .. } => 502,
            Self::TimedOut { .. } => 504,
            Self::SpawnFailure { .. }
            | Self::NonZeroExit { .. }
            | Self::NoPayloadFound { .. }
            | Self::PayloadMalformed { .. }
            | Self::PersistenceFailure { .. }
            | Self::Internal(_) => 500,
        }
    }

    /// True when the failure means "the operation matched nothing" rather
    /// than "the operation broke".
    pub fn is_empty_result(&self) -> bool {
        matches!(self, Self::NoPayloadFound { .. })
    }
}
