use thiserror::Error;

/// Top-level server error taxonomy.
///
/// Boot-time failures are non-recoverable and terminate the process with a
/// crash banner; everything else is handled at the subsystem that raised it
/// and translated to a protocol-level status before it reaches a client.
#[derive(Debug, Error)]
pub enum ServerError {
    /// Fatal boot condition: circular module dependency, duplicate manifest
    /// name, unusable secret, failed database connection or migration.
    #[error("boot failure: {0}")]
    Boot(String),

    /// Network setup or transport failure.
    #[error("network error: {0}")]
    Network(String),

    /// Database layer failure. Never shown to clients verbatim.
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    /// IPC channel to a module instance failed.
    #[error("ipc error: {0}")]
    Ipc(String),

    /// Internal invariant violation.
    #[error("internal error: {0}")]
    Internal(String),
}

/// Outcome of dispatching a request to a module instance.
#[derive(Debug, Error)]
pub enum DispatchError {
    /// No live instance of the target module. Maps to HTTP 503.
    #[error("module '{0}' has no available instance")]
    Unavailable(String),

    /// The instance did not reply before the deadline. Maps to HTTP 504.
    #[error("request to module '{0}' timed out")]
    Timeout(String),
}

impl DispatchError {
    /// Stable identifier used in logs and error payloads.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Unavailable(_) => "unavailable",
            Self::Timeout(_) => "timeout",
        }
    }
}
