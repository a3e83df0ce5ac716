//! Errors surfaced by the worker's public API.

/// Failure of a worker operation.
///
/// Internal steps use `anyhow` with context; this enum is what callers of
/// [`crate::Worker`] see.
#[derive(Debug, thiserror::Error)]
pub enum WorkerError {
    /// The worker thread or its runtime could not be brought up.
    #[error("failed to start worker: {0}")]
    Spawn(String),
    /// The worker loop has exited and no longer accepts commands.
    #[error("worker stopped")]
    Stopped,
    /// The loop dropped the reply for a pending request.
    #[error("request cancelled by worker")]
    Cancelled,
    /// No server configuration is stored for this id.
    #[error("no server config for {server_id}")]
    MissingServerConfig { server_id: String },
    /// A storage transaction failed.
    #[error("storage error: {0}")]
    Storage(#[from] rusqlite::Error),
    /// The wire-level connect handshake failed.
    #[error("handshake failed: {0}")]
    Handshake(String),
}

impl WorkerError {
    /// Map an internal error chain onto the public taxonomy.
    pub(crate) fn from_anyhow(err: anyhow::Error) -> Self {
        match err.downcast::<WorkerError>() {
            Ok(e) => e,
            Err(err) => match err.downcast::<rusqlite::Error>() {
                Ok(e) => WorkerError::Storage(e),
                Err(err) => WorkerError::Handshake(format!("{err:#}")),
            },
        }
    }
}

/// Result alias for the public surface.
pub type Result<T> = std::result::Result<T, WorkerError>;
