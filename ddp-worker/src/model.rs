//! Persisted records the worker reads and writes.

/// Id of the single session record kept per server partition.
pub const DEFAULT_SESSION_ID: &str = "default";

/// Connection settings for one server, stored in the shared partition.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ServerConfig {
    pub server_id: String,
    pub hostname: String,
    /// Last session id handed out by the server, used for resumption.
    pub session: Option<String>,
    /// Text of the most recent connection failure.
    pub connection_error: Option<String>,
}

impl ServerConfig {
    pub fn new(server_id: impl Into<String>, hostname: impl Into<String>) -> Self {
        Self {
            server_id: server_id.into(),
            hostname: hostname.into(),
            session: None,
            connection_error: None,
        }
    }
}

/// Login state for one server, stored in that server's partition.
///
/// The worker only ever clears `token_verified` and `error`; the token itself
/// is written by the login listener.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SessionRecord {
    pub session_id: String,
    pub token: Option<String>,
    pub token_verified: bool,
    pub error: Option<String>,
}

impl SessionRecord {
    /// An empty record under [`DEFAULT_SESSION_ID`].
    pub fn default_session() -> Self {
        Self {
            session_id: DEFAULT_SESSION_ID.to_string(),
            ..Self::default()
        }
    }

    pub fn has_token(&self) -> bool {
        self.token.as_deref().is_some_and(|t| !t.is_empty())
    }

    pub fn has_error(&self) -> bool {
        self.error.as_deref().is_some_and(|e| !e.is_empty())
    }
}
