//! Protocol listeners and the registry that activates them.
//!
//! Each listener kind is produced by a factory looked up in a
//! [`ListenerTable`]. Activation is best-effort: a kind whose factory is
//! missing, fails, or whose `register` fails is logged and skipped, and the
//! remaining kinds still come up.

use std::any::Any;
use std::fmt;
use std::sync::Arc;

use anyhow::Result;

use crate::store::Partition;
use crate::wire::WireHandle;

/// Uniform lifecycle shared by all protocol listeners.
pub trait Registerable {
    fn register(&mut self) -> Result<()>;
    fn unregister(&mut self) -> Result<()>;
    fn keepalive(&mut self) -> Result<()>;
}

/// The listener kinds a worker activates, in activation order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ListenerKind {
    /// Syncs the server's login service configuration.
    LoginServiceConfig,
    /// Tracks which users are online.
    ActiveUsers,
    /// Logs in with the stored token.
    TokenLogin,
    /// Dispatches queued method calls.
    MethodCall,
    /// Mirrors session state.
    Session,
    /// Runs message-load requests.
    LoadMessageProcedure,
}

impl ListenerKind {
    pub const ALL: [ListenerKind; 6] = [
        ListenerKind::LoginServiceConfig,
        ListenerKind::ActiveUsers,
        ListenerKind::TokenLogin,
        ListenerKind::MethodCall,
        ListenerKind::Session,
        ListenerKind::LoadMessageProcedure,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            ListenerKind::LoginServiceConfig => "login-service-config",
            ListenerKind::ActiveUsers => "active-users",
            ListenerKind::TokenLogin => "token-login",
            ListenerKind::MethodCall => "method-call",
            ListenerKind::Session => "session",
            ListenerKind::LoadMessageProcedure => "load-message-procedure",
        }
    }
}

impl fmt::Display for ListenerKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Opaque application state handed through to listener factories.
#[derive(Clone)]
pub struct AppContext(Arc<dyn Any + Send + Sync>);

impl AppContext {
    pub fn new<T: Any + Send + Sync>(value: T) -> Self {
        Self(Arc::new(value))
    }

    /// A context carrying nothing.
    pub fn empty() -> Self {
        Self::new(())
    }

    pub fn get<T: Any + Send + Sync>(&self) -> Option<&T> {
        self.0.downcast_ref::<T>()
    }
}

impl fmt::Debug for AppContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AppContext").finish_non_exhaustive()
    }
}

/// Everything a listener is built from. Shared by all kinds of one connection.
#[derive(Clone)]
pub struct ListenerContext {
    pub app: AppContext,
    pub server_id: String,
    pub partition: Partition,
    pub wire: Arc<dyn WireHandle>,
}

pub type ListenerFactory =
    Arc<dyn Fn(&ListenerContext) -> Result<Box<dyn Registerable>> + Send + Sync>;

/// Maps each listener kind to the factory that builds it.
#[derive(Clone, Default)]
pub struct ListenerTable {
    factories: Vec<(ListenerKind, ListenerFactory)>,
}

impl ListenerTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the factory for `kind`, replacing any previous one.
    pub fn with<F>(mut self, kind: ListenerKind, factory: F) -> Self
    where
        F: Fn(&ListenerContext) -> Result<Box<dyn Registerable>> + Send + Sync + 'static,
    {
        self.factories.retain(|(k, _)| *k != kind);
        self.factories.push((kind, Arc::new(factory)));
        self
    }

    pub fn factory(&self, kind: ListenerKind) -> Option<&ListenerFactory> {
        self.factories
            .iter()
            .find(|(k, _)| *k == kind)
            .map(|(_, f)| f)
    }
}

impl fmt::Debug for ListenerTable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list()
            .entries(self.factories.iter().map(|(k, _)| k))
            .finish()
    }
}

/// Active listeners of one connection, in registration order.
pub struct ListenerRegistry {
    server_id: String,
    active: Vec<(ListenerKind, Box<dyn Registerable>)>,
}

impl ListenerRegistry {
    pub fn new(server_id: impl Into<String>) -> Self {
        Self {
            server_id: server_id.into(),
            active: Vec::new(),
        }
    }

    /// Build and register every kind in [`ListenerKind::ALL`] order.
    /// Returns how many came up.
    pub fn register_all(&mut self, table: &ListenerTable, ctx: &ListenerContext) -> usize {
        let before = self.active.len();
        for kind in ListenerKind::ALL {
            let Some(factory) = table.factory(kind) else {
                tracing::warn!(
                    server_id = %self.server_id,
                    listener = %kind,
                    "no factory for listener, skipping"
                );
                continue;
            };
            let mut listener = match factory(ctx) {
                Ok(l) => l,
                Err(e) => {
                    tracing::warn!(
                        server_id = %self.server_id,
                        listener = %kind,
                        error = %e,
                        "failed to build listener"
                    );
                    continue;
                }
            };
            if let Err(e) = listener.register() {
                tracing::warn!(
                    server_id = %self.server_id,
                    listener = %kind,
                    error = %e,
                    "failed to register listener"
                );
                continue;
            }
            tracing::debug!(server_id = %self.server_id, listener = %kind, "listener registered");
            self.active.push((kind, listener));
        }
        self.active.len() - before
    }

    pub fn keepalive_all(&mut self) {
        for (kind, listener) in &mut self.active {
            if let Err(e) = listener.keepalive() {
                tracing::warn!(
                    server_id = %self.server_id,
                    listener = %kind,
                    error = %e,
                    "listener keepalive failed"
                );
            }
        }
    }

    /// Unregister in registration order, dropping each listener as it finishes.
    pub fn unregister_all(&mut self) {
        for (kind, mut listener) in self.active.drain(..) {
            if let Err(e) = listener.unregister() {
                tracing::warn!(
                    server_id = %self.server_id,
                    listener = %kind,
                    error = %e,
                    "listener unregister failed"
                );
            }
        }
    }

    pub fn active_kinds(&self) -> Vec<ListenerKind> {
        self.active.iter().map(|(k, _)| *k).collect()
    }

    pub fn is_empty(&self) -> bool {
        self.active.is_empty()
    }
}
