//! Per-server connection worker for DDP chat backends.
//!
//! A [`Worker`] owns one persistent connection to a chat server. It runs on
//! its own thread, resumes the last known session on connect, activates a
//! fixed set of protocol listeners once the handshake succeeds, and tears
//! everything down when asked to (or when the server closes the socket).
//!
//! ## Threading
//!
//! Every mutation of the connection handle and the listener set happens on
//! the worker's thread. Callers only ever send commands through the
//! [`Worker`] handle, which is cheap to clone and safe to use from anywhere.
//!
//! ## Reconnection
//!
//! There is no automatic reconnect loop. A failed or dropped connection
//! stays down until someone calls [`Worker::keepalive`].

pub mod config;
pub mod connection;
pub mod error;
pub mod listener;
pub mod model;
pub mod state;
pub mod store;
pub mod token;
pub mod wire;
pub mod worker;

pub use config::WorkerConfig;
pub use error::WorkerError;
pub use listener::{AppContext, ListenerContext, ListenerKind, ListenerTable, Registerable};
pub use model::{DEFAULT_SESSION_ID, ServerConfig, SessionRecord};
pub use state::WorkerState;
pub use store::{Partition, Store};
pub use wire::{Handshake, WireConnector, WireHandle};
pub use worker::{Worker, WorkerContext, WorkerStatus, destroy, start};
