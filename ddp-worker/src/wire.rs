//! Boundary to the wire-level DDP client.
//!
//! The worker never speaks the protocol itself. It asks a [`WireConnector`]
//! for a handle per hostname and drives that handle through connect and
//! close.

use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use tokio::sync::oneshot;

/// Result of a successful connect handshake.
#[derive(Debug)]
pub struct Handshake {
    /// Session id issued (or resumed) by the server.
    pub session: String,
    /// Fires once when the remote end closes the connection. An `Err` carries
    /// the transport failure; a dropped sender means the handle was closed
    /// locally.
    pub closed: oneshot::Receiver<Result<()>>,
}

/// A live (or not yet connected) client socket.
#[async_trait]
pub trait WireHandle: Send + Sync {
    /// Perform the protocol handshake, resuming `session` if given.
    async fn connect(&self, session: Option<String>) -> Result<Handshake>;

    fn is_connected(&self) -> bool;

    fn close(&self);
}

/// Creates client handles for a hostname.
pub trait WireConnector: Send + Sync {
    fn create(&self, hostname: &str) -> Arc<dyn WireHandle>;
}
