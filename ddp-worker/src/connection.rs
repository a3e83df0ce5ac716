//! Connection manager: owns the wire handle and runs the connect chain.
//!
//! A connect attempt is split in two. [`ConnectionManager::prepare`] runs on
//! the worker loop, reads the server config and claims a socket handle.
//! [`handshake`] then runs as a separate task and performs the protocol
//! connect plus the session bookkeeping; its outcome is posted back to the
//! loop, which registers listeners.

use std::sync::Arc;

use anyhow::{Context, Result};

use crate::error::WorkerError;
use crate::model::{DEFAULT_SESSION_ID, SessionRecord};
use crate::store::{Partition, Store};
use crate::wire::{Handshake, WireConnector, WireHandle};

pub struct ConnectionManager {
    server_id: String,
    store: Arc<Store>,
    partition: Partition,
    connector: Arc<dyn WireConnector>,
    wire: Option<Arc<dyn WireHandle>>,
    /// Bumped on every attempt; tags close notifications so a stale handle
    /// can't tear down its replacement.
    generation: u64,
}

/// Everything the handshake task needs, detached from the loop.
pub struct PreparedConnect {
    pub generation: u64,
    server_id: String,
    store: Arc<Store>,
    partition: Partition,
    wire: Arc<dyn WireHandle>,
    session: Option<String>,
}

impl ConnectionManager {
    pub fn new(
        server_id: impl Into<String>,
        store: Arc<Store>,
        connector: Arc<dyn WireConnector>,
    ) -> Self {
        let server_id = server_id.into();
        let partition = store.partition(server_id.clone());
        Self {
            server_id,
            store,
            partition,
            connector,
            wire: None,
            generation: 0,
        }
    }

    pub fn partition(&self) -> &Partition {
        &self.partition
    }

    pub fn wire(&self) -> Option<&Arc<dyn WireHandle>> {
        self.wire.as_ref()
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// A handle exists and reports itself connected.
    pub fn is_live(&self) -> bool {
        self.wire.as_ref().is_some_and(|w| w.is_connected())
    }

    /// Read the server config and make sure a usable handle exists.
    pub fn prepare(&mut self) -> Result<PreparedConnect> {
        let server_id = self.server_id.clone();
        let config = self
            .store
            .transaction_for_read(|tx| Ok(tx.server_config(&server_id)?))?
            .ok_or_else(|| WorkerError::MissingServerConfig {
                server_id: server_id.clone(),
            })?;

        let wire = match &self.wire {
            Some(w) if w.is_connected() => Arc::clone(w),
            stale => {
                if let Some(old) = stale {
                    old.close();
                }
                tracing::debug!(
                    server_id = %self.server_id,
                    hostname = %config.hostname,
                    "creating socket"
                );
                let w = self.connector.create(&config.hostname);
                self.wire = Some(Arc::clone(&w));
                w
            }
        };

        self.generation += 1;
        Ok(PreparedConnect {
            generation: self.generation,
            server_id,
            store: Arc::clone(&self.store),
            partition: self.partition.clone(),
            wire,
            session: config.session,
        })
    }

    /// Close and drop the handle, if any.
    pub fn close(&mut self) {
        if let Some(wire) = self.wire.take() {
            tracing::debug!(server_id = %self.server_id, "closing socket");
            wire.close();
        }
    }

    /// Log a connect failure and record it on the server config.
    pub fn log_connection_error(&self, err: &anyhow::Error) {
        let message = format!("{err:#}");
        tracing::error!(server_id = %self.server_id, error = %message, "connection error");
        let recorded = self.store.transaction(|tx| {
            Ok(tx.set_connection_error(&self.server_id, Some(message.as_str()))?)
        });
        if let Err(e) = recorded {
            tracing::warn!(
                server_id = %self.server_id,
                error = %e,
                "failed to record connection error"
            );
        }
    }
}

/// Handshake, persist the issued session id (clearing any recorded
/// connection error), and ensure the default session record exists. Each
/// step short-circuits the rest on failure.
pub async fn handshake(p: PreparedConnect) -> Result<Handshake> {
    let handshake = p
        .wire
        .connect(p.session.clone())
        .await
        .context("connect handshake")?;

    if let Err(e) = persist_session(&p, &handshake.session) {
        // Don't leave a half-set-up socket behind a failed attempt.
        p.wire.close();
        return Err(e);
    }
    tracing::debug!(server_id = %p.server_id, session = %handshake.session, "handshake complete");
    Ok(handshake)
}

fn persist_session(p: &PreparedConnect, session: &str) -> Result<()> {
    p.store
        .transaction(|tx| {
            tx.upsert_server_session(&p.server_id, session)?;
            Ok(tx.set_connection_error(&p.server_id, None)?)
        })
        .context("save session id")?;

    p.partition
        .transaction(|tx| {
            if tx.session(DEFAULT_SESSION_ID)?.is_none() {
                tx.create_session(&SessionRecord::default_session())?;
            }
            Ok(())
        })
        .context("ensure default session")
}
