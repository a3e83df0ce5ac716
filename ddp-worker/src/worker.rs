//! The worker loop: one thread per server, driven by commands.
//!
//! [`Worker::spawn`] launches a named thread with a single-threaded tokio
//! runtime. The loop's first action is the session token guard; only then
//! does it report ready. From there on it consumes commands until told
//! to stop (or until every [`Worker`] handle is gone).
//!
//! Handshakes run as tasks on the same runtime and post their outcome back
//! as a command, so listener registration and teardown are always
//! serialized with everything else the loop does.

use std::sync::Arc;

use tokio::sync::{mpsc, oneshot};

use crate::config::WorkerConfig;
use crate::connection::{self, ConnectionManager};
use crate::error::{Result, WorkerError};
use crate::listener::{AppContext, ListenerContext, ListenerKind, ListenerRegistry, ListenerTable};
use crate::state::WorkerState;
use crate::store::Store;
use crate::token;
use crate::wire::{Handshake, WireConnector};

/// Collaborators shared by all workers of an application.
#[derive(Clone)]
pub struct WorkerContext {
    pub app: AppContext,
    pub store: Arc<Store>,
    pub connector: Arc<dyn WireConnector>,
    pub listeners: ListenerTable,
    pub config: WorkerConfig,
}

/// Snapshot of a worker's state, as seen from its own thread.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerStatus {
    pub state: WorkerState,
    pub socket_exists: bool,
    pub listeners_registered: bool,
    pub active_listeners: Vec<ListenerKind>,
}

type Reply<T> = oneshot::Sender<Result<T>>;

/// Messages processed by the worker loop.
enum Command {
    Connect {
        reply: Option<Reply<()>>,
        ping_after: bool,
    },
    Keepalive,
    ConnectFinished {
        generation: u64,
        result: anyhow::Result<Handshake>,
        reply: Option<Reply<()>>,
        ping_after: bool,
    },
    RegisterListeners,
    UnregisterListeners,
    PingListeners,
    RemoteClosed {
        generation: u64,
        result: anyhow::Result<()>,
    },
    Status {
        reply: oneshot::Sender<WorkerStatus>,
    },
    Stop,
}

/// Handle to a running worker. Cheap to clone, usable from any thread.
#[derive(Clone)]
pub struct Worker {
    server_id: Arc<str>,
    tx: mpsc::UnboundedSender<Command>,
}

impl std::fmt::Debug for Worker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Worker")
            .field("server_id", &self.server_id)
            .field("stopped", &self.tx.is_closed())
            .finish()
    }
}

/// Spawn a worker for `server_id` and run its first connect.
///
/// The outer error is a failure to launch the thread. The inner result is
/// the outcome of the first connect; on failure the worker stays up,
/// disconnected, until the next [`Worker::keepalive`].
pub async fn start(
    ctx: &WorkerContext,
    server_id: impl Into<String>,
) -> Result<(Worker, Result<()>)> {
    let worker = Worker::spawn(ctx, server_id).await?;
    let connected = worker.connect().await;
    Ok((worker, connected))
}

/// Stop a worker. No-op if it already stopped.
pub fn destroy(worker: &Worker) {
    worker.destroy();
}

impl Worker {
    /// Launch the worker thread and wait until its loop is ready.
    pub async fn spawn(ctx: &WorkerContext, server_id: impl Into<String>) -> Result<Worker> {
        let server_id: String = server_id.into();
        let (tx, rx) = mpsc::unbounded_channel();
        let (ready_tx, ready_rx) = oneshot::channel::<std::result::Result<(), String>>();

        let self_tx = tx.downgrade();
        let thread_ctx = ctx.clone();
        let thread_server_id = server_id.clone();
        std::thread::Builder::new()
            .name(ctx.config.thread_name(&server_id))
            .spawn(move || {
                let rt = match tokio::runtime::Builder::new_current_thread()
                    .enable_all()
                    .build()
                {
                    Ok(rt) => rt,
                    Err(e) => {
                        let _ = ready_tx.send(Err(format!("failed to build runtime: {e}")));
                        return;
                    }
                };
                rt.block_on(async move {
                    let mut worker_loop = WorkerLoop::new(&thread_ctx, thread_server_id, self_tx);
                    worker_loop.startup();
                    let _ = ready_tx.send(Ok(()));
                    worker_loop.run(rx).await;
                });
            })
            .map_err(|e| WorkerError::Spawn(format!("failed to spawn thread: {e}")))?;

        match ready_rx.await {
            Ok(Ok(())) => Ok(Worker {
                server_id: server_id.into(),
                tx,
            }),
            Ok(Err(msg)) => Err(WorkerError::Spawn(msg)),
            Err(_) => Err(WorkerError::Spawn("worker thread exited before ready".into())),
        }
    }

    pub fn server_id(&self) -> &str {
        &self.server_id
    }

    /// Connect unless a socket already exists or is being created, in which
    /// case this returns `Ok` without doing anything.
    pub async fn connect(&self) -> Result<()> {
        let (reply, rx) = oneshot::channel();
        self.send(Command::Connect {
            reply: Some(reply),
            ping_after: false,
        })?;
        rx.await.map_err(|_| WorkerError::Cancelled)?
    }

    /// Reconnect if needed, then ping every listener. Fire-and-forget.
    pub fn keepalive(&self) {
        let _ = self.send(Command::Keepalive);
    }

    /// Register listeners on the current connection, connecting first if
    /// the worker is idle.
    pub fn register_listeners(&self) {
        let _ = self.send(Command::RegisterListeners);
    }

    /// Unregister all listeners and close the socket, leaving the loop running.
    pub fn unregister_listeners(&self) {
        let _ = self.send(Command::UnregisterListeners);
    }

    pub fn ping_listeners(&self) {
        let _ = self.send(Command::PingListeners);
    }

    pub async fn status(&self) -> Result<WorkerStatus> {
        let (reply, rx) = oneshot::channel();
        self.send(Command::Status { reply })?;
        rx.await.map_err(|_| WorkerError::Cancelled)
    }

    /// Tear down listeners and socket on the worker thread, then stop it.
    pub fn destroy(&self) {
        if self.send(Command::Stop).is_err() {
            tracing::debug!(server_id = %self.server_id, "destroy on stopped worker");
        }
    }

    pub fn is_stopped(&self) -> bool {
        self.tx.is_closed()
    }

    /// Resolves once the loop has exited.
    pub async fn stopped(&self) {
        self.tx.closed().await;
    }

    fn send(&self, cmd: Command) -> Result<()> {
        self.tx.send(cmd).map_err(|_| WorkerError::Stopped)
    }
}

/// State owned by the worker thread.
struct WorkerLoop {
    server_id: String,
    app: AppContext,
    listeners: ListenerTable,
    conn: ConnectionManager,
    registry: ListenerRegistry,
    state: WorkerState,
    /// Weak so that dropping every `Worker` handle ends the loop.
    self_tx: mpsc::WeakUnboundedSender<Command>,
}

impl WorkerLoop {
    fn new(
        ctx: &WorkerContext,
        server_id: String,
        self_tx: mpsc::WeakUnboundedSender<Command>,
    ) -> Self {
        let conn = ConnectionManager::new(
            server_id.clone(),
            Arc::clone(&ctx.store),
            Arc::clone(&ctx.connector),
        );
        Self {
            app: ctx.app.clone(),
            listeners: ctx.listeners.clone(),
            conn,
            registry: ListenerRegistry::new(server_id.clone()),
            state: WorkerState::Created,
            server_id,
            self_tx,
        }
    }

    fn startup(&mut self) {
        token::invalidate_stale_token(self.conn.partition(), &self.server_id);
        self.set_state(WorkerState::Ready);
        tracing::debug!(server_id = %self.server_id, "worker ready");
    }

    async fn run(mut self, mut rx: mpsc::UnboundedReceiver<Command>) {
        while let Some(cmd) = rx.recv().await {
            match cmd {
                Command::Connect { reply, ping_after } => self.connect(reply, ping_after),
                Command::Keepalive => self.ensure_connection(None, true),
                Command::ConnectFinished {
                    generation,
                    result,
                    reply,
                    ping_after,
                } => self.connect_finished(generation, result, reply, ping_after),
                Command::RegisterListeners => self.register_or_connect(),
                Command::UnregisterListeners => self.unregister_listeners(),
                Command::PingListeners => self.keepalive_listeners(),
                Command::RemoteClosed { generation, result } => {
                    if self.remote_closed(generation, result) {
                        break;
                    }
                }
                Command::Status { reply } => {
                    let _ = reply.send(self.status());
                }
                Command::Stop => break,
            }
        }
        self.shutdown();
    }

    fn set_state(&mut self, to: WorkerState) {
        if let Err(e) = self.state.transition(to) {
            tracing::error!(server_id = %self.server_id, error = %e, "rejected state change");
        }
    }

    fn status(&self) -> WorkerStatus {
        WorkerStatus {
            state: self.state,
            socket_exists: self.state.socket_exists(),
            listeners_registered: self.state.listeners_registered(),
            active_listeners: self.registry.active_kinds(),
        }
    }

    /// Reconnect unless the current handle is live, then optionally ping.
    fn ensure_connection(&mut self, reply: Option<Reply<()>>, ping_after: bool) {
        let in_flight = self.state == WorkerState::Connecting;
        let established = matches!(self.state, WorkerState::Connected | WorkerState::Listening);
        if in_flight || (established && self.conn.is_live()) {
            if let Some(reply) = reply {
                let _ = reply.send(Ok(()));
            }
            if ping_after {
                self.keepalive_listeners();
            }
            return;
        }
        match self.state {
            // The socket dropped underneath us.
            WorkerState::Connected | WorkerState::Listening => self.close(),
            WorkerState::Failed => {
                tracing::debug!(server_id = %self.server_id, "retrying failed connect");
                self.begin_connect(reply, ping_after);
                return;
            }
            _ => {}
        }
        self.connect(reply, ping_after);
    }

    fn connect(&mut self, reply: Option<Reply<()>>, ping_after: bool) {
        if self.state.socket_exists() {
            if let Some(reply) = reply {
                let _ = reply.send(Ok(()));
            }
            if ping_after {
                self.keepalive_listeners();
            }
            return;
        }
        self.begin_connect(reply, ping_after);
    }

    fn begin_connect(&mut self, reply: Option<Reply<()>>, ping_after: bool) {
        self.set_state(WorkerState::Connecting);
        tracing::debug!(server_id = %self.server_id, "connecting");

        let prepared = match self.conn.prepare() {
            Ok(p) => p,
            Err(e) => {
                self.connect_failed(e, reply);
                return;
            }
        };

        let generation = prepared.generation;
        let tx = self.self_tx.clone();
        tokio::spawn(async move {
            let result = connection::handshake(prepared).await;
            if let Some(tx) = tx.upgrade() {
                let _ = tx.send(Command::ConnectFinished {
                    generation,
                    result,
                    reply,
                    ping_after,
                });
            }
        });
    }

    fn connect_failed(&mut self, err: anyhow::Error, reply: Option<Reply<()>>) {
        self.set_state(WorkerState::Failed);
        self.conn.log_connection_error(&err);
        if let Some(reply) = reply {
            let _ = reply.send(Err(WorkerError::from_anyhow(err)));
        }
    }

    fn connect_finished(
        &mut self,
        generation: u64,
        result: anyhow::Result<Handshake>,
        reply: Option<Reply<()>>,
        ping_after: bool,
    ) {
        if generation != self.conn.generation() || self.state != WorkerState::Connecting {
            tracing::debug!(
                server_id = %self.server_id,
                generation,
                "dropping stale connect result"
            );
            if let Some(reply) = reply {
                let _ = reply.send(Err(WorkerError::Cancelled));
            }
            return;
        }

        let handshake = match result {
            Ok(h) => h,
            Err(e) => {
                self.connect_failed(e, reply);
                return;
            }
        };

        self.set_state(WorkerState::Connected);
        self.register_listeners();
        self.watch_close(generation, handshake.closed);

        if let Some(reply) = reply {
            let _ = reply.send(Ok(()));
        }
        if ping_after {
            self.keepalive_listeners();
        }
    }

    /// Forward the remote close notification of this connection to the loop.
    fn watch_close(&self, generation: u64, closed: oneshot::Receiver<anyhow::Result<()>>) {
        let tx = self.self_tx.clone();
        let server_id = self.server_id.clone();
        tokio::spawn(async move {
            let Ok(result) = closed.await else {
                tracing::debug!(server_id = %server_id, "close notifier dropped");
                return;
            };
            if let Some(tx) = tx.upgrade() {
                let _ = tx.send(Command::RemoteClosed { generation, result });
            }
        });
    }

    /// Returns `true` when the loop should stop.
    fn remote_closed(&mut self, generation: u64, result: anyhow::Result<()>) -> bool {
        if generation != self.conn.generation() || !self.state.socket_exists() {
            tracing::debug!(
                server_id = %self.server_id,
                generation,
                "ignoring close of old socket"
            );
            return false;
        }
        match result {
            Ok(()) => tracing::debug!(server_id = %self.server_id, "remote closed connection"),
            Err(e) => self.conn.log_connection_error(&e),
        }
        true
    }

    /// From idle, run the connect chain, which registers on success.
    /// A failed worker waits for keepalive instead.
    fn register_or_connect(&mut self) {
        match self.state {
            WorkerState::Ready => self.connect(None, false),
            _ => self.register_listeners(),
        }
    }

    fn register_listeners(&mut self) {
        if self.state != WorkerState::Connected {
            return;
        }
        let Some(wire) = self.conn.wire() else {
            return;
        };
        let ctx = ListenerContext {
            app: self.app.clone(),
            server_id: self.server_id.clone(),
            partition: self.conn.partition().clone(),
            wire: Arc::clone(wire),
        };
        self.set_state(WorkerState::Listening);
        let n = self.registry.register_all(&self.listeners, &ctx);
        tracing::debug!(server_id = %self.server_id, registered = n, "listeners registered");
    }

    fn keepalive_listeners(&mut self) {
        if !self.state.listeners_registered() {
            return;
        }
        self.registry.keepalive_all();
    }

    fn unregister_listeners(&mut self) {
        if !self.state.listeners_registered() {
            return;
        }
        self.set_state(WorkerState::Closing);
        self.registry.unregister_all();
        self.conn.close();
        self.set_state(WorkerState::Ready);
    }

    /// Unregister listeners and drop the socket, whatever state it is in.
    fn close(&mut self) {
        self.unregister_listeners();
        if matches!(self.state, WorkerState::Connected | WorkerState::Failed) {
            self.set_state(WorkerState::Closing);
            self.conn.close();
            self.set_state(WorkerState::Ready);
        }
    }

    fn shutdown(&mut self) {
        tracing::debug!(server_id = %self.server_id, state = %self.state, "worker stopping");
        self.close();
        // A handshake may still be in flight.
        self.conn.close();
        self.set_state(WorkerState::Stopped);
    }
}
