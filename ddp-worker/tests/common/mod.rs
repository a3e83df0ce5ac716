//! Fakes shared by the worker integration tests.

#![allow(dead_code)]

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use ddp_worker::listener::ListenerContext;
use ddp_worker::{
    AppContext, Handshake, ListenerKind, ListenerTable, Registerable, ServerConfig, Store,
    WireConnector, WireHandle, Worker, WorkerConfig, WorkerContext, WorkerStatus, start,
};
use parking_lot::Mutex;
use tokio::sync::{Semaphore, oneshot};

pub type Log = Arc<Mutex<Vec<String>>>;

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

// ── Wire ──

#[derive(Default)]
pub struct NetState {
    pub hostnames: Mutex<Vec<String>>,
    pub handshakes: AtomicUsize,
    pub resumed: Mutex<Vec<Option<String>>>,
    pub fail: AtomicBool,
    /// Failed handshakes leave the socket reporting itself connected.
    pub half_open: AtomicBool,
    pub gate: Mutex<Option<Arc<Semaphore>>>,
    pub wires: Mutex<Vec<Arc<FakeWire>>>,
    next_session: AtomicUsize,
}

#[derive(Clone, Default)]
pub struct FakeNet(pub Arc<NetState>);

impl FakeNet {
    pub fn handshakes(&self) -> usize {
        self.0.handshakes.load(Ordering::SeqCst)
    }

    pub fn set_failing(&self, fail: bool) {
        self.0.fail.store(fail, Ordering::SeqCst);
    }

    pub fn set_half_open(&self, half_open: bool) {
        self.0.half_open.store(half_open, Ordering::SeqCst);
    }

    /// Hold every handshake until the returned semaphore gets a permit.
    pub fn gate(&self) -> Arc<Semaphore> {
        let sem = Arc::new(Semaphore::new(0));
        *self.0.gate.lock() = Some(Arc::clone(&sem));
        sem
    }

    pub fn last_wire(&self) -> Arc<FakeWire> {
        Arc::clone(self.0.wires.lock().last().expect("no wire created"))
    }

    /// Simulate the server closing the newest socket.
    pub fn close_remote(&self, result: Result<()>) {
        self.last_wire().fire_close(result);
    }

    /// Simulate a socket that died without a close notification.
    pub fn drop_silently(&self) {
        self.last_wire().connected.store(false, Ordering::SeqCst);
    }
}

impl WireConnector for FakeNet {
    fn create(&self, hostname: &str) -> Arc<dyn WireHandle> {
        self.0.hostnames.lock().push(hostname.to_string());
        let wire = Arc::new(FakeWire {
            net: Arc::clone(&self.0),
            connected: AtomicBool::new(false),
            closed_tx: Mutex::new(None),
            close_calls: AtomicUsize::new(0),
        });
        self.0.wires.lock().push(Arc::clone(&wire));
        wire
    }
}

pub struct FakeWire {
    net: Arc<NetState>,
    pub connected: AtomicBool,
    closed_tx: Mutex<Option<oneshot::Sender<Result<()>>>>,
    pub close_calls: AtomicUsize,
}

#[async_trait]
impl WireHandle for FakeWire {
    async fn connect(&self, session: Option<String>) -> Result<Handshake> {
        self.net.handshakes.fetch_add(1, Ordering::SeqCst);
        self.net.resumed.lock().push(session);
        let gate = self.net.gate.lock().clone();
        if let Some(gate) = gate {
            let _permit = gate.acquire().await?;
        }
        if self.net.fail.load(Ordering::SeqCst) {
            if self.net.half_open.load(Ordering::SeqCst) {
                self.connected.store(true, Ordering::SeqCst);
                anyhow::bail!("connect rejected");
            }
            anyhow::bail!("network unreachable");
        }
        let n = self.net.next_session.fetch_add(1, Ordering::SeqCst) + 1;
        let (tx, rx) = oneshot::channel();
        *self.closed_tx.lock() = Some(tx);
        self.connected.store(true, Ordering::SeqCst);
        Ok(Handshake {
            session: format!("sess-{n}"),
            closed: rx,
        })
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    fn close(&self) {
        self.close_calls.fetch_add(1, Ordering::SeqCst);
        self.connected.store(false, Ordering::SeqCst);
    }
}

impl FakeWire {
    /// Deliver this socket's close notification.
    pub fn fire_close(&self, result: Result<()>) {
        self.connected.store(false, Ordering::SeqCst);
        if let Some(tx) = self.closed_tx.lock().take() {
            let _ = tx.send(result);
        }
    }
}

// ── Listeners ──

struct Recorder {
    kind: ListenerKind,
    log: Log,
}

impl Registerable for Recorder {
    fn register(&mut self) -> Result<()> {
        self.log.lock().push(format!("register {}", self.kind));
        Ok(())
    }

    fn unregister(&mut self) -> Result<()> {
        self.log.lock().push(format!("unregister {}", self.kind));
        Ok(())
    }

    fn keepalive(&mut self) -> Result<()> {
        self.log.lock().push(format!("keepalive {}", self.kind));
        Ok(())
    }
}

/// A table whose listeners append lifecycle calls to `log` and the building
/// thread's name to `threads`.
pub fn recording_table(log: &Log, threads: &Log) -> ListenerTable {
    ListenerKind::ALL.into_iter().fold(ListenerTable::new(), |table, kind| {
        let log = Arc::clone(log);
        let threads = Arc::clone(threads);
        table.with(kind, move |_ctx: &ListenerContext| {
            let name = std::thread::current().name().unwrap_or("").to_string();
            threads.lock().push(name);
            Ok(Box::new(Recorder {
                kind,
                log: Arc::clone(&log),
            }) as Box<dyn Registerable>)
        })
    })
}

pub fn entries(log: &Log, prefix: &str) -> Vec<String> {
    log.lock()
        .iter()
        .filter(|e| e.starts_with(prefix))
        .cloned()
        .collect()
}

pub fn expected(prefix: &str) -> Vec<String> {
    ListenerKind::ALL
        .iter()
        .map(|k| format!("{prefix} {k}"))
        .collect()
}

// ── Harness ──

pub struct Harness {
    pub store: Arc<Store>,
    pub net: FakeNet,
    pub log: Log,
    pub threads: Log,
    pub ctx: WorkerContext,
}

impl Harness {
    /// Store holding `srv1` at `chat.example.com`, no session yet.
    pub fn new() -> Self {
        let h = Self::without_config();
        h.store
            .transaction(|tx| {
                Ok(tx.put_server_config(&ServerConfig::new("srv1", "chat.example.com"))?)
            })
            .unwrap();
        h
    }

    pub fn without_config() -> Self {
        init_tracing();
        let store = Arc::new(Store::open_memory().unwrap());
        let net = FakeNet::default();
        let log: Log = Arc::default();
        let threads: Log = Arc::default();
        let ctx = WorkerContext {
            app: AppContext::empty(),
            store: Arc::clone(&store),
            connector: Arc::new(net.clone()),
            listeners: recording_table(&log, &threads),
            config: WorkerConfig::default(),
        };
        Self {
            store,
            net,
            log,
            threads,
            ctx,
        }
    }

    pub fn server_config(&self) -> ServerConfig {
        self.store
            .transaction_for_read(|tx| Ok(tx.server_config("srv1")?))
            .unwrap()
            .unwrap()
    }
}

/// Start `srv1` and require the first connect to succeed.
pub async fn start_connected(ctx: &WorkerContext) -> Worker {
    let (worker, connected) = start(ctx, "srv1").await.unwrap();
    connected.unwrap();
    worker
}

/// Poll the worker until `pred` holds.
pub async fn eventually(worker: &Worker, pred: impl Fn(&WorkerStatus) -> bool) -> WorkerStatus {
    for _ in 0..300 {
        let status = worker.status().await.unwrap();
        if pred(&status) {
            return status;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("worker never reached expected state");
}

/// Wait for the loop to exit, failing the test after a few seconds.
pub async fn wait_stopped(worker: &Worker) {
    tokio::time::timeout(Duration::from_secs(3), worker.stopped())
        .await
        .expect("worker did not stop");
}
