//! SQLite-backed record store, partitioned per server.
//!
//! Server configs live in one shared table. Session records are keyed by
//! partition name, so workers for different servers never touch each
//! other's rows.

use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use parking_lot::Mutex;
use rusqlite::{Connection, OptionalExtension, params};

use crate::config::WorkerConfig;
use crate::model::{ServerConfig, SessionRecord};

/// Partition used by store-level transactions.
pub const SHARED_PARTITION: &str = "";

pub struct Store {
    db: Mutex<Connection>,
}

impl std::fmt::Debug for Store {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Store").finish_non_exhaustive()
    }
}

impl Store {
    /// Open (or create) the store at the given path.
    pub fn open<P: AsRef<Path>>(path: P) -> rusqlite::Result<Self> {
        let conn = Connection::open(path)?;
        conn.execute_batch("PRAGMA journal_mode=WAL;")?;
        let store = Self { db: Mutex::new(conn) };
        store.migrate()?;
        Ok(store)
    }

    /// Open the store at the configured (or platform default) location,
    /// creating its directory if needed.
    pub fn open_default(config: &WorkerConfig) -> Result<Self> {
        let path = config.resolved_store_path();
        if let Some(dir) = path.parent() {
            std::fs::create_dir_all(dir)
                .with_context(|| format!("can't create {}", dir.display()))?;
        }
        Self::open(&path).with_context(|| format!("can't open store at {}", path.display()))
    }

    /// Open an in-memory store (for testing).
    pub fn open_memory() -> rusqlite::Result<Self> {
        let store = Self {
            db: Mutex::new(Connection::open_in_memory()?),
        };
        store.migrate()?;
        Ok(store)
    }

    fn migrate(&self) -> rusqlite::Result<()> {
        let db = self.db.lock();
        db.execute_batch(
            "
            CREATE TABLE IF NOT EXISTS server_configs (
                server_id        TEXT PRIMARY KEY,
                hostname         TEXT NOT NULL DEFAULT '',
                session          TEXT,
                connection_error TEXT
            );

            CREATE TABLE IF NOT EXISTS sessions (
                partition      TEXT NOT NULL,
                session_id     TEXT NOT NULL,
                token          TEXT,
                token_verified INTEGER NOT NULL DEFAULT 0,
                error          TEXT,
                PRIMARY KEY (partition, session_id)
            );
            ",
        )
    }

    /// A handle scoped to one partition.
    pub fn partition(self: &Arc<Self>, name: impl Into<String>) -> Partition {
        Partition {
            store: Arc::clone(self),
            name: name.into(),
        }
    }

    /// Run `f` inside a write transaction on the shared partition.
    pub fn transaction<T>(&self, f: impl FnOnce(&Tx<'_>) -> Result<T>) -> Result<T> {
        self.transaction_in(SHARED_PARTITION, f)
    }

    /// Run `f` against the shared partition without opening a write transaction.
    pub fn transaction_for_read<T>(&self, f: impl FnOnce(&Tx<'_>) -> Result<T>) -> Result<T> {
        self.read_in(SHARED_PARTITION, f)
    }

    fn transaction_in<T>(
        &self,
        partition: &str,
        f: impl FnOnce(&Tx<'_>) -> Result<T>,
    ) -> Result<T> {
        let mut db = self.db.lock();
        let txn = db.transaction()?;
        // Dropping `txn` on the error path rolls it back.
        let out = f(&Tx {
            conn: &txn,
            partition,
        })?;
        txn.commit()?;
        Ok(out)
    }

    fn read_in<T>(&self, partition: &str, f: impl FnOnce(&Tx<'_>) -> Result<T>) -> Result<T> {
        let db = self.db.lock();
        f(&Tx {
            conn: &db,
            partition,
        })
    }
}

/// A store view scoped to one named partition. Cheap to clone.
#[derive(Debug, Clone)]
pub struct Partition {
    store: Arc<Store>,
    name: String,
}

impl Partition {
    pub fn transaction<T>(&self, f: impl FnOnce(&Tx<'_>) -> Result<T>) -> Result<T> {
        self.store.transaction_in(&self.name, f)
    }

    pub fn transaction_for_read<T>(&self, f: impl FnOnce(&Tx<'_>) -> Result<T>) -> Result<T> {
        self.store.read_in(&self.name, f)
    }
}

/// Record operations available inside a transaction.
pub struct Tx<'a> {
    conn: &'a Connection,
    partition: &'a str,
}

impl Tx<'_> {
    pub fn server_config(&self, server_id: &str) -> rusqlite::Result<Option<ServerConfig>> {
        self.conn
            .query_row(
                "SELECT server_id, hostname, session, connection_error
                 FROM server_configs WHERE server_id = ?1",
                params![server_id],
                |row| {
                    Ok(ServerConfig {
                        server_id: row.get(0)?,
                        hostname: row.get(1)?,
                        session: row.get(2)?,
                        connection_error: row.get(3)?,
                    })
                },
            )
            .optional()
    }

    /// Insert or fully replace a server config.
    pub fn put_server_config(&self, cfg: &ServerConfig) -> rusqlite::Result<()> {
        self.conn.execute(
            "INSERT INTO server_configs (server_id, hostname, session, connection_error)
             VALUES (?1, ?2, ?3, ?4)
             ON CONFLICT(server_id) DO UPDATE SET
                hostname = excluded.hostname,
                session = excluded.session,
                connection_error = excluded.connection_error",
            params![cfg.server_id, cfg.hostname, cfg.session, cfg.connection_error],
        )?;
        Ok(())
    }

    /// Upsert only the session column, leaving the rest of the row alone.
    pub fn upsert_server_session(&self, server_id: &str, session: &str) -> rusqlite::Result<()> {
        self.conn.execute(
            "INSERT INTO server_configs (server_id, session) VALUES (?1, ?2)
             ON CONFLICT(server_id) DO UPDATE SET session = excluded.session",
            params![server_id, session],
        )?;
        Ok(())
    }

    pub fn set_connection_error(
        &self,
        server_id: &str,
        error: Option<&str>,
    ) -> rusqlite::Result<()> {
        self.conn.execute(
            "UPDATE server_configs SET connection_error = ?2 WHERE server_id = ?1",
            params![server_id, error],
        )?;
        Ok(())
    }

    pub fn session(&self, session_id: &str) -> rusqlite::Result<Option<SessionRecord>> {
        self.conn
            .query_row(
                "SELECT session_id, token, token_verified, error
                 FROM sessions WHERE partition = ?1 AND session_id = ?2",
                params![self.partition, session_id],
                row_to_session,
            )
            .optional()
    }

    /// All session records in this partition, ordered by id.
    pub fn sessions(&self) -> rusqlite::Result<Vec<SessionRecord>> {
        let mut stmt = self.conn.prepare(
            "SELECT session_id, token, token_verified, error
             FROM sessions WHERE partition = ?1 ORDER BY session_id",
        )?;
        let rows = stmt.query_map(params![self.partition], row_to_session)?;
        rows.collect()
    }

    /// Insert a new record. Fails if one with the same id exists.
    pub fn create_session(&self, rec: &SessionRecord) -> rusqlite::Result<()> {
        self.conn.execute(
            "INSERT INTO sessions (partition, session_id, token, token_verified, error)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                self.partition,
                rec.session_id,
                rec.token,
                rec.token_verified,
                rec.error
            ],
        )?;
        Ok(())
    }

    /// Overwrite an existing record. Returns whether a row was changed.
    pub fn update_session(&self, rec: &SessionRecord) -> rusqlite::Result<bool> {
        let n = self.conn.execute(
            "UPDATE sessions SET token = ?3, token_verified = ?4, error = ?5
             WHERE partition = ?1 AND session_id = ?2",
            params![
                self.partition,
                rec.session_id,
                rec.token,
                rec.token_verified,
                rec.error
            ],
        )?;
        Ok(n > 0)
    }
}

fn row_to_session(row: &rusqlite::Row<'_>) -> rusqlite::Result<SessionRecord> {
    Ok(SessionRecord {
        session_id: row.get(0)?,
        token: row.get(1)?,
        token_verified: row.get(2)?,
        error: row.get(3)?,
    })
}
