//! Worker tuning, loadable from TOML.
//!
//! ```toml
//! thread_name_prefix = "ddp_worker_"
//! store_path = "/var/lib/chat/store.db"
//! ```

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::Deserialize;

/// Default prefix for worker thread names.
pub const DEFAULT_THREAD_PREFIX: &str = "ddp_worker_";

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct WorkerConfig {
    /// Worker threads are named `<prefix><server_id>`.
    pub thread_name_prefix: String,
    /// SQLite file backing the store. `None` uses the platform data dir.
    pub store_path: Option<PathBuf>,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            thread_name_prefix: DEFAULT_THREAD_PREFIX.to_string(),
            store_path: None,
        }
    }
}

impl WorkerConfig {
    pub fn from_toml_str(s: &str) -> Result<Self> {
        toml::from_str(s).context("invalid worker config")
    }

    /// Read a config file. A missing file yields the defaults.
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let s = std::fs::read_to_string(path)
            .with_context(|| format!("can't read {}", path.display()))?;
        Self::from_toml_str(&s)
    }

    pub fn thread_name(&self, server_id: &str) -> String {
        format!("{}{server_id}", self.thread_name_prefix)
    }

    /// Where the store lives: the configured path, or `<data_dir>/ddp-worker/store.db`.
    pub fn resolved_store_path(&self) -> PathBuf {
        match &self.store_path {
            Some(p) => p.clone(),
            None => dirs::data_dir()
                .unwrap_or_else(|| PathBuf::from("."))
                .join("ddp-worker")
                .join("store.db"),
        }
    }
}
