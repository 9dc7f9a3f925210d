//! Append-only history of transfer attempts.

use std::path::{Path, PathBuf};

use tracing::warn;

use super::{JsonStore, StoreError};
use crate::core::models::TransferLogEntry;

#[derive(Debug, Clone)]
pub struct TransferLog {
    store: JsonStore<Vec<TransferLogEntry>>,
}

impl TransferLog {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            store: JsonStore::new(path),
        }
    }

    pub fn path(&self) -> &Path {
        self.store.path()
    }

    /// Read the history without repairing it.
    pub fn inspect(&self) -> Result<Vec<TransferLogEntry>, StoreError> {
        self.store.load()
    }

    /// Move an unreadable history aside and start an empty one.
    pub fn quarantine(&self) -> Result<PathBuf, StoreError> {
        self.store.quarantine()
    }

    /// Load the history. An unparsable file is quarantined and the history
    /// starts over empty.
    fn load(&self) -> Result<Vec<TransferLogEntry>, StoreError> {
        match self.store.load() {
            Err(StoreError::Corrupt { path, source }) => {
                warn!(path = %path.display(), error = %source, "Transfer log is corrupt");
                self.store.quarantine()?;
                Ok(Vec::new())
            }
            other => other,
        }
    }

    pub fn append(&self, entry: TransferLogEntry) -> Result<(), StoreError> {
        let mut entries = self.load()?;
        entries.push(entry);
        self.store.save(&entries)
    }

    pub fn query_all(&self) -> Result<Vec<TransferLogEntry>, StoreError> {
        self.load()
    }

    pub fn query_by_route(&self, route_base_id: &str) -> Result<Vec<TransferLogEntry>, StoreError> {
        Ok(self
            .load()?
            .into_iter()
            .filter(|e| e.route_base_id == route_base_id)
            .collect())
    }
}
