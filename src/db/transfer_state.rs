//! Per-route transfer progress markers.
//!
//! One JSON file per route under the state directory. A file surviving into
//! the next run means the previous transfer of that route never finished.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use chrono::Utc;
use tracing::debug;

use super::{JsonStore, StoreError};
use crate::core::models::{TransferStage, TransferState};

#[derive(Debug, Clone)]
pub struct TransferStateStore {
    dir: PathBuf,
}

impl TransferStateStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn store(&self, route_base_id: &str) -> JsonStore<Option<TransferState>> {
        JsonStore::new(self.dir.join(format!("{}.json", sanitize(route_base_id))))
    }

    pub fn save(
        &self,
        route_base_id: &str,
        location_id: &str,
        progress_percent: u8,
        stage: TransferStage,
    ) -> Result<TransferState, StoreError> {
        let state = TransferState {
            route_base_id: route_base_id.to_string(),
            location_id: location_id.to_string(),
            progress_percent: progress_percent.min(100),
            stage,
            timestamp: Utc::now(),
        };
        self.store(route_base_id).save(&Some(state.clone()))?;
        debug!(
            route = %route_base_id,
            progress = progress_percent,
            stage = %stage,
            "Saved transfer state"
        );
        Ok(state)
    }

    pub fn load(&self, route_base_id: &str) -> Result<Option<TransferState>, StoreError> {
        self.store(route_base_id).load()
    }

    pub fn clear(&self, route_base_id: &str) -> Result<(), StoreError> {
        self.store(route_base_id).remove()
    }

    /// Every saved state, skipping files that cannot be parsed.
    pub fn list(&self) -> Result<Vec<TransferState>, StoreError> {
        let entries = match fs::read_dir(&self.dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(source) => {
                return Err(StoreError::Io {
                    path: self.dir.clone(),
                    source,
                });
            }
        };

        let mut states = Vec::new();
        for entry in entries.flatten() {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            match JsonStore::<Option<TransferState>>::new(&path).load() {
                Ok(Some(state)) => states.push(state),
                Ok(None) => {}
                Err(e) => debug!(path = %path.display(), error = %e, "Skipping unreadable state"),
            }
        }
        states.sort_by(|a, b| a.route_base_id.cmp(&b.route_base_id));
        Ok(states)
    }
}

/// Route ids become file names; keep them to one path component.
fn sanitize(route_base_id: &str) -> String {
    route_base_id
        .chars()
        .map(|c| if c == '/' || c == '\\' { '_' } else { c })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn save_load_clear() {
        let temp = tempdir().unwrap();
        let store = TransferStateStore::new(temp.path().join("state"));

        assert!(store.load("00001").unwrap().is_none());

        store
            .save("00001", "loc1", 25, TransferStage::Concatenating)
            .unwrap();
        let state = store.load("00001").unwrap().unwrap();
        assert_eq!(state.progress_percent, 25);
        assert_eq!(state.location_id, "loc1");
        assert_eq!(state.stage, TransferStage::Concatenating);

        store.clear("00001").unwrap();
        assert!(store.load("00001").unwrap().is_none());
        store.clear("00001").unwrap();
    }

    #[test]
    fn later_save_replaces_earlier() {
        let temp = tempdir().unwrap();
        let store = TransferStateStore::new(temp.path());

        store.save("r", "loc", 25, TransferStage::Concatenating).unwrap();
        store.save("r", "loc", 75, TransferStage::Uploading).unwrap();

        let states = store.list().unwrap();
        assert_eq!(states.len(), 1);
        assert_eq!(states[0].progress_percent, 75);
    }

    #[test]
    fn list_skips_foreign_files() {
        let temp = tempdir().unwrap();
        let store = TransferStateStore::new(temp.path());
        store.save("b", "loc", 0, TransferStage::Init).unwrap();
        store.save("a", "loc", 50, TransferStage::Concatenating).unwrap();
        fs::write(temp.path().join("notes.txt"), "x").unwrap();
        fs::write(temp.path().join("broken.json"), "{").unwrap();

        let routes: Vec<_> = store
            .list()
            .unwrap()
            .into_iter()
            .map(|s| s.route_base_id)
            .collect();
        assert_eq!(routes, vec!["a", "b"]);
    }
}
