//! File-backed persister: one JSON file per cell, fsynced before acking.

use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde_json::Value;

use super::{Persister, PersisterError, PersisterProvider};

pub struct FsPersister {
    path: PathBuf,
}

impl FsPersister {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        FsPersister { path: path.into() }
    }
}

fn fault(err: impl std::fmt::Display) -> PersisterError {
    PersisterError::Fault(err.to_string())
}

impl Persister for FsPersister {
    fn save(&self, state: &Value) -> Result<(), PersisterError> {
        let text = serde_json::to_string_pretty(state).map_err(fault)?;
        let mut file = File::create(&self.path).map_err(fault)?;
        file.write_all(text.as_bytes()).map_err(fault)?;
        // Flush before ack: a crash after save() returns must not lose
        // the state the caller believes durable.
        file.sync_all().map_err(fault)?;
        Ok(())
    }

    fn load(&self) -> Result<Value, PersisterError> {
        let text = match fs::read_to_string(&self.path) {
            Ok(text) => text,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                return Err(PersisterError::NotFound)
            }
            Err(err) => return Err(fault(err)),
        };
        serde_json::from_str(&text).map_err(fault)
    }

    fn remove(&self) -> Result<(), PersisterError> {
        match fs::remove_file(&self.path) {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                Err(PersisterError::NotFound)
            }
            Err(err) => Err(fault(err)),
        }
    }
}

/// Cells as files under one directory.
pub struct FsPersisterProvider {
    dir: PathBuf,
}

impl FsPersisterProvider {
    pub fn new(dir: impl AsRef<Path>) -> Self {
        FsPersisterProvider {
            dir: dir.as_ref().to_path_buf(),
        }
    }
}

impl PersisterProvider for FsPersisterProvider {
    fn incarnator(&self, id: &str) -> Arc<dyn Persister> {
        Arc::new(FsPersister::new(self.dir.join(format!("{}.json", id))))
    }

    fn active_op(&self) -> Arc<dyn Persister> {
        Arc::new(FsPersister::new(self.dir.join("active_async_op.json")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn save_load_remove_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let cell = FsPersister::new(dir.path().join("state.json"));

        assert_eq!(cell.load(), Err(PersisterError::NotFound));

        let state = json!({"status": "initialized", "seq": 42});
        cell.save(&state).unwrap();
        assert_eq!(cell.load().unwrap(), state);

        // Save is an idempotent overwrite.
        cell.save(&state).unwrap();
        assert_eq!(cell.load().unwrap(), state);

        cell.remove().unwrap();
        assert_eq!(cell.load(), Err(PersisterError::NotFound));
        assert_eq!(cell.remove(), Err(PersisterError::NotFound));
    }

    #[test]
    fn corrupt_cell_is_a_fault_not_notfound() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state.json");
        std::fs::write(&path, b"{not json").unwrap();
        let cell = FsPersister::new(&path);
        assert!(matches!(cell.load(), Err(PersisterError::Fault(_))));
    }

    #[test]
    fn provider_separates_cells() {
        let dir = tempfile::tempdir().unwrap();
        let provider = FsPersisterProvider::new(dir.path());
        provider.incarnator("a").save(&json!({"id": "a"})).unwrap();
        provider.incarnator("b").save(&json!({"id": "b"})).unwrap();
        assert_eq!(provider.incarnator("a").load().unwrap()["id"], json!("a"));
        assert_eq!(provider.incarnator("b").load().unwrap()["id"], json!("b"));
        assert_eq!(provider.active_op().load(), Err(PersisterError::NotFound));
    }
}
