//! Persister backed by the document store itself: one document per cell
//! in a control collection, revision-preserving upsert on save.

use std::sync::Arc;

use serde_json::Value;

use super::{Persister, PersisterError, PersisterProvider};
use crate::storage::{Document, StorageBackend, StorageError};

pub struct ControlPersister {
    storage: Arc<dyn StorageBackend>,
    collection: String,
    doc_id: String,
}

impl ControlPersister {
    pub fn new(
        storage: Arc<dyn StorageBackend>,
        collection: impl Into<String>,
        doc_id: impl Into<String>,
    ) -> Self {
        ControlPersister {
            storage,
            collection: collection.into(),
            doc_id: doc_id.into(),
        }
    }
}

fn fault(err: StorageError) -> PersisterError {
    PersisterError::Fault(err.to_string())
}

impl Persister for ControlPersister {
    fn save(&self, state: &Value) -> Result<(), PersisterError> {
        match self.storage.create_collection(&self.collection) {
            Ok(()) => {}
            Err(err) if err.already_exists() => {}
            Err(err) => return Err(fault(err)),
        }
        let existing = self
            .storage
            .get_document(&self.collection, &self.doc_id)
            .map_err(fault)?;
        let mut doc = Document::new(self.doc_id.clone(), state.clone());
        if let Some(existing) = existing {
            doc.rev = existing.rev;
        }
        self.storage
            .put_document(&self.collection, &doc)
            .map_err(fault)?;
        Ok(())
    }

    fn load(&self) -> Result<Value, PersisterError> {
        match self.storage.get_document(&self.collection, &self.doc_id) {
            Ok(Some(doc)) => Ok(doc.body),
            Ok(None) => Err(PersisterError::NotFound),
            // A missing control collection reads as "never persisted".
            Err(err) if err.is_not_found() => Err(PersisterError::NotFound),
            Err(err) => Err(fault(err)),
        }
    }

    fn remove(&self) -> Result<(), PersisterError> {
        let existing = match self.storage.get_document(&self.collection, &self.doc_id) {
            Ok(Some(doc)) => doc,
            Ok(None) => return Err(PersisterError::NotFound),
            Err(err) if err.is_not_found() => return Err(PersisterError::NotFound),
            Err(err) => return Err(fault(err)),
        };
        let rev = existing.rev.unwrap_or_default();
        self.storage
            .put_document(&self.collection, &Document::deletion(self.doc_id.clone(), rev))
            .map_err(fault)?;
        Ok(())
    }
}

/// Cells as documents of one control collection.
pub struct ControlPersisterProvider {
    storage: Arc<dyn StorageBackend>,
    collection: String,
}

impl ControlPersisterProvider {
    pub fn new(storage: Arc<dyn StorageBackend>, collection: impl Into<String>) -> Self {
        ControlPersisterProvider {
            storage,
            collection: collection.into(),
        }
    }
}

impl PersisterProvider for ControlPersisterProvider {
    fn incarnator(&self, id: &str) -> Arc<dyn Persister> {
        Arc::new(ControlPersister::new(
            self.storage.clone(),
            self.collection.clone(),
            id,
        ))
    }

    fn active_op(&self) -> Arc<dyn Persister> {
        Arc::new(ControlPersister::new(
            self.storage.clone(),
            self.collection.clone(),
            "active_async_op",
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemoryBackend;
    use serde_json::json;

    fn provider() -> ControlPersisterProvider {
        ControlPersisterProvider::new(Arc::new(MemoryBackend::new()), "incarnate")
    }

    #[test]
    fn roundtrip_and_overwrite() {
        let provider = provider();
        let cell = provider.incarnator("scores");
        assert_eq!(cell.load(), Err(PersisterError::NotFound));

        cell.save(&json!({"status": "initializing"})).unwrap();
        cell.save(&json!({"status": "initialized"})).unwrap();
        assert_eq!(cell.load().unwrap()["status"], json!("initialized"));

        cell.remove().unwrap();
        assert_eq!(cell.load(), Err(PersisterError::NotFound));
        assert_eq!(cell.remove(), Err(PersisterError::NotFound));
    }

    #[test]
    fn cells_are_independent_documents() {
        let provider = provider();
        provider.incarnator("a").save(&json!({"id": "a"})).unwrap();
        provider.active_op().save(&json!({"stage": "pre_init_target"})).unwrap();
        assert_eq!(provider.incarnator("a").load().unwrap()["id"], json!("a"));
        assert_eq!(
            provider.active_op().load().unwrap()["stage"],
            json!("pre_init_target")
        );
        assert_eq!(provider.incarnator("b").load(), Err(PersisterError::NotFound));
    }
}
