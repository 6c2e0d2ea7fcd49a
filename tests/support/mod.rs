#![allow(dead_code)]

use std::sync::Arc;

use incarnate::{
    ControlPersisterProvider, Document, IncarnatorConfig, Manager, MemoryBackend, ScriptEvaluator,
    StorageBackend,
};
use serde_json::{json, Value};

pub const SOURCE_DB: &str = "my_db";

/// Everything an end-to-end test needs: a shared in-memory backend, the
/// control-collection persisters on top of it, and a manager. Building a
/// second manager over the same backend simulates a process restart.
pub struct TestBed {
    pub backend: Arc<MemoryBackend>,
    pub provider: Arc<ControlPersisterProvider>,
    pub manager: Manager,
}

pub fn testbed() -> TestBed {
    let backend = Arc::new(MemoryBackend::new());
    backend.create_collection(SOURCE_DB).unwrap();
    let provider = Arc::new(ControlPersisterProvider::new(backend.clone(), "incarnate"));
    let manager = build_manager(&backend, &provider);
    TestBed {
        backend,
        provider,
        manager,
    }
}

fn build_manager(
    backend: &Arc<MemoryBackend>,
    provider: &Arc<ControlPersisterProvider>,
) -> Manager {
    Manager::new(
        backend.clone(),
        Arc::new(ScriptEvaluator::new()),
        provider.clone(),
    )
}

impl TestBed {
    /// A second manager over the same storage and persisters, as after a
    /// process restart.
    pub fn restarted_manager(&self) -> Manager {
        build_manager(&self.backend, &self.provider)
    }

    pub fn put_source(&self, id: &str, body: Value) -> String {
        self.backend
            .put_document(SOURCE_DB, &Document::new(id, body))
            .unwrap()
            .rev
    }

    pub fn update_source(&self, id: &str, body: Value) {
        let rev = self
            .backend
            .get_document(SOURCE_DB, id)
            .unwrap()
            .unwrap()
            .rev
            .unwrap();
        self.backend
            .put_document(SOURCE_DB, &Document::new(id, body).with_rev(rev))
            .unwrap();
    }

    /// Generation-scoped collections currently in the backend.
    pub fn derived_collections(&self) -> Vec<String> {
        self.backend
            .collection_names()
            .into_iter()
            .filter(|name| name.starts_with("incarnate_"))
            .collect()
    }
}

/// The scoreboard config the original ships in its test suite: emit
/// score by player, count per group.
pub fn scores_conf() -> IncarnatorConfig {
    serde_json::from_value(json!({
        "source": SOURCE_DB,
        "map": "function (doc) { if (doc.score && doc.for !== undefined) { emit(doc.for, doc.score); } }",
        "reduces": {
            "count": { "function": "_count", "group_levels": [1] }
        }
    }))
    .unwrap()
}
