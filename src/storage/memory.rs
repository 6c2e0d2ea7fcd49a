//! In-memory storage backend for testing and single-process scenarios.
//!
//! Behaves like a small CouchDB: revision tokens, tombstoned deletes, a
//! change feed that reports each document once at its latest change,
//! `_all_docs`, and grouped/bracketed view queries under key collation.
//! Reduce sources installed via `set_views` are compiled through an
//! [`Evaluator`] and run at query time, the way the real backend would.

use std::collections::hash_map::DefaultHasher;
use std::collections::{BTreeMap, HashMap};
use std::hash::{Hash, Hasher};
use std::sync::{Arc, Mutex};

use serde_json::{json, Value};

use super::{
    cmp_keys, Change, ChangeBatch, Document, RawRequest, RawResponse, Seq, StorageBackend,
    StorageError, ViewDef, ViewMap, ViewQuery, ViewRow, Written,
};
use crate::evaluator::{Evaluator, ReduceFn, ScriptEvaluator};

pub struct MemoryBackend {
    evaluator: Arc<dyn Evaluator>,
    collections: Mutex<HashMap<String, Collection>>,
}

struct Collection {
    docs: BTreeMap<String, StoredDoc>,
    next_seq: u64,
    views: Vec<StoredView>,
}

struct StoredDoc {
    gen: u64,
    rev: String,
    deleted: bool,
    body: Value,
    seq: u64,
}

struct StoredView {
    def: ViewDef,
    reduce: Option<Box<dyn ReduceFn>>,
}

impl Default for MemoryBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryBackend {
    /// Backend with the bundled script evaluator for reduce views.
    pub fn new() -> Self {
        Self::with_evaluator(Arc::new(ScriptEvaluator::new()))
    }

    pub fn with_evaluator(evaluator: Arc<dyn Evaluator>) -> Self {
        MemoryBackend {
            evaluator,
            collections: Mutex::new(HashMap::new()),
        }
    }

    /// Names of all live collections, for assertions in tests.
    pub fn collection_names(&self) -> Vec<String> {
        let collections = match self.collections.lock() {
            Ok(guard) => guard,
            Err(_) => return Vec::new(),
        };
        let mut names: Vec<String> = collections.keys().cloned().collect();
        names.sort();
        names
    }

    fn locked(
        &self,
    ) -> Result<std::sync::MutexGuard<'_, HashMap<String, Collection>>, StorageError> {
        self.collections
            .lock()
            .map_err(|_| StorageError::Connection("backend lock poisoned".to_string()))
    }
}

fn make_rev(gen: u64, body: &Value) -> String {
    let mut hasher = DefaultHasher::new();
    gen.hash(&mut hasher);
    body.to_string().hash(&mut hasher);
    format!("{}-{:08x}", gen, hasher.finish() as u32)
}

fn collection<'a>(
    map: &'a HashMap<String, Collection>,
    name: &str,
) -> Result<&'a Collection, StorageError> {
    map.get(name).ok_or(StorageError::Status(404))
}

fn collection_mut<'a>(
    map: &'a mut HashMap<String, Collection>,
    name: &str,
) -> Result<&'a mut Collection, StorageError> {
    map.get_mut(name).ok_or(StorageError::Status(404))
}

impl Collection {
    fn new() -> Self {
        Collection {
            docs: BTreeMap::new(),
            next_seq: 1,
            views: Vec::new(),
        }
    }

    /// Revision check for one incoming write, against current state.
    fn check(&self, doc: &Document) -> Result<(), StorageError> {
        let current = self.docs.get(&doc.id);
        match (&doc.rev, current) {
            (None, Some(existing)) if !existing.deleted => Err(StorageError::Status(409)),
            (None, _) => Ok(()),
            (Some(rev), Some(existing)) if existing.rev == *rev => Ok(()),
            (Some(_), _) => Err(StorageError::Status(409)),
        }
    }

    fn apply(&mut self, doc: &Document) -> Written {
        let gen = self.docs.get(&doc.id).map(|d| d.gen).unwrap_or(0) + 1;
        let rev = make_rev(gen, &doc.body);
        let seq = self.next_seq;
        self.next_seq += 1;
        self.docs.insert(
            doc.id.clone(),
            StoredDoc {
                gen,
                rev: rev.clone(),
                deleted: doc.deleted,
                body: doc.body.clone(),
                seq,
            },
        );
        Written {
            id: doc.id.clone(),
            rev,
        }
    }

    fn live_docs(&self) -> impl Iterator<Item = (&String, &StoredDoc)> {
        self.docs.iter().filter(|(_, d)| !d.deleted)
    }

    fn wire_doc(&self, id: &str, stored: &StoredDoc) -> Value {
        Document {
            id: id.to_string(),
            rev: Some(stored.rev.clone()),
            deleted: false,
            body: stored.body.clone(),
        }
        .to_wire()
    }
}

/// Truncate a group key to the queried level. Level 0 collapses every key
/// to the singleton `null` group; positive levels truncate array keys and
/// pass anything else through.
fn group_key(key: &Value, level: Option<u32>) -> Value {
    match level {
        None => key.clone(),
        Some(0) => Value::Null,
        Some(n) => match key {
            Value::Array(items) => Value::Array(items.iter().take(n as usize).cloned().collect()),
            other => other.clone(),
        },
    }
}

fn key_matches(key: &Value, query: &ViewQuery) -> bool {
    if let Some(exact) = &query.key {
        return cmp_keys(key, exact) == std::cmp::Ordering::Equal;
    }
    if let Some(keys) = &query.keys {
        return keys
            .iter()
            .any(|k| cmp_keys(key, k) == std::cmp::Ordering::Equal);
    }
    match (&query.start_key, &query.end_key) {
        (Some(start), Some(end)) => super::collate::in_range(key, start, end),
        (Some(start), None) => cmp_keys(key, start) != std::cmp::Ordering::Less,
        (None, Some(end)) => cmp_keys(key, end) != std::cmp::Ordering::Greater,
        (None, None) => true,
    }
}

impl StorageBackend for MemoryBackend {
    fn create_collection(&self, name: &str) -> Result<(), StorageError> {
        let mut collections = self.locked()?;
        if collections.contains_key(name) {
            return Err(StorageError::Status(412));
        }
        collections.insert(name.to_string(), Collection::new());
        Ok(())
    }

    fn delete_collection(&self, name: &str) -> Result<(), StorageError> {
        let mut collections = self.locked()?;
        if collections.remove(name).is_none() {
            return Err(StorageError::Status(404));
        }
        Ok(())
    }

    fn set_views(&self, name: &str, views: &[ViewDef]) -> Result<(), StorageError> {
        let mut compiled = Vec::with_capacity(views.len());
        for def in views {
            let reduce = match &def.reduce {
                Some(source) => Some(
                    self.evaluator
                        .compile_reduce(source)
                        .map_err(|_| StorageError::Status(400))?,
                ),
                None => None,
            };
            compiled.push(StoredView {
                def: def.clone(),
                reduce,
            });
        }
        let mut collections = self.locked()?;
        collection_mut(&mut collections, name)?.views = compiled;
        Ok(())
    }

    fn get_document(&self, name: &str, id: &str) -> Result<Option<Document>, StorageError> {
        let collections = self.locked()?;
        let coll = collection(&collections, name)?;
        Ok(coll.docs.get(id).filter(|d| !d.deleted).map(|d| Document {
            id: id.to_string(),
            rev: Some(d.rev.clone()),
            deleted: false,
            body: d.body.clone(),
        }))
    }

    fn get_documents(&self, name: &str, ids: &[String]) -> Result<Vec<Document>, StorageError> {
        let collections = self.locked()?;
        let coll = collection(&collections, name)?;
        let mut found = Vec::new();
        for id in ids {
            if let Some(stored) = coll.docs.get(id).filter(|d| !d.deleted) {
                found.push(Document {
                    id: id.clone(),
                    rev: Some(stored.rev.clone()),
                    deleted: false,
                    body: stored.body.clone(),
                });
            }
        }
        Ok(found)
    }

    fn put_document(&self, name: &str, doc: &Document) -> Result<Written, StorageError> {
        let mut collections = self.locked()?;
        let coll = collection_mut(&mut collections, name)?;
        coll.check(doc)?;
        Ok(coll.apply(doc))
    }

    fn bulk_write(
        &self,
        name: &str,
        docs: &[Document],
        all_or_nothing: bool,
    ) -> Result<Vec<Written>, StorageError> {
        let mut collections = self.locked()?;
        let coll = collection_mut(&mut collections, name)?;
        if all_or_nothing {
            // One stale revision fails the whole batch, nothing applies.
            for doc in docs {
                coll.check(doc)?;
            }
            Ok(docs.iter().map(|doc| coll.apply(doc)).collect())
        } else {
            let mut written = Vec::with_capacity(docs.len());
            for doc in docs {
                if coll.check(doc).is_ok() {
                    written.push(coll.apply(doc));
                }
            }
            Ok(written)
        }
    }

    fn query_view(
        &self,
        name: &str,
        view: &str,
        query: &ViewQuery,
    ) -> Result<Vec<ViewRow>, StorageError> {
        let collections = self.locked()?;
        let coll = collection(&collections, name)?;

        if view == "_all_docs" {
            let mut rows = Vec::new();
            for (id, stored) in coll.live_docs() {
                let key = Value::String(id.clone());
                if !key_matches(&key, query) {
                    continue;
                }
                rows.push(ViewRow {
                    id: Some(id.clone()),
                    key,
                    value: json!({ "rev": stored.rev }),
                });
            }
            return Ok(rows);
        }

        let stored_view = coll
            .views
            .iter()
            .find(|v| v.def.name == view)
            .ok_or(StorageError::Status(404))?;

        match stored_view.def.map {
            ViewMap::ByOrigin => {
                let mut rows = Vec::new();
                for (id, stored) in coll.live_docs() {
                    let origin = stored.body.get("origin").cloned().unwrap_or(Value::Null);
                    if !key_matches(&origin, query) {
                        continue;
                    }
                    rows.push(ViewRow {
                        id: Some(id.clone()),
                        key: origin,
                        value: json!({ "_rev": stored.rev }),
                    });
                }
                Ok(rows)
            }
            ViewMap::ByKey => {
                let mut rows: Vec<ViewRow> = Vec::new();
                for (id, stored) in coll.live_docs() {
                    let key = stored.body.get("key").cloned().unwrap_or(Value::Null);
                    if !key_matches(&key, query) {
                        continue;
                    }
                    rows.push(ViewRow {
                        id: Some(id.clone()),
                        key,
                        value: stored.body.get("value").cloned().unwrap_or(Value::Null),
                    });
                }
                rows.sort_by(|a, b| {
                    cmp_keys(&a.key, &b.key).then_with(|| a.id.cmp(&b.id))
                });

                let reduce = match &stored_view.reduce {
                    Some(reduce) => reduce,
                    None => return Ok(rows),
                };

                if !query.group && query.group_level.is_none() {
                    return Ok(rows);
                }

                let mut grouped: Vec<(Value, Vec<Value>, Vec<Value>)> = Vec::new();
                for row in &rows {
                    let gk = group_key(&row.key, query.group_level);
                    match grouped
                        .last_mut()
                        .filter(|(k, _, _)| cmp_keys(k, &gk) == std::cmp::Ordering::Equal)
                    {
                        Some((_, keys, values)) => {
                            keys.push(row.key.clone());
                            values.push(row.value.clone());
                        }
                        None => grouped.push((gk, vec![row.key.clone()], vec![row.value.clone()])),
                    }
                }

                let mut reduced = Vec::with_capacity(grouped.len());
                for (gk, keys, values) in grouped {
                    let value = reduce
                        .reduce(&keys, &values, false)
                        .map_err(|_| StorageError::Status(500))?;
                    reduced.push(ViewRow {
                        id: None,
                        key: gk,
                        value,
                    });
                }
                Ok(reduced)
            }
        }
    }

    fn changes(
        &self,
        name: &str,
        since: Seq,
        limit: usize,
        include_docs: bool,
    ) -> Result<ChangeBatch, StorageError> {
        let collections = self.locked()?;
        let coll = collection(&collections, name)?;
        let mut changed: Vec<(&String, &StoredDoc)> = coll
            .docs
            .iter()
            .filter(|(_, d)| d.seq > since.0)
            .collect();
        changed.sort_by_key(|(_, d)| d.seq);
        changed.truncate(limit);

        let results: Vec<Change> = changed
            .iter()
            .map(|(id, stored)| Change {
                id: (*id).clone(),
                seq: Seq(stored.seq),
                deleted: stored.deleted,
                doc: if include_docs && !stored.deleted {
                    Some(coll.wire_doc(id, stored))
                } else {
                    None
                },
            })
            .collect();

        let last_seq = results.last().map(|c| c.seq).unwrap_or(since);
        Ok(ChangeBatch { results, last_seq })
    }

    fn raw_request(
        &self,
        name: &str,
        request: &RawRequest,
    ) -> Result<RawResponse, StorageError> {
        let collections = self.locked()?;
        let coll = match collections.get(name) {
            Some(coll) => coll,
            None => return Ok(RawResponse::not_found()),
        };

        if request.method != "GET" {
            return Ok(RawResponse {
                status: 405,
                body: json!({ "error": "method not supported" }),
            });
        }

        match request.path.as_str() {
            "" => Ok(RawResponse {
                status: 200,
                body: json!({
                    "db_name": name,
                    "doc_count": coll.live_docs().count(),
                }),
            }),
            "_all_docs" => {
                let rows: Vec<Value> = coll
                    .live_docs()
                    .map(|(id, stored)| {
                        json!({
                            "id": id,
                            "key": id,
                            "value": { "rev": stored.rev },
                        })
                    })
                    .collect();
                Ok(RawResponse {
                    status: 200,
                    body: json!({ "total_rows": rows.len(), "rows": rows }),
                })
            }
            doc_id => match coll.docs.get(doc_id).filter(|d| !d.deleted) {
                Some(stored) => Ok(RawResponse {
                    status: 200,
                    body: coll.wire_doc(doc_id, stored),
                }),
                None => Ok(RawResponse::not_found()),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn backend() -> MemoryBackend {
        let backend = MemoryBackend::new();
        backend.create_collection("db").unwrap();
        backend
    }

    #[test]
    fn create_is_exclusive_delete_is_strict() {
        let backend = backend();
        assert!(backend.create_collection("db").unwrap_err().already_exists());
        backend.delete_collection("db").unwrap();
        assert!(backend.delete_collection("db").unwrap_err().is_not_found());
    }

    #[test]
    fn revision_checks() {
        let backend = backend();
        let written = backend
            .put_document("db", &Document::new("a", json!({"n": 1})))
            .unwrap();
        // Blind overwrite conflicts, revisioned update succeeds.
        assert!(backend
            .put_document("db", &Document::new("a", json!({"n": 2})))
            .unwrap_err()
            .is_conflict());
        backend
            .put_document(
                "db",
                &Document::new("a", json!({"n": 2})).with_rev(written.rev),
            )
            .unwrap();
    }

    #[test]
    fn bulk_write_is_atomic() {
        let backend = backend();
        backend
            .put_document("db", &Document::new("a", json!({"n": 1})))
            .unwrap();
        let batch = vec![
            Document::new("b", json!({"n": 2})),
            // Stale rev: must poison the whole batch.
            Document::new("a", json!({"n": 9})).with_rev("1-deadbeef"),
        ];
        assert!(backend.bulk_write("db", &batch, true).is_err());
        assert!(backend.get_document("db", "b").unwrap().is_none());
    }

    #[test]
    fn batched_fetch_skips_missing_ids() {
        let backend = backend();
        backend
            .put_document("db", &Document::new("a", json!({"n": 1})))
            .unwrap();
        backend
            .put_document("db", &Document::new("b", json!({"n": 2})))
            .unwrap();
        let docs = backend
            .get_documents(
                "db",
                &["a".to_string(), "missing".to_string(), "b".to_string()],
            )
            .unwrap();
        assert_eq!(docs.len(), 2);
        assert_eq!(docs[0].id, "a");
        assert_eq!(docs[1].id, "b");
    }

    #[test]
    fn changes_report_latest_only() {
        let backend = backend();
        let first = backend
            .put_document("db", &Document::new("a", json!({"n": 1})))
            .unwrap();
        backend
            .put_document("db", &Document::new("b", json!({"n": 1})))
            .unwrap();
        backend
            .put_document(
                "db",
                &Document::new("a", json!({"n": 2})).with_rev(first.rev),
            )
            .unwrap();

        let batch = backend.changes("db", Seq::zero(), 100, false).unwrap();
        assert_eq!(batch.results.len(), 2);
        // "a" appears once, at its latest seq, after "b".
        assert_eq!(batch.results[0].id, "b");
        assert_eq!(batch.results[1].id, "a");
        assert_eq!(batch.last_seq, Seq(3));

        let empty = backend.changes("db", batch.last_seq, 100, false).unwrap();
        assert!(empty.results.is_empty());
        assert_eq!(empty.last_seq, batch.last_seq);
    }

    #[test]
    fn deletions_surface_in_changes() {
        let backend = backend();
        let written = backend
            .put_document("db", &Document::new("a", json!({"n": 1})))
            .unwrap();
        backend
            .put_document("db", &Document::deletion("a", written.rev))
            .unwrap();
        let batch = backend.changes("db", Seq::zero(), 100, true).unwrap();
        assert_eq!(batch.results.len(), 1);
        assert!(batch.results[0].deleted);
        assert!(batch.results[0].doc.is_none());
    }

    #[test]
    fn grouped_reduce_query() {
        let backend = backend();
        backend
            .set_views(
                "db",
                &[ViewDef {
                    name: "count".to_string(),
                    map: ViewMap::ByKey,
                    reduce: Some("_count".to_string()),
                }],
            )
            .unwrap();
        for (id, key) in [("1", "x"), ("2", "x"), ("3", "y")] {
            backend
                .put_document(
                    "db",
                    &Document::new(id, json!({"key": key, "value": 1})),
                )
                .unwrap();
        }
        let rows = backend
            .query_view("db", "count", &ViewQuery::by_key(json!("x")).grouped(None))
            .unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].value, json!(2));

        // Level 0 collapses everything into the null group.
        let rows = backend
            .query_view("db", "count", &ViewQuery::default().grouped(Some(0)))
            .unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].key, Value::Null);
        assert_eq!(rows[0].value, json!(3));
    }

    #[test]
    fn bracketed_group_level_query() {
        let backend = backend();
        backend
            .set_views(
                "db",
                &[ViewDef {
                    name: "sum".to_string(),
                    map: ViewMap::ByKey,
                    reduce: Some("_sum".to_string()),
                }],
            )
            .unwrap();
        for (id, key, value) in [
            ("1", json!(["a", "b", "c"]), 1),
            ("2", json!(["a", "b", "d"]), 2),
            ("3", json!(["a", "z"]), 10),
        ] {
            backend
                .put_document("db", &Document::new(id, json!({"key": key, "value": value})))
                .unwrap();
        }
        let query = ViewQuery {
            start_key: Some(json!(["a", "b"])),
            end_key: Some(json!(["a", "b", {}])),
            ..Default::default()
        }
        .grouped(Some(2));
        let rows = backend.query_view("db", "sum", &query).unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].key, json!(["a", "b"]));
        assert_eq!(rows[0].value, json!(3));
    }

    #[test]
    fn origin_index() {
        let backend = backend();
        backend
            .set_views(
                "db",
                &[ViewDef {
                    name: "meta_by_origin".to_string(),
                    map: ViewMap::ByOrigin,
                    reduce: None,
                }],
            )
            .unwrap();
        backend
            .put_document(
                "db",
                &Document::new("slot-1", json!({"key": "k", "origin": "src-1", "value": 1})),
            )
            .unwrap();
        backend
            .put_document(
                "db",
                &Document::new("slot-2", json!({"key": "k", "origin": "src-2", "value": 1})),
            )
            .unwrap();
        let rows = backend
            .query_view(
                "db",
                "meta_by_origin",
                &ViewQuery::by_keys(vec![json!("src-1")]),
            )
            .unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].id.as_deref(), Some("slot-1"));
        assert!(rows[0].value.get("_rev").is_some());
    }

    #[test]
    fn raw_get_document() {
        let backend = backend();
        backend
            .put_document("db", &Document::new("a", json!({"n": 1})))
            .unwrap();
        let response = backend.raw_request("db", &RawRequest::get("a")).unwrap();
        assert_eq!(response.status, 200);
        assert_eq!(response.body["n"], json!(1));
        assert_eq!(response.body["_id"], json!("a"));
        let missing = backend.raw_request("db", &RawRequest::get("zz")).unwrap();
        assert_eq!(missing.status, 404);
    }
}
