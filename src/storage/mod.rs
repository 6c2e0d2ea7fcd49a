//! Storage boundary.
//!
//! The document store is an external collaborator: the core only ever
//! talks to it through [`StorageBackend`]. The contract is deliberately
//! CouchDB-shaped (revisioned documents, an all-or-nothing bulk write,
//! grouped/ranged view queries, a cursor-based change feed), but any
//! store that can satisfy it will do. [`MemoryBackend`] is the bundled
//! in-process implementation, used for testing and single-process
//! deployments.

mod collate;
mod memory;

pub use collate::cmp_keys;
pub use memory::MemoryBackend;

use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};

/// Opaque position in a collection's change feed.
///
/// Monotonic non-decreasing; `Seq::zero()` addresses the start of the feed.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct Seq(pub u64);

impl Seq {
    pub fn zero() -> Self {
        Seq(0)
    }
}

impl fmt::Display for Seq {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A revisioned document.
///
/// `rev` is `None` for a fresh insert; updates and deletions must carry
/// the revision token they intend to replace.
#[derive(Debug, Clone, PartialEq)]
pub struct Document {
    pub id: String,
    pub rev: Option<String>,
    pub deleted: bool,
    pub body: Value,
}

impl Document {
    pub fn new(id: impl Into<String>, body: Value) -> Self {
        Document {
            id: id.into(),
            rev: None,
            deleted: false,
            body,
        }
    }

    pub fn with_rev(mut self, rev: impl Into<String>) -> Self {
        self.rev = Some(rev.into());
        self
    }

    /// A deletion stub: id + prior revision, no body.
    pub fn deletion(id: impl Into<String>, rev: impl Into<String>) -> Self {
        Document {
            id: id.into(),
            rev: Some(rev.into()),
            deleted: true,
            body: Value::Null,
        }
    }

    /// The document as the wire would carry it: body plus `_id`/`_rev`
    /// (and `_deleted`) special members.
    pub fn to_wire(&self) -> Value {
        let mut obj = match &self.body {
            Value::Object(map) => map.clone(),
            Value::Null => Map::new(),
            other => {
                let mut map = Map::new();
                map.insert("value".to_string(), other.clone());
                map
            }
        };
        obj.insert("_id".to_string(), Value::String(self.id.clone()));
        if let Some(rev) = &self.rev {
            obj.insert("_rev".to_string(), Value::String(rev.clone()));
        }
        if self.deleted {
            obj.insert("_deleted".to_string(), Value::Bool(true));
        }
        Value::Object(obj)
    }
}

/// One entry in a change feed.
#[derive(Debug, Clone)]
pub struct Change {
    pub id: String,
    pub seq: Seq,
    pub deleted: bool,
    /// Present when the feed was requested with `include_docs`.
    pub doc: Option<Value>,
}

/// A page of the change feed.
#[derive(Debug, Clone, Default)]
pub struct ChangeBatch {
    pub results: Vec<Change>,
    /// Seq of the last result in this page; equals the requested `since`
    /// when the page is empty.
    pub last_seq: Seq,
}

/// Result of writing one document in a bulk operation.
#[derive(Debug, Clone)]
pub struct Written {
    pub id: String,
    pub rev: String,
}

/// View query options, CouchDB-style.
#[derive(Debug, Clone, Default)]
pub struct ViewQuery {
    pub key: Option<Value>,
    pub keys: Option<Vec<Value>>,
    pub start_key: Option<Value>,
    pub end_key: Option<Value>,
    pub group: bool,
    pub group_level: Option<u32>,
    pub include_docs: bool,
}

impl ViewQuery {
    pub fn by_key(key: Value) -> Self {
        ViewQuery {
            key: Some(key),
            ..Default::default()
        }
    }

    pub fn by_keys(keys: Vec<Value>) -> Self {
        ViewQuery {
            keys: Some(keys),
            ..Default::default()
        }
    }

    pub fn grouped(mut self, level: Option<u32>) -> Self {
        self.group = true;
        self.group_level = level;
        self
    }
}

/// One row of a view result.
#[derive(Debug, Clone, PartialEq)]
pub struct ViewRow {
    /// Originating document id; absent for reduced rows.
    pub id: Option<String>,
    pub key: Value,
    pub value: Value,
}

/// The map side of an installed view.
///
/// The system only ever installs two shapes, so the contract names them
/// instead of shipping map source text to the backend: `ByOrigin` indexes
/// emitted slots by their origin document id (the permanent origin index),
/// `ByKey` indexes them by emitted key for reduction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ViewMap {
    ByOrigin,
    ByKey,
}

/// An installed view: a named map shape plus an optional reduce source,
/// compiled and evaluated by the backend.
#[derive(Debug, Clone)]
pub struct ViewDef {
    pub name: String,
    pub map: ViewMap,
    pub reduce: Option<String>,
}

/// A request forwarded verbatim to a collection.
#[derive(Debug, Clone)]
pub struct RawRequest {
    pub method: String,
    /// Path inside the collection, e.g. `""`, `"_all_docs"` or a doc id.
    pub path: String,
    pub query: Vec<(String, String)>,
    pub body: Option<Value>,
}

impl RawRequest {
    pub fn get(path: impl Into<String>) -> Self {
        RawRequest {
            method: "GET".to_string(),
            path: path.into(),
            query: Vec::new(),
            body: None,
        }
    }
}

/// The raw response of a forwarded request, returned unmodified.
#[derive(Debug, Clone, PartialEq)]
pub struct RawResponse {
    pub status: u16,
    pub body: Value,
}

impl RawResponse {
    pub fn not_found() -> Self {
        RawResponse {
            status: 404,
            body: json!({ "error": "not_found" }),
        }
    }
}

/// Storage failure. Connection faults and backend status faults are both
/// opaque I/O failures to the core.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StorageError {
    Connection(String),
    Status(u16),
}

impl StorageError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, StorageError::Status(404))
    }

    pub fn is_conflict(&self) -> bool {
        matches!(self, StorageError::Status(409))
    }

    pub fn already_exists(&self) -> bool {
        matches!(self, StorageError::Status(412))
    }
}

impl fmt::Display for StorageError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StorageError::Connection(detail) => write!(f, "storage connection error: {}", detail),
            StorageError::Status(code) => write!(f, "storage returned status {}", code),
        }
    }
}

impl std::error::Error for StorageError {}

/// The document store, as the core sees it.
pub trait StorageBackend: Send + Sync {
    /// Create a collection. Fails with status 412 if it already exists.
    fn create_collection(&self, name: &str) -> Result<(), StorageError>;

    /// Delete a collection. Fails with status 404 if absent.
    fn delete_collection(&self, name: &str) -> Result<(), StorageError>;

    /// Install (replacing) the views of a collection.
    fn set_views(&self, collection: &str, views: &[ViewDef]) -> Result<(), StorageError>;

    /// Fetch one document. `Ok(None)` when absent or deleted.
    fn get_document(&self, collection: &str, id: &str)
        -> Result<Option<Document>, StorageError>;

    /// Batched fetch; absent ids are simply missing from the result.
    fn get_documents(
        &self,
        collection: &str,
        ids: &[String],
    ) -> Result<Vec<Document>, StorageError>;

    /// Insert, update or delete one document, honoring its revision.
    fn put_document(&self, collection: &str, doc: &Document) -> Result<Written, StorageError>;

    /// All-or-nothing bulk write: either every document applies or none
    /// does (a single stale revision fails the whole batch).
    fn bulk_write(
        &self,
        collection: &str,
        docs: &[Document],
        all_or_nothing: bool,
    ) -> Result<Vec<Written>, StorageError>;

    /// Query a view (or `_all_docs`) of a collection.
    fn query_view(
        &self,
        collection: &str,
        view: &str,
        query: &ViewQuery,
    ) -> Result<Vec<ViewRow>, StorageError>;

    /// A page of the collection's change feed: each document appears at
    /// most once, at its latest change past `since`.
    fn changes(
        &self,
        collection: &str,
        since: Seq,
        limit: usize,
        include_docs: bool,
    ) -> Result<ChangeBatch, StorageError>;

    /// Proxy hop: execute a raw request against a collection and return
    /// the raw response.
    fn raw_request(
        &self,
        collection: &str,
        request: &RawRequest,
    ) -> Result<RawResponse, StorageError>;
}
