//! Two-hop incremental sync: source → intermediate, intermediate → derived.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard};

use log::{info, trace, warn};
use serde_json::{json, Value};

use super::changeset::change_set;
use crate::evaluator::{EvalError, Evaluator, MapFn};
use crate::incarnator::GroupLevel;
use crate::storage::{Change, Seq, StorageBackend, StorageError, ViewQuery};

/// Change-feed page size. Paging loops until a page comes back short.
pub const DEFAULT_PAGE_LIMIT: usize = 1000;

/// Identifies one incarnation within its incarnator:
/// (reduction name, group level in display form).
pub type IncKey = (String, String);

/// Tagged sync failure: which hop gave up.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncError {
    MapSync,
    IncSync,
}

impl fmt::Display for SyncError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SyncError::MapSync => write!(f, "failed to sync intermediate collection from source"),
            SyncError::IncSync => write!(f, "failed to sync derived collections"),
        }
    }
}

impl std::error::Error for SyncError {}

/// The admission window for a late-arriving request has already closed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AdmitError {
    WindowClosed,
}

impl fmt::Display for AdmitError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "sync has passed its admission window")
    }
}

impl std::error::Error for AdmitError {}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SyncPhase {
    Idle,
    Map,
    Incarnations,
}

/// Which incarnations the running sync will bring current. Shared with
/// the owning incarnator so a request racing the sync can still latch on
/// while the map hop is in flight.
pub(crate) struct Admission {
    phase: SyncPhase,
    pending: BTreeSet<IncKey>,
}

impl Admission {
    pub(crate) fn new() -> Self {
        Admission {
            phase: SyncPhase::Idle,
            pending: BTreeSet::new(),
        }
    }

    /// Admit one more incarnation into the running sync. Only open while
    /// the map hop runs; afterwards the derived set is already fixed.
    pub(crate) fn admit(&mut self, key: IncKey) -> Result<(), AdmitError> {
        if self.phase == SyncPhase::Map {
            self.pending.insert(key);
            Ok(())
        } else {
            Err(AdmitError::WindowClosed)
        }
    }
}

/// One derived collection under sync.
pub(crate) struct SyncTarget {
    pub collection: String,
    pub group_level: GroupLevel,
    pub seq: Seq,
}

enum StepError {
    Storage(StorageError),
    Eval(EvalError),
}

impl From<StorageError> for StepError {
    fn from(err: StorageError) -> Self {
        StepError::Storage(err)
    }
}

impl From<EvalError> for StepError {
    fn from(err: EvalError) -> Self {
        StepError::Eval(err)
    }
}

impl fmt::Display for StepError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StepError::Storage(err) => err.fmt(f),
            StepError::Eval(err) => err.fmt(f),
        }
    }
}

pub(crate) struct Syncer {
    id: String,
    storage: Arc<dyn StorageBackend>,
    source: String,
    map_collection: String,
    map_fn: Box<dyn MapFn>,
    source_to_map_seq: Seq,
    incs: BTreeMap<IncKey, SyncTarget>,
    admission: Arc<Mutex<Admission>>,
    page_limit: usize,
}

impl Syncer {
    /// Compiles the map source up front: a definition that does not parse
    /// is rejected here, at setup time, never at sync time.
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        id: impl Into<String>,
        storage: Arc<dyn StorageBackend>,
        evaluator: &dyn Evaluator,
        source: impl Into<String>,
        map_collection: impl Into<String>,
        map_source: &str,
        source_to_map_seq: Seq,
        incs: BTreeMap<IncKey, SyncTarget>,
        admission: Arc<Mutex<Admission>>,
    ) -> Result<Self, EvalError> {
        let map_fn = evaluator.compile_map(map_source)?;
        Ok(Syncer {
            id: id.into(),
            storage,
            source: source.into(),
            map_collection: map_collection.into(),
            map_fn,
            source_to_map_seq,
            incs,
            admission,
            page_limit: DEFAULT_PAGE_LIMIT,
        })
    }

    #[cfg(test)]
    pub(crate) fn set_page_limit(&mut self, limit: usize) {
        self.page_limit = limit;
    }

    pub(crate) fn source_to_map_seq(&self) -> Seq {
        self.source_to_map_seq
    }

    pub(crate) fn inc_seqs(&self) -> BTreeMap<IncKey, Seq> {
        self.incs
            .iter()
            .map(|(key, target)| (key.clone(), target.seq))
            .collect()
    }

    fn admission(&self) -> MutexGuard<'_, Admission> {
        // The admission set is plain data; recover it if a holder panicked.
        match self.admission.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Bring the intermediate collection fully current, then every
    /// requested (plus latched) derived collection.
    pub(crate) fn sync(&mut self, keys: &[IncKey]) -> Result<(), SyncError> {
        info!("syncing {}: incarnations {:?}", self.id, keys);
        {
            let mut admission = self.admission();
            admission.phase = SyncPhase::Map;
            admission.pending = keys.iter().cloned().collect();
        }

        if let Err(err) = self.sync_map_from_source() {
            warn!(
                "syncer {}: failed to sync intermediate collection: {}",
                self.id, err
            );
            self.stop();
            return Err(SyncError::MapSync);
        }

        let pending: Vec<IncKey> = {
            let mut admission = self.admission();
            admission.phase = SyncPhase::Incarnations;
            admission.pending.iter().cloned().collect()
        };

        for key in &pending {
            if let Err(err) = self.sync_incarnation(key) {
                warn!(
                    "syncer {}: failed to sync incarnation {}/{}: {}",
                    self.id, key.0, key.1, err
                );
                self.stop();
                return Err(SyncError::IncSync);
            }
        }
        self.stop();
        Ok(())
    }

    fn stop(&self) {
        let mut admission = self.admission();
        admission.phase = SyncPhase::Idle;
        admission.pending.clear();
    }

    // ------------------------------------------------------------------
    // Hop 1: source → intermediate
    // ------------------------------------------------------------------

    fn sync_map_from_source(&mut self) -> Result<(), StepError> {
        loop {
            trace!("syncer {}: fetching source changes", self.id);
            let batch = self.storage.changes(
                &self.source,
                self.source_to_map_seq,
                self.page_limit,
                true,
            )?;
            if batch.results.is_empty() {
                return Ok(());
            }
            let page_len = batch.results.len();

            // New emissions for every live changed document.
            trace!("syncer {}: evaluating map over {} changes", self.id, page_len);
            let mut touched: BTreeSet<String> = BTreeSet::new();
            let mut new_slots: BTreeMap<String, Value> = BTreeMap::new();
            for change in &batch.results {
                if change.id.starts_with('_') {
                    continue;
                }
                touched.insert(change.id.clone());
                if change.deleted {
                    continue;
                }
                let doc = change.doc.clone().unwrap_or(Value::Null);
                for emit in self.map_fn.map(&doc)? {
                    let slot_id = slot_id(&emit.key, &change.id);
                    new_slots.insert(
                        slot_id,
                        json!({
                            "key": emit.key,
                            "origin": change.id,
                            "value": emit.value,
                        }),
                    );
                }
            }

            // Prior emissions for exactly the touched origins, via the
            // permanent origin index.
            trace!("syncer {}: fetching previous emissions", self.id);
            let origin_keys: Vec<Value> = touched
                .iter()
                .map(|origin| Value::String(origin.clone()))
                .collect();
            let rows = self.storage.query_view(
                &self.map_collection,
                "meta_by_origin",
                &ViewQuery::by_keys(origin_keys),
            )?;
            let mut old_slots: BTreeMap<String, String> = BTreeMap::new();
            for row in rows {
                let (Some(id), Some(rev)) = (row.id, row.value.get("_rev")) else {
                    continue;
                };
                if let Some(rev) = rev.as_str() {
                    old_slots.insert(id, rev.to_string());
                }
            }

            // Slot ids embed the origin, so one diff covers all origins.
            trace!("syncer {}: submitting intermediate change-set", self.id);
            let docs = change_set(&old_slots, &new_slots);
            if !docs.is_empty() {
                self.storage.bulk_write(&self.map_collection, &docs, true)?;
            }

            self.source_to_map_seq = batch
                .results
                .last()
                .map(|change| change.seq)
                .unwrap_or(self.source_to_map_seq);
            if page_len < self.page_limit {
                return Ok(());
            }
        }
    }

    // ------------------------------------------------------------------
    // Hop 2: intermediate → derived, one requested pair at a time
    // ------------------------------------------------------------------

    fn sync_incarnation(&mut self, key: &IncKey) -> Result<(), StepError> {
        // A latched pair may be absent from the topology; its request
        // will be failed at forward time, nothing to sync here.
        let Some(target) = self.incs.get(key) else {
            return Ok(());
        };
        let collection = target.collection.clone();
        let group_level = target.group_level;
        let mut seq = target.seq;

        loop {
            trace!(
                "syncer {}: incarnation {}/{}: fetching intermediate changes",
                self.id, key.0, key.1
            );
            let batch =
                self.storage
                    .changes(&self.map_collection, seq, self.page_limit, false)?;
            if batch.results.is_empty() {
                break;
            }
            let page_len = batch.results.len();

            let inc_keys = derive_group_keys(&batch.results, group_level);
            if !inc_keys.is_empty() {
                let doc_ids: Vec<String> = inc_keys.iter().map(|k| k.to_string()).collect();

                trace!(
                    "syncer {}: incarnation {}/{}: fetching reduced values",
                    self.id, key.0, key.1
                );
                let new_vals = self.new_inc_values(&key.0, group_level, &inc_keys)?;

                trace!(
                    "syncer {}: incarnation {}/{}: fetching previous derived docs",
                    self.id, key.0, key.1
                );
                let old_vals = self.past_inc_values(&collection, &doc_ids)?;

                trace!(
                    "syncer {}: incarnation {}/{}: submitting change-set",
                    self.id, key.0, key.1
                );
                let docs = change_set(&old_vals, &new_vals);
                if !docs.is_empty() {
                    self.storage.bulk_write(&collection, &docs, true)?;
                }
            }

            seq = batch.last_seq;
            if page_len < self.page_limit {
                break;
            }
        }

        if let Some(target) = self.incs.get_mut(key) {
            target.seq = seq;
        }
        Ok(())
    }

    /// Current reduced value per implicated group key, from the reduction
    /// view over the intermediate collection.
    fn new_inc_values(
        &self,
        reduce_name: &str,
        group_level: GroupLevel,
        inc_keys: &[Value],
    ) -> Result<BTreeMap<String, Value>, StepError> {
        let mut values = BTreeMap::new();
        match group_level {
            GroupLevel::All => {
                let rows = self.storage.query_view(
                    &self.map_collection,
                    reduce_name,
                    &ViewQuery::default().grouped(Some(0)),
                )?;
                if let Some(row) = rows.into_iter().next() {
                    values.insert(
                        Value::Null.to_string(),
                        json!({ "key": Value::Null, "value": row.value }),
                    );
                }
            }
            GroupLevel::Depth(depth) => {
                for inc_key in inc_keys {
                    let full_depth = matches!(
                        inc_key,
                        Value::Array(items) if items.len() >= depth as usize
                    );
                    let query = if full_depth {
                        // Bracket `[key .. key + [{}]]` sweeps every longer
                        // extension of the truncated key into its group.
                        let mut end = inc_key.as_array().cloned().unwrap_or_default();
                        end.push(json!({}));
                        ViewQuery {
                            start_key: Some(inc_key.clone()),
                            end_key: Some(Value::Array(end)),
                            ..Default::default()
                        }
                        .grouped(Some(depth))
                    } else {
                        ViewQuery::by_key(inc_key.clone()).grouped(Some(depth))
                    };
                    let rows =
                        self.storage
                            .query_view(&self.map_collection, reduce_name, &query)?;
                    if let Some(row) = rows.into_iter().next() {
                        values.insert(
                            inc_key.to_string(),
                            json!({ "key": inc_key, "value": row.value }),
                        );
                    }
                }
            }
        }
        Ok(values)
    }

    /// Existing derived documents for the implicated keys: only their
    /// revisions matter, the diff rewrites contents wholesale.
    fn past_inc_values(
        &self,
        collection: &str,
        doc_ids: &[String],
    ) -> Result<BTreeMap<String, String>, StepError> {
        let keys: Vec<Value> = doc_ids
            .iter()
            .map(|id| Value::String(id.clone()))
            .collect();
        let rows = self
            .storage
            .query_view(collection, "_all_docs", &ViewQuery::by_keys(keys))?;
        let mut values = BTreeMap::new();
        for row in rows {
            let (Some(id), Some(rev)) = (row.id, row.value.get("rev")) else {
                continue;
            };
            if let Some(rev) = rev.as_str() {
                values.insert(id, rev.to_string());
            }
        }
        Ok(values)
    }
}

/// Emitted slots are keyed by (emitted key, origin document id), so
/// multiple emissions per document occupy distinct slots.
fn slot_id(key: &Value, origin: &str) -> String {
    json!([key, origin]).to_string()
}

/// Group keys implicated by a page of intermediate changes. `All`
/// collapses everything into the singleton `null` group; `Depth(n)`
/// truncates array-shaped emitted keys and passes other shapes through.
pub(crate) fn derive_group_keys(changes: &[Change], group_level: GroupLevel) -> Vec<Value> {
    match group_level {
        GroupLevel::All => {
            if changes.iter().any(|c| !c.id.starts_with('_')) {
                vec![Value::Null]
            } else {
                Vec::new()
            }
        }
        GroupLevel::Depth(depth) => {
            let mut seen = BTreeSet::new();
            let mut keys = Vec::new();
            for change in changes {
                if change.id.starts_with('_') {
                    continue;
                }
                let slot: Value = match serde_json::from_str(&change.id) {
                    Ok(value) => value,
                    Err(_) => continue,
                };
                let map_key = slot.get(0).cloned().unwrap_or(Value::Null);
                let inc_key = match &map_key {
                    Value::Array(items) => {
                        Value::Array(items.iter().take(depth as usize).cloned().collect())
                    }
                    other => other.clone(),
                };
                if seen.insert(inc_key.to_string()) {
                    keys.push(inc_key);
                }
            }
            keys
        }
    }
}
