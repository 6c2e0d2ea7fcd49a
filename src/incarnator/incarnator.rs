//! Incarnator lifecycle: uninitialized → initializing → initialized →
//! deleting → removed.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard};

use log::{info, trace};
use uuid::Uuid;

use super::config::{GroupLevel, IncarnatorConfig};
use super::state::{IncarnatorState, IncarnatorStatus};
use crate::evaluator::Evaluator;
use crate::persister::{Persister, PersisterError};
use crate::storage::{
    RawRequest, RawResponse, Seq, StorageBackend, StorageError, ViewDef, ViewMap,
};
use crate::sync::{Admission, AdmitError, IncKey, SyncError, SyncTarget, Syncer};

#[derive(Debug)]
pub enum IncarnatorError {
    /// Operation requires an initialized incarnator.
    Uninitialized,
    /// Config failed validation; nothing was changed.
    BadConf(String),
    /// A captured snapshot could not be reconstructed.
    BadState(String),
    /// No persisted state exists for this id.
    NoSuchIncarnator,
    /// No such (reduction, group level) pair in the current config.
    NoSuchIncarnation,
    /// Persisted state exists but could not be read back.
    Load,
    Sync(SyncError),
    /// Generic storage failure.
    Failure(String),
}

impl fmt::Display for IncarnatorError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            IncarnatorError::Uninitialized => write!(f, "incarnator is not initialized"),
            IncarnatorError::BadConf(detail) => write!(f, "bad configuration: {}", detail),
            IncarnatorError::BadState(detail) => write!(f, "bad state snapshot: {}", detail),
            IncarnatorError::NoSuchIncarnator => write!(f, "no such incarnator"),
            IncarnatorError::NoSuchIncarnation => write!(f, "no such incarnation"),
            IncarnatorError::Load => write!(f, "failed to load persisted state"),
            IncarnatorError::Sync(err) => err.fmt(f),
            IncarnatorError::Failure(detail) => write!(f, "storage failure: {}", detail),
        }
    }
}

impl std::error::Error for IncarnatorError {}

impl From<StorageError> for IncarnatorError {
    fn from(err: StorageError) -> Self {
        IncarnatorError::Failure(err.to_string())
    }
}

fn map_collection_name(internal_id: &str) -> String {
    format!("incarnate_{}__map", internal_id)
}

fn incarnation_collection_name(internal_id: &str, reduce: &str, group_level: GroupLevel) -> String {
    format!("incarnate_{}___{}_{}", internal_id, reduce, group_level)
}

struct Inner {
    conf: IncarnatorConfig,
    status: IncarnatorStatus,
    internal_id: String,
    map_collection: String,
    /// (reduction, group level) → concrete derived-collection name for
    /// the current generation.
    incarnations: BTreeMap<IncKey, String>,
    syncer: Syncer,
}

pub struct Incarnator {
    id: String,
    storage: Arc<dyn StorageBackend>,
    evaluator: Arc<dyn Evaluator>,
    persister: Arc<dyn Persister>,
    admission: Arc<Mutex<Admission>>,
    inner: Mutex<Option<Inner>>,
}

impl Incarnator {
    pub fn new(
        id: impl Into<String>,
        storage: Arc<dyn StorageBackend>,
        evaluator: Arc<dyn Evaluator>,
        persister: Arc<dyn Persister>,
    ) -> Self {
        Incarnator {
            id: id.into(),
            storage,
            evaluator,
            persister,
            admission: Arc::new(Mutex::new(Admission::new())),
            inner: Mutex::new(None),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    fn lock_inner(&self) -> MutexGuard<'_, Option<Inner>> {
        match self.inner.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Validate, mint a fresh generation token, create the physical
    /// collections and persist twice (initializing, then initialized).
    /// Validation failure changes nothing.
    pub fn init_from_conf(&self, conf: IncarnatorConfig) -> Result<(), IncarnatorError> {
        conf.validate(self.evaluator.as_ref())
            .map_err(IncarnatorError::BadConf)?;

        let internal_id = Uuid::new_v4().simple().to_string();
        info!(
            "initializing incarnator {} (generation {})",
            self.id, internal_id
        );
        let state = IncarnatorState {
            conf,
            status: IncarnatorStatus::Initializing,
            internal_id,
            source_to_map_seq: Seq::zero(),
            map_to_inc_seqs: BTreeMap::new(),
        };
        let inner = self
            .build_inner(state)
            .map_err(IncarnatorError::BadConf)?;

        let mut guard = self.lock_inner();
        let inner = guard.insert(inner);
        self.persist(inner)?;
        Self::init_dbs(&self.storage, inner)?;
        inner.status = IncarnatorStatus::Initialized;
        self.persist(inner)?;
        Ok(())
    }

    /// Reconstruct purely from a captured snapshot, touching no storage.
    /// Used by move: the snapshot's generation token makes this
    /// incarnator point at the physical collections it was captured with.
    pub fn init_from_state(&self, state: IncarnatorState) -> Result<(), IncarnatorError> {
        let inner = self
            .build_inner(state)
            .map_err(IncarnatorError::BadState)?;
        *self.lock_inner() = Some(inner);
        Ok(())
    }

    /// Cold-start read of the persisted snapshot.
    pub fn load_previous_state(&self) -> Result<(), IncarnatorError> {
        let value = match self.persister.load() {
            Ok(value) => value,
            Err(PersisterError::NotFound) => return Err(IncarnatorError::NoSuchIncarnator),
            Err(_) => return Err(IncarnatorError::Load),
        };
        let state = IncarnatorState::from_value(&value).map_err(|_| IncarnatorError::Load)?;
        let inner = self.build_inner(state).map_err(|_| IncarnatorError::Load)?;
        *self.lock_inner() = Some(inner);
        trace!("loaded previous state of incarnator {}", self.id);
        Ok(())
    }

    /// Tear down. With `keep_dbs` only the persisted state record goes -
    /// the physical collections stay behind for whoever owns them now.
    pub fn destroy(&self, keep_dbs: bool) -> Result<(), IncarnatorError> {
        let mut guard = self.lock_inner();
        let inner = guard.as_mut().ok_or(IncarnatorError::Uninitialized)?;
        info!("deleting incarnator {} (keep_dbs: {})", self.id, keep_dbs);

        if !keep_dbs {
            inner.status = IncarnatorStatus::Deleting;
            self.persist(inner)?;
            Self::del_dbs(&self.storage, inner)?;
        }

        self.persister
            .remove()
            .map_err(|err| IncarnatorError::Failure(err.to_string()))?;
        *guard = None;
        Ok(())
    }

    /// Delegate to the sync engine; persist the advanced cursors only
    /// when the whole sync succeeded.
    pub fn sync(&self, pairs: &[IncKey]) -> Result<(), IncarnatorError> {
        let mut guard = self.lock_inner();
        let inner = guard.as_mut().ok_or(IncarnatorError::Uninitialized)?;
        if inner.status != IncarnatorStatus::Initialized {
            return Err(IncarnatorError::Uninitialized);
        }
        inner.syncer.sync(pairs).map_err(IncarnatorError::Sync)?;
        self.persist(inner)?;
        Ok(())
    }

    /// Latch one more incarnation onto the sync currently in flight.
    /// Only possible while that sync is still in its admission window.
    pub fn add_to_running_sync(
        &self,
        reduce: &str,
        group_level: &str,
    ) -> Result<(), AdmitError> {
        let mut admission = match self.admission.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        admission.admit((reduce.to_string(), group_level.to_string()))
    }

    /// Present in the config at the last successful setup?
    pub fn incarnation_exists(&self, reduce: &str, group_level: &str) -> bool {
        let guard = self.lock_inner();
        match guard.as_ref() {
            Some(inner) => inner
                .incarnations
                .contains_key(&(reduce.to_string(), group_level.to_string())),
            None => false,
        }
    }

    /// Rewrite the target to the concrete derived-collection name for the
    /// current generation, proxy verbatim, return the raw response
    /// unmodified. Callers must have synced this pair first.
    pub fn forward(
        &self,
        request: &RawRequest,
        reduce: &str,
        group_level: &str,
    ) -> Result<RawResponse, IncarnatorError> {
        let collection = {
            let guard = self.lock_inner();
            let inner = guard.as_ref().ok_or(IncarnatorError::Uninitialized)?;
            if inner.status != IncarnatorStatus::Initialized {
                return Err(IncarnatorError::Uninitialized);
            }
            inner
                .incarnations
                .get(&(reduce.to_string(), group_level.to_string()))
                .ok_or(IncarnatorError::NoSuchIncarnation)?
                .clone()
        };
        Ok(self.storage.raw_request(&collection, request)?)
    }

    /// Current snapshot, `None` while uninitialized.
    pub fn get_state(&self) -> Option<IncarnatorState> {
        let guard = self.lock_inner();
        guard.as_ref().map(Self::state_of)
    }

    /// Persist the current snapshot as-is. Used by move when adopting a
    /// captured state without recreating storage.
    pub(crate) fn save_current_state(&self) -> Result<(), IncarnatorError> {
        let guard = self.lock_inner();
        let inner = guard.as_ref().ok_or(IncarnatorError::Uninitialized)?;
        self.persist(inner)
    }

    // ------------------------------------------------------------------

    fn build_inner(&self, state: IncarnatorState) -> Result<Inner, String> {
        let map_collection = map_collection_name(&state.internal_id);
        let mut incarnations = BTreeMap::new();
        let mut targets = BTreeMap::new();
        for (reduce, group_level) in state.conf.incarnations() {
            let key: IncKey = (reduce.to_string(), group_level.to_string());
            let collection =
                incarnation_collection_name(&state.internal_id, reduce, group_level);
            let seq = state
                .map_to_inc_seqs
                .get(reduce)
                .and_then(|by_level| by_level.get(&group_level.to_string()))
                .copied()
                .unwrap_or(Seq::zero());
            incarnations.insert(key.clone(), collection.clone());
            targets.insert(
                key,
                SyncTarget {
                    collection,
                    group_level,
                    seq,
                },
            );
        }
        let syncer = Syncer::new(
            self.id.clone(),
            self.storage.clone(),
            self.evaluator.as_ref(),
            state.conf.source.clone(),
            map_collection.clone(),
            &state.conf.map,
            state.source_to_map_seq,
            targets,
            self.admission.clone(),
        )
        .map_err(|err| err.to_string())?;
        Ok(Inner {
            conf: state.conf,
            status: state.status,
            internal_id: state.internal_id,
            map_collection,
            incarnations,
            syncer,
        })
    }

    fn state_of(inner: &Inner) -> IncarnatorState {
        let mut map_to_inc_seqs: BTreeMap<String, BTreeMap<String, Seq>> = BTreeMap::new();
        for ((reduce, group_level), seq) in inner.syncer.inc_seqs() {
            map_to_inc_seqs
                .entry(reduce)
                .or_default()
                .insert(group_level, seq);
        }
        IncarnatorState {
            conf: inner.conf.clone(),
            status: inner.status,
            internal_id: inner.internal_id.clone(),
            source_to_map_seq: inner.syncer.source_to_map_seq(),
            map_to_inc_seqs,
        }
    }

    fn persist(&self, inner: &Inner) -> Result<(), IncarnatorError> {
        self.persister
            .save(&Self::state_of(inner).to_value())
            .map_err(|err| IncarnatorError::Failure(err.to_string()))
    }

    fn init_dbs(storage: &Arc<dyn StorageBackend>, inner: &Inner) -> Result<(), IncarnatorError> {
        trace!("creating intermediate collection {}", inner.map_collection);
        wipe_collection(storage, &inner.map_collection)?;
        storage.create_collection(&inner.map_collection)?;

        let mut views = vec![ViewDef {
            name: "meta_by_origin".to_string(),
            map: ViewMap::ByOrigin,
            reduce: None,
        }];
        for (reduce_name, reduce) in &inner.conf.reduces {
            views.push(ViewDef {
                name: reduce_name.clone(),
                map: ViewMap::ByKey,
                reduce: Some(reduce.function.clone()),
            });
        }
        storage.set_views(&inner.map_collection, &views)?;

        for collection in inner.incarnations.values() {
            trace!("creating derived collection {}", collection);
            wipe_collection(storage, collection)?;
            storage.create_collection(collection)?;
        }
        Ok(())
    }

    fn del_dbs(storage: &Arc<dyn StorageBackend>, inner: &Inner) -> Result<(), IncarnatorError> {
        trace!("deleting intermediate collection {}", inner.map_collection);
        wipe_collection(storage, &inner.map_collection)?;
        for collection in inner.incarnations.values() {
            trace!("deleting derived collection {}", collection);
            wipe_collection(storage, collection)?;
        }
        Ok(())
    }
}

/// Delete a collection, tolerating its absence.
fn wipe_collection(
    storage: &Arc<dyn StorageBackend>,
    name: &str,
) -> Result<(), IncarnatorError> {
    match storage.delete_collection(name) {
        Ok(()) => Ok(()),
        Err(err) if err.is_not_found() => Ok(()),
        Err(err) => Err(err.into()),
    }
}
