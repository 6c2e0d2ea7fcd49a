//! The serializer/batcher around one incarnator.

use std::collections::BTreeSet;
use std::fmt;
use std::sync::mpsc::{channel, Sender};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread;

use log::{trace, warn};

use crate::evaluator::Evaluator;
use crate::incarnator::{Incarnator, IncarnatorConfig, IncarnatorError, IncarnatorState};
use crate::persister::Persister;
use crate::queue::Fifo;
use crate::storage::{RawRequest, RawResponse, StorageBackend};
use crate::sync::IncKey;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionError {
    NoSuchIncarnator,
    NoSuchIncarnation,
    BadConf(String),
    /// The batch's shared sync failed; the cause is meaningless to the
    /// callers riding it.
    Sync,
    Server(String),
}

impl fmt::Display for SessionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SessionError::NoSuchIncarnator => write!(f, "no such incarnator"),
            SessionError::NoSuchIncarnation => write!(f, "no such incarnation"),
            SessionError::BadConf(detail) => write!(f, "bad configuration: {}", detail),
            SessionError::Sync => write!(f, "sync failed"),
            SessionError::Server(detail) => write!(f, "server error: {}", detail),
        }
    }
}

impl std::error::Error for SessionError {}

fn coarsen(err: IncarnatorError) -> SessionError {
    match err {
        IncarnatorError::NoSuchIncarnator => SessionError::NoSuchIncarnator,
        IncarnatorError::NoSuchIncarnation => SessionError::NoSuchIncarnation,
        IncarnatorError::BadConf(detail) => SessionError::BadConf(detail),
        IncarnatorError::Sync(_) => SessionError::Sync,
        other => SessionError::Server(other.to_string()),
    }
}

/// A queued forward request.
pub(crate) struct DbRequest {
    pub reduce: String,
    pub group_level: String,
    pub request: RawRequest,
    pub reply: Sender<Result<RawResponse, SessionError>>,
}

/// One pending unit of work.
pub(crate) enum SessionOp {
    Setup {
        conf: IncarnatorConfig,
        reply: Sender<Result<(), SessionError>>,
    },
    Destroy {
        reply: Sender<Result<(), SessionError>>,
    },
    GetState {
        reply: Sender<Result<IncarnatorState, SessionError>>,
    },
    DbRequest(DbRequest),
    // Move sub-operations: serialized through the same queue so the
    // manager never touches an incarnator around its owning session.
    CaptureState {
        reply: Sender<Result<IncarnatorState, SessionError>>,
    },
    Wipe {
        reply: Sender<Result<(), SessionError>>,
    },
    AdoptState {
        state: IncarnatorState,
        reply: Sender<Result<(), SessionError>>,
    },
    DestroyKeepDbs {
        reply: Sender<Result<(), SessionError>>,
    },
}

struct SessionState {
    /// Cold-start load already attempted successfully?
    loaded: bool,
    incarnator: Option<Arc<Incarnator>>,
    queue: Fifo<SessionOp>,
    busy: bool,
    /// The batch currently assembling: taken from the queue on drain,
    /// grown by requests latching onto the running sync.
    batch: Vec<DbRequest>,
    /// Calls admitted by the manager but not yet completed.
    outstanding: usize,
}

/// Serializes mutating operations on one incarnator while letting read
/// traffic batch onto one in-flight sync. Cheap to construct: the cold
/// start load happens lazily on first use.
pub struct IncarnatorSession {
    id: String,
    storage: Arc<dyn StorageBackend>,
    evaluator: Arc<dyn Evaluator>,
    persister: Arc<dyn Persister>,
    state: Mutex<SessionState>,
}

impl IncarnatorSession {
    pub fn new(
        id: impl Into<String>,
        storage: Arc<dyn StorageBackend>,
        evaluator: Arc<dyn Evaluator>,
        persister: Arc<dyn Persister>,
    ) -> Self {
        IncarnatorSession {
            id: id.into(),
            storage,
            evaluator,
            persister,
            state: Mutex::new(SessionState {
                loaded: false,
                incarnator: None,
                queue: Fifo::new(),
                busy: false,
                batch: Vec::new(),
                outstanding: 0,
            }),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    // ------------------------------------------------------------------
    // Blocking front door
    // ------------------------------------------------------------------

    pub fn setup(&self, conf: IncarnatorConfig) -> Result<(), SessionError> {
        let (reply, rx) = channel();
        self.enqueue(SessionOp::Setup { conf, reply });
        self.drive();
        recv(rx)
    }

    pub fn destroy(&self) -> Result<(), SessionError> {
        let (reply, rx) = channel();
        self.enqueue(SessionOp::Destroy { reply });
        self.drive();
        recv(rx)
    }

    pub fn get_state(&self) -> Result<IncarnatorState, SessionError> {
        let (reply, rx) = channel();
        self.enqueue(SessionOp::GetState { reply });
        self.drive();
        recv(rx)
    }

    pub fn forward(
        &self,
        reduce: &str,
        group_level: &str,
        request: RawRequest,
    ) -> Result<RawResponse, SessionError> {
        let (reply, rx) = channel();
        self.enqueue(SessionOp::DbRequest(DbRequest {
            reduce: reduce.to_string(),
            group_level: group_level.to_string(),
            request,
            reply,
        }));
        self.drive();
        recv(rx)
    }

    pub(crate) fn capture_state(&self) -> Result<IncarnatorState, SessionError> {
        let (reply, rx) = channel();
        self.enqueue(SessionOp::CaptureState { reply });
        self.drive();
        recv(rx)
    }

    pub(crate) fn wipe(&self) -> Result<(), SessionError> {
        let (reply, rx) = channel();
        self.enqueue(SessionOp::Wipe { reply });
        self.drive();
        recv(rx)
    }

    pub(crate) fn adopt_state(&self, state: IncarnatorState) -> Result<(), SessionError> {
        let (reply, rx) = channel();
        self.enqueue(SessionOp::AdoptState { state, reply });
        self.drive();
        recv(rx)
    }

    pub(crate) fn destroy_keep_dbs(&self) -> Result<(), SessionError> {
        let (reply, rx) = channel();
        self.enqueue(SessionOp::DestroyKeepDbs { reply });
        self.drive();
        recv(rx)
    }

    // ------------------------------------------------------------------
    // Queue and drain
    // ------------------------------------------------------------------

    fn lock_state(&self) -> MutexGuard<'_, SessionState> {
        match self.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Liveness bookkeeping for the manager's registry.
    pub(crate) fn incarnator_exists(&self) -> bool {
        self.lock_state().incarnator.is_some()
    }

    pub(crate) fn in_use(&self) -> bool {
        let state = self.lock_state();
        state.busy || !state.queue.is_empty() || !state.batch.is_empty() || state.outstanding > 0
    }

    pub(crate) fn retain(&self) {
        self.lock_state().outstanding += 1;
    }

    pub(crate) fn release(&self) {
        let mut state = self.lock_state();
        state.outstanding = state.outstanding.saturating_sub(1);
    }

    /// Queue one unit. A forward request arriving while the queue is
    /// empty and an incarnator exists is speculatively admitted into the
    /// currently assembling batch, bypassing the queue: unless the sync
    /// has already passed its admission window.
    pub(crate) fn enqueue(&self, op: SessionOp) {
        let mut state = self.lock_state();
        match op {
            SessionOp::DbRequest(req) => {
                if state.queue.is_empty() {
                    if let Some(incarnator) = state.incarnator.clone() {
                        match incarnator.add_to_running_sync(&req.reduce, &req.group_level) {
                            Ok(()) => {
                                trace!(
                                    "session {}: request latched onto running sync",
                                    self.id
                                );
                                state.batch.push(req);
                                return;
                            }
                            Err(_) => {
                                trace!(
                                    "session {}: failed to add to running sync, queuing",
                                    self.id
                                );
                            }
                        }
                    }
                }
                state.queue.enqueue(SessionOp::DbRequest(req));
            }
            other => state.queue.enqueue(other),
        }
    }

    /// Drain the queue one unit at a time. Whoever flips the busy flag
    /// becomes the drainer and keeps going until the queue is empty;
    /// everyone else returns immediately and waits on their reply.
    pub(crate) fn drive(&self) {
        {
            let mut state = self.lock_state();
            if state.busy || state.queue.is_empty() {
                return;
            }
            state.busy = true;
        }
        trace!("session {} getting busy", self.id);
        loop {
            let unit = {
                let mut state = self.lock_state();
                match state.queue.dequeue() {
                    Some(op) => op,
                    None => {
                        state.busy = false;
                        trace!("session {} no longer busy", self.id);
                        return;
                    }
                }
            };
            self.process(unit);
        }
    }

    fn process(&self, unit: SessionOp) {
        if let Err(err) = self.ensure_loaded() {
            // Cold-start load faulted: fail this unit, stay unloaded so
            // the next one retries.
            match unit {
                SessionOp::Setup { reply, .. }
                | SessionOp::Destroy { reply }
                | SessionOp::Wipe { reply }
                | SessionOp::AdoptState { reply, .. }
                | SessionOp::DestroyKeepDbs { reply } => {
                    let _ = reply.send(Err(err));
                }
                SessionOp::GetState { reply } | SessionOp::CaptureState { reply } => {
                    let _ = reply.send(Err(err));
                }
                SessionOp::DbRequest(req) => {
                    let _ = req.reply.send(Err(err));
                }
            }
            return;
        }

        match unit {
            SessionOp::DbRequest(first) => {
                // A unit of forwards: the maximal contiguous run at the
                // front of the queue, batched together.
                {
                    let mut state = self.lock_state();
                    state.batch.push(first);
                    while matches!(state.queue.peek(0), Some(SessionOp::DbRequest(_))) {
                        if let Some(SessionOp::DbRequest(req)) = state.queue.dequeue() {
                            state.batch.push(req);
                        }
                    }
                }
                self.process_batch();
            }
            SessionOp::Setup { conf, reply } => {
                let _ = reply.send(self.process_setup(conf));
            }
            SessionOp::Destroy { reply } => {
                let _ = reply.send(self.process_destroy(false));
            }
            SessionOp::GetState { reply } => {
                let _ = reply.send(self.snapshot_state());
            }
            SessionOp::CaptureState { reply } => {
                let _ = reply.send(self.snapshot_state());
            }
            SessionOp::Wipe { reply } => {
                let result = match self.process_destroy(false) {
                    Ok(()) | Err(SessionError::NoSuchIncarnator) => Ok(()),
                    Err(err) => Err(err),
                };
                let _ = reply.send(result);
            }
            SessionOp::AdoptState { state, reply } => {
                let _ = reply.send(self.process_adopt(state));
            }
            SessionOp::DestroyKeepDbs { reply } => {
                let _ = reply.send(self.process_destroy(true));
            }
        }
    }

    fn ensure_loaded(&self) -> Result<(), SessionError> {
        {
            let state = self.lock_state();
            if state.loaded {
                return Ok(());
            }
        }
        let incarnator = Arc::new(self.fresh_incarnator());
        match incarnator.load_previous_state() {
            Ok(()) => {
                let mut state = self.lock_state();
                state.incarnator = Some(incarnator);
                state.loaded = true;
                Ok(())
            }
            Err(IncarnatorError::NoSuchIncarnator) => {
                self.lock_state().loaded = true;
                Ok(())
            }
            Err(err) => Err(coarsen(err)),
        }
    }

    fn fresh_incarnator(&self) -> Incarnator {
        Incarnator::new(
            self.id.clone(),
            self.storage.clone(),
            self.evaluator.clone(),
            self.persister.clone(),
        )
    }

    fn current(&self) -> Option<Arc<Incarnator>> {
        self.lock_state().incarnator.clone()
    }

    fn take_batch(&self) -> Vec<DbRequest> {
        std::mem::take(&mut self.lock_state().batch)
    }

    // ------------------------------------------------------------------
    // Unit processing
    // ------------------------------------------------------------------

    fn process_batch(&self) {
        let Some(incarnator) = self.current() else {
            trace!("session {}: no such incarnator", self.id);
            fail_batch(self.take_batch(), SessionError::NoSuchIncarnator);
            return;
        };

        // Union of pairs actually present in config, from the batch as
        // assembled so far. Requests latching on during the sync are
        // checked only afterwards, at forward time.
        let candidates: Vec<IncKey> = {
            let state = self.lock_state();
            state
                .batch
                .iter()
                .map(|req| (req.reduce.clone(), req.group_level.clone()))
                .collect()
        };
        let pairs: Vec<IncKey> = candidates
            .into_iter()
            .filter(|(reduce, gl)| incarnator.incarnation_exists(reduce, gl))
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect();

        if pairs.is_empty() {
            trace!("session {}: no incarnations to sync", self.id);
            fail_batch(self.take_batch(), SessionError::NoSuchIncarnation);
            return;
        }

        let synced = incarnator.sync(&pairs);
        let batch = self.take_batch();
        match synced {
            Err(err) => {
                warn!("session {}: sync error: {}", self.id, err);
                fail_batch(batch, SessionError::Sync);
            }
            Ok(()) => {
                // Forward everything concurrently; the unit completes
                // only once every forward has returned.
                let incarnator = &incarnator;
                thread::scope(|scope| {
                    for req in batch {
                        scope.spawn(move || {
                            let result = if incarnator
                                .incarnation_exists(&req.reduce, &req.group_level)
                            {
                                incarnator
                                    .forward(&req.request, &req.reduce, &req.group_level)
                                    .map_err(coarsen)
                            } else {
                                Err(SessionError::NoSuchIncarnation)
                            };
                            let _ = req.reply.send(result);
                        });
                    }
                });
            }
        }
    }

    fn process_setup(&self, conf: IncarnatorConfig) -> Result<(), SessionError> {
        // Validation short-circuits before the destructive step: a bad
        // replacement config must not take down the working incarnator.
        conf.validate(self.evaluator.as_ref())
            .map_err(SessionError::BadConf)?;

        if let Some(existing) = self.current() {
            existing.destroy(false).map_err(coarsen)?;
            self.lock_state().incarnator = None;
        }

        let fresh = Arc::new(self.fresh_incarnator());
        fresh.init_from_conf(conf).map_err(coarsen)?;
        self.lock_state().incarnator = Some(fresh);
        Ok(())
    }

    fn process_destroy(&self, keep_dbs: bool) -> Result<(), SessionError> {
        let Some(incarnator) = self.current() else {
            return Err(SessionError::NoSuchIncarnator);
        };
        incarnator.destroy(keep_dbs).map_err(coarsen)?;
        self.lock_state().incarnator = None;
        Ok(())
    }

    fn snapshot_state(&self) -> Result<IncarnatorState, SessionError> {
        let Some(incarnator) = self.current() else {
            return Err(SessionError::NoSuchIncarnator);
        };
        incarnator
            .get_state()
            .ok_or_else(|| SessionError::Server("incarnator has no state".to_string()))
    }

    fn process_adopt(&self, state: IncarnatorState) -> Result<(), SessionError> {
        let incarnator = Arc::new(self.fresh_incarnator());
        incarnator.init_from_state(state).map_err(coarsen)?;
        incarnator.save_current_state().map_err(coarsen)?;
        let mut session_state = self.lock_state();
        session_state.incarnator = Some(incarnator);
        session_state.loaded = true;
        Ok(())
    }
}

fn recv<T>(rx: std::sync::mpsc::Receiver<Result<T, SessionError>>) -> Result<T, SessionError> {
    rx.recv()
        .unwrap_or_else(|_| Err(SessionError::Server("request was dropped".to_string())))
}

fn fail_batch(batch: Vec<DbRequest>, err: SessionError) {
    for req in batch {
        let _ = req.reply.send(Err(err.clone()));
    }
}
