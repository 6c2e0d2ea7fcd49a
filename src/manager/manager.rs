//! Global admission and the move state machine.

use std::collections::HashMap;
use std::fmt;
use std::sync::mpsc::{channel, Receiver, Sender};
use std::sync::{Arc, Mutex, MutexGuard};

use log::{info, trace, warn};

use super::move_op::{ActiveAsyncOp, MoveStage, OpKind};
use crate::evaluator::Evaluator;
use crate::incarnator::{IncarnatorConfig, IncarnatorState};
use crate::persister::{Persister, PersisterError, PersisterProvider};
use crate::queue::Fifo;
use crate::session::{IncarnatorSession, SessionError};
use crate::session::{DbRequest, SessionOp};
use crate::storage::{RawRequest, RawResponse, StorageBackend};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ManagerError {
    NoSuchIncarnator,
    NoSuchIncarnation,
    BadConf(String),
    /// A persisted move was resumed in an unrecognized stage. Fatal to
    /// that move; the descriptor is left in place for the operator.
    IllegalState(String),
    Server(String),
}

impl fmt::Display for ManagerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ManagerError::NoSuchIncarnator => write!(f, "no such incarnator"),
            ManagerError::NoSuchIncarnation => write!(f, "no such incarnation"),
            ManagerError::BadConf(detail) => write!(f, "bad configuration: {}", detail),
            ManagerError::IllegalState(detail) => write!(f, "illegal state: {}", detail),
            ManagerError::Server(detail) => write!(f, "server error: {}", detail),
        }
    }
}

impl std::error::Error for ManagerError {}

fn coarsen(err: SessionError) -> ManagerError {
    match err {
        SessionError::NoSuchIncarnator => ManagerError::NoSuchIncarnator,
        SessionError::NoSuchIncarnation => ManagerError::NoSuchIncarnation,
        SessionError::BadConf(detail) => ManagerError::BadConf(detail),
        // A sync failure means nothing at this boundary.
        other => ManagerError::Server(other.to_string()),
    }
}

enum ManagerEntry {
    /// Admit one request: ensure the session lives, hand the op to its
    /// queue, tell the caller which session to drive.
    Request {
        id: String,
        op: SessionOp,
        admitted: Sender<Arc<IncarnatorSession>>,
    },
    Move {
        source_id: String,
        target_id: String,
        reply: Sender<Result<(), ManagerError>>,
    },
}

struct ManagerState {
    queue: Fifo<ManagerEntry>,
    busy: bool,
    sessions: HashMap<String, Arc<IncarnatorSession>>,
}

/// Multiplexes every incarnator behind one front door. All requests pass
/// the global FIFO for admission; admission is cheap, and the heavy work
/// runs on the calling thread against the per-incarnator session. The
/// registry and the one ActiveAsyncOp slot are only touched under the
/// manager's own lock.
pub struct Manager {
    storage: Arc<dyn StorageBackend>,
    evaluator: Arc<dyn Evaluator>,
    persisters: Arc<dyn PersisterProvider>,
    op_cell: Arc<dyn Persister>,
    state: Mutex<ManagerState>,
}

impl Manager {
    pub fn new(
        storage: Arc<dyn StorageBackend>,
        evaluator: Arc<dyn Evaluator>,
        persisters: Arc<dyn PersisterProvider>,
    ) -> Self {
        let op_cell = persisters.active_op();
        Manager {
            storage,
            evaluator,
            persisters,
            op_cell,
            state: Mutex::new(ManagerState {
                queue: Fifo::new(),
                busy: false,
                sessions: HashMap::new(),
            }),
        }
    }

    /// Resume a crash-interrupted move, if one was persisted. Call once
    /// at startup, before serving requests.
    pub fn recover(&self) -> Result<(), ManagerError> {
        let value = match self.op_cell.load() {
            Ok(value) => value,
            Err(PersisterError::NotFound) => return Ok(()),
            Err(err) => return Err(ManagerError::Server(err.to_string())),
        };
        let op: ActiveAsyncOp = serde_json::from_value(value)
            .map_err(|err| ManagerError::IllegalState(err.to_string()))?;
        info!(
            "resuming move {} -> {} at stage {:?}",
            op.source_id, op.target_id, op.stage
        );
        let (source_id, target_id) = (op.source_id.clone(), op.target_id.clone());
        let result = self.resume_move(op);
        self.evict_if_idle(&source_id);
        self.evict_if_idle(&target_id);
        result
    }

    // ------------------------------------------------------------------
    // Boundary exposed to the front door
    // ------------------------------------------------------------------

    pub fn setup(&self, id: &str, conf: IncarnatorConfig) -> Result<(), ManagerError> {
        let (reply, rx) = channel();
        self.run_on_session(id, SessionOp::Setup { conf, reply }, rx)
    }

    pub fn destroy(&self, id: &str) -> Result<(), ManagerError> {
        let (reply, rx) = channel();
        self.run_on_session(id, SessionOp::Destroy { reply }, rx)
    }

    pub fn get_state(&self, id: &str) -> Result<IncarnatorState, ManagerError> {
        let (reply, rx) = channel();
        self.run_on_session(id, SessionOp::GetState { reply }, rx)
    }

    pub fn forward(
        &self,
        id: &str,
        reduce: &str,
        group_level: &str,
        request: RawRequest,
    ) -> Result<RawResponse, ManagerError> {
        let (reply, rx) = channel();
        let op = SessionOp::DbRequest(DbRequest {
            reduce: reduce.to_string(),
            group_level: group_level.to_string(),
            request,
            reply,
        });
        self.run_on_session(id, op, rx)
    }

    /// Relocate an incarnator under a new id. Serialized behind the
    /// global queue: at most one move runs at a time, a second simply
    /// waits its turn.
    pub fn move_incarnator(&self, source_id: &str, target_id: &str) -> Result<(), ManagerError> {
        let (reply, rx) = channel();
        {
            let mut state = self.lock_state();
            state.queue.enqueue(ManagerEntry::Move {
                source_id: source_id.to_string(),
                target_id: target_id.to_string(),
                reply,
            });
        }
        self.drive();
        rx.recv()
            .unwrap_or_else(|_| Err(ManagerError::Server("request was dropped".to_string())))
    }

    /// Number of live sessions in the registry.
    pub fn session_count(&self) -> usize {
        self.lock_state().sessions.len()
    }

    // ------------------------------------------------------------------
    // Admission
    // ------------------------------------------------------------------

    fn lock_state(&self) -> MutexGuard<'_, ManagerState> {
        match self.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn run_on_session<T>(
        &self,
        id: &str,
        op: SessionOp,
        rx: Receiver<Result<T, SessionError>>,
    ) -> Result<T, ManagerError> {
        let session = self.admit(id, op)?;
        session.drive();
        let result = rx
            .recv()
            .unwrap_or_else(|_| Err(SessionError::Server("request was dropped".to_string())));
        self.finish(id, &session);
        result.map_err(coarsen)
    }

    fn admit(&self, id: &str, op: SessionOp) -> Result<Arc<IncarnatorSession>, ManagerError> {
        let (admitted, rx) = channel();
        {
            let mut state = self.lock_state();
            state.queue.enqueue(ManagerEntry::Request {
                id: id.to_string(),
                op,
                admitted,
            });
        }
        self.drive();
        rx.recv()
            .map_err(|_| ManagerError::Server("admission was dropped".to_string()))
    }

    /// Drain the global queue one entry at a time. Admissions are cheap;
    /// a move runs to completion right here, blocking only entries
    /// queued behind it.
    fn drive(&self) {
        {
            let mut state = self.lock_state();
            if state.busy || state.queue.is_empty() {
                return;
            }
            state.busy = true;
        }
        loop {
            let entry = {
                let mut state = self.lock_state();
                match state.queue.dequeue() {
                    Some(entry) => entry,
                    None => {
                        state.busy = false;
                        return;
                    }
                }
            };
            match entry {
                ManagerEntry::Request { id, op, admitted } => {
                    trace!("admitting request for incarnator {}", id);
                    let session = self.ensure_session(&id);
                    session.retain();
                    session.enqueue(op);
                    let _ = admitted.send(session);
                }
                ManagerEntry::Move {
                    source_id,
                    target_id,
                    reply,
                } => {
                    let _ = reply.send(self.run_move(&source_id, &target_id));
                }
            }
        }
    }

    fn ensure_session(&self, id: &str) -> Arc<IncarnatorSession> {
        let mut state = self.lock_state();
        state
            .sessions
            .entry(id.to_string())
            .or_insert_with(|| {
                Arc::new(IncarnatorSession::new(
                    id,
                    self.storage.clone(),
                    self.evaluator.clone(),
                    self.persisters.incarnator(id),
                ))
            })
            .clone()
    }

    /// Completion bookkeeping: drop the call's claim on the session and
    /// evict it once its incarnator is absent and no call is outstanding.
    fn finish(&self, id: &str, session: &Arc<IncarnatorSession>) {
        session.release();
        self.evict_if_idle(id);
    }

    fn evict_if_idle(&self, id: &str) {
        let mut state = self.lock_state();
        if let Some(session) = state.sessions.get(id) {
            if !session.incarnator_exists() && !session.in_use() {
                trace!("evicting idle session {}", id);
                state.sessions.remove(id);
            }
        }
    }

    // ------------------------------------------------------------------
    // Move
    // ------------------------------------------------------------------

    fn run_move(&self, source_id: &str, target_id: &str) -> Result<(), ManagerError> {
        let result = self.start_move(source_id, target_id);
        self.evict_if_idle(source_id);
        self.evict_if_idle(target_id);
        result
    }

    fn start_move(&self, source_id: &str, target_id: &str) -> Result<(), ManagerError> {
        info!("moving incarnator {} to {}", source_id, target_id);

        // Stage start: capture before anything destructive, then wipe
        // whatever currently answers to the target id.
        let source = self.ensure_session(source_id);
        let captured = source.capture_state().map_err(coarsen)?;
        let target = self.ensure_session(target_id);
        target.wipe().map_err(coarsen)?;

        let op = ActiveAsyncOp {
            kind: OpKind::Move,
            source_id: source_id.to_string(),
            target_id: target_id.to_string(),
            captured,
            stage: MoveStage::PreInitTarget,
        };
        self.save_op(&op)?;
        self.resume_move(op)
    }

    /// Walk the remaining stages, persisting before each transition.
    fn resume_move(&self, mut op: ActiveAsyncOp) -> Result<(), ManagerError> {
        loop {
            match op.stage {
                MoveStage::PreInitTarget => {
                    let target = self.ensure_session(&op.target_id);
                    target
                        .adopt_state(op.captured.clone())
                        .map_err(coarsen)?;
                    op.stage = MoveStage::PreDeleteSource;
                    self.save_op(&op)?;
                }
                MoveStage::PreDeleteSource => {
                    let source = self.ensure_session(&op.source_id);
                    match source.destroy_keep_dbs() {
                        Ok(()) => {}
                        // A resume may find the destroy already done.
                        Err(SessionError::NoSuchIncarnator) => {}
                        Err(err) => return Err(coarsen(err)),
                    }
                    self.clear_op()?;
                    info!(
                        "move {} -> {} complete",
                        op.source_id, op.target_id
                    );
                    return Ok(());
                }
            }
        }
    }

    fn save_op(&self, op: &ActiveAsyncOp) -> Result<(), ManagerError> {
        let value = serde_json::to_value(op)
            .map_err(|err| ManagerError::Server(err.to_string()))?;
        self.op_cell
            .save(&value)
            .map_err(|err| ManagerError::Server(err.to_string()))
    }

    fn clear_op(&self) -> Result<(), ManagerError> {
        match self.op_cell.remove() {
            Ok(()) | Err(PersisterError::NotFound) => Ok(()),
            Err(err) => {
                warn!("failed to clear active async op: {}", err);
                Err(ManagerError::Server(err.to_string()))
            }
        }
    }
}
