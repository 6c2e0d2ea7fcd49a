mod evaluator;
mod incarnator;
mod manager;
mod persister;
mod queue;
mod session;
mod storage;
mod sync;

pub use evaluator::{Emit, EvalError, Evaluator, MapFn, ReduceFn, ScriptEvaluator};
pub use incarnator::{
    GroupLevel, Incarnator, IncarnatorConfig, IncarnatorError, IncarnatorState, IncarnatorStatus,
    ReduceConfig,
};
pub use manager::{ActiveAsyncOp, Manager, ManagerError, MoveStage, OpKind};
pub use persister::{
    ControlPersister, ControlPersisterProvider, FsPersister, FsPersisterProvider, Persister,
    PersisterError, PersisterProvider,
};
pub use queue::Fifo;
pub use session::{IncarnatorSession, SessionError};
pub use storage::{
    Change, ChangeBatch, Document, MemoryBackend, RawRequest, RawResponse, Seq, StorageBackend,
    StorageError, ViewDef, ViewMap, ViewQuery, ViewRow, Written,
};
pub use sync::{AdmitError, IncKey, SyncError, DEFAULT_PAGE_LIMIT};
