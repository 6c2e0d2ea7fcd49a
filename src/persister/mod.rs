//! Durable state cells.
//!
//! Each incarnator owns one persisted JSON state blob; the manager owns
//! one more for the in-flight move descriptor. A [`Persister`] is a
//! single durable cell: idempotently retryable `save`, a `load` that can
//! tell "not found" apart from a fault, and `remove`. The payload is an
//! opaque `serde_json::Value`: callers keep their own typed views.
//!
//! Two interchangeable backends: [`FsPersister`] (one file per cell,
//! flushed before acking) and [`ControlPersister`] (one document per cell
//! in a control collection of the document store).

mod control;
mod fs;

pub use control::{ControlPersister, ControlPersisterProvider};
pub use fs::{FsPersister, FsPersisterProvider};

use std::fmt;
use std::sync::Arc;

use serde_json::Value;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PersisterError {
    NotFound,
    Fault(String),
}

impl fmt::Display for PersisterError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PersisterError::NotFound => write!(f, "no persisted state"),
            PersisterError::Fault(detail) => write!(f, "persister fault: {}", detail),
        }
    }
}

impl std::error::Error for PersisterError {}

/// One durable JSON cell.
pub trait Persister: Send + Sync {
    fn save(&self, state: &Value) -> Result<(), PersisterError>;
    fn load(&self) -> Result<Value, PersisterError>;
    fn remove(&self) -> Result<(), PersisterError>;
}

/// Hands out the cells the system needs: one per incarnator id, plus the
/// process-wide cell holding the active async operation.
pub trait PersisterProvider: Send + Sync {
    fn incarnator(&self, id: &str) -> Arc<dyn Persister>;
    fn active_op(&self) -> Arc<dyn Persister>;
}
