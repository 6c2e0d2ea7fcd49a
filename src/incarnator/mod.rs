//! One incarnator: a named view definition plus its managed derived
//! collections.
//!
//! [`IncarnatorConfig`] is the immutable definition, [`IncarnatorState`]
//! the persisted snapshot it recovers from, [`Incarnator`] the lifecycle
//! state machine owning the derived-collection topology and hosting the
//! sync engine.

mod config;
mod incarnator;
mod state;

pub use config::{GroupLevel, IncarnatorConfig, ReduceConfig};
pub use incarnator::{Incarnator, IncarnatorError};
pub use state::{IncarnatorState, IncarnatorStatus};
