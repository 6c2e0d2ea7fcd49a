//! The synchronization engine.
//!
//! Propagation is demand-driven and bounded-incremental: nothing moves
//! until someone asks, and each hop applies the minimal diff between what
//! a collection holds and what it should hold, resuming from persisted
//! cursors. See [`Syncer`] for the two hops (source → intermediate,
//! intermediate → derived) and [`changeset`] for the diff itself.

mod changeset;
mod syncer;

pub use syncer::{AdmitError, IncKey, SyncError, DEFAULT_PAGE_LIMIT};

pub(crate) use syncer::{Admission, SyncTarget, Syncer};
