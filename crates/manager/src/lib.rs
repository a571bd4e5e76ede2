//! Process pool supervisor for rip workers.
//!
//! The manager owns the worker table: it spawns one process per slot,
//! supervises each slot independently, throttles crash loops with an
//! exponential backoff, abandons slots that cannot stabilize and performs
//! rolling restarts when the application changes on disk.

pub mod backoff;
pub mod error;
pub mod pool;
pub mod watcher;

pub use backoff::{Backoff, ExitKind, RestartDecision, RestartPolicy};
pub use error::{ManagerError, Result};
pub use pool::{Manager, ManagerConfig, WorkerInfo};
pub use watcher::ReloadWatcher;
