//! Live-connection pool for monitored accounts.
//!
//! The pool keeps one live transport connection per account whose
//! monitoring flag is set, reconciling the live map against the
//! account directory on a fixed interval. Each live connection carries
//! an archiver pump that persists observed traffic and tracks
//! deletions.

pub mod connection_archiver;
pub mod pool_reconciler;

pub use connection_archiver::{ArchiverPumpHandle, MessageArchiver, SharedConnection};
pub use pool_reconciler::{
    start_pool_reconciler, PoolCycleSummary, PoolHandle, PoolReconcilerConfig, SessionPoolManager,
};
