//! PID attribution ports (interfaces).

use std::collections::BTreeSet;

use crate::error::Result;

/// One way of finding the processes that hold a port open.
///
/// An empty set is a miss, not an error. Errors mean the strategy itself
/// could not run (missing binary, permission, timeout).
pub trait PidStrategy: Send + Sync {
    /// Short strategy name used in logs.
    fn name(&self) -> &'static str;

    /// Look up the owning PIDs of `port`.
    fn lookup(&self, port: u16) -> impl std::future::Future<Output = Result<BTreeSet<u32>>> + Send;
}

/// Best-effort PID attribution as consumed by the reconciliation engine.
///
/// Never fails: an empty set means "unknown".
pub trait PidLookup: Send + Sync {
    fn resolve(&self, port: u16) -> impl std::future::Future<Output = BTreeSet<u32>> + Send;
}
