//! Socket table sampler port (interface).

use std::collections::HashSet;

use crate::error::Result;

/// Port for taking point-in-time snapshots of bound/listening ports.
///
/// Implementations handle backend details (`ss`, `/proc/net/*`, ...) and
/// normalize their output to plain port numbers. Entries that cannot be
/// parsed are dropped, never reported as an error.
pub trait SocketSampler: Send + Sync {
    /// Short backend name used in logs.
    fn name(&self) -> &'static str;

    /// Return the set of currently bound/listening ports.
    ///
    /// Fails with [`crate::Error::BackendUnavailable`] when the backend
    /// cannot be queried at all.
    fn sample(&self) -> impl std::future::Future<Output = Result<HashSet<u16>>> + Send;
}
