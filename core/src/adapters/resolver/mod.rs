//! Layered PID attribution.
//!
//! Process association through `ss -p` needs capabilities that containers
//! often drop, so it is backed by `lsof` enumeration. Each attempt is bounded
//! by a timeout; a failed or timed-out strategy counts as a miss.

mod lsof;
mod ss;

use std::collections::BTreeSet;
use std::time::Duration;

use tokio::time::timeout;
use tracing::{debug, warn};

use crate::ports::{PidLookup, PidStrategy};

pub use lsof::LsofPidStrategy;
pub use ss::SsPidStrategy;

/// Default bound for one strategy attempt.
pub const DEFAULT_STRATEGY_TIMEOUT: Duration = Duration::from_millis(1500);

/// Resolves owning PIDs by trying a primary then a secondary strategy.
pub struct PidResolver<P: PidStrategy = SsPidStrategy, S: PidStrategy = LsofPidStrategy> {
    primary: P,
    secondary: S,
    attempt_timeout: Duration,
}

impl PidResolver {
    /// Resolver using the system `ss` and `lsof` binaries.
    pub fn system(attempt_timeout: Duration) -> Self {
        Self::new(SsPidStrategy::new(), LsofPidStrategy::new(), attempt_timeout)
    }
}

impl<P: PidStrategy, S: PidStrategy> PidResolver<P, S> {
    pub fn new(primary: P, secondary: S, attempt_timeout: Duration) -> Self {
        Self {
            primary,
            secondary,
            attempt_timeout,
        }
    }

    async fn attempt<T: PidStrategy>(&self, strategy: &T, port: u16) -> BTreeSet<u32> {
        match timeout(self.attempt_timeout, strategy.lookup(port)).await {
            Ok(Ok(pids)) => {
                if pids.is_empty() {
                    debug!(port, strategy = strategy.name(), "no owner found");
                }
                pids
            }
            Ok(Err(e)) => {
                debug!(port, strategy = strategy.name(), error = %e, "pid lookup failed");
                BTreeSet::new()
            }
            Err(_) => {
                warn!(
                    port,
                    strategy = strategy.name(),
                    timeout_ms = self.attempt_timeout.as_millis() as u64,
                    "pid lookup timed out"
                );
                BTreeSet::new()
            }
        }
    }
}

impl<P: PidStrategy, S: PidStrategy> PidLookup for PidResolver<P, S> {
    /// Resolve the owners of `port`. Empty on total failure.
    async fn resolve(&self, port: u16) -> BTreeSet<u32> {
        let pids = self.attempt(&self.primary, port).await;
        if !pids.is_empty() {
            return pids;
        }
        self.attempt(&self.secondary, port).await
    }
}
