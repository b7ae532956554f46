//! Socket table sampler adapters.
//!
//! Two backends produce the same normalized port set: `ss` (socket-table
//! query) and `/proc/net/*` parsing. [`FailoverSampler`] tries the primary
//! backend and falls over to the alternate one for the current cycle.

mod procfs;
mod ss;
mod utils;

use std::collections::HashSet;

use tracing::warn;

use crate::config::BackendChoice;
use crate::error::{Error, Result};
use crate::ports::SocketSampler;

pub use procfs::ProcNetSampler;
pub use ss::SsSampler;
pub use utils::Utils;

/// A concrete sampler backend.
pub enum SamplerBackend {
    SocketTable(SsSampler),
    ProcNet(ProcNetSampler),
}

impl SocketSampler for SamplerBackend {
    fn name(&self) -> &'static str {
        match self {
            SamplerBackend::SocketTable(inner) => inner.name(),
            SamplerBackend::ProcNet(inner) => inner.name(),
        }
    }

    async fn sample(&self) -> Result<HashSet<u16>> {
        match self {
            SamplerBackend::SocketTable(inner) => inner.sample().await,
            SamplerBackend::ProcNet(inner) => inner.sample().await,
        }
    }
}

/// Sampler that fails over to an alternate backend when the primary is unavailable.
pub struct FailoverSampler<S: SocketSampler = SamplerBackend> {
    primary: S,
    alternate: Option<S>,
}

impl<S: SocketSampler> FailoverSampler<S> {
    pub fn new(primary: S, alternate: Option<S>) -> Self {
        Self { primary, alternate }
    }

    pub fn primary(&self) -> &S {
        &self.primary
    }
}

impl FailoverSampler<SamplerBackend> {
    /// Build the backend pair for a configured choice.
    ///
    /// `auto` and `ss` prefer the socket-table query; `proc` prefers the proc
    /// tables. The other backend is always kept as the alternate.
    pub fn for_choice(choice: BackendChoice) -> Self {
        let ss = SamplerBackend::SocketTable(SsSampler::new());
        let proc = SamplerBackend::ProcNet(ProcNetSampler::new());

        match choice {
            BackendChoice::Auto | BackendChoice::Ss => Self::new(ss, Some(proc)),
            BackendChoice::Proc => Self::new(proc, Some(ss)),
        }
    }
}

impl<S: SocketSampler> SocketSampler for FailoverSampler<S> {
    fn name(&self) -> &'static str {
        self.primary.name()
    }

    async fn sample(&self) -> Result<HashSet<u16>> {
        let primary_err = match self.primary.sample().await {
            Ok(ports) => return Ok(ports),
            Err(e) => e,
        };

        let Some(alternate) = &self.alternate else {
            return Err(primary_err);
        };

        warn!(
            primary = self.primary.name(),
            alternate = alternate.name(),
            error = %primary_err,
            "primary sampler unavailable, failing over for this cycle"
        );

        alternate.sample().await.map_err(|alt_err| {
            Error::BackendUnavailable(format!(
                "{}: {}; {}: {}",
                self.primary.name(),
                primary_err,
                alternate.name(),
                alt_err
            ))
        })
    }
}
