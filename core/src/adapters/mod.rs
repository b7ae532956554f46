//! Adapters layer - External system implementations.
//!
//! This module contains implementations of the port traits defined in `ports`.
//! Each adapter handles communication with external systems: the socket
//! table, the PID attribution tools, the kernel tracer, the HTTP sink and
//! the snapshot file.

pub(crate) mod command;
pub mod kernel;
pub mod resolver;
pub mod sampler;
pub mod sink;
pub mod snapshot;

// Re-export main types for convenience
pub use kernel::{KernelEventSource, StreamItem, TracerProcess, TracerStream};
pub use resolver::PidResolver;
pub use sampler::{FailoverSampler, SamplerBackend};
pub use sink::HttpSink;
pub use snapshot::SnapshotPersister;
