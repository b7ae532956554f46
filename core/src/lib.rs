//! Portwatch Core Library
//!
//! Watches a host's (or container's) listening sockets and turns noisy
//! observations into a de-duplicated, debounced stream of port lifecycle
//! events ("port opened" / "port closed") with best-effort PID attribution.
//! Provides functionality to:
//! - Sample the socket table (`ss` or `/proc/net/*`) with burst scans
//! - Consume an ordered kernel bind/close event stream from a tracer
//! - Reconcile either modality into one authoritative port state store
//! - Forward events to an HTTP collector and persist a port snapshot
//! - Flush synthetic closes exactly once on shutdown
//!
//! # Architecture
//! This library follows hexagonal architecture (ports & adapters):
//! - `domain`: Pure business logic and data models
//! - `ports`: Trait definitions (interfaces)
//! - `adapters`: External system implementations
//! - `application`: Use case services
//!
//! # Platform Support
//! Linux. Sampling uses `ss` or `/proc/net/{tcp,tcp6,udp,udp6}`; PID
//! attribution uses `ss -p` and `lsof`.

// Hexagonal architecture layers
pub mod adapters;
pub mod application;
pub mod domain;
pub mod ports;

pub mod config;
pub mod engine;
pub mod error;

// Re-export domain types (primary API)
pub use domain::{
    ContainerIdentity, EventKind, EventSource, KernelEvent, LifecycleEvent, PortFilter,
    PortRecord, PortStateStore,
};

// Re-export other commonly used types
pub use adapters::{FailoverSampler, HttpSink, PidResolver, SnapshotPersister, TracerProcess};
pub use application::{EventEmitter, ReconciliationEngine, ShutdownFlusher};
pub use config::{BackendChoice, ConfigStore, Mode, WatchConfig};
pub use engine::{EventRunReport, PortWatcher, SamplingSchedule};
pub use error::{Error, Result};
pub use ports::{PidLookup, SocketSampler};
