//! Application layer - Use case services.
//!
//! This module contains the services that turn observations into lifecycle
//! events. They depend on the traits in `ports`, never on concrete adapters,
//! except for the default type parameters.

mod emitter;
mod reconciler;
mod shutdown;

pub use emitter::{EventEmitter, EVENT_TARGET};
pub use reconciler::{Discipline, NoLookup, Reconciliation, ReconciliationEngine};
pub use shutdown::ShutdownFlusher;
