//! Domain layer - Pure port lifecycle types.
//!
//! This module contains the entities the reconciliation engine works on.
//! These types have no I/O dependencies and can be tested in isolation.

mod event;
mod filter;
mod kernel;
mod port;

// Re-export all domain types
pub use event::{ContainerIdentity, EventKind, EventSource, LifecycleEvent, SinkPayload};
pub use filter::PortFilter;
pub use kernel::{AddressFamily, KernelEvent};
pub use port::{is_valid_port, PortRecord, PortStateStore};
