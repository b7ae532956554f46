//! Ports layer - Trait definitions (interfaces).
//!
//! This module defines the interfaces that the application layer uses
//! to interact with external systems. Implementations live in `adapters`.

mod resolver;
mod sampler;
mod sink;

pub use resolver::{PidLookup, PidStrategy};
pub use sampler::SocketSampler;
pub use sink::EventSink;
