//! CLI command implementations.

pub mod resolve;
pub mod sample;
pub mod watch;
