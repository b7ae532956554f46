//! Error types for the portwatch-core library.

use thiserror::Error;

/// Result type alias for portwatch operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur while observing ports and forwarding events.
///
/// None of these are fatal to a running watcher except [`Error::Config`],
/// which is raised before the reconciliation loop starts.
#[derive(Error, Debug)]
pub enum Error {
    /// A sampler backend could not produce a snapshot.
    #[error("Sampler backend unavailable: {0}")]
    BackendUnavailable(String),

    /// Failed to execute a system command.
    #[error("Command execution failed: {0}")]
    CommandFailed(String),

    /// Failed to parse command output.
    #[error("Failed to parse output: {0}")]
    ParseError(String),

    /// An external call did not finish within its time bound.
    #[error("Timed out: {0}")]
    Timeout(String),

    /// The event sink could not be reached or rejected the event.
    #[error("Sink unreachable: {0}")]
    SinkUnreachable(String),

    /// The port snapshot could not be written.
    #[error("Snapshot persistence failed: {0}")]
    Persistence(String),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization/deserialization error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Configuration error.
    #[error("Configuration error: {0}")]
    Config(String),
}
