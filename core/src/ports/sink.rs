//! Event sink port (interface).

use crate::domain::SinkPayload;
use crate::error::Result;

/// Port for forwarding lifecycle events to an external collector.
///
/// Forwarding is fire-and-forget: callers log and drop errors, and never retry.
pub trait EventSink: Send + Sync {
    fn forward(
        &self,
        payload: &SinkPayload<'_>,
    ) -> impl std::future::Future<Output = Result<()>> + Send;
}
