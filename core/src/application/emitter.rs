//! Lifecycle event output: local log line plus optional sink forwarding.

use tracing::{info, warn};

use crate::adapters::HttpSink;
use crate::domain::{ContainerIdentity, LifecycleEvent};
use crate::ports::EventSink;

/// Log target for lifecycle event lines.
pub const EVENT_TARGET: &str = "portwatch::events";

/// Writes the authoritative log line for each event and forwards it to the
/// sink, if one is configured. Sink failures never propagate.
pub struct EventEmitter<K: EventSink = HttpSink> {
    identity: ContainerIdentity,
    sink: Option<K>,
}

impl<K: EventSink> EventEmitter<K> {
    pub fn new(identity: ContainerIdentity, sink: Option<K>) -> Self {
        Self { identity, sink }
    }

    pub async fn emit(&self, event: &LifecycleEvent) {
        info!(
            target: EVENT_TARGET,
            event = ?event.kind,
            port = event.port,
            source = %event.source,
            "{}",
            event.log_line()
        );

        let Some(sink) = &self.sink else {
            return;
        };

        if let Err(e) = sink.forward(&event.to_payload(&self.identity)).await {
            warn!(port = event.port, error = %e, "event not delivered");
        }
    }

    /// Emit events in order, one forwarding attempt at a time.
    pub async fn emit_all(&self, events: &[LifecycleEvent]) {
        for event in events {
            self.emit(event).await;
        }
    }
}
