//! One-shot drain of the port store on termination.

use std::sync::atomic::{AtomicBool, Ordering};

use crate::domain::{EventSource, LifecycleEvent, PortStateStore};

/// Synthesizes a close for every tracked port, exactly once per process.
#[derive(Debug, Default)]
pub struct ShutdownFlusher {
    flushed: AtomicBool,
}

impl ShutdownFlusher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Close events for every record in `store`, including ports pending close.
    ///
    /// `source` is the running modality's tag; events carry its shutdown
    /// counterpart. Every call after the first returns an empty list. The
    /// store is not modified.
    pub fn flush(&self, store: &PortStateStore, source: EventSource) -> Vec<LifecycleEvent> {
        if self.flushed.swap(true, Ordering::SeqCst) {
            return Vec::new();
        }

        let tag = source.on_shutdown();
        store
            .ports()
            .into_iter()
            .filter_map(|port| store.get(port))
            .map(|record| LifecycleEvent::close(record.port, record.pids(), tag))
            .collect()
    }

    pub fn is_flushed(&self) -> bool {
        self.flushed.load(Ordering::SeqCst)
    }
}
