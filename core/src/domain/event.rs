//! Port lifecycle events and their wire format.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Transition reported for a port.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EventKind {
    /// The port started listening.
    Open,
    /// The port stopped listening.
    Close,
}

/// Which observation path produced an event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum EventSource {
    /// Socket-table sampling.
    Polling,
    /// Sampling used because the kernel event stream could not be started.
    Fallback,
    /// Kernel event stream.
    Ebpf,
    /// Shutdown flush while sampling.
    Shutdown,
    /// Shutdown flush while sampling in fallback.
    ShutdownFallback,
    /// Shutdown flush while consuming kernel events.
    ShutdownEbpf,
}

impl EventSource {
    /// The tag used for synthetic closes when the watcher shuts down.
    pub fn on_shutdown(self) -> Self {
        match self {
            EventSource::Polling | EventSource::Shutdown => EventSource::Shutdown,
            EventSource::Fallback | EventSource::ShutdownFallback => {
                EventSource::ShutdownFallback
            }
            EventSource::Ebpf | EventSource::ShutdownEbpf => EventSource::ShutdownEbpf,
        }
    }

    /// Wire name of the source.
    pub fn as_str(&self) -> &'static str {
        match self {
            EventSource::Polling => "polling",
            EventSource::Fallback => "fallback",
            EventSource::Ebpf => "ebpf",
            EventSource::Shutdown => "shutdown",
            EventSource::ShutdownFallback => "shutdown-fallback",
            EventSource::ShutdownEbpf => "shutdown-ebpf",
        }
    }
}

impl fmt::Display for EventSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A detected open or close of a listening port.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LifecycleEvent {
    pub kind: EventKind,
    pub port: u16,
    /// Owning PIDs for an open, last known PIDs for a close. Sorted.
    pub pids: Vec<u32>,
    pub source: EventSource,
}

impl LifecycleEvent {
    pub fn open(port: u16, pids: Vec<u32>, source: EventSource) -> Self {
        Self {
            kind: EventKind::Open,
            port,
            pids,
            source,
        }
    }

    pub fn close(port: u16, pids: Vec<u32>, source: EventSource) -> Self {
        Self {
            kind: EventKind::Close,
            port,
            pids,
            source,
        }
    }

    /// Human-readable log line.
    ///
    /// ```text
    /// New port opened: 8080 (pids: 10,11)
    /// Port closed: 8080 (last pids: unknown)
    /// ```
    pub fn log_line(&self) -> String {
        let pids = if self.pids.is_empty() {
            "unknown".to_string()
        } else {
            self.pids
                .iter()
                .map(|p| p.to_string())
                .collect::<Vec<_>>()
                .join(",")
        };

        match self.kind {
            EventKind::Open => format!("New port opened: {} (pids: {})", self.port, pids),
            EventKind::Close => format!("Port closed: {} (last pids: {})", self.port, pids),
        }
    }

    /// Build the JSON payload forwarded to the sink.
    pub fn to_payload<'a>(&'a self, identity: &'a ContainerIdentity) -> SinkPayload<'a> {
        let (pids, last_pids) = match self.kind {
            EventKind::Open => (Some(self.pids.as_slice()), None),
            EventKind::Close => (None, Some(self.pids.as_slice())),
        };

        SinkPayload {
            event: self.kind,
            port: self.port,
            pids,
            last_pids,
            container_id: &identity.container_id,
            container_name: &identity.container_name,
            source: self.source,
        }
    }
}

impl fmt::Display for LifecycleEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.log_line())
    }
}

/// Identity strings of the container (or host) being watched.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContainerIdentity {
    pub container_id: String,
    pub container_name: String,
}

impl ContainerIdentity {
    pub fn new(container_id: impl Into<String>, container_name: impl Into<String>) -> Self {
        Self {
            container_id: container_id.into(),
            container_name: container_name.into(),
        }
    }
}

/// JSON body sent to the event sink.
#[derive(Debug, Serialize)]
pub struct SinkPayload<'a> {
    pub event: EventKind,
    pub port: u16,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pids: Option<&'a [u32]>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_pids: Option<&'a [u32]>,
    pub container_id: &'a str,
    pub container_name: &'a str,
    pub source: EventSource,
}
