//! Typed kernel socket events.

use std::fmt;

/// Linux `AF_INET`.
const AF_INET: i64 = 2;
/// Linux `AF_INET6`.
const AF_INET6: i64 = 10;

/// Address family reported with a bind.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AddressFamily {
    Inet,
    Inet6,
    /// Any non-IP family (unix, netlink, ...). Carries the raw value.
    Other(String),
}

impl AddressFamily {
    /// Interpret a textual family as printed by tracers (`AF_INET`, `inet6`, `2`, ...).
    pub fn from_name(name: &str) -> Self {
        let trimmed = name.trim();
        if let Ok(code) = trimmed.parse::<i64>() {
            return Self::from_code(code);
        }
        match trimmed.to_ascii_lowercase().as_str() {
            "af_inet" | "inet" | "ipv4" | "ip4" | "tcp4" | "udp4" => AddressFamily::Inet,
            "af_inet6" | "inet6" | "ipv6" | "ip6" | "tcp6" | "udp6" => AddressFamily::Inet6,
            _ => AddressFamily::Other(trimmed.to_string()),
        }
    }

    /// Interpret a numeric `sa_family` value.
    pub fn from_code(code: i64) -> Self {
        match code {
            AF_INET => AddressFamily::Inet,
            AF_INET6 => AddressFamily::Inet6,
            other => AddressFamily::Other(other.to_string()),
        }
    }

    /// Whether this family has a numeric port concept.
    pub fn is_ip(&self) -> bool {
        matches!(self, AddressFamily::Inet | AddressFamily::Inet6)
    }
}

impl fmt::Display for AddressFamily {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AddressFamily::Inet => f.write_str("AF_INET"),
            AddressFamily::Inet6 => f.write_str("AF_INET6"),
            AddressFamily::Other(raw) => write!(f, "{}", raw),
        }
    }
}

/// A decoded record from the kernel event stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum KernelEvent {
    /// A socket was bound (or put into listen) on `port`.
    ///
    /// `port` is the raw value reported by the tracer and is validated by the
    /// engine, not the decoder.
    Bind {
        pid: u32,
        fd: i64,
        port: i64,
        family: AddressFamily,
    },
    /// A file descriptor was closed.
    Close { pid: u32, fd: i64 },
}
