//! Kernel proc-table sampler backend.
//!
//! Reads `/proc/net/{tcp,tcp6,udp,udp6}` directly. This needs no external
//! binaries and no elevated capability, which makes it the usual fallback
//! inside minimal containers. Both IPv4 and IPv6 tables must be read: many
//! servers bind `::` only.

use std::collections::HashSet;
use std::path::PathBuf;

use tokio::fs;
use tracing::trace;

use crate::error::{Error, Result};
use crate::ports::SocketSampler;

use super::utils::Utils;

/// TCP state code for LISTEN in `/proc/net/tcp*`.
const TCP_LISTEN: &str = "0A";

/// Proc tables and whether they are TCP (state-filtered) tables.
const TABLES: &[(&str, bool)] = &[("tcp", true), ("tcp6", true), ("udp", false), ("udp6", false)];

/// Samples ports by parsing the kernel's proc socket tables.
pub struct ProcNetSampler {
    root: PathBuf,
}

impl ProcNetSampler {
    pub fn new() -> Self {
        Self::with_root("/proc/net")
    }

    /// Read tables from a different directory (e.g. `/proc/<pid>/net`).
    pub fn with_root(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }
}

impl Default for ProcNetSampler {
    fn default() -> Self {
        Self::new()
    }
}

impl SocketSampler for ProcNetSampler {
    fn name(&self) -> &'static str {
        "procfs"
    }

    async fn sample(&self) -> Result<HashSet<u16>> {
        let mut ports = HashSet::new();
        let mut readable = 0usize;

        for (table, is_tcp) in TABLES {
            let path = self.root.join(table);
            match fs::read_to_string(&path).await {
                Ok(content) => {
                    readable += 1;
                    ports.extend(parse_proc_net(&content, *is_tcp));
                }
                Err(e) => {
                    // IPv6 tables are absent when IPv6 is disabled
                    trace!("Could not read {}: {}", path.display(), e);
                }
            }
        }

        if readable == 0 {
            return Err(Error::BackendUnavailable(format!(
                "no socket tables readable under {}",
                self.root.display()
            )));
        }

        Ok(ports)
    }
}

/// Parse one `/proc/net/*` table.
///
/// Format (each line after header):
/// ```text
///    sl  local_address rem_address   st tx_queue rx_queue tr tm->when retrnsmt   uid  timeout inode
///    0: 00000000:1F90 00000000:0000 0A 00000000:00000000 00:00000000 00000000  1000        0 12345 ...
/// ```
///
/// TCP rows are kept only in LISTEN state; every UDP row is kept. Rows that
/// do not parse are skipped.
fn parse_proc_net(content: &str, is_tcp: bool) -> HashSet<u16> {
    content
        .lines()
        .skip(1)
        .filter_map(|line| {
            let parts: Vec<&str> = line.split_whitespace().collect();
            if parts.len() < 4 {
                return None;
            }
            if is_tcp && !parts[3].eq_ignore_ascii_case(TCP_LISTEN) {
                return None;
            }
            Utils::parse_hex_port(parts[1]).filter(|port| *port != 0)
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    const TCP: &str = r#"  sl  local_address rem_address   st tx_queue rx_queue tr tm->when retrnsmt   uid  timeout inode
   0: 00000000:0050 00000000:0000 0A 00000000:00000000 00:00000000 00000000     0        0 12345 1 0000000000000000 100 0 0 10 0
   1: 0100007F:1F90 00000000:0000 0A 00000000:00000000 00:00000000 00000000  1000        0 12346 1 0000000000000000 100 0 0 10 0
   2: 0100007F:2328 0100007F:1234 01 00000000:00000000 00:00000000 00000000  1000        0 12347 1 0000000000000000 100 0 0 10 0"#;

    const UDP: &str = r#"   sl  local_address rem_address   st tx_queue rx_queue tr tm->when retrnsmt   uid  timeout inode ref pointer drops
  100: 3500007F:0035 00000000:0000 07 00000000:00000000 00:00000000 00000000   101        0 2001 2 0000000000000000 0
  101: 00000000:XYZ1 00000000:0000 07 00000000:00000000 00:00000000 00000000   101        0 2002 2 0000000000000000 0"#;

    #[test]
    fn test_tcp_listen_only() {
        let ports = parse_proc_net(TCP, true);
        // 0x2328 (9000) is ESTABLISHED and must be skipped
        assert_eq!(ports, HashSet::from([80, 8080]));
    }

    #[test]
    fn test_udp_any_state_and_malformed_dropped() {
        let ports = parse_proc_net(UDP, false);
        assert_eq!(ports, HashSet::from([53]));
    }

    #[tokio::test]
    async fn test_sample_reads_available_tables() {
        let dir = tempdir().unwrap();
        std::fs::write(dir.path().join("tcp"), TCP).unwrap();
        std::fs::write(dir.path().join("udp"), UDP).unwrap();

        let sampler = ProcNetSampler::with_root(dir.path());
        let ports = sampler.sample().await.unwrap();
        assert_eq!(ports, HashSet::from([53, 80, 8080]));
    }

    #[tokio::test]
    async fn test_sample_without_tables_is_unavailable() {
        let dir = tempdir().unwrap();
        let sampler = ProcNetSampler::with_root(dir.path());
        let result = sampler.sample().await;
        assert!(matches!(result, Err(Error::BackendUnavailable(_))));
    }
}
