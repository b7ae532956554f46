//! PID lookup through open-file enumeration with `lsof`.

use std::collections::BTreeSet;
use std::path::PathBuf;
use std::time::Duration;

use crate::adapters::command::{find_executable, run_bounded, LSOF_PATHS};
use crate::error::{Error, Result};
use crate::ports::PidStrategy;

const LSOF_TIMEOUT: Duration = Duration::from_secs(5);

/// Resolves owners by enumerating sockets bound to the port.
///
/// Queries are tried in order and the first non-empty answer wins:
/// TCP sockets in LISTEN, then UDP sockets, then any socket on the port.
pub struct LsofPidStrategy {
    lsof_path: Option<PathBuf>,
}

impl LsofPidStrategy {
    pub fn new() -> Self {
        Self {
            lsof_path: find_executable(LSOF_PATHS),
        }
    }

    pub fn with_path(lsof_path: Option<PathBuf>) -> Self {
        Self { lsof_path }
    }

    /// Argument lists for each query, most specific first.
    ///
    /// Flags:
    /// - -n / -P: no host or port name resolution
    /// - -t: terse output (PIDs only)
    /// - -i <proto>:<port>: filter by protocol and port
    /// - -s TCP:LISTEN: only listening TCP sockets
    fn queries(port: u16) -> [Vec<String>; 3] {
        [
            terse(&[format!("-iTCP:{}", port), "-sTCP:LISTEN".to_string()]),
            terse(&[format!("-iUDP:{}", port)]),
            terse(&[format!("-i:{}", port)]),
        ]
    }

    fn parse_pids(output: &str) -> BTreeSet<u32> {
        output
            .lines()
            .filter_map(|line| line.trim().parse().ok())
            .collect()
    }
}

fn terse(filters: &[String]) -> Vec<String> {
    ["-n", "-P", "-t"]
        .iter()
        .map(|s| s.to_string())
        .chain(filters.iter().cloned())
        .collect()
}

impl Default for LsofPidStrategy {
    fn default() -> Self {
        Self::new()
    }
}

impl PidStrategy for LsofPidStrategy {
    fn name(&self) -> &'static str {
        "lsof"
    }

    async fn lookup(&self, port: u16) -> Result<BTreeSet<u32>> {
        let lsof_path = self
            .lsof_path
            .as_ref()
            .ok_or_else(|| Error::CommandFailed("lsof not found".to_string()))?;

        for query in Self::queries(port) {
            let args: Vec<&str> = query.iter().map(String::as_str).collect();
            let output = run_bounded(lsof_path, &args, LSOF_TIMEOUT).await?;

            // lsof returns exit code 1 when no processes found, which is not an error
            if !output.status.success() && !output.stdout.is_empty() {
                let stderr = String::from_utf8_lossy(&output.stderr);
                return Err(Error::CommandFailed(format!("lsof failed: {}", stderr.trim())));
            }

            let pids = Self::parse_pids(&String::from_utf8_lossy(&output.stdout));
            if !pids.is_empty() {
                return Ok(pids);
            }
        }

        Ok(BTreeSet::new())
    }
}
