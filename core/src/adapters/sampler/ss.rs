//! Socket-table sampler backend using `ss`.

use std::collections::HashSet;
use std::path::PathBuf;
use std::time::Duration;

use crate::adapters::command::{find_executable, run_bounded, SS_PATHS};
use crate::error::{Error, Result};
use crate::ports::SocketSampler;

use super::utils::Utils;

/// Upper bound for a single `ss` invocation.
const SS_TIMEOUT: Duration = Duration::from_secs(5);

/// Samples bound TCP/UDP sockets with `ss`.
pub struct SsSampler {
    ss_path: Option<PathBuf>,
}

impl SsSampler {
    pub fn new() -> Self {
        Self {
            ss_path: find_executable(SS_PATHS),
        }
    }

    /// Create a sampler using a specific `ss` binary (or none).
    pub fn with_path(ss_path: Option<PathBuf>) -> Self {
        Self { ss_path }
    }

    /// Parse `ss -Htuln` output into port numbers.
    ///
    /// Expected format (no header, Netid column first):
    /// ```text
    /// tcp   LISTEN 0      4096         0.0.0.0:22         0.0.0.0:*
    /// udp   UNCONN 0      0      127.0.0.53%lo:53         0.0.0.0:*
    /// ```
    fn parse_ss_output(&self, output: &str) -> HashSet<u16> {
        let mut ports = HashSet::new();

        for line in output.lines() {
            let components: Vec<&str> = line.split_whitespace().collect();
            if components.len() < 5 {
                continue;
            }

            let Some((_, port)) = Utils::parse_address(components[4]) else {
                continue;
            };
            if port == 0 {
                continue;
            }

            ports.insert(port);
        }

        ports
    }
}

impl Default for SsSampler {
    fn default() -> Self {
        Self::new()
    }
}

impl SocketSampler for SsSampler {
    fn name(&self) -> &'static str {
        "ss"
    }

    /// Sample listening TCP and bound UDP sockets.
    ///
    /// Executes: `ss -Htuln`
    ///
    /// Flags explained:
    /// -H, --no-header     Suppress header line
    /// -t, --tcp           display TCP sockets
    /// -u, --udp           display UDP sockets
    /// -l, --listening     display listening (TCP) / bound (UDP) sockets
    /// -n, --numeric       don't resolve service names
    async fn sample(&self) -> Result<HashSet<u16>> {
        let ss_path = self
            .ss_path
            .as_ref()
            .ok_or_else(|| Error::BackendUnavailable("ss not found".to_string()))?;

        let output = run_bounded(ss_path, &["-Htuln"], SS_TIMEOUT)
            .await
            .map_err(|e| Error::BackendUnavailable(e.to_string()))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(Error::BackendUnavailable(format!(
                "ss exited with {}: {}",
                output.status,
                stderr.trim()
            )));
        }

        let stdout = String::from_utf8(output.stdout)
            .map_err(|e| Error::ParseError(format!("Invalid UTF-8 in ss output: {}", e)))?;

        Ok(self.parse_ss_output(&stdout))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_ss_output() {
        let sampler = SsSampler::with_path(None);
        let output = r#"tcp   LISTEN 0      4096         0.0.0.0:22         0.0.0.0:*
tcp   LISTEN 0      511             [::]:8080            [::]:*
udp   UNCONN 0      0      127.0.0.53%lo:53         0.0.0.0:*"#;

        let ports = sampler.parse_ss_output(output);
        assert_eq!(ports, HashSet::from([22, 8080, 53]));
    }

    #[test]
    fn test_deduplication_and_malformed_lines() {
        let sampler = SsSampler::with_path(None);

        // Same port on v4 and v6 collapses; short and non-numeric lines are dropped
        let output = r#"tcp LISTEN 0 4096 127.0.0.1:3000 0.0.0.0:*
tcp LISTEN 0 4096 [::1]:3000 [::]:*
garbage
tcp LISTEN 0 4096 127.0.0.1:http 0.0.0.0:*
udp UNCONN 0 0 0.0.0.0:0 0.0.0.0:*"#;

        let ports = sampler.parse_ss_output(output);
        assert_eq!(ports, HashSet::from([3000]));
    }

    #[tokio::test]
    async fn test_missing_binary_is_unavailable() {
        let sampler = SsSampler::with_path(None);
        let result = sampler.sample().await;
        assert!(matches!(result, Err(Error::BackendUnavailable(_))));
    }
}
