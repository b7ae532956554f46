//! PID lookup through `ss` process association.

use std::collections::BTreeSet;
use std::path::PathBuf;
use std::sync::OnceLock;
use std::time::Duration;

use regex::Regex;

use crate::adapters::command::{find_executable, run_bounded, SS_PATHS};
use crate::adapters::sampler::Utils;
use crate::error::{Error, Result};
use crate::ports::PidStrategy;

/// Internal bound for the `ss` call; the resolver applies its own timeout on top.
const SS_TIMEOUT: Duration = Duration::from_secs(5);

fn pid_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"pid=(\d+)").expect("pid pattern is valid"))
}

/// Resolves owners with `ss -p`, restricted to one source port.
///
/// Needs the capability to inspect other processes' descriptors; without it
/// `ss` prints no `users:` column and the lookup is a miss.
pub struct SsPidStrategy {
    ss_path: Option<PathBuf>,
}

impl SsPidStrategy {
    pub fn new() -> Self {
        Self {
            ss_path: find_executable(SS_PATHS),
        }
    }

    pub fn with_path(ss_path: Option<PathBuf>) -> Self {
        Self { ss_path }
    }

    /// Collect PIDs from `ss -Htulnp` lines whose local port is `port`.
    ///
    /// ```text
    /// tcp LISTEN 0 4096 0.0.0.0:8080 0.0.0.0:* users:(("node",pid=10,fd=3),("node",pid=11,fd=3))
    /// ```
    fn parse_owners(&self, output: &str, port: u16) -> BTreeSet<u32> {
        let mut pids = BTreeSet::new();

        for line in output.lines() {
            let components: Vec<&str> = line.split_whitespace().collect();
            if components.len() < 6 {
                continue;
            }

            match Utils::parse_address(components[4]) {
                Some((_, local_port)) if local_port == port => {}
                _ => continue,
            }

            for users in &components[5..] {
                pids.extend(
                    pid_pattern()
                        .captures_iter(users)
                        .filter_map(|caps| caps[1].parse::<u32>().ok()),
                );
            }
        }

        pids
    }
}

impl Default for SsPidStrategy {
    fn default() -> Self {
        Self::new()
    }
}

impl PidStrategy for SsPidStrategy {
    fn name(&self) -> &'static str {
        "ss"
    }

    /// Executes: `ss -Htulnp sport = :<port>`
    async fn lookup(&self, port: u16) -> Result<BTreeSet<u32>> {
        let ss_path = self
            .ss_path
            .as_ref()
            .ok_or_else(|| Error::CommandFailed("ss not found".to_string()))?;

        let filter = format!(":{}", port);
        let output = run_bounded(ss_path, &["-Htulnp", "sport", "=", &filter], SS_TIMEOUT).await?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(Error::CommandFailed(format!("ss failed: {}", stderr.trim())));
        }

        let stdout = String::from_utf8_lossy(&output.stdout);
        Ok(self.parse_owners(&stdout, port))
    }
}
