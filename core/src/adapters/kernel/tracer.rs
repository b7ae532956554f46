//! Kernel tracer child process.
//!
//! The tracer (a bpftrace script or similar) is an external binary that
//! prints one JSON record per bind/close on stdout.

use std::process::{ExitStatus, Stdio};
use std::time::Duration;

use tokio::io::BufReader;
use tokio::process::{Child, ChildStdout, Command};
use tokio::time::timeout;
use tracing::{debug, warn};

use crate::error::{Error, Result};

use super::source::KernelEventSource;

/// Grace period between SIGTERM and SIGKILL.
const TERMINATE_GRACE: Duration = Duration::from_millis(500);

/// Event stream produced by a running tracer.
pub type TracerStream = KernelEventSource<BufReader<ChildStdout>>;

/// A running tracer process.
pub struct TracerProcess {
    child: Child,
    program: String,
}

impl TracerProcess {
    /// Spawn the tracer from its argv and attach to its stdout.
    pub fn spawn(argv: &[String]) -> Result<(Self, TracerStream)> {
        let (program, args) = argv
            .split_first()
            .ok_or_else(|| Error::Config("Tracer command is empty".to_string()))?;

        let mut child = Command::new(program)
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| Error::CommandFailed(format!("Failed to start {}: {}", program, e)))?;

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| Error::CommandFailed(format!("No stdout from {}", program)))?;

        debug!(program = %program, pid = child.id(), "tracer started");

        let tracer = Self {
            child,
            program: program.clone(),
        };
        Ok((tracer, KernelEventSource::new(BufReader::new(stdout))))
    }

    /// OS process id, if the tracer has not been reaped.
    pub fn id(&self) -> Option<u32> {
        self.child.id()
    }

    /// Stop the tracer: SIGTERM, then SIGKILL after a short grace period.
    ///
    /// Returns the exit status if the tracer was reaped. A tracer that had
    /// already exited on its own reports its own status.
    pub async fn terminate(mut self) -> Option<ExitStatus> {
        if let Ok(Some(status)) = self.child.try_wait() {
            debug!(program = %self.program, %status, "tracer had already exited");
            return Some(status);
        }

        if let Some(pid) = self.child.id() {
            send_sigterm(pid);
        }

        match timeout(TERMINATE_GRACE, self.child.wait()).await {
            Ok(Ok(status)) => {
                debug!(program = %self.program, %status, "tracer exited");
                Some(status)
            }
            Ok(Err(e)) => {
                warn!(program = %self.program, error = %e, "failed to reap tracer");
                None
            }
            Err(_) => {
                warn!(program = %self.program, "tracer ignored SIGTERM, killing");
                if let Err(e) = self.child.kill().await {
                    warn!(program = %self.program, error = %e, "failed to kill tracer");
                }
                None
            }
        }
    }
}

#[cfg(unix)]
fn send_sigterm(pid: u32) {
    use nix::sys::signal::{kill, Signal};
    use nix::unistd::Pid;

    let Ok(raw) = i32::try_from(pid) else {
        return;
    };
    if let Err(e) = kill(Pid::from_raw(raw), Signal::SIGTERM) {
        debug!(pid, error = %e, "SIGTERM to tracer failed");
    }
}

#[cfg(not(unix))]
fn send_sigterm(_pid: u32) {}
