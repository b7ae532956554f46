//! Time-bounded execution of system commands.

use std::path::{Path, PathBuf};
use std::process::{Output, Stdio};
use std::time::Duration;

use tokio::process::Command;
use tokio::time::timeout;

use crate::error::{Error, Result};

/// Default paths to search for `ss`.
pub(crate) const SS_PATHS: &[&str] = &["/usr/sbin/ss", "/usr/bin/ss", "/sbin/ss", "/bin/ss"];

/// Default paths to search for `lsof`.
pub(crate) const LSOF_PATHS: &[&str] = &[
    "/usr/bin/lsof",
    "/usr/sbin/lsof",
    "/bin/lsof",
    "/sbin/lsof",
];

/// Finds an executable in the given paths.
pub(crate) fn find_executable(paths: &[&str]) -> Option<PathBuf> {
    paths.iter().map(PathBuf::from).find(|p| p.exists())
}

/// Runs a command and collects its output, killing it if `limit` elapses.
///
/// The exit status is left to the caller: several tools exit non-zero for
/// "no match".
pub(crate) async fn run_bounded(program: &Path, args: &[&str], limit: Duration) -> Result<Output> {
    let name = program.display().to_string();

    let result = timeout(limit, async {
        Command::new(program)
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .output()
            .await
    })
    .await;

    match result {
        Ok(Ok(output)) => Ok(output),
        Ok(Err(e)) => Err(Error::CommandFailed(format!("Failed to run {}: {}", name, e))),
        Err(_) => Err(Error::Timeout(format!("{} after {:?}", name, limit))),
    }
}
