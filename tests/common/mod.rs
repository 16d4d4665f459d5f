//! Shared test support.
//!
//! Jobs under test run through [`PipeLauncher`], which spawns the target
//! as an ordinary child process with stdout and stderr merged into one
//! pipe. That matches the stream contract of the real launcher without
//! needing namespaces, cgroups or `CAP_SYS_ADMIN`, so the lifecycle
//! machinery is exercised unprivileged.

// Each integration test binary compiles this module separately and uses
// a different subset of it.
#![allow(dead_code)]

use std::fs::File;
use std::process::{Command, Stdio};
use std::sync::Arc;

use async_trait::async_trait;
use nix::unistd::Pid;
use tokio_util::sync::CancellationToken;

use jobd::{CallContext, Error, JobSpec, LaunchedJob, Launcher, Result, Tracker};

/// Launches jobs as plain child processes, no isolation.
pub struct PipeLauncher;

#[async_trait]
impl Launcher for PipeLauncher {
    async fn launch(&self, _id: &str, spec: &JobSpec) -> Result<LaunchedJob> {
        let (read, write) = nix::unistd::pipe()
            .map_err(|e| Error::Launch { reason: format!("could not create pipe: {e}") })?;
        let write_err = write
            .try_clone()
            .map_err(|e| Error::Launch { reason: format!("could not clone pipe: {e}") })?;

        let child = Command::new(&spec.command)
            .args(&spec.args)
            .stdin(Stdio::null())
            .stdout(Stdio::from(write))
            .stderr(Stdio::from(write_err))
            .spawn()
            .map_err(|e| Error::Launch {
                reason: format!("could not exec {}: {e}", spec.command),
            })?;

        Ok(LaunchedJob {
            pid: Pid::from_raw(child.id() as i32),
            output: File::from(read),
        })
    }
}

/// A tracker over [`PipeLauncher`] with `carol` as the configured admin.
pub fn test_tracker() -> Arc<Tracker> {
    Arc::new(Tracker::new(Arc::new(PipeLauncher), ["carol".to_string()]))
}

/// An authenticated call context for `user`.
pub fn ctx(user: &str) -> CallContext {
    CallContext::new(user, CancellationToken::new())
}

/// A spec running `/bin/echo` with the given arguments.
pub fn echo_spec(args: &[&str]) -> JobSpec {
    JobSpec {
        command: "/bin/echo".to_string(),
        args: args.iter().map(|a| a.to_string()).collect(),
        ..Default::default()
    }
}

/// A spec running `/bin/sleep` for the given duration argument.
pub fn sleep_spec(duration: &str) -> JobSpec {
    JobSpec {
        command: "/bin/sleep".to_string(),
        args: vec![duration.to_string()],
        ..Default::default()
    }
}
