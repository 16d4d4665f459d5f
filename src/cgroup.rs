//! Cgroup-v2 control for jobs.
//!
//! All jobs live under one parent cgroup ([`CGROUP_ROOT`]) with the
//! `cpu cpuset io memory pids` controllers delegated to its children.
//! Each job gets its own child directory, created by the container child
//! between clone and exec, and removed by the server after the job is
//! reaped — the child execs the target, so nothing on its side survives
//! to clean up.

use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use tracing::warn;

use crate::constants::{CGROUP_CONTROLLERS, CGROUP_ROOT};
use crate::error::{Error, Result};
use crate::spec::ResourceLimits;

/// Returns the cgroup directory of one job.
fn job_path(id: &str) -> PathBuf {
    Path::new(CGROUP_ROOT).join(id)
}

/// Writes one control file inside a job's cgroup.
fn write_control(id: &str, control: &str, value: &str) -> Result<()> {
    let path = job_path(id).join(control);
    fs::write(&path, value)
        .map_err(|e| Error::config(format!("could not set {control} for job {id}: {e}")))
}

/// Creates the parent cgroup and enables the controllers jobs need.
///
/// Idempotent: an existing parent directory is not an error. Called once
/// at server startup.
pub fn init() -> Result<()> {
    if let Err(e) = fs::create_dir(CGROUP_ROOT) {
        if e.kind() != ErrorKind::AlreadyExists {
            return Err(Error::config(format!(
                "could not create parent cgroup {CGROUP_ROOT}: {e}"
            )));
        }
    }

    let control = Path::new(CGROUP_ROOT).join("cgroup.subtree_control");
    fs::write(&control, CGROUP_CONTROLLERS)
        .map_err(|e| Error::config(format!("could not enable cgroup controllers: {e}")))
}

/// Creates a job's cgroup and moves the calling process into it.
///
/// Runs in the container child before exec, so the target process and
/// everything it forks inherit the limits. Idempotent on directory
/// existence.
pub fn create(id: &str) -> Result<()> {
    if let Err(e) = fs::create_dir(job_path(id)) {
        if e.kind() != ErrorKind::AlreadyExists {
            return Err(Error::config(format!(
                "could not create cgroup for job {id}: {e}"
            )));
        }
    }
    write_control(id, "cgroup.procs", &nix::unistd::getpid().to_string())
}

/// Writes the control files for every non-zero limit in `resources`.
pub fn write_limits(id: &str, resources: &ResourceLimits) -> Result<()> {
    if resources.max_processes > 0 {
        write_control(id, "pids.max", &resources.max_processes.to_string())?;
    }

    if resources.memory_bytes > 0 {
        write_control(id, "memory.max", &resources.memory_bytes.to_string())?;
    }

    if resources.milli_cpu > 0 {
        // cpu.max wants "<quota> <period>" in microseconds per period.
        let quota = u64::from(resources.milli_cpu) * 1000;
        write_control(id, "cpu.max", &format!("{quota} 1000000"))?;
    }

    for limit in &resources.io_limits {
        write_control(id, "io.max", &limit.cgroup_line())?;
    }

    Ok(())
}

/// Removes a job's cgroup directory.
///
/// Silent on ENOENT: a launch can fail before the child ever created its
/// cgroup. Called exactly once per successful [`create`], by the server
/// after the job is reaped.
pub fn remove(id: &str) {
    if let Err(e) = fs::remove_dir(job_path(id)) {
        if e.kind() != ErrorKind::NotFound {
            warn!(job = %id, error = %e, "could not remove job cgroup");
        }
    }
}
