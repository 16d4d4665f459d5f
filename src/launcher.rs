//! Two-phase container launch.
//!
//! Phase 1 runs in the server: clone(2) a child into fresh UTS, PID and
//! mount namespaces (plus a network namespace when requested), with its
//! stdout and stderr piped back and stdin on `/dev/null`. The child execs
//! the server binary itself with a `runc` argv built from the job spec —
//! `std::process::Command` cannot request `CLONE_NEWPID`, and
//! `unshare(CLONE_NEWPID)` only affects grandchildren, so the clone is done
//! by hand and the code between clone and exec stays allocation-free.
//!
//! The child's stderr pipe doubles as a one-shot setup status channel. The
//! parent reads it to end-of-file before declaring the launch done: any
//! bytes are a phase-2 diagnostic and the launch has failed; an empty read
//! means the target exec'd, and from then on the stdout pipe carries the
//! target's combined stdout and stderr.
//!
//! Phase 2 ([`exec_job`]) runs in the re-exec'd child: preserve the setup
//! channel on a close-on-exec descriptor, fold stderr into stdout, enter
//! the job cgroup, apply limits, set the hostname, optionally chroot,
//! mount `/proc`, and exec the target with an empty environment. Every
//! step is fatal; the only success path is the exec replacing the process
//! image, which closes the setup channel.

use std::ffi::CString;
use std::fs::File;
use std::io::{Read, Write};
use std::os::fd::{AsRawFd, FromRawFd, RawFd};

use async_trait::async_trait;
use nix::fcntl::OFlag;
use nix::sched::CloneFlags;
use nix::sys::wait::waitpid;
use nix::unistd::Pid;

use crate::cgroup;
use crate::constants::CHILD_STACK_SIZE;
use crate::error::{Error, Result};
use crate::spec::JobSpec;

/// Handles returned from a successful launch: the child's pid for
/// signalling and reaping, and the read side of its combined
/// stdout/stderr stream.
#[derive(Debug)]
pub struct LaunchedJob {
    /// Process id of the container child.
    pub pid: Pid,
    /// Read handle for the child's combined stdout/stderr.
    pub output: File,
}

/// Starts a job's process and hands back its output stream and pid.
///
/// The production implementation is [`ReexecLauncher`]. Tests drive jobs
/// through an unprivileged launcher so the lifecycle machinery can be
/// exercised without `CAP_SYS_ADMIN`.
#[async_trait]
pub trait Launcher: Send + Sync {
    /// Launches the job described by `spec` under the given id.
    async fn launch(&self, id: &str, spec: &JobSpec) -> Result<LaunchedJob>;
}

// =============================================================================
// Phase 1: Re-exec Launcher
// =============================================================================

/// Launches jobs by cloning into fresh namespaces and re-executing the
/// server binary with a hidden `runc` subcommand.
#[derive(Debug, Default)]
pub struct ReexecLauncher;

impl ReexecLauncher {
    /// Creates a new re-exec launcher.
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl Launcher for ReexecLauncher {
    async fn launch(&self, id: &str, spec: &JobSpec) -> Result<LaunchedJob> {
        let id = id.to_owned();
        let spec = spec.clone();
        tokio::task::spawn_blocking(move || launch_blocking(&id, &spec))
            .await
            .map_err(|e| Error::Internal(format!("launch task failed: {e}")))?
    }
}

/// Builds the argv (after the program name) that re-runs this binary as
/// the container child: the `runc` subcommand, the job id, the flattened
/// spec, then `--` and the target command line.
pub fn reexec_args(id: &str, spec: &JobSpec) -> Vec<String> {
    let mut args = vec!["runc".to_string(), "--id".to_string(), id.to_string()];

    if let Some(root) = &spec.root_dir {
        args.push("--root".to_string());
        args.push(root.display().to_string());
    }
    if spec.isolate_network {
        args.push("--isolate-network".to_string());
    }

    let r = &spec.resources;
    if r.max_processes != 0 {
        args.push("--max-processes".to_string());
        args.push(r.max_processes.to_string());
    }
    if r.memory_bytes != 0 {
        args.push("--memory".to_string());
        args.push(r.memory_bytes.to_string());
    }
    if r.milli_cpu != 0 {
        args.push("--cpu".to_string());
        args.push(r.milli_cpu.to_string());
    }
    for limit in &r.io_limits {
        args.push("--io".to_string());
        args.push(limit.to_string());
    }

    args.push("--".to_string());
    args.push(spec.command.clone());
    args.extend(spec.args.iter().cloned());
    args
}

/// Writes a static diagnostic to a raw descriptor. Only called between
/// clone and exec, where allocating is off-limits.
fn child_report(fd: RawFd, msg: &[u8]) {
    unsafe {
        let _ = libc::write(fd, msg.as_ptr().cast(), msg.len());
    }
}

fn launch_blocking(id: &str, spec: &JobSpec) -> Result<LaunchedJob> {
    let exe = CString::from(c"/proc/self/exe");
    let mut argv_cstrings = vec![CString::from(c"jobd")];
    for arg in reexec_args(id, spec) {
        argv_cstrings
            .push(CString::new(arg).map_err(|e| Error::config(format!("bad argument: {e}")))?);
    }
    let mut argv_ptrs: Vec<*const libc::c_char> =
        argv_cstrings.iter().map(|c| c.as_ptr()).collect();
    argv_ptrs.push(std::ptr::null());

    // Close-on-exec keeps these descriptors out of any sibling child
    // cloned concurrently for another job; our child re-opens them on
    // fds 0-2, which dup2 strips the flag from.
    let devnull = File::open("/dev/null")?;
    let (out_r, out_w) = nix::unistd::pipe2(OFlag::O_CLOEXEC)
        .map_err(|e| Error::Launch { reason: format!("could not create stdout pipe: {e}") })?;
    let (err_r, err_w) = nix::unistd::pipe2(OFlag::O_CLOEXEC)
        .map_err(|e| Error::Launch { reason: format!("could not create stderr pipe: {e}") })?;

    let devnull_fd = devnull.as_raw_fd();
    let out_w_fd = out_w.as_raw_fd();
    let err_w_fd = err_w.as_raw_fd();

    let mut flags = CloneFlags::CLONE_NEWUTS | CloneFlags::CLONE_NEWPID | CloneFlags::CLONE_NEWNS;
    if spec.isolate_network {
        flags |= CloneFlags::CLONE_NEWNET;
    }

    // Runs in the cloned child. The parent is multi-threaded, so nothing
    // here may allocate or take locks: raw dup2/write/execv only, on
    // pointers prepared above.
    let child = move || -> isize {
        unsafe {
            if libc::dup2(devnull_fd, 0) < 0
                || libc::dup2(out_w_fd, 1) < 0
                || libc::dup2(err_w_fd, 2) < 0
            {
                child_report(err_w_fd, b"could not set up job stdio\n");
                return 126;
            }
        }
        // Keep mount events private to this namespace tree.
        if nix::sched::unshare(CloneFlags::CLONE_NEWNS).is_err() {
            child_report(2, b"could not unshare mount namespace\n");
            return 125;
        }
        unsafe {
            libc::execv(exe.as_ptr(), argv_ptrs.as_ptr());
        }
        child_report(2, b"could not re-exec server binary\n");
        127
    };

    let mut stack = vec![0u8; CHILD_STACK_SIZE];
    let pid = unsafe {
        nix::sched::clone(Box::new(child), &mut stack, flags, Some(libc::SIGCHLD))
    }
    .map_err(|e| Error::Launch { reason: format!("could not clone job child: {e}") })?;

    // Close our copies of the child's ends so the pipes see EOF when the
    // child side goes away.
    drop(out_w);
    drop(err_w);
    drop(devnull);

    // The stderr pipe is the setup status channel: read it to end-of-file.
    // Bytes mean phase 2 failed before exec; an empty read means success.
    let mut setup_err = Vec::new();
    let mut err_pipe = File::from(err_r);
    if let Err(e) = err_pipe.read_to_end(&mut setup_err) {
        let _ = waitpid(pid, None);
        cgroup::remove(id);
        return Err(Error::Launch {
            reason: format!("could not read job setup status: {e}"),
        });
    }

    if !setup_err.is_empty() {
        // The child exited without exec'ing; reap it and drop whatever
        // cgroup it managed to create.
        let _ = waitpid(pid, None);
        cgroup::remove(id);
        return Err(Error::Launch {
            reason: String::from_utf8_lossy(&setup_err).into_owned(),
        });
    }

    Ok(LaunchedJob {
        pid,
        output: File::from(out_r),
    })
}

// =============================================================================
// Phase 2: Container Child
// =============================================================================

/// Configures the container child and execs the target command.
///
/// Runs inside the re-exec'd `runc` process, which clone(2) placed in its
/// namespaces with stdout on the job output pipe and stderr on the setup
/// status pipe. Returns only on failure, after writing a diagnostic to the
/// preserved setup channel; the caller exits non-zero.
pub fn exec_job(id: &str, spec: &JobSpec) {
    // Preserve the setup channel before folding stderr into stdout. The
    // descriptor is close-on-exec so a successful exec closes it, which
    // the server reads as success.
    let errfd = unsafe { libc::fcntl(libc::STDERR_FILENO, libc::F_DUPFD_CLOEXEC, 3) };
    if errfd < 0 {
        return;
    }
    let mut setup_err = unsafe { File::from_raw_fd(errfd) };

    if unsafe { libc::dup2(libc::STDOUT_FILENO, libc::STDERR_FILENO) } < 0 {
        let e = std::io::Error::last_os_error();
        let _ = write!(setup_err, "could not redirect stderr to stdout: {e}");
        return;
    }

    if let Err(e) = setup_and_exec(id, spec) {
        let _ = write!(setup_err, "{e}");
    }
}

fn setup_and_exec(id: &str, spec: &JobSpec) -> Result<std::convert::Infallible> {
    cgroup::create(id)?;
    cgroup::write_limits(id, &spec.resources)?;

    nix::unistd::sethostname(id)
        .map_err(|e| Error::config(format!("could not set container hostname: {e}")))?;

    if let Some(root) = &spec.root_dir {
        nix::unistd::chroot(root.as_path()).map_err(|e| {
            Error::config(format!(
                "could not set root directory to {}: {e}",
                root.display()
            ))
        })?;
    }

    nix::unistd::chdir("/")
        .map_err(|e| Error::config(format!("could not change to root directory: {e}")))?;

    nix::mount::mount(
        Some("proc"),
        "/proc",
        Some("proc"),
        nix::mount::MsFlags::empty(),
        None::<&str>,
    )
    .map_err(|e| Error::config(format!("could not mount /proc: {e}")))?;

    let command = CString::new(spec.command.clone())
        .map_err(|e| Error::config(format!("bad command path: {e}")))?;
    let mut argv = vec![CString::new(spec.basename())
        .map_err(|e| Error::config(format!("bad command name: {e}")))?];
    for arg in &spec.args {
        argv.push(
            CString::new(arg.clone()).map_err(|e| Error::config(format!("bad argument: {e}")))?,
        );
    }
    let argv: Vec<&std::ffi::CStr> = argv.iter().map(|c| c.as_c_str()).collect();

    // Empty environment: the target sees only what its namespaces give it.
    let e = match nix::unistd::execve::<&std::ffi::CStr, &std::ffi::CStr>(&command, &argv, &[]) {
        Ok(never) => match never {},
        Err(e) => e,
    };
    Err(Error::config(format!(
        "could not exec {}: {e}",
        spec.command
    )))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::spec::{DiskIoLimit, ResourceLimits};

    #[test]
    fn test_reexec_args_minimal() {
        let spec = JobSpec {
            command: "/bin/echo".into(),
            args: vec!["hello".into()],
            ..Default::default()
        };
        assert_eq!(
            reexec_args("echo-00c0ffee", &spec),
            vec![
                "runc",
                "--id",
                "echo-00c0ffee",
                "--",
                "/bin/echo",
                "hello"
            ]
        );
    }

    #[test]
    fn test_reexec_args_full_spec() {
        let spec = JobSpec {
            command: "/usr/bin/stress".into(),
            args: vec!["--cpu".into(), "2".into()],
            root_dir: Some("/srv/root".into()),
            isolate_network: true,
            resources: ResourceLimits {
                milli_cpu: 500,
                memory_bytes: 1 << 20,
                max_processes: 8,
                io_limits: vec![DiskIoLimit {
                    major: 8,
                    minor: 0,
                    read_bps: 1000,
                    ..Default::default()
                }],
            },
        };
        let args = reexec_args("stress-deadbeef", &spec);
        assert_eq!(
            args,
            vec![
                "runc",
                "--id",
                "stress-deadbeef",
                "--root",
                "/srv/root",
                "--isolate-network",
                "--max-processes",
                "8",
                "--memory",
                "1048576",
                "--cpu",
                "500",
                "--io",
                "8:0:1000:0:0:0",
                "--",
                "/usr/bin/stress",
                "--cpu",
                "2"
            ]
        );
    }
}
