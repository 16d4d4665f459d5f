//! Wire types for the RPC surface.
//!
//! One request/reply pair per operation, serialized as JSON inside
//! length-prefixed frames. Job ids travel as raw bytes: generated ids are
//! ASCII, but the protocol imposes no UTF-8 constraint on them.
//!
//! Device names cross the wire as filesystem paths and are resolved to
//! `(major, minor)` pairs at the trust boundary, before a spec reaches
//! the tracker.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::job::{JobSnapshot, JobState};
use crate::spec::{DiskIoLimit, JobSpec, ResourceLimits};

// =============================================================================
// Requests
// =============================================================================

/// A client request. Exactly one is served per connection.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Request {
    /// Launch a job.
    Run { spec: WireJobSpec },
    /// Stop a job, optionally removing it from tracking.
    Stop { job_id: Vec<u8>, cleanup: bool },
    /// Fetch one job's status.
    Status { job_id: Vec<u8> },
    /// List visible jobs.
    List { all_jobs: bool, completed: bool },
    /// Stream a job's recorded output.
    Logs { job_id: Vec<u8>, follow: bool },
    /// Stop all jobs and shut the server down.
    Shutdown,
}

// =============================================================================
// Replies
// =============================================================================

/// A server reply frame. Unary operations send exactly one; `Logs` sends
/// a `Log` frame per record and finishes with `LogsEnd`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Reply {
    /// The id assigned to a launched job.
    Run { job_id: Vec<u8> },
    /// Acknowledges a stop.
    Stop,
    /// One job's status.
    Status { status: WireJobStatus },
    /// Visible jobs, ordered by `(start_time, job_id)`.
    List { jobs: Vec<WireJobStatus> },
    /// One log record.
    Log {
        timestamp: DateTime<Utc>,
        line: Vec<u8>,
    },
    /// Terminates a log stream.
    LogsEnd,
    /// Acknowledges a shutdown.
    Shutdown { num_jobs_stopped: i32 },
    /// The operation failed.
    Error { kind: ErrorKind, message: String },
}

/// Wire form of the error taxonomy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ErrorKind {
    Unauthorized,
    Unknown,
    NoCommand,
    AlreadyStarted,
    Launch,
    Config,
    Internal,
}

impl Reply {
    /// Builds the error frame for a failed operation.
    pub fn from_error(err: &Error) -> Self {
        let kind = match err {
            Error::Unauthorized => ErrorKind::Unauthorized,
            Error::UnknownJob(_) => ErrorKind::Unknown,
            Error::NoCommand => ErrorKind::NoCommand,
            Error::AlreadyStarted(_) => ErrorKind::AlreadyStarted,
            Error::Launch { .. } => ErrorKind::Launch,
            Error::Config { .. } => ErrorKind::Config,
            _ => ErrorKind::Internal,
        };
        Reply::Error {
            kind,
            message: err.to_string(),
        }
    }
}

// =============================================================================
// Job Spec
// =============================================================================

/// Job specification as it crosses the wire.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct WireJobSpec {
    pub command: String,
    #[serde(default)]
    pub arguments: Vec<String>,
    /// Empty means inherit the server's filesystem view.
    #[serde(default)]
    pub root_dir: String,
    #[serde(default)]
    pub isolate_network: bool,
    #[serde(default)]
    pub resources: WireResources,
}

/// Resource limits as they cross the wire. Zero = unconstrained.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct WireResources {
    #[serde(default)]
    pub milli_cpu: u32,
    #[serde(default)]
    pub memory: u64,
    #[serde(default)]
    pub max_processes: u32,
    #[serde(default)]
    pub io_limits: Vec<WireDiskIoLimit>,
}

/// A disk I/O throttle naming its device by path.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct WireDiskIoLimit {
    pub device: String,
    #[serde(default)]
    pub read_bps: u64,
    #[serde(default)]
    pub write_bps: u64,
    #[serde(default)]
    pub read_iops: u32,
    #[serde(default)]
    pub write_iops: u32,
}

impl TryFrom<WireJobSpec> for JobSpec {
    type Error = Error;

    /// Validates a wire spec, resolving device paths to major/minor
    /// numbers. Fails with a configuration error on an unresolvable or
    /// non-block device.
    fn try_from(wire: WireJobSpec) -> Result<JobSpec> {
        let mut io_limits = Vec::with_capacity(wire.resources.io_limits.len());
        for lim in wire.resources.io_limits {
            let (major, minor) = DiskIoLimit::resolve_device(&lim.device)?;
            io_limits.push(DiskIoLimit {
                major,
                minor,
                read_bps: lim.read_bps,
                write_bps: lim.write_bps,
                read_iops: lim.read_iops,
                write_iops: lim.write_iops,
            });
        }

        Ok(JobSpec {
            command: wire.command,
            args: wire.arguments,
            root_dir: if wire.root_dir.is_empty() {
                None
            } else {
                Some(wire.root_dir.into())
            },
            isolate_network: wire.isolate_network,
            resources: ResourceLimits {
                milli_cpu: wire.resources.milli_cpu,
                memory_bytes: wire.resources.memory,
                max_processes: wire.resources.max_processes,
                io_limits,
            },
        })
    }
}

impl From<&JobSpec> for WireJobSpec {
    /// Echoes an accepted spec back onto the wire. Resolved devices are
    /// rendered as `major:minor`.
    fn from(spec: &JobSpec) -> Self {
        WireJobSpec {
            command: spec.command.clone(),
            arguments: spec.args.clone(),
            root_dir: spec
                .root_dir
                .as_ref()
                .map(|p| p.display().to_string())
                .unwrap_or_default(),
            isolate_network: spec.isolate_network,
            resources: WireResources {
                milli_cpu: spec.resources.milli_cpu,
                memory: spec.resources.memory_bytes,
                max_processes: spec.resources.max_processes,
                io_limits: spec
                    .resources
                    .io_limits
                    .iter()
                    .map(|lim| WireDiskIoLimit {
                        device: format!("{}:{}", lim.major, lim.minor),
                        read_bps: lim.read_bps,
                        write_bps: lim.write_bps,
                        read_iops: lim.read_iops,
                        write_iops: lim.write_iops,
                    })
                    .collect(),
            },
        }
    }
}

// =============================================================================
// Job Status
// =============================================================================

/// Job state as it crosses the wire. `Invalid` is the unset value and
/// never describes a tracked job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum WireJobState {
    Invalid,
    Running,
    Completed,
}

/// Job status as it crosses the wire.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WireJobStatus {
    pub job_id: Vec<u8>,
    pub start_time: Option<DateTime<Utc>>,
    pub user: String,
    pub state: WireJobState,
    /// Exit code masked to the low 8 bits; meaningful once `Completed`.
    pub exit_code: u32,
    /// Echo of the accepted spec.
    pub spec: Option<WireJobSpec>,
}

impl From<&JobSnapshot> for WireJobStatus {
    fn from(snap: &JobSnapshot) -> Self {
        let state = match snap.status.state {
            // Pre-start jobs are never tracked, so this should not appear.
            JobState::PreStart => WireJobState::Invalid,
            JobState::Running => WireJobState::Running,
            JobState::Completed => WireJobState::Completed,
        };
        WireJobStatus {
            job_id: snap.id.clone().into_bytes(),
            start_time: snap.status.start_time,
            user: snap.status.owner.clone(),
            state,
            exit_code: snap.status.exit_code,
            spec: Some(WireJobSpec::from(&snap.spec)),
        }
    }
}

/// Decodes a wire job id. Generated ids are always ASCII, so a non-UTF-8
/// id can only be one the tracker never issued.
pub fn job_id_from_bytes(job_id: &[u8]) -> Result<String> {
    std::str::from_utf8(job_id)
        .map(str::to_owned)
        .map_err(|_| Error::UnknownJob(String::from_utf8_lossy(job_id).into_owned()))
}
