//! Job specifications and resource limits.
//!
//! A [`JobSpec`] is immutable after construction and describes everything
//! needed to launch one job: the target command, its arguments, the optional
//! root directory, network isolation, and the cgroup resource limits.
//!
//! [`DiskIoLimit`] carries a device as resolved `(major, minor)` numbers.
//! Operators may name a device by filesystem path; the path is resolved by
//! stat'ing it and verifying it is a block-special file before any limit is
//! written.

use std::path::{Path, PathBuf};
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

// =============================================================================
// Job Spec
// =============================================================================

/// Everything needed to launch one job. Immutable after construction.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobSpec {
    /// Absolute path of the program to execute.
    pub command: String,
    /// Arguments to the program (argv[1..]).
    pub args: Vec<String>,
    /// Root directory to chroot into. `None` inherits the server's
    /// filesystem view.
    pub root_dir: Option<PathBuf>,
    /// Run the job in a fresh network namespace (loopback only, down).
    pub isolate_network: bool,
    /// Cgroup resource limits.
    pub resources: ResourceLimits,
}

impl JobSpec {
    /// Returns the basename of the command, used as the job id prefix and
    /// as argv[0] of the target process.
    pub fn basename(&self) -> &str {
        Path::new(&self.command)
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or(&self.command)
    }
}

// =============================================================================
// Resource Limits
// =============================================================================

/// Cgroup-v2 resource limits for one job.
///
/// A value of 0 in any scalar field means "do not constrain".
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceLimits {
    /// CPU bandwidth in milli-CPUs; 1000 = one full core.
    pub milli_cpu: u32,
    /// Memory ceiling in bytes.
    pub memory_bytes: u64,
    /// Maximum number of processes.
    pub max_processes: u32,
    /// Per-device disk I/O throttles.
    pub io_limits: Vec<DiskIoLimit>,
}

// =============================================================================
// Disk I/O Limits
// =============================================================================

/// Disk I/O throttles for one block device.
///
/// A zero in any throttle field leaves that throttle unset.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiskIoLimit {
    /// Device major number.
    pub major: u32,
    /// Device minor number.
    pub minor: u32,
    /// Read bandwidth cap (bytes per second).
    pub read_bps: u64,
    /// Write bandwidth cap (bytes per second).
    pub write_bps: u64,
    /// Read operations per second cap.
    pub read_iops: u32,
    /// Write operations per second cap.
    pub write_iops: u32,
}

impl DiskIoLimit {
    /// Resolves a device path to `(major, minor)` numbers.
    ///
    /// The path must exist and be a block-special file.
    pub fn resolve_device(path: &str) -> Result<(u32, u32)> {
        let st = nix::sys::stat::stat(path)
            .map_err(|e| Error::config(format!("could not stat {path}: {e}")))?;
        if st.st_mode & libc::S_IFMT != libc::S_IFBLK {
            return Err(Error::config(format!("not a block device: {path}")));
        }
        let dev = st.st_rdev;
        Ok((
            nix::sys::stat::major(dev) as u32,
            nix::sys::stat::minor(dev) as u32,
        ))
    }

    /// Formats the line written to the cgroup `io.max` control file.
    ///
    /// Zero throttles are omitted; a `major:minor` with no parameters is
    /// valid and ignored by the kernel.
    pub fn cgroup_line(&self) -> String {
        let mut vals = Vec::new();
        if self.read_bps != 0 {
            vals.push(format!("rbps={}", self.read_bps));
        }
        if self.write_bps != 0 {
            vals.push(format!("wbps={}", self.write_bps));
        }
        if self.read_iops != 0 {
            vals.push(format!("riops={}", self.read_iops));
        }
        if self.write_iops != 0 {
            vals.push(format!("wiops={}", self.write_iops));
        }
        format!("{}:{} {}", self.major, self.minor, vals.join(" "))
    }
}

/// The six-integer colon form used on the re-exec command line:
/// `major:minor:rbps:wbps:riops:wiops`, empty field = 0.
impl std::fmt::Display for DiskIoLimit {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{}:{}:{}:{}:{}:{}",
            self.major, self.minor, self.read_bps, self.write_bps, self.read_iops, self.write_iops
        )
    }
}

impl FromStr for DiskIoLimit {
    type Err = Error;

    /// Parses the colon-separated text form.
    ///
    /// Six fields are `major:minor:rbps:wbps:riops:wiops` directly. Five
    /// fields name a block device by path in the first field, which is
    /// resolved by stat. Throttle fields may be empty, which parses as 0.
    fn from_str(s: &str) -> Result<Self> {
        fn val<T: FromStr<Err = std::num::ParseIntError>>(
            field: &str,
            name: &str,
            zero: T,
        ) -> Result<T> {
            if field.is_empty() {
                return Ok(zero);
            }
            field
                .parse()
                .map_err(|e| Error::config(format!("could not parse {name} {field}: {e}")))
        }

        let parts: Vec<&str> = s.split(':').collect();
        let (major, minor, rest): (u32, u32, &[&str]) = match parts.len() {
            5 => {
                let (major, minor) = Self::resolve_device(parts[0])?;
                (major, minor, &parts[1..])
            }
            6 => (
                val(parts[0], "major", 0)?,
                val(parts[1], "minor", 0)?,
                &parts[2..],
            ),
            _ => return Err(Error::config(format!("wrong number of fields in {s:?}"))),
        };

        Ok(DiskIoLimit {
            major,
            minor,
            read_bps: val(rest[0], "read bps", 0)?,
            write_bps: val(rest[1], "write bps", 0)?,
            read_iops: val(rest[2], "read iops", 0)?,
            write_iops: val(rest[3], "write iops", 0)?,
        })
    }
}
