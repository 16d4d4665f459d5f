//! Constants for the job runner.
//!
//! All limits, timeouts, and paths are defined here to ensure
//! consistency and prevent magic numbers throughout the codebase.

use std::time::Duration;

// =============================================================================
// Cgroup Paths
// =============================================================================

/// Parent cgroup directory for all jobs (cgroups-v2 unified hierarchy).
pub const CGROUP_ROOT: &str = "/sys/fs/cgroup/jobber";

/// Controllers enabled in the parent cgroup's `cgroup.subtree_control`.
pub const CGROUP_CONTROLLERS: &str = "+cpu +cpuset +io +memory +pids";

// =============================================================================
// Log Records
// =============================================================================

/// Maximum length of a single log record line (bytes).
/// Longer runs without a newline are chunked at this boundary.
pub const MAX_LINE_BYTES: usize = 512;

// =============================================================================
// Timeouts
// =============================================================================

/// Grace period between SIGTERM and SIGKILL when stopping a job.
pub const STOP_GRACE: Duration = Duration::from_secs(10);

// =============================================================================
// ID Allocation
// =============================================================================

/// Maximum attempts to allocate a unique job id before giving up.
pub const ID_ALLOC_MAX_RETRIES: u32 = 32;

// =============================================================================
// Channel Capacities
// =============================================================================

/// Capacity of the ingest channel between the output reader and the
/// fan-out loop.
pub const INGEST_CHANNEL_CAPACITY: usize = 256;

/// Capacity of the fan-out loop's attach-request channel.
pub const ATTACH_CHANNEL_CAPACITY: usize = 16;

/// Capacity of each subscriber's delivery channel.
pub const SUBSCRIBER_CHANNEL_CAPACITY: usize = 64;

// =============================================================================
// Wire Protocol
// =============================================================================

/// Maximum size of a single wire frame (1 MiB).
/// Prevents memory exhaustion from a hostile length prefix.
pub const MAX_FRAME_SIZE: usize = 1024 * 1024;

// =============================================================================
// Launcher
// =============================================================================

/// Stack size for the cloned container child (256 KiB).
/// The child only redirects descriptors and execs, so this is generous.
pub const CHILD_STACK_SIZE: usize = 256 * 1024;
