//! # jobd
//!
//! **Remote Job Runner**
//!
//! This crate is the server side of a remote job runner: authenticated
//! callers submit arbitrary Linux programs, which run under namespace and
//! cgroup-v2 isolation while their combined output is recorded and fanned
//! out to any number of concurrent log subscribers in real time.
//!
//! # Architecture Overview
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────┐
//! │                             jobd                                 │
//! ├──────────────────────────────────────────────────────────────────┤
//! │  server ── mTLS accept loop, peer CN = caller identity           │
//! │     │                                                            │
//! │  service ── one RPC per connection, framed JSON                  │
//! │     │       Run / Stop / Status / List / Logs / Shutdown         │
//! │     ▼                                                            │
//! │  tracker ── id allocation, owner/admin authorization             │
//! │     │                                                            │
//! │     ▼                                                            │
//! │  job ── PreStart → Running → Completed, reaper, stop escalation  │
//! │   │   │                                                          │
//! │   │   └── fanout ── append-only record buffer, N subscribers     │
//! │   ▼                                                              │
//! │  launcher ── clone(2) into fresh namespaces, re-exec `jobd runc` │
//! │   │                                                              │
//! │   └── cgroup ── /sys/fs/cgroup/jobber/<id>, cpu/memory/pids/io   │
//! └──────────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Job Lifecycle
//!
//! ```text
//!   ┌──────────┐   start    ┌─────────┐    reap    ┌───────────┐
//!   │ PreStart │ ─────────► │ Running │ ─────────► │ Completed │
//!   └──────────┘            └─────────┘            └───────────┘
//!        │                       │                       │
//!        │ launch failed:        │ stop: SIGTERM,        │ replayable
//!        │ never tracked         │ 10 s, SIGKILL         │ until cleanup
//! ```
//!
//! # Security Model
//!
//! - **Identity**: TLS 1.3 mutual authentication; the caller is the
//!   Common Name of its verified certificate. No certificate, wrong CA,
//!   or empty CN rejects the connection.
//! - **Authorization**: callers operate on jobs they own; identities in
//!   the configured admin set operate on any job.
//! - **Isolation**: each job runs in fresh UTS, PID and mount namespaces
//!   (plus a network namespace on request), inside its own cgroup with
//!   CPU, memory, process-count and disk-I/O limits.
//!
//! # Requirements
//!
//! Linux with the cgroups-v2 unified hierarchy mounted at
//! `/sys/fs/cgroup`, and `CAP_SYS_ADMIN` for the namespace and mount
//! operations. State is in-memory only and lost on restart.

pub mod cgroup;
pub mod codec;
pub mod constants;
pub mod error;
pub mod fanout;
pub mod job;
pub mod launcher;
pub mod server;
pub mod service;
pub mod spec;
pub mod tls;
pub mod tracker;
pub mod wire;

pub use error::{Error, Result};
pub use fanout::LogRecord;
pub use job::{JobSnapshot, JobState, JobStatus};
pub use launcher::{Launcher, LaunchedJob, ReexecLauncher};
pub use spec::{DiskIoLimit, JobSpec, ResourceLimits};
pub use tracker::{CallContext, Tracker};
