//! A single job: one execution from launch to reap.
//!
//! The job owns the process handle, the status fields and the fan-out
//! engine for its output. Status fields live under one mutex; anything
//! that blocks — waiting for the launch, for exit, for a subscriber —
//! happens with the mutex released.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use chrono::{DateTime, Utc};
use nix::sys::signal::{kill, Signal};
use nix::sys::wait::{waitpid, WaitStatus};
use nix::unistd::Pid;
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::cgroup;
use crate::constants::{INGEST_CHANNEL_CAPACITY, STOP_GRACE};
use crate::error::{Error, Result};
use crate::fanout::{self, FanoutHandle, LogRecord};
use crate::launcher::Launcher;
use crate::spec::JobSpec;

// =============================================================================
// Job State
// =============================================================================

/// Lifecycle state of a job. Transitions are monotonic:
/// `PreStart → Running → Completed`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum JobState {
    /// Constructed but not launched.
    PreStart,
    /// The target process has exec'd and not yet been reaped.
    Running,
    /// The process exited and was reaped.
    Completed,
}

impl std::fmt::Display for JobState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::PreStart => write!(f, "pre-start"),
            Self::Running => write!(f, "running"),
            Self::Completed => write!(f, "completed"),
        }
    }
}

/// Mutable status of a job.
#[derive(Debug, Clone)]
pub struct JobStatus {
    /// When the job was launched. `None` before start.
    pub start_time: Option<DateTime<Utc>>,
    /// Identity that started the job.
    pub owner: String,
    /// Lifecycle state.
    pub state: JobState,
    /// Exit code masked to the low 8 bits; valid once `Completed`.
    pub exit_code: u32,
    /// Signal that terminated the process, when there was one.
    pub signal: Option<i32>,
    /// Failure reason recorded by the reaper, if any.
    pub exit_error: Option<String>,
}

impl Default for JobStatus {
    fn default() -> Self {
        Self {
            start_time: None,
            owner: String::new(),
            state: JobState::PreStart,
            exit_code: 0,
            signal: None,
            exit_error: None,
        }
    }
}

/// Point-in-time copy of a job handed to callers. Not a live handle.
#[derive(Debug, Clone)]
pub struct JobSnapshot {
    /// The job's id.
    pub id: String,
    /// The spec the job was launched with.
    pub spec: JobSpec,
    /// Status at snapshot time.
    pub status: JobStatus,
}

// =============================================================================
// Job
// =============================================================================

struct JobInner {
    status: JobStatus,
    /// Guards against concurrent `start` while the launch is in flight
    /// and the state is still `PreStart`.
    starting: bool,
    child: Option<Pid>,
    fanout: Option<FanoutHandle>,
}

/// One tracked execution.
pub struct Job {
    id: String,
    spec: JobSpec,
    inner: Mutex<JobInner>,
    reaped_tx: Arc<watch::Sender<bool>>,
    reaped_rx: watch::Receiver<bool>,
    shutdown: CancellationToken,
}

impl Job {
    /// Creates a job in the pre-start state.
    pub fn new(id: String, spec: JobSpec) -> Self {
        let (reaped_tx, reaped_rx) = watch::channel(false);
        Self {
            id,
            spec,
            inner: Mutex::new(JobInner {
                status: JobStatus::default(),
                starting: false,
                child: None,
                fanout: None,
            }),
            reaped_tx: Arc::new(reaped_tx),
            reaped_rx,
            shutdown: CancellationToken::new(),
        }
    }

    /// Returns the job's id.
    pub fn id(&self) -> &str {
        &self.id
    }

    fn lock(&self) -> MutexGuard<'_, JobInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Launches the job on behalf of `owner`.
    ///
    /// On success the job is `Running`, its output is being recorded, and
    /// a reaper is waiting on the child. On launch failure the job stays
    /// `PreStart` and the error carries the child's setup diagnostic; the
    /// caller discards the job.
    pub async fn start(
        self: Arc<Self>,
        owner: String,
        launcher: Arc<dyn Launcher>,
    ) -> Result<()> {
        {
            let mut inner = self.lock();
            if inner.starting || inner.status.state != JobState::PreStart {
                return Err(Error::AlreadyStarted(self.id.clone()));
            }
            inner.starting = true;
        }

        let launched = match launcher.launch(&self.id, &self.spec).await {
            Ok(launched) => launched,
            Err(e) => {
                self.lock().starting = false;
                return Err(e);
            }
        };

        let (records_tx, records_rx) = mpsc::channel(INGEST_CHANNEL_CAPACITY);
        let fanout = fanout::spawn(records_rx, self.shutdown.clone());

        {
            let mut inner = self.lock();
            inner.status.owner = owner;
            inner.status.start_time = Some(Utc::now());
            inner.status.state = JobState::Running;
            inner.child = Some(launched.pid);
            inner.fanout = Some(fanout);
        }
        info!(job = %self.id, pid = launched.pid.as_raw(), "job started");

        let output = launched.output;
        tokio::task::spawn_blocking(move || fanout::ingest(output, records_tx));

        let pid = launched.pid;
        tokio::spawn(async move { self.reap(pid).await });

        Ok(())
    }

    /// Waits for the child, records its exit, and releases its cgroup.
    async fn reap(&self, pid: Pid) {
        let status = tokio::task::spawn_blocking(move || waitpid(pid, None)).await;

        {
            let mut inner = self.lock();
            match status {
                Ok(Ok(WaitStatus::Exited(_, code))) => {
                    // Mask to the low 8 bits, matching what the kernel
                    // reports to a shell.
                    inner.status.exit_code = (code as u32) & 0xff;
                    if code != 0 {
                        inner.status.exit_error = Some(format!("exited with code {code}"));
                    }
                }
                Ok(Ok(WaitStatus::Signaled(_, signal, _))) => {
                    inner.status.exit_code = 0xff;
                    inner.status.signal = Some(signal as i32);
                    inner.status.exit_error = Some(format!("terminated by {signal}"));
                }
                Ok(Ok(other)) => {
                    inner.status.exit_error = Some(format!("unexpected wait status: {other:?}"));
                }
                Ok(Err(e)) => {
                    inner.status.exit_error = Some(format!("could not reap job process: {e}"));
                }
                Err(e) => {
                    inner.status.exit_error = Some(format!("reaper task failed: {e}"));
                }
            }
            inner.status.state = JobState::Completed;
            debug!(
                job = %self.id,
                exit_code = inner.status.exit_code,
                "job reaped"
            );
        }

        let _ = self.reaped_tx.send(true);

        // The child exec'd, so nothing on its side outlives it to clean
        // this up; the cgroup is ours to remove.
        cgroup::remove(&self.id);
    }

    /// Stops a running job: SIGTERM, then SIGKILL after [`STOP_GRACE`].
    ///
    /// Returns when the reaper has observed the exit or when `cancel`
    /// fires, whichever comes first. A no-op on a completed job.
    pub async fn stop(&self, cancel: &CancellationToken) -> Result<()> {
        let pid = {
            let inner = self.lock();
            match (inner.status.state, inner.child) {
                (JobState::Running, Some(pid)) => pid,
                _ => return Ok(()),
            }
        };

        // ESRCH here just means the child beat us to the exit; the reaper
        // settles the status either way.
        if let Err(e) = kill(pid, Signal::SIGTERM) {
            debug!(job = %self.id, error = %e, "SIGTERM delivery failed");
        }

        let mut reaped = self.reaped_rx.clone();
        tokio::select! {
            _ = cancel.cancelled() => return Ok(()),
            timed = tokio::time::timeout(STOP_GRACE, async { let _ = reaped.wait_for(|done| *done).await; }) => {
                if timed.is_err() {
                    warn!(job = %self.id, "grace period expired, sending SIGKILL");
                    if let Err(e) = kill(pid, Signal::SIGKILL) {
                        debug!(job = %self.id, error = %e, "SIGKILL delivery failed");
                    }
                    let mut reaped = self.reaped_rx.clone();
                    tokio::select! {
                        _ = cancel.cancelled() => {}
                        _ = reaped.wait_for(|done| *done) => {}
                    }
                }
            }
        }
        Ok(())
    }

    /// Returns a point-in-time copy of the job's id, spec and status.
    pub fn snapshot(&self) -> JobSnapshot {
        let inner = self.lock();
        JobSnapshot {
            id: self.id.clone(),
            spec: self.spec.clone(),
            status: inner.status.clone(),
        }
    }

    /// Returns the identity that started the job.
    pub fn owner(&self) -> String {
        self.lock().status.owner.clone()
    }

    /// Attaches a log subscriber. Permitted in any state: a completed
    /// job's buffer replays in full.
    pub async fn subscribe(
        &self,
        follow: bool,
        cancel: CancellationToken,
    ) -> mpsc::Receiver<LogRecord> {
        let fanout = self.lock().fanout.clone();
        match fanout {
            Some(fanout) => fanout.subscribe(follow, cancel).await,
            None => {
                // Never started, or already cleaned up: an empty, closed
                // stream.
                let (_tx, rx) = mpsc::channel(1);
                rx
            }
        }
    }

    /// Shuts down the fan-out engine and refuses new subscriptions.
    /// Called once, when the job is removed from tracking.
    pub fn cleanup(&self) {
        self.lock().fanout = None;
        self.shutdown.cancel();
    }
}

impl std::fmt::Debug for Job {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Job")
            .field("id", &self.id)
            .field("spec", &self.spec)
            .finish_non_exhaustive()
    }
}
