//! The job tracker: the collection of live and completed jobs.
//!
//! Every caller-facing operation authenticates and authorizes here. A
//! caller may operate on a job it owns; identities in the admin set may
//! operate on any job. The jobs map lives under one mutex, held only to
//! locate and mutate membership — launches, stops and subscription waits
//! all happen with it released.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::constants::ID_ALLOC_MAX_RETRIES;
use crate::error::{Error, Result};
use crate::fanout::LogRecord;
use crate::job::{Job, JobSnapshot, JobState};
use crate::launcher::Launcher;
use crate::spec::JobSpec;

// =============================================================================
// Call Context
// =============================================================================

/// Per-call context: the authenticated identity and a cancellation signal
/// tied to the caller (client disconnect, stream teardown).
#[derive(Debug, Clone)]
pub struct CallContext {
    identity: Option<String>,
    /// Fires when the caller abandons the call.
    pub cancel: CancellationToken,
}

impl CallContext {
    /// Creates a context for an authenticated caller.
    pub fn new(identity: impl Into<String>, cancel: CancellationToken) -> Self {
        Self {
            identity: Some(identity.into()),
            cancel,
        }
    }

    /// Creates a context with no identity. Every authorized operation
    /// fails on it.
    pub fn anonymous() -> Self {
        Self {
            identity: None,
            cancel: CancellationToken::new(),
        }
    }

    /// Returns the caller's identity, or `Unauthorized` when there is
    /// none.
    pub fn identity(&self) -> Result<&str> {
        self.identity.as_deref().ok_or(Error::Unauthorized)
    }
}

// =============================================================================
// Tracker
// =============================================================================

struct JobTable {
    jobs: HashMap<String, Arc<Job>>,
    /// Ids handed out for launches still in flight. Keeps concurrent
    /// starts from colliding without exposing unlaunched jobs.
    reserved: HashSet<String>,
}

/// Tracks jobs by id and dispatches operations on them.
pub struct Tracker {
    launcher: Arc<dyn Launcher>,
    admins: HashSet<String>,
    table: Mutex<JobTable>,
}

impl Tracker {
    /// Creates a tracker that launches jobs with `launcher`. Identities
    /// in `admins` may operate on any job.
    pub fn new(launcher: Arc<dyn Launcher>, admins: impl IntoIterator<Item = String>) -> Self {
        Self {
            launcher,
            admins: admins.into_iter().collect(),
            table: Mutex::new(JobTable {
                jobs: HashMap::new(),
                reserved: HashSet::new(),
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, JobTable> {
        self.table.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn find(&self, id: &str) -> Result<Arc<Job>> {
        self.lock()
            .jobs
            .get(id)
            .cloned()
            .ok_or_else(|| Error::UnknownJob(id.to_string()))
    }

    /// Owner-or-admin check for operations on an existing job.
    fn authorize(&self, user: &str, job: &Job) -> Result<()> {
        if job.owner() == user || self.admins.contains(user) {
            Ok(())
        } else {
            Err(Error::Unauthorized)
        }
    }

    /// Allocates a fresh id of the form `<basename>-<8 hex digits>`,
    /// reserving it until the launch settles.
    fn allocate_id(&self, spec: &JobSpec) -> Result<String> {
        let base = spec.basename();
        let mut table = self.lock();
        for _ in 0..ID_ALLOC_MAX_RETRIES {
            let id = format!("{base}-{:08x}", rand::random::<u32>());
            if !table.jobs.contains_key(&id) && !table.reserved.contains(&id) {
                table.reserved.insert(id.clone());
                return Ok(id);
            }
        }
        Err(Error::config(format!(
            "could not allocate a unique id for {base}"
        )))
    }

    /// Starts a job from `spec`. The job is tracked only if the launch
    /// succeeds; the returned id is how the caller refers to it from now
    /// on.
    pub async fn start(&self, ctx: &CallContext, spec: JobSpec) -> Result<String> {
        let user = ctx.identity()?.to_owned();
        if spec.command.is_empty() {
            return Err(Error::NoCommand);
        }

        let id = self.allocate_id(&spec)?;
        let job = Arc::new(Job::new(id.clone(), spec));

        let started = Arc::clone(&job)
            .start(user.clone(), Arc::clone(&self.launcher))
            .await;
        let mut table = self.lock();
        table.reserved.remove(&id);
        match started {
            Ok(()) => {
                table.jobs.insert(id.clone(), job);
                Ok(id)
            }
            Err(e) => {
                // Don't track a job we couldn't start.
                warn!(job = %id, user = %user, error = %e, "launch failed");
                Err(e)
            }
        }
    }

    /// Stops the job identified by `id`, waiting for its exit unless the
    /// caller cancels. With `cleanup`, the job is also removed from
    /// tracking and its log buffer released.
    pub async fn stop(&self, ctx: &CallContext, id: &str, cleanup: bool) -> Result<()> {
        let user = ctx.identity()?;
        let job = self.find(id)?;
        self.authorize(user, &job)?;

        job.stop(&ctx.cancel).await?;

        if cleanup {
            if let Some(job) = self.lock().jobs.remove(id) {
                job.cleanup();
            }
        }
        Ok(())
    }

    /// Returns a status snapshot of the job identified by `id`.
    pub fn get(&self, ctx: &CallContext, id: &str) -> Result<JobSnapshot> {
        let user = ctx.identity()?;
        let job = self.find(id)?;
        self.authorize(user, &job)?;
        Ok(job.snapshot())
    }

    /// Lists jobs visible to the caller: its own, or every job when
    /// `all_jobs` is set and the caller is an admin. Completed jobs are
    /// filtered out unless `include_completed`.
    ///
    /// The result is ordered by start time, then id, so listings are
    /// deterministic.
    pub fn list(
        &self,
        ctx: &CallContext,
        include_completed: bool,
        all_jobs: bool,
    ) -> Result<Vec<JobSnapshot>> {
        let user = ctx.identity()?;
        let see_all = all_jobs && self.admins.contains(user);

        let jobs: Vec<Arc<Job>> = self.lock().jobs.values().cloned().collect();
        let mut snapshots: Vec<JobSnapshot> = jobs
            .iter()
            .map(|job| job.snapshot())
            .filter(|snap| see_all || snap.status.owner == user)
            .filter(|snap| include_completed || snap.status.state != JobState::Completed)
            .collect();

        snapshots.sort_by(|a, b| {
            a.status
                .start_time
                .cmp(&b.status.start_time)
                .then_with(|| a.id.cmp(&b.id))
        });
        Ok(snapshots)
    }

    /// Attaches a log subscriber to the job identified by `id`. The
    /// returned channel replays the recorded output from the start; with
    /// `follow` it keeps delivering until the job's stream ends, the
    /// caller cancels, or the job is cleaned up.
    pub async fn subscribe(
        &self,
        ctx: &CallContext,
        id: &str,
        follow: bool,
    ) -> Result<mpsc::Receiver<LogRecord>> {
        let user = ctx.identity()?;
        let job = self.find(id)?;
        self.authorize(user, &job)?;
        Ok(job.subscribe(follow, ctx.cancel.clone()).await)
    }

    /// Stops every running job and cleans up every tracked job. Returns
    /// how many were running at invocation. Admin only.
    pub async fn shutdown(&self, ctx: &CallContext) -> Result<u32> {
        let user = ctx.identity()?;
        if !self.admins.contains(user) {
            return Err(Error::Unauthorized);
        }

        let jobs: Vec<Arc<Job>> = {
            let mut table = self.lock();
            table.jobs.drain().map(|(_, job)| job).collect()
        };

        let mut num_running = 0u32;
        for job in &jobs {
            if job.snapshot().status.state == JobState::Running {
                num_running += 1;
                job.stop(&ctx.cancel).await.ok();
            }
        }
        for job in &jobs {
            job.cleanup();
        }

        info!(stopped = num_running, total = jobs.len(), "tracker shut down");
        Ok(num_running)
    }
}

impl std::fmt::Debug for Tracker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Tracker")
            .field("admins", &self.admins)
            .finish_non_exhaustive()
    }
}
