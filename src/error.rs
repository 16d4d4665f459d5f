//! Error types for the job runner.

/// Result type alias for job runner operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur while tracking and running jobs.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    // =========================================================================
    // Authorization Errors
    // =========================================================================
    /// Caller has no identity, or is neither the job's owner nor an admin.
    #[error("unauthorized")]
    Unauthorized,

    // =========================================================================
    // Job Lifecycle Errors
    // =========================================================================
    /// No job with the given id is tracked.
    #[error("unknown job: {0}")]
    UnknownJob(String),

    /// The job spec has an empty command.
    #[error("missing job command")]
    NoCommand,

    /// `start` was called on a job that is not in the pre-start state.
    #[error("job already started: {0}")]
    AlreadyStarted(String),

    /// The container child failed during setup, before exec.
    ///
    /// Carries the diagnostic the child wrote to its setup-error pipe.
    /// A job that fails this way is never tracked.
    #[error("could not start job: {reason}")]
    Launch { reason: String },

    // =========================================================================
    // Configuration Errors
    // =========================================================================
    /// A cgroup control file write was rejected, a device could not be
    /// resolved, or a limit string was malformed.
    #[error("configuration error: {reason}")]
    Config { reason: String },

    // =========================================================================
    // Transport Errors
    // =========================================================================
    /// A wire frame could not be decoded, or exceeded the frame size cap.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// TLS setup or peer identity extraction failed.
    #[error("TLS error: {0}")]
    Tls(String),

    // =========================================================================
    // I/O Errors
    // =========================================================================
    /// Generic I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    // =========================================================================
    // Internal Errors
    // =========================================================================
    /// Internal error (should not happen).
    #[error("internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Shorthand for [`Error::Config`] with a formatted reason.
    pub fn config(reason: impl Into<String>) -> Self {
        Self::Config {
            reason: reason.into(),
        }
    }
}
