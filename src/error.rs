use std::path::PathBuf;

use thiserror::Error;

/// Everything that can go wrong while orchestrating a run.
#[derive(Debug, Error)]
pub enum FanoutError {
    #[error("Config error: {0}")]
    Config(String),

    /// The scheduler binary or service cannot be reached. Never retried.
    #[error("Scheduler backend unavailable ({program}): {message}")]
    BackendUnavailable { program: String, message: String },

    /// A scheduler command exited non-zero after all retries.
    #[error("Scheduler command `{command}` failed with status {status}: {}", .stderr.trim())]
    Command {
        command: String,
        status: i32,
        stdout: String,
        stderr: String,
    },

    #[error("Could not parse scheduler output: {0}")]
    Parse(String),

    #[error("Resource not found: {0}")]
    ResourceNotFound(String),

    #[error("Content store layout error at {path}: {message}")]
    StorageLayout { path: PathBuf, message: String },

    #[error("Straggler sub-tasks {indexes:?} missed the {deadline_ms}ms deadline")]
    StragglerDetected { indexes: Vec<usize>, deadline_ms: u64 },

    #[error("Sub-task {index} (job {job_id}) finished as {state}")]
    SubTaskFailed {
        index: usize,
        job_id: String,
        state: String,
        diagnostic: Option<String>,
    },

    #[error("Merge failed: {0}")]
    Merge(String),

    #[error("Invalid transition from {from} to {to}")]
    InvalidTransition { from: String, to: String },

    #[error("Queue watcher halted: {0}")]
    WatcherHalted(String),

    #[error("Store error: {0}")]
    Store(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("TOML parse error: {0}")]
    Toml(#[from] toml::de::Error),

    #[error("Directory walk error: {0}")]
    Walk(#[from] walkdir::Error),
}

pub type Result<T, E = FanoutError> = std::result::Result<T, E>;

/// Coarse classification of a [`FanoutError`], surfaced to callers of a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum ErrorKind {
    BackendUnavailable,
    CommandError,
    ResourceNotFound,
    StorageLayout,
    StragglerDetected,
    SubTaskFailed,
    Merge,
    InvalidTransition,
    Config,
    Parse,
    Io,
    Store,
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            ErrorKind::BackendUnavailable => "BackendUnavailable",
            ErrorKind::CommandError => "CommandError",
            ErrorKind::ResourceNotFound => "ResourceNotFoundError",
            ErrorKind::StorageLayout => "StorageLayoutError",
            ErrorKind::StragglerDetected => "StragglerDetected",
            ErrorKind::SubTaskFailed => "SubTaskFailed",
            ErrorKind::Merge => "MergeError",
            ErrorKind::InvalidTransition => "InvalidTransition",
            ErrorKind::Config => "ConfigError",
            ErrorKind::Parse => "ParseError",
            ErrorKind::Io => "IoError",
            ErrorKind::Store => "StoreError",
        };
        f.write_str(name)
    }
}

impl FanoutError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            FanoutError::Config(_) | FanoutError::Toml(_) => ErrorKind::Config,
            FanoutError::BackendUnavailable { .. } | FanoutError::WatcherHalted(_) => {
                ErrorKind::BackendUnavailable
            }
            FanoutError::Command { .. } => ErrorKind::CommandError,
            FanoutError::Parse(_) => ErrorKind::Parse,
            FanoutError::ResourceNotFound(_) => ErrorKind::ResourceNotFound,
            FanoutError::StorageLayout { .. } => ErrorKind::StorageLayout,
            FanoutError::StragglerDetected { .. } => ErrorKind::StragglerDetected,
            FanoutError::SubTaskFailed { .. } => ErrorKind::SubTaskFailed,
            FanoutError::Merge(_) => ErrorKind::Merge,
            FanoutError::InvalidTransition { .. } => ErrorKind::InvalidTransition,
            FanoutError::Store(_) | FanoutError::Json(_) => ErrorKind::Store,
            FanoutError::Io(_) | FanoutError::Walk(_) => ErrorKind::Io,
        }
    }

    /// Last diagnostic text captured from the backend, if the error carries one.
    pub fn diagnostic(&self) -> Option<&str> {
        match self {
            FanoutError::Command { stdout, stderr, .. } => {
                if stderr.trim().is_empty() {
                    Some(stdout.trim())
                } else {
                    Some(stderr.trim())
                }
            }
            FanoutError::BackendUnavailable { message, .. } => Some(message),
            FanoutError::WatcherHalted(message) => Some(message),
            FanoutError::SubTaskFailed { diagnostic, .. } => diagnostic.as_deref(),
            _ => None,
        }
    }

    /// Whether a scheduler command should be attempted again after this error:
    /// non-zero exits and transient spawn failures. A missing backend is not.
    pub fn is_retryable(&self) -> bool {
        match self {
            FanoutError::Command { .. } => true,
            FanoutError::Io(e) => matches!(
                e.kind(),
                std::io::ErrorKind::Interrupted
                    | std::io::ErrorKind::TimedOut
                    | std::io::ErrorKind::WouldBlock
            ),
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn command_error_exposes_stderr_as_diagnostic() {
        let err = FanoutError::Command {
            command: "sbatch run.sh".into(),
            status: 1,
            stdout: String::new(),
            stderr: "sbatch: error: Batch job submission failed\n".into(),
        };
        assert_eq!(err.kind(), ErrorKind::CommandError);
        assert_eq!(
            err.diagnostic(),
            Some("sbatch: error: Batch job submission failed")
        );
        assert!(err.is_retryable());
        assert_eq!(
            err.to_string(),
            "Scheduler command `sbatch run.sh` failed with status 1: sbatch: error: Batch job submission failed"
        );
    }

    #[test]
    fn backend_unavailable_is_not_retryable() {
        let err = FanoutError::BackendUnavailable {
            program: "squeue".into(),
            message: "No such file or directory".into(),
        };
        assert_eq!(err.kind(), ErrorKind::BackendUnavailable);
        assert!(!err.is_retryable());
    }

    #[test]
    fn transient_io_is_retryable() {
        let timed_out = FanoutError::Io(std::io::Error::from(std::io::ErrorKind::TimedOut));
        assert!(timed_out.is_retryable());
        let denied = FanoutError::Io(std::io::Error::from(std::io::ErrorKind::InvalidInput));
        assert!(!denied.is_retryable());
        assert!(!FanoutError::Parse("x".into()).is_retryable());
    }

    #[test]
    fn failed_sub_task_carries_backend_diagnostic() {
        let err = FanoutError::SubTaskFailed {
            index: 1,
            job_id: "101".into(),
            state: "FAILED".into(),
            diagnostic: Some("JobState=FAILED Reason=NonZeroExitCode ExitCode=1:0".into()),
        };
        assert_eq!(
            err.diagnostic(),
            Some("JobState=FAILED Reason=NonZeroExitCode ExitCode=1:0")
        );
        assert_eq!(err.to_string(), "Sub-task 1 (job 101) finished as FAILED");
    }

    #[test]
    fn straggler_display() {
        let err = FanoutError::StragglerDetected {
            indexes: vec![9],
            deadline_ms: 40_500,
        };
        assert_eq!(err.kind().to_string(), "StragglerDetected");
        assert_eq!(
            err.to_string(),
            "Straggler sub-tasks [9] missed the 40500ms deadline"
        );
    }

    #[test]
    fn error_is_send_sync() {
        fn assert_send_sync<T: Send + Sync>() {}
        assert_send_sync::<FanoutError>();
    }
}
