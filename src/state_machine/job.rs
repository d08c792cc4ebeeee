use std::path::PathBuf;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::state::RunState;
use crate::error::{FanoutError, Result};

/// Lifecycle of one sub-task. Completed, Failed and Cancelled are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SubTaskState {
    Pending,
    Submitted,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl SubTaskState {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            SubTaskState::Completed | SubTaskState::Failed | SubTaskState::Cancelled
        )
    }

    fn rank(self) -> u8 {
        match self {
            SubTaskState::Pending => 0,
            SubTaskState::Submitted => 1,
            SubTaskState::Running => 2,
            SubTaskState::Completed | SubTaskState::Failed | SubTaskState::Cancelled => 3,
        }
    }

    /// Whether `self -> next` moves strictly forward.
    pub fn can_advance_to(self, next: SubTaskState) -> bool {
        !self.is_terminal() && next.rank() > self.rank()
    }
}

impl std::fmt::Display for SubTaskState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SubTaskState::Pending => write!(f, "PENDING"),
            SubTaskState::Submitted => write!(f, "SUBMITTED"),
            SubTaskState::Running => write!(f, "RUNNING"),
            SubTaskState::Completed => write!(f, "COMPLETED"),
            SubTaskState::Failed => write!(f, "FAILED"),
            SubTaskState::Cancelled => write!(f, "CANCELLED"),
        }
    }
}

/// Configuration for retry behavior of scheduler commands.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    /// Maximum number of retries before the error is surfaced.
    pub max_retries: u32,
    /// Base delay in milliseconds for exponential backoff.
    pub base_delay_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay_ms: 1000,
        }
    }
}

impl RetryConfig {
    /// Calculate the delay for a given retry attempt using exponential backoff.
    /// delay = base_delay_ms * 2^(attempt - 1)
    pub fn delay_for_attempt(&self, attempt: u32) -> u64 {
        self.base_delay_ms
            .saturating_mul(2u64.saturating_pow(attempt.saturating_sub(1)))
    }
}

/// One of the N identical jobs of a run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubTask {
    pub index: usize,
    pub work_dir: PathBuf,
    pub backend_job_id: Option<String>,
    pub state: SubTaskState,
    pub elapsed: Option<Duration>,
    pub submitted_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl SubTask {
    pub fn new(index: usize, work_dir: PathBuf) -> Self {
        Self {
            index,
            work_dir,
            backend_job_id: None,
            state: SubTaskState::Pending,
            elapsed: None,
            submitted_at: None,
            completed_at: None,
        }
    }

    /// Moves the sub-task forward. Backward moves and moves out of a terminal
    /// state are rejected and leave the sub-task untouched.
    pub fn advance(&mut self, next: SubTaskState) -> Result<()> {
        if !self.state.can_advance_to(next) {
            return Err(FanoutError::InvalidTransition {
                from: self.state.to_string(),
                to: next.to_string(),
            });
        }
        self.state = next;
        if next.is_terminal() {
            self.completed_at = Some(Utc::now());
        }
        Ok(())
    }

    pub fn mark_submitted(&mut self, job_id: String) -> Result<()> {
        self.advance(SubTaskState::Submitted)?;
        self.backend_job_id = Some(job_id);
        self.submitted_at = Some(Utc::now());
        Ok(())
    }

    /// Records the terminal state reported by the scheduler.
    pub fn finish(&mut self, state: SubTaskState, elapsed: Duration) -> Result<()> {
        self.advance(state)?;
        self.elapsed = Some(elapsed);
        Ok(())
    }

    pub fn is_terminal(&self) -> bool {
        self.state.is_terminal()
    }
}

/// Summary produced when a run ends, printed by the CLI.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunSummary {
    pub run_id: String,
    pub hash: String,
    pub state: RunState,
    pub state_transitions: Vec<RunState>,
    pub sub_tasks: usize,
    pub completed: usize,
    pub failed: usize,
    pub cancelled: usize,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub duration_ms: i64,
}

impl RunSummary {
    pub fn new(
        run_id: &str,
        hash: &str,
        history: &[RunState],
        sub_tasks: &[SubTask],
        started_at: DateTime<Utc>,
    ) -> Self {
        let now = Utc::now();
        let count = |state: SubTaskState| sub_tasks.iter().filter(|s| s.state == state).count();
        Self {
            run_id: run_id.to_string(),
            hash: hash.to_string(),
            state: history.last().copied().unwrap_or(RunState::Created),
            state_transitions: history.to_vec(),
            sub_tasks: sub_tasks.len(),
            completed: count(SubTaskState::Completed),
            failed: count(SubTaskState::Failed),
            cancelled: count(SubTaskState::Cancelled),
            started_at,
            finished_at: now,
            duration_ms: (now - started_at).num_milliseconds(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sub_task() -> SubTask {
        SubTask::new(0, PathBuf::from("/tmp/run/sub-0000"))
    }

    #[test]
    fn sub_task_creation_defaults() {
        let task = sub_task();
        assert_eq!(task.state, SubTaskState::Pending);
        assert!(task.backend_job_id.is_none());
        assert!(task.submitted_at.is_none());
        assert!(!task.is_terminal());
    }

    #[test]
    fn forward_path_is_accepted() {
        let mut task = sub_task();
        task.mark_submitted("100".into()).unwrap();
        assert_eq!(task.backend_job_id.as_deref(), Some("100"));
        assert!(task.submitted_at.is_some());
        task.advance(SubTaskState::Running).unwrap();
        task.finish(SubTaskState::Completed, Duration::from_secs(12))
            .unwrap();
        assert!(task.is_terminal());
        assert_eq!(task.elapsed, Some(Duration::from_secs(12)));
        assert!(task.completed_at.is_some());
    }

    #[test]
    fn skipping_running_is_allowed() {
        let mut task = sub_task();
        task.mark_submitted("7".into()).unwrap();
        task.finish(SubTaskState::Failed, Duration::ZERO).unwrap();
        assert_eq!(task.state, SubTaskState::Failed);
    }

    #[test]
    fn terminal_states_are_never_left() {
        for terminal in [
            SubTaskState::Completed,
            SubTaskState::Failed,
            SubTaskState::Cancelled,
        ] {
            let mut task = sub_task();
            task.advance(terminal).unwrap();
            for next in [
                SubTaskState::Pending,
                SubTaskState::Submitted,
                SubTaskState::Running,
                SubTaskState::Completed,
                SubTaskState::Failed,
                SubTaskState::Cancelled,
            ] {
                assert!(task.advance(next).is_err(), "{terminal} -> {next}");
                assert_eq!(task.state, terminal);
            }
        }
    }

    #[test]
    fn backward_transition_is_rejected() {
        let mut task = sub_task();
        task.mark_submitted("1".into()).unwrap();
        task.advance(SubTaskState::Running).unwrap();
        let err = task.advance(SubTaskState::Submitted).unwrap_err();
        assert_eq!(
            err.to_string(),
            "Invalid transition from RUNNING to SUBMITTED"
        );
        assert_eq!(task.state, SubTaskState::Running);
    }

    #[test]
    fn retry_config_exponential_backoff() {
        let config = RetryConfig {
            max_retries: 5,
            base_delay_ms: 1000,
        };
        assert_eq!(config.delay_for_attempt(1), 1000);
        assert_eq!(config.delay_for_attempt(2), 2000);
        assert_eq!(config.delay_for_attempt(3), 4000);
        assert_eq!(config.delay_for_attempt(4), 8000);
    }

    #[test]
    fn run_summary_counts_states() {
        let mut done = sub_task();
        done.advance(SubTaskState::Completed).unwrap();
        let mut failed = SubTask::new(1, PathBuf::from("/tmp/run/sub-0001"));
        failed.advance(SubTaskState::Failed).unwrap();
        let history = [RunState::Created, RunState::Failed];

        let summary = RunSummary::new("run-1", "sha256:ab", &history, &[done, failed], Utc::now());
        assert_eq!(summary.state, RunState::Failed);
        assert_eq!(summary.completed, 1);
        assert_eq!(summary.failed, 1);
        assert_eq!(summary.cancelled, 0);
        assert_eq!(summary.sub_tasks, 2);
    }
}
