//! Adapter layer between the orchestrator and an external batch scheduler.
//!
//! [`SchedulerClient`] is the only surface the rest of the crate sees. Each
//! operation maps to one command of the backend; all text parsing lives in
//! [`parse`].

use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::state_machine::SubTaskState;

pub mod parse;
pub mod runner;
pub mod slurm;

pub use runner::{CommandOutput, CommandRunner, ProcessRunner};
pub use slurm::SlurmClient;

/// One row of the scheduler's queue report.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueEntry {
    pub job_id: String,
    /// Backend state code as reported (`R`, `PD`, ...).
    pub state: String,
    pub elapsed: Duration,
}

impl QueueEntry {
    pub fn is_running(&self) -> bool {
        parse::is_running_state(&self.state)
    }
}

/// Result of a cancel request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CancelAck {
    Cancelled,
    /// The backend reported the job as already finished.
    AlreadyFinished,
}

/// Operations every backend adapter provides.
#[async_trait]
pub trait SchedulerClient: Send + Sync {
    /// Submits `script` to run in `work_dir` and returns the backend job id.
    async fn submit(&self, work_dir: &Path, script: &Path) -> Result<String>;

    /// Best-effort cancel; a job that already finished is not an error.
    async fn cancel(&self, job_id: &str) -> Result<CancelAck>;

    /// Current global queue.
    async fn queue(&self) -> Result<Vec<QueueEntry>>;

    /// Flat `key=value` report for one job.
    async fn inspect(&self, job_id: &str) -> Result<HashMap<String, String>>;

    /// Terminal state of a job that left the queue, judged from its report.
    fn final_state(&self, report: &HashMap<String, String>) -> SubTaskState {
        parse::final_state_from_inspect(report)
    }

    /// Run time recorded in an inspect report, if the backend provides one.
    fn reported_elapsed(&self, report: &HashMap<String, String>) -> Option<Duration> {
        parse::elapsed_from_inspect(report)
    }

    /// Backend text explaining how a job ended, for error reports.
    fn diagnostic(&self, report: &HashMap<String, String>) -> Option<String> {
        parse::diagnostic_from_inspect(report)
    }
}
