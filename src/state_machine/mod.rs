mod job;
mod state;

pub use job::{RetryConfig, RunSummary, SubTask, SubTaskState};
pub use state::{RunState, StateMachine};
