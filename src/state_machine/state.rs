use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::{FanoutError, Result};

/// Lifecycle of a run.
///
/// The happy path is CREATED → RESOURCES_STAGED → SUBTASKS_SUBMITTED →
/// AWAITING_COMPLETION → MERGING → COMPLETED. FAILED can be entered from any
/// non-terminal state; ROLLED_BACK from FAILED or any non-terminal state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RunState {
    Created,
    ResourcesStaged,
    SubTasksSubmitted,
    AwaitingCompletion,
    Merging,
    Completed,
    Failed,
    RolledBack,
}

impl RunState {
    pub fn is_terminal(self) -> bool {
        matches!(self, RunState::Completed | RunState::RolledBack)
    }

    fn successor(self) -> Option<RunState> {
        match self {
            RunState::Created => Some(RunState::ResourcesStaged),
            RunState::ResourcesStaged => Some(RunState::SubTasksSubmitted),
            RunState::SubTasksSubmitted => Some(RunState::AwaitingCompletion),
            RunState::AwaitingCompletion => Some(RunState::Merging),
            RunState::Merging => Some(RunState::Completed),
            RunState::Completed | RunState::Failed | RunState::RolledBack => None,
        }
    }
}

impl fmt::Display for RunState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RunState::Created => write!(f, "CREATED"),
            RunState::ResourcesStaged => write!(f, "RESOURCES_STAGED"),
            RunState::SubTasksSubmitted => write!(f, "SUBTASKS_SUBMITTED"),
            RunState::AwaitingCompletion => write!(f, "AWAITING_COMPLETION"),
            RunState::Merging => write!(f, "MERGING"),
            RunState::Completed => write!(f, "COMPLETED"),
            RunState::Failed => write!(f, "FAILED"),
            RunState::RolledBack => write!(f, "ROLLED_BACK"),
        }
    }
}

/// Drives a run through its lifecycle and records every state it visits.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StateMachine {
    state: RunState,
    history: Vec<RunState>,
}

impl Default for StateMachine {
    fn default() -> Self {
        Self {
            state: RunState::Created,
            history: vec![RunState::Created],
        }
    }
}

impl StateMachine {
    pub fn state(&self) -> RunState {
        self.state
    }

    /// Every state visited so far, current state last.
    pub fn history(&self) -> &[RunState] {
        &self.history
    }

    /// Moves to `next` if the lifecycle allows it.
    ///
    /// - Forward moves go one step at a time along the happy path.
    /// - `Failed` is reachable from every state except the terminal ones.
    /// - `RolledBack` is reachable from `Failed` and every non-terminal state.
    pub fn transition(&mut self, next: RunState) -> Result<RunState> {
        let allowed = match next {
            RunState::Failed => !self.state.is_terminal() && self.state != RunState::Failed,
            RunState::RolledBack => !self.state.is_terminal(),
            _ => self.state.successor() == Some(next),
        };
        if !allowed {
            return Err(FanoutError::InvalidTransition {
                from: self.state.to_string(),
                to: next.to_string(),
            });
        }
        self.state = next;
        self.history.push(next);
        Ok(next)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn happy_path_walks_all_states() {
        let mut machine = StateMachine::default();
        assert_eq!(machine.state(), RunState::Created);

        for next in [
            RunState::ResourcesStaged,
            RunState::SubTasksSubmitted,
            RunState::AwaitingCompletion,
            RunState::Merging,
            RunState::Completed,
        ] {
            assert_eq!(machine.transition(next).unwrap(), next);
        }
        assert_eq!(
            machine.history(),
            &[
                RunState::Created,
                RunState::ResourcesStaged,
                RunState::SubTasksSubmitted,
                RunState::AwaitingCompletion,
                RunState::Merging,
                RunState::Completed,
            ]
        );

        // Completed is terminal.
        assert!(machine.transition(RunState::Failed).is_err());
        assert!(machine.transition(RunState::RolledBack).is_err());
    }

    #[test]
    fn skipping_a_state_is_rejected() {
        let mut machine = StateMachine::default();
        let err = machine.transition(RunState::SubTasksSubmitted).unwrap_err();
        assert_eq!(
            err.to_string(),
            "Invalid transition from CREATED to SUBTASKS_SUBMITTED"
        );
        assert_eq!(machine.state(), RunState::Created);
    }

    #[test]
    fn failure_then_rollback() {
        let mut machine = StateMachine::default();
        machine.transition(RunState::ResourcesStaged).unwrap();
        machine.transition(RunState::SubTasksSubmitted).unwrap();
        machine.transition(RunState::Failed).unwrap();
        assert!(machine.transition(RunState::Failed).is_err());
        assert!(machine.transition(RunState::Merging).is_err());
        machine.transition(RunState::RolledBack).unwrap();
        assert!(machine.transition(RunState::RolledBack).is_err());
        assert_eq!(machine.history().last(), Some(&RunState::RolledBack));
    }

    #[test]
    fn state_display() {
        assert_eq!(RunState::Created.to_string(), "CREATED");
        assert_eq!(RunState::AwaitingCompletion.to_string(), "AWAITING_COMPLETION");
        assert_eq!(RunState::RolledBack.to_string(), "ROLLED_BACK");
    }
}
