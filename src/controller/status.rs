use serde::{Deserialize, Serialize};

/// Lifecycle status of an execution as recorded in the execution store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExecutionStatus {
    Pending,
    Scheduling,
    Initializing,
    Running,
    Failing,
    Paused,
    Stopping,
    Stopped,
    Completed,
    Failed,
    Terminated,
}

impl ExecutionStatus {
    pub const TERMINAL: [ExecutionStatus; 4] = [
        ExecutionStatus::Completed,
        ExecutionStatus::Failed,
        ExecutionStatus::Terminated,
        ExecutionStatus::Stopped,
    ];

    pub const RUNNING: [ExecutionStatus; 4] = [
        ExecutionStatus::Running,
        ExecutionStatus::Failing,
        ExecutionStatus::Paused,
        ExecutionStatus::Stopping,
    ];

    pub fn is_terminal(&self) -> bool {
        Self::TERMINAL.contains(self)
    }

    pub fn is_running(&self) -> bool {
        Self::RUNNING.contains(self)
    }

    /// Terminal statuses are final; anything else may move freely.
    pub fn can_transition_to(&self, next: ExecutionStatus) -> bool {
        !self.is_terminal() || *self == next
    }
}

impl std::fmt::Display for ExecutionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            ExecutionStatus::Pending => "pending",
            ExecutionStatus::Scheduling => "scheduling",
            ExecutionStatus::Initializing => "initializing",
            ExecutionStatus::Running => "running",
            ExecutionStatus::Failing => "failing",
            ExecutionStatus::Paused => "paused",
            ExecutionStatus::Stopping => "stopping",
            ExecutionStatus::Stopped => "stopped",
            ExecutionStatus::Completed => "completed",
            ExecutionStatus::Failed => "failed",
            ExecutionStatus::Terminated => "terminated",
        };
        write!(f, "{}", name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn terminal_and_running_are_disjoint() {
        for status in ExecutionStatus::TERMINAL {
            assert!(status.is_terminal());
            assert!(!status.is_running());
        }
        for status in ExecutionStatus::RUNNING {
            assert!(status.is_running());
            assert!(!status.is_terminal());
        }
        assert!(!ExecutionStatus::Initializing.is_running());
        assert!(!ExecutionStatus::Initializing.is_terminal());
    }

    #[test]
    fn terminal_statuses_are_final() {
        assert!(ExecutionStatus::Running.can_transition_to(ExecutionStatus::Failing));
        assert!(ExecutionStatus::Failing.can_transition_to(ExecutionStatus::Running));
        assert!(!ExecutionStatus::Completed.can_transition_to(ExecutionStatus::Running));
        assert!(!ExecutionStatus::Failed.can_transition_to(ExecutionStatus::Completed));
        assert!(ExecutionStatus::Stopped.can_transition_to(ExecutionStatus::Stopped));
    }

    #[test]
    fn serializes_lowercase() {
        let raw = serde_json::to_string(&ExecutionStatus::Terminated).unwrap();
        assert_eq!(raw, "\"terminated\"");
        assert_eq!(ExecutionStatus::Failing.to_string(), "failing");
    }
}
