// Task Record Domain Model (persisted handle identities)

use serde::{Deserialize, Serialize};

use crate::domain::error::DomainError;
use crate::domain::handle::WaitResult;

/// Persisted task state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TaskRecordState {
    Running,
    Exited,
    /// Executor vanished while the agent was away; outcome unknown
    Lost,
}

impl std::fmt::Display for TaskRecordState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TaskRecordState::Running => write!(f, "RUNNING"),
            TaskRecordState::Exited => write!(f, "EXITED"),
            TaskRecordState::Lost => write!(f, "LOST"),
        }
    }
}

impl std::str::FromStr for TaskRecordState {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "RUNNING" => Ok(TaskRecordState::Running),
            "EXITED" => Ok(TaskRecordState::Exited),
            "LOST" => Ok(TaskRecordState::Lost),
            other => Err(DomainError::ValidationError(format!(
                "unknown task record state: {}",
                other
            ))),
        }
    }
}

/// A task handle as the agent remembers it across restarts
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskRecord {
    pub task_name: String,
    pub identity: String,
    pub state: TaskRecordState,
    pub exit_code: Option<i32>,
    pub signal: Option<i32>,
    pub error: Option<String>,
    pub created_at: i64, // epoch ms
    pub updated_at: i64,
}

impl TaskRecord {
    pub fn running(task_name: impl Into<String>, identity: impl Into<String>, now: i64) -> Self {
        Self {
            task_name: task_name.into(),
            identity: identity.into(),
            state: TaskRecordState::Running,
            exit_code: None,
            signal: None,
            error: None,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn exit(&mut self, result: &WaitResult, now: i64) {
        self.state = TaskRecordState::Exited;
        self.exit_code = Some(result.exit_code);
        self.signal = Some(result.signal);
        self.error = result.error.clone();
        self.updated_at = now;
    }

    pub fn lose(&mut self, reason: impl Into<String>, now: i64) {
        self.state = TaskRecordState::Lost;
        self.error = Some(reason.into());
        self.updated_at = now;
    }
}
