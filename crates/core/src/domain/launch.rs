// Launch Domain Model

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;

/// Host-to-guest port forward, applied for every transport protocol
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortForward {
    pub label: String,
    pub host: u16,
    pub guest: u16,
}

/// Fully resolved VM command line
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LaunchSpec {
    pub vm_id: String,
    pub command: String,
    pub args: Vec<String>,
    pub memory_mb: u64,
    pub port_forwards: Vec<PortForward>,
}

impl LaunchSpec {
    /// The command the executor runs
    pub fn exec_command(&self) -> ExecCommand {
        ExecCommand {
            cmd: self.command.clone(),
            args: self.args.clone(),
        }
    }

    /// Full command line as a single string (for logging)
    pub fn command_line(&self) -> String {
        std::iter::once(self.command.as_str())
            .chain(self.args.iter().map(String::as_str))
            .collect::<Vec<_>>()
            .join(" ")
    }
}

/// Executable and arguments sent to the executor
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecCommand {
    pub cmd: String,
    pub args: Vec<String>,
}

/// Where and how the executor runs the process
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutorContext {
    pub task_name: String,
    pub task_dir: PathBuf,
    #[serde(default)]
    pub env: BTreeMap<String, String>,
}

impl ExecutorContext {
    pub fn new(task_name: impl Into<String>, task_dir: impl Into<PathBuf>) -> Self {
        Self {
            task_name: task_name.into(),
            task_dir: task_dir.into(),
            env: BTreeMap::new(),
        }
    }

    /// Task-local directory artifacts are placed in
    pub fn local_dir(&self) -> PathBuf {
        self.task_dir.join(TASK_LOCAL_DIR)
    }

    /// Log file the executor writes its own tracing output to
    pub fn executor_log_path(&self) -> PathBuf {
        self.task_dir.join(EXECUTOR_LOG_FILE)
    }
}

pub const TASK_LOCAL_DIR: &str = "local";
pub const EXECUTOR_LOG_FILE: &str = "executor.log";
