// Agent configuration: CLI flags with environment fallbacks

use clap::{Args, ValueEnum};
use std::path::{Path, PathBuf};

pub const DEFAULT_DB_PATH: &str = "~/.qvisor/state.db";
pub const DEFAULT_STATE_DIR: &str = "~/.qvisor/tasks";

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum LogFormat {
    /// Human-readable, for terminals
    Pretty,
    /// One JSON object per line
    Json,
}

#[derive(Debug, Clone, Args)]
pub struct AgentArgs {
    /// Handle store (SQLite file)
    #[arg(long, global = true, env = "QVISOR_DB_PATH", default_value = DEFAULT_DB_PATH)]
    pub db_path: String,

    /// Root directory for per-task state
    #[arg(long, global = true, env = "QVISOR_STATE_DIR", default_value = DEFAULT_STATE_DIR)]
    pub state_dir: String,

    #[arg(
        long,
        global = true,
        env = "QVISOR_LOG_FORMAT",
        value_enum,
        default_value_t = LogFormat::Pretty
    )]
    pub log_format: LogFormat,
}

/// Resolved agent paths
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AgentConfig {
    pub db_path: PathBuf,
    pub state_dir: PathBuf,
}

impl AgentConfig {
    pub fn from_args(args: &AgentArgs) -> Self {
        Self {
            db_path: expand(&args.db_path),
            state_dir: expand(&args.state_dir),
        }
    }

    /// Directory a task's executor, image and logs live in
    pub fn task_dir(&self, task_name: &str) -> PathBuf {
        self.state_dir.join(task_name)
    }

    pub fn db_dir(&self) -> Option<&Path> {
        self.db_path.parent().filter(|p| !p.as_os_str().is_empty())
    }
}

fn expand(path: &str) -> PathBuf {
    PathBuf::from(shellexpand::tilde(path).into_owned())
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::Parser;

    #[derive(Parser)]
    struct TestCli {
        #[command(flatten)]
        agent: AgentArgs,
    }

    #[test]
    fn test_explicit_paths() {
        let cli = TestCli::parse_from([
            "qvisor",
            "--db-path",
            "/var/lib/qvisor/state.db",
            "--state-dir",
            "/var/lib/qvisor/tasks",
            "--log-format",
            "json",
        ]);
        let config = AgentConfig::from_args(&cli.agent);

        assert_eq!(config.db_path, PathBuf::from("/var/lib/qvisor/state.db"));
        assert_eq!(config.task_dir("web"), PathBuf::from("/var/lib/qvisor/tasks/web"));
        assert_eq!(config.db_dir(), Some(Path::new("/var/lib/qvisor")));
        assert_eq!(cli.agent.log_format, LogFormat::Json);
    }

    #[test]
    fn test_tilde_is_expanded() {
        let args = AgentArgs {
            db_path: DEFAULT_DB_PATH.to_string(),
            state_dir: DEFAULT_STATE_DIR.to_string(),
            log_format: LogFormat::Pretty,
        };
        let config = AgentConfig::from_args(&args);

        assert!(!config.db_path.starts_with("~"));
        assert!(config.db_path.ends_with(".qvisor/state.db"));
        assert!(config.state_dir.ends_with(".qvisor/tasks"));
    }

    #[test]
    fn test_bare_db_file_has_no_dir() {
        let args = AgentArgs {
            db_path: "state.db".to_string(),
            state_dir: "tasks".to_string(),
            log_format: LogFormat::Pretty,
        };
        assert!(AgentConfig::from_args(&args).db_dir().is_none());
    }
}
