// Subcommand implementations

use anyhow::Result;
use colored::Colorize;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tabled::{Table, Tabled};
use tracing::{error, info, warn};

use qvisor_core::application::ProcessHandle;
use qvisor_core::domain::{ExecutorContext, TaskRecord, WaitResult};
use qvisor_core::port::{Fingerprint, Fingerprinter};
use qvisor_infra_system::QemuFingerprinter;

use crate::app::App;
use crate::task_file;

/// What Ctrl+C means while following a task
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum OnInterrupt {
    Kill,
    Detach,
}

pub async fn run(app: &App, task_path: &Path, task_dir: Option<PathBuf>, detach: bool) -> Result<()> {
    let task = task_file::load(task_path)?;
    let task_dir = task_dir.unwrap_or_else(|| app.config.task_dir(&task.name));
    let ctx = ExecutorContext::new(&task.name, task_dir);

    let handle = app.tasks.start(&ctx, &task).await?;
    println!(
        "{}",
        format!("✓ Task {} started (pid {})", task.name, handle.user_pid())
            .green()
            .bold()
    );

    if detach {
        println!("  Reattach with: qvisor attach {}", task.name);
        return Ok(());
    }
    follow(app, handle, OnInterrupt::Kill).await
}

pub async fn attach(app: &App, task_name: &str) -> Result<()> {
    let handle = app.tasks.attach(task_name).await?;
    println!(
        "{}",
        format!("✓ Attached to {} (pid {})", task_name, handle.user_pid())
            .green()
            .bold()
    );
    follow(app, handle, OnInterrupt::Detach).await
}

pub async fn kill(app: &App, task_name: &str, timeout_ms: Option<u64>) -> Result<()> {
    let handle = app.tasks.attach(task_name).await?;
    if let Some(ms) = timeout_ms {
        handle.update_kill_timeout(Duration::from_millis(ms));
    }

    println!(
        "{}",
        format!(
            "Stopping {} (escalating after {}ms)...",
            task_name,
            handle.kill_timeout().as_millis()
        )
        .cyan()
    );
    handle.kill().await?;

    let result = app.tasks.supervise(&handle).await?;
    print_result(task_name, &result);
    Ok(())
}

pub async fn list(app: &App) -> Result<()> {
    let records = app.tasks.list().await?;
    if records.is_empty() {
        println!("{}", "No tasks recorded".yellow());
        return Ok(());
    }

    let rows: Vec<TaskRow> = records.iter().map(TaskRow::from).collect();
    println!("{}", Table::new(rows));
    Ok(())
}

pub async fn forget(app: &App, task_name: &str) -> Result<()> {
    if app.tasks.forget(task_name).await? {
        println!("{}", format!("✓ Forgot task {}", task_name).green().bold());
    } else {
        println!("{}", format!("No task named {}", task_name).yellow());
    }
    Ok(())
}

pub async fn fingerprint() -> Result<()> {
    match QemuFingerprinter::new().fingerprint().await? {
        fp @ Fingerprint::Available { .. } => {
            println!("{}", "QEMU detected".green().bold());
            for (key, value) in fp.attributes() {
                println!("  {} {}", format!("{}:", key).bold(), value);
            }
        }
        Fingerprint::Unavailable => println!("{}", "QEMU not detected".yellow()),
    }
    Ok(())
}

/// Reattach to every running task and supervise them until interrupted
///
/// Stopping the agent leaves the VMs running; the next agent reattaches.
pub async fn agent(app: &App) -> Result<()> {
    let report = app.recovery.recover_running_tasks().await?;

    for name in &report.lost {
        warn!(task = %name, "Task lost while the agent was down");
    }
    for (name, reason) in &report.failed {
        error!(task = %name, reason = %reason, "Task left running but unsupervised");
    }

    for handle in report.reattached {
        let tasks = app.tasks.clone();
        tokio::spawn(async move {
            match tasks.supervise(&handle).await {
                Ok(result) => info!(task = %handle.task_name(), result = %result, "Task finished"),
                Err(e) => error!(task = %handle.task_name(), error = %e, "Failed to record task exit"),
            }
        });
    }

    info!("Agent ready. Press Ctrl+C to stop (tasks keep running)");
    tokio::signal::ctrl_c().await?;
    info!("Agent stopping");
    Ok(())
}

async fn follow(app: &App, handle: ProcessHandle, on_interrupt: OnInterrupt) -> Result<()> {
    let task_name = handle.task_name().to_string();
    let mut done = handle.done_signal();

    tokio::select! {
        _ = done.wait() => {}
        interrupted = tokio::signal::ctrl_c() => {
            interrupted?;
            match on_interrupt {
                OnInterrupt::Kill => {
                    println!("{}", format!("Stopping {}...", task_name).cyan());
                    handle.kill().await?;
                }
                OnInterrupt::Detach => {
                    println!(
                        "{}",
                        format!("Detached; {} keeps running", task_name).yellow()
                    );
                    return Ok(());
                }
            }
        }
    }

    let result = app.tasks.supervise(&handle).await?;
    print_result(&task_name, &result);
    Ok(())
}

fn print_result(task_name: &str, result: &WaitResult) {
    if result.successful() {
        println!("{}", format!("✓ Task {} exited cleanly", task_name).green().bold());
    } else {
        println!("{}", format!("✗ Task {} exited: {}", task_name, result).red().bold());
    }
}

#[derive(Tabled)]
struct TaskRow {
    name: String,
    state: String,
    exit_code: String,
    signal: String,
    updated: String,
    error: String,
}

impl From<&TaskRecord> for TaskRow {
    fn from(record: &TaskRecord) -> Self {
        let or_dash = |v: Option<i32>| v.map_or_else(|| "-".to_string(), |v| v.to_string());
        Self {
            name: record.task_name.clone(),
            state: record.state.to_string(),
            exit_code: or_dash(record.exit_code),
            signal: or_dash(record.signal),
            updated: format_millis(record.updated_at),
            error: record.error.clone().unwrap_or_default(),
        }
    }
}

fn format_millis(millis: i64) -> String {
    chrono::DateTime::from_timestamp_millis(millis)
        .map(|t| t.format("%Y-%m-%d %H:%M:%S").to_string())
        .unwrap_or_else(|| millis.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use qvisor_core::domain::TaskRecordState;

    #[test]
    fn test_row_for_running_task() {
        let record = TaskRecord::running("web", "{}", 0);
        let row = TaskRow::from(&record);

        assert_eq!(row.state, "RUNNING");
        assert_eq!(row.exit_code, "-");
        assert_eq!(row.updated, "1970-01-01 00:00:00");
    }

    #[test]
    fn test_row_for_exited_task() {
        let mut record = TaskRecord::running("web", "{}", 0);
        record.exit(&WaitResult::new(143, 15, None), 1_000);
        let row = TaskRow::from(&record);

        assert_eq!(row.state, TaskRecordState::Exited.to_string());
        assert_eq!(row.exit_code, "143");
        assert_eq!(row.signal, "15");
        assert!(row.error.is_empty());
    }

    #[test]
    fn test_table_lists_every_task() {
        let mut lost = TaskRecord::running("db", "{}", 0);
        lost.lose("executor gone", 5);
        let rows = vec![
            TaskRow::from(&TaskRecord::running("web", "{}", 0)),
            TaskRow::from(&lost),
        ];

        let table = Table::new(rows).to_string();
        assert!(table.contains("web"));
        assert!(table.contains("LOST"));
        assert!(table.contains("executor gone"));
    }
}
