// Reattach recovery: reconnect to VMs left RUNNING by a previous agent

use crate::application::driver::QemuDriver;
use crate::application::handle::ProcessHandle;
use crate::domain::{TaskRecord, TaskRecordState};
use crate::port::{HandleRepository, TimeProvider};
use std::sync::Arc;
use tracing::{error, info, warn};

/// Outcome of one recovery pass
#[derive(Debug, Default)]
pub struct RecoveryReport {
    /// Handles reattached to live executors
    pub reattached: Vec<ProcessHandle>,
    /// Tasks whose executor is gone, now marked LOST
    pub lost: Vec<String>,
    /// Tasks that could not be reattached but may still be alive
    pub failed: Vec<(String, String)>,
}

/// Recovery service
///
/// On agent startup, walks every RUNNING record and reopens its handle.
/// Records are only marked LOST when the executor process no longer
/// exists; any other failure leaves them RUNNING for a later attempt.
pub struct RecoveryService {
    handle_repo: Arc<dyn HandleRepository>,
    driver: Arc<QemuDriver>,
    time_provider: Arc<dyn TimeProvider>,
}

impl RecoveryService {
    pub fn new(
        handle_repo: Arc<dyn HandleRepository>,
        driver: Arc<QemuDriver>,
        time_provider: Arc<dyn TimeProvider>,
    ) -> Self {
        Self {
            handle_repo,
            driver,
            time_provider,
        }
    }

    pub async fn recover_running_tasks(&self) -> crate::error::Result<RecoveryReport> {
        let running = self
            .handle_repo
            .find_by_state(TaskRecordState::Running)
            .await?;

        info!(count = %running.len(), "Starting reattach recovery");

        let mut report = RecoveryReport::default();
        for record in running {
            self.recover_single_task(record, &mut report).await?;
        }

        info!(
            reattached = %report.reattached.len(),
            lost = %report.lost.len(),
            failed = %report.failed.len(),
            "Reattach recovery complete"
        );
        Ok(report)
    }

    async fn recover_single_task(
        &self,
        mut record: TaskRecord,
        report: &mut RecoveryReport,
    ) -> crate::error::Result<()> {
        match self.driver.open(&record.task_name, &record.identity).await {
            Ok(handle) => {
                info!(task = %record.task_name, pid = %handle.user_pid(), "Recovered task");
                report.reattached.push(handle);
            }
            Err(e) if e.is_task_gone() => {
                warn!(task = %record.task_name, error = %e, "Task executor is gone, marking lost");
                record.lose(e.to_string(), self.time_provider.now_millis());
                self.handle_repo.upsert(&record).await?;
                report.lost.push(record.task_name);
            }
            Err(e) => {
                error!(task = %record.task_name, error = %e, "Failed to reattach task");
                report.failed.push((record.task_name, e.to_string()));
            }
        }
        Ok(())
    }
}
