// Task Service - tracks supervised VMs in the handle store

use std::sync::Arc;
use tracing::{error, info, warn};

use crate::application::driver::QemuDriver;
use crate::application::handle::ProcessHandle;
use crate::domain::{ExecutorContext, TaskConfig, TaskRecord, TaskRecordState, WaitResult};
use crate::error::{AppError, Result};
use crate::port::{HandleRepository, TimeProvider};

pub struct TaskService {
    driver: Arc<QemuDriver>,
    handle_repo: Arc<dyn HandleRepository>,
    time_provider: Arc<dyn TimeProvider>,
}

impl TaskService {
    pub fn new(
        driver: Arc<QemuDriver>,
        handle_repo: Arc<dyn HandleRepository>,
        time_provider: Arc<dyn TimeProvider>,
    ) -> Self {
        Self {
            driver,
            handle_repo,
            time_provider,
        }
    }

    /// Start a task and remember its identity
    ///
    /// # Errors
    /// - AppError::Conflict if a task with the same name is still running
    /// - Any error from `QemuDriver::start`
    pub async fn start(&self, ctx: &ExecutorContext, task: &TaskConfig) -> Result<ProcessHandle> {
        if let Some(existing) = self.handle_repo.find_by_name(&task.name).await? {
            if existing.state == TaskRecordState::Running {
                return Err(AppError::Conflict(format!(
                    "task {:?} is already running",
                    task.name
                )));
            }
        }

        let handle = self.driver.start(ctx, task).await?;

        if let Err(e) = self.persist(&handle).await {
            // An untracked VM could never be reattached; stop it
            error!(task = %task.name, error = %e, "Failed to record task, stopping it");
            if let Err(kill_err) = handle.kill().await {
                warn!(task = %task.name, error = %kill_err, "Failed to stop unrecorded task");
            }
            return Err(e);
        }

        Ok(handle)
    }

    /// Store the handle's current identity as RUNNING
    pub async fn persist(&self, handle: &ProcessHandle) -> Result<()> {
        let now = self.time_provider.now_millis();
        let identity = handle.identity()?;

        let record = match self.handle_repo.find_by_name(handle.task_name()).await? {
            Some(mut existing) if existing.state == TaskRecordState::Running => {
                existing.identity = identity;
                existing.updated_at = now;
                existing
            }
            _ => TaskRecord::running(handle.task_name(), identity, now),
        };
        self.handle_repo.upsert(&record).await
    }

    /// Reopen a RUNNING task by name
    ///
    /// A task whose executor is gone is marked LOST before the error returns.
    pub async fn attach(&self, task_name: &str) -> Result<ProcessHandle> {
        let mut record = self
            .handle_repo
            .find_by_name(task_name)
            .await?
            .ok_or_else(|| AppError::NotFound(format!("task {:?}", task_name)))?;

        if record.state != TaskRecordState::Running {
            return Err(AppError::Conflict(format!(
                "task {:?} is {}, not running",
                task_name, record.state
            )));
        }

        match self.driver.open(task_name, &record.identity).await {
            Ok(handle) => Ok(handle),
            Err(e) => {
                if e.is_task_gone() {
                    warn!(task = %task_name, error = %e, "Task executor is gone, marking lost");
                    record.lose(e.to_string(), self.time_provider.now_millis());
                    self.handle_repo.upsert(&record).await?;
                }
                Err(e)
            }
        }
    }

    /// Wait for the handle's result and record it
    ///
    /// # Errors
    /// - AppError::Internal if the result was already taken elsewhere
    pub async fn supervise(&self, handle: &ProcessHandle) -> Result<WaitResult> {
        let result = handle.wait().await.ok_or_else(|| {
            AppError::Internal(format!(
                "result of task {:?} was already consumed",
                handle.task_name()
            ))
        })?;
        self.record_exit(handle.task_name(), &result).await?;
        Ok(result)
    }

    /// Mark a task EXITED with its terminal result
    pub async fn record_exit(&self, task_name: &str, result: &WaitResult) -> Result<()> {
        let Some(mut record) = self.handle_repo.find_by_name(task_name).await? else {
            warn!(task = %task_name, "Exited task has no record");
            return Ok(());
        };
        record.exit(result, self.time_provider.now_millis());
        self.handle_repo.upsert(&record).await?;

        info!(task = %task_name, result = %result, "Recorded task exit");
        Ok(())
    }

    pub async fn list(&self) -> Result<Vec<TaskRecord>> {
        self.handle_repo.list().await
    }

    /// Drop a finished task's record
    ///
    /// # Errors
    /// - AppError::Conflict if the task is still running
    pub async fn forget(&self, task_name: &str) -> Result<bool> {
        if let Some(record) = self.handle_repo.find_by_name(task_name).await? {
            if record.state == TaskRecordState::Running {
                return Err(AppError::Conflict(format!(
                    "task {:?} is still running",
                    task_name
                )));
            }
        }
        self.handle_repo.delete(task_name).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{HandleIdentity, QemuConfig, Resources};
    use crate::port::artifact::mocks::MockArtifactFetcher;
    use crate::port::handle_repository::mocks::InMemoryHandleRepository;
    use crate::port::executor::mocks::{MockBehavior, MockExecutorClient, SIGKILL};
    use crate::port::time_provider::FixedTimeProvider;
    use std::path::PathBuf;
    use std::time::Duration;

    fn setup() -> (Arc<MockExecutorClient>, Arc<InMemoryHandleRepository>, TaskService) {
        let client = Arc::new(MockExecutorClient::new(MockBehavior::default()));
        let repo = Arc::new(InMemoryHandleRepository::new());
        let driver = Arc::new(QemuDriver::new(
            client.clone(),
            Arc::new(MockArtifactFetcher::new()),
        ));
        let service = TaskService::new(driver, repo.clone(), Arc::new(FixedTimeProvider(1_000)));
        (client, repo, service)
    }

    fn ctx() -> ExecutorContext {
        ExecutorContext::new("web", PathBuf::from("/tmp/qvisor-test/web"))
    }

    fn task() -> TaskConfig {
        TaskConfig {
            name: "web".to_string(),
            kill_timeout_ms: 20,
            resources: Some(Resources {
                memory_mb: 256,
                networks: vec![],
            }),
            config: QemuConfig {
                artifact_source: "/images/web.qcow2".to_string(),
                checksum: None,
                accelerator: None,
                port_map: vec![],
            },
        }
    }

    #[tokio::test]
    async fn test_start_records_running_identity() {
        let (_, repo, service) = setup();
        let handle = service.start(&ctx(), &task()).await.unwrap();

        let record = repo.find_by_name("web").await.unwrap().unwrap();
        assert_eq!(record.state, TaskRecordState::Running);
        assert_eq!(record.identity, handle.identity().unwrap());
    }

    #[tokio::test]
    async fn test_start_rejects_duplicate_running_task() {
        let (client, _, service) = setup();
        service.start(&ctx(), &task()).await.unwrap();

        let err = service.start(&ctx(), &task()).await.unwrap_err();
        assert!(matches!(err, AppError::Conflict(_)));
        assert_eq!(client.spawn_count(), 1);
    }

    #[tokio::test]
    async fn test_supervise_records_exit() {
        let (client, repo, service) = setup();
        let handle = service.start(&ctx(), &task()).await.unwrap();

        handle.kill().await.unwrap();
        let result = service.supervise(&handle).await.unwrap();
        assert_eq!(result.signal, SIGKILL);
        assert_eq!(client.spawned()[0].exit_calls(), 1);

        let record = repo.find_by_name("web").await.unwrap().unwrap();
        assert_eq!(record.state, TaskRecordState::Exited);
        assert_eq!(record.signal, Some(SIGKILL));

        // Result is single-delivery
        assert!(matches!(
            service.supervise(&handle).await,
            Err(AppError::Internal(_))
        ));
    }

    #[tokio::test]
    async fn test_attach_marks_gone_task_lost() {
        let (client, repo, service) = setup();
        let handle = service.start(&ctx(), &task()).await.unwrap();
        let identity = HandleIdentity::decode(&handle.identity().unwrap()).unwrap();
        client.kill_executor(&identity.reattach.instance_id);

        let err = service.attach("web").await.unwrap_err();
        assert!(err.is_task_gone());

        let record = repo.find_by_name("web").await.unwrap().unwrap();
        assert_eq!(record.state, TaskRecordState::Lost);
        assert!(record.error.is_some());
    }

    #[tokio::test]
    async fn test_attach_unreachable_keeps_running() {
        let (client, repo, service) = setup();
        service.start(&ctx(), &task()).await.unwrap();
        client.set_unreachable(true);

        tokio_test::assert_err!(service.attach("web").await);
        let record = repo.find_by_name("web").await.unwrap().unwrap();
        assert_eq!(record.state, TaskRecordState::Running);
    }

    #[tokio::test]
    async fn test_persist_refreshes_kill_timeout() {
        let (_, repo, service) = setup();
        let handle = service.start(&ctx(), &task()).await.unwrap();
        handle.update_kill_timeout(Duration::from_secs(9));
        service.persist(&handle).await.unwrap();

        let record = repo.find_by_name("web").await.unwrap().unwrap();
        let identity = HandleIdentity::decode(&record.identity).unwrap();
        assert_eq!(identity.kill_timeout, Duration::from_secs(9));
    }

    #[tokio::test]
    async fn test_attach_and_forget_unknown_or_running() {
        let (_, _, service) = setup();
        assert!(matches!(
            service.attach("nope").await,
            Err(AppError::NotFound(_))
        ));

        service.start(&ctx(), &task()).await.unwrap();
        assert!(matches!(service.forget("web").await, Err(AppError::Conflict(_))));
        assert!(!service.forget("nope").await.unwrap());
    }
}
