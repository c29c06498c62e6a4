// QEMU Driver: start new VMs and reopen running ones from their identity

use std::sync::Arc;
use tracing::{debug, info};

use crate::application::handle::ProcessHandle;
use crate::application::launch_spec;
use crate::domain::{ExecutorContext, HandleIdentity, TaskConfig};
use crate::error::{AppError, Result};
use crate::port::{ArtifactFetcher, ExecutorClient};

pub struct QemuDriver {
    executor_client: Arc<dyn ExecutorClient>,
    artifact_fetcher: Arc<dyn ArtifactFetcher>,
}

impl QemuDriver {
    pub fn new(
        executor_client: Arc<dyn ExecutorClient>,
        artifact_fetcher: Arc<dyn ArtifactFetcher>,
    ) -> Self {
        Self {
            executor_client,
            artifact_fetcher,
        }
    }

    /// Validate the task, fetch its image and boot it under a new executor
    ///
    /// # Errors
    /// - AppError::Config before any side effect if the task is invalid
    /// - AppError::Artifact if the image cannot be fetched or verified
    /// - AppError::Launch if the executor or the VM failed to start
    pub async fn start(&self, ctx: &ExecutorContext, task: &TaskConfig) -> Result<ProcessHandle> {
        let plan = launch_spec::validate(task)?;

        let vm_path = self
            .artifact_fetcher
            .fetch(
                &ctx.local_dir(),
                &plan.artifact_source,
                plan.checksum.as_deref(),
            )
            .await?;

        let spec = launch_spec::build(&plan, &vm_path);
        debug!(
            task = %task.name,
            command = %spec.command_line(),
            "Starting QemuVM command"
        );

        let launched = self
            .executor_client
            .launch(&spec.exec_command(), ctx)
            .await
            .map_err(AppError::Launch)?;

        info!(
            task = %task.name,
            vm_id = %spec.vm_id,
            pid = %launched.pid,
            memory_mb = %spec.memory_mb,
            forwards = %spec.port_forwards.len(),
            "Started new QemuVM"
        );

        Ok(ProcessHandle::supervise(
            task.name.clone(),
            launched.connection,
            launched.pid,
            task.kill_timeout(),
        ))
    }

    /// Rebuild a handle for a VM started earlier, possibly by another agent
    ///
    /// Never starts a process. `task_name` only labels the new handle.
    ///
    /// # Errors
    /// - AppError::InvalidHandle if the identity cannot be decoded
    /// - AppError::Reattach if the executor cannot be reached
    pub async fn open(&self, task_name: &str, identity: &str) -> Result<ProcessHandle> {
        let id = HandleIdentity::decode(identity).map_err(|e| AppError::InvalidHandle {
            identity: identity.to_string(),
            reason: e.to_string(),
        })?;

        let connection = self
            .executor_client
            .reattach(&id.reattach)
            .await
            .map_err(AppError::Reattach)?;

        info!(
            task = %task_name,
            pid = %id.user_pid,
            executor_pid = %id.reattach.pid,
            executor_addr = %id.reattach.addr,
            "Reattached to running QemuVM"
        );

        Ok(ProcessHandle::supervise(
            task_name,
            connection,
            id.user_pid,
            id.kill_timeout,
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{
        ConfigError, NetworkResource, PortMap, QemuConfig, ReservedPort, Resources, WaitResult,
    };
    use crate::port::artifact::mocks::MockArtifactFetcher;
    use crate::port::executor::mocks::{MockBehavior, MockExecutorClient};
    use crate::port::ExecutorError;
    use std::path::PathBuf;
    use std::time::Duration;

    struct Fixture {
        client: Arc<MockExecutorClient>,
        fetcher: Arc<MockArtifactFetcher>,
        driver: QemuDriver,
    }

    fn fixture(behavior: MockBehavior) -> Fixture {
        let client = Arc::new(MockExecutorClient::new(behavior));
        let fetcher = Arc::new(MockArtifactFetcher::new());
        let driver = QemuDriver::new(client.clone(), fetcher.clone());
        Fixture {
            client,
            fetcher,
            driver,
        }
    }

    fn ctx() -> ExecutorContext {
        ExecutorContext::new("linux", PathBuf::from("/tmp/qvisor-test/linux"))
    }

    fn task(memory_mb: u64, port_map: Vec<PortMap>) -> TaskConfig {
        TaskConfig {
            name: "linux".to_string(),
            kill_timeout_ms: 100,
            resources: Some(Resources {
                memory_mb,
                networks: vec![NetworkResource {
                    reserved_ports: vec![ReservedPort {
                        label: "web".to_string(),
                        value: 22000,
                    }],
                }],
            }),
            config: QemuConfig {
                artifact_source: "https://example.com/linux.img".to_string(),
                checksum: None,
                accelerator: None,
                port_map,
            },
        }
    }

    #[tokio::test]
    async fn test_start_and_natural_exit() {
        let f = fixture(MockBehavior::default());
        let handle = f.driver.start(&ctx(), &task(512, vec![])).await.unwrap();

        assert_eq!(f.client.spawn_count(), 1);
        let executor = f.client.spawned().remove(0);
        assert_eq!(executor.launch_calls(), 1);
        assert_eq!(handle.kill_timeout(), Duration::from_millis(100));

        executor.finish(0, 0);
        assert_eq!(handle.wait().await, Some(WaitResult::new(0, 0, None)));
    }

    #[tokio::test]
    async fn test_invalid_task_has_no_side_effects() {
        let f = fixture(MockBehavior::default());

        let multi = task(
            512,
            vec![
                [("web".to_string(), 80)].into_iter().collect(),
                [("web".to_string(), 81)].into_iter().collect(),
            ],
        );
        let no_memory = task(0, vec![]);
        let bad_label = task(512, vec![[("ssh".to_string(), 22)].into_iter().collect()]);

        for t in [multi, no_memory, bad_label] {
            let err = f.driver.start(&ctx(), &t).await.unwrap_err();
            assert!(matches!(err, AppError::Config(_)), "got {err:?}");
        }

        assert_eq!(f.client.spawn_count(), 0);
        assert!(f.fetcher.fetched().is_empty());
    }

    #[tokio::test]
    async fn test_missing_memory_error_kind() {
        let f = fixture(MockBehavior::default());
        let err = f.driver.start(&ctx(), &task(0, vec![])).await.unwrap_err();
        assert!(matches!(err, AppError::Config(ConfigError::MissingMemory)));
    }

    #[tokio::test]
    async fn test_launch_failure_tears_down_executor() {
        let f = fixture(MockBehavior {
            fail_launch: Some("qemu-system-x86_64: not found".to_string()),
            ..Default::default()
        });

        let err = f.driver.start(&ctx(), &task(512, vec![])).await.unwrap_err();
        assert!(matches!(err, AppError::Launch(ExecutorError::LaunchFailed(_))));

        let executor = f.client.spawned().remove(0);
        assert_eq!(executor.teardown_calls(), 1);
    }

    #[tokio::test]
    async fn test_artifact_failure_spawns_nothing() {
        let client = Arc::new(MockExecutorClient::new(MockBehavior::default()));
        let driver = QemuDriver::new(
            client.clone(),
            Arc::new(MockArtifactFetcher::failing("404 Not Found")),
        );

        let err = driver.start(&ctx(), &task(512, vec![])).await.unwrap_err();
        assert!(matches!(err, AppError::Artifact(_)));
        assert_eq!(client.spawn_count(), 0);
    }

    #[tokio::test]
    async fn test_open_reattaches_to_same_process() {
        let f = fixture(MockBehavior::default());
        let original = f.driver.start(&ctx(), &task(512, vec![])).await.unwrap();
        original.update_kill_timeout(Duration::from_millis(750));
        let identity = original.identity().unwrap();

        let reopened = f.driver.open("linux", &identity).await.unwrap();
        assert_eq!(reopened.user_pid(), original.user_pid());
        assert_eq!(reopened.kill_timeout(), Duration::from_millis(750));
        assert_eq!(reopened.identity().unwrap(), identity);
        assert_eq!(f.client.spawn_count(), 1);

        f.client.spawned()[0].finish(7, 0);
        assert_eq!(reopened.wait().await, Some(WaitResult::new(7, 0, None)));
    }

    #[tokio::test]
    async fn test_open_rejects_garbage_identity() {
        let f = fixture(MockBehavior::default());
        let err = f.driver.open("linux", "{not an identity").await.unwrap_err();
        assert!(matches!(err, AppError::InvalidHandle { .. }));
        assert_eq!(f.client.spawn_count(), 0);
    }

    #[tokio::test]
    async fn test_open_classifies_dead_executor() {
        let f = fixture(MockBehavior::default());
        let handle = f.driver.start(&ctx(), &task(512, vec![])).await.unwrap();
        let identity = handle.identity().unwrap();
        let instance = HandleIdentity::decode(&identity).unwrap().reattach.instance_id;

        f.client.kill_executor(&instance);

        let err = f.driver.open("linux", &identity).await.unwrap_err();
        assert!(err.is_task_gone());
    }

    #[tokio::test]
    async fn test_open_unreachable_is_not_gone() {
        let f = fixture(MockBehavior::default());
        let handle = f.driver.start(&ctx(), &task(512, vec![])).await.unwrap();
        f.client.set_unreachable(true);

        let err = f.driver.open("linux", &handle.identity().unwrap()).await.unwrap_err();
        assert!(matches!(
            err,
            AppError::Reattach(ExecutorError::Unreachable { .. })
        ));
        assert!(!err.is_task_gone());
    }
}
