// Composition root: wires the SQLite store and system adapters into services

use anyhow::{anyhow, Context, Result};
use std::sync::Arc;
use tracing::info;

use qvisor_core::application::{QemuDriver, RecoveryService, TaskService};
use qvisor_core::port::time_provider::SystemTimeProvider;
use qvisor_core::port::{HandleRepository, TimeProvider};
use qvisor_infra_sqlite::{create_pool, run_migrations, SqliteHandleRepository};
use qvisor_infra_system::{LocalArtifactFetcher, RpcExecutorClient};

use crate::config::AgentConfig;

pub struct App {
    pub config: AgentConfig,
    pub tasks: Arc<TaskService>,
    pub recovery: RecoveryService,
}

impl App {
    pub async fn init(config: AgentConfig) -> Result<Self> {
        if let Some(dir) = config.db_dir() {
            std::fs::create_dir_all(dir)
                .with_context(|| format!("Failed to create {}", dir.display()))?;
        }
        let db_path = config
            .db_path
            .to_str()
            .with_context(|| format!("Database path is not UTF-8: {}", config.db_path.display()))?;

        info!(db_path = %db_path, "Opening handle store");
        let pool = create_pool(db_path)
            .await
            .map_err(|e| anyhow!("DB pool creation failed: {}", e))?;
        run_migrations(&pool)
            .await
            .map_err(|e| anyhow!("Migration failed: {}", e))?;

        // The executor is this same binary under a hidden subcommand
        let executor_bin =
            std::env::current_exe().context("Failed to locate the qvisor binary")?;

        let time_provider: Arc<dyn TimeProvider> = Arc::new(SystemTimeProvider);
        let handle_repo: Arc<dyn HandleRepository> = Arc::new(SqliteHandleRepository::new(pool));
        let driver = Arc::new(QemuDriver::new(
            Arc::new(RpcExecutorClient::new(executor_bin)),
            Arc::new(LocalArtifactFetcher::new()),
        ));

        let tasks = Arc::new(TaskService::new(
            driver.clone(),
            handle_repo.clone(),
            time_provider.clone(),
        ));
        let recovery = RecoveryService::new(handle_repo, driver, time_provider);

        Ok(Self {
            config,
            tasks,
            recovery,
        })
    }
}
