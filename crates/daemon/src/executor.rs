// `qvisor executor`: the out-of-process executor
//
// Spawned by the agent with the magic cookie set. Prints one handshake line
// on stdout, then serves RPC until it is killed or told to stop by signal.

use anyhow::{anyhow, Result};
use std::io::Write;
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, info, warn};

use qvisor_core::domain::protocol::{MAGIC_COOKIE_KEY, MAGIC_COOKIE_VALUE};
use qvisor_executor_rpc::error::ProcessError;
use qvisor_executor_rpc::server::DEFAULT_BIND_ADDR;
use qvisor_executor_rpc::{ExecutorHandler, ExecutorServer};

use crate::logging;

pub fn cookie_matches(value: Option<&str>) -> bool {
    value == Some(MAGIC_COOKIE_VALUE)
}

pub async fn run(log_file: &Path) -> Result<()> {
    if !cookie_matches(std::env::var(MAGIC_COOKIE_KEY).ok().as_deref()) {
        anyhow::bail!(
            "the executor is started by the qvisor agent and cannot be run by hand"
        );
    }

    let _guard = logging::init_file(log_file)?;

    let handler = Arc::new(ExecutorHandler::new());
    let running = ExecutorServer::new(handler.clone())
        .start(DEFAULT_BIND_ADDR)
        .await
        .map_err(|e| anyhow!("Executor server start failed: {}", e))?;

    {
        let mut stdout = std::io::stdout().lock();
        writeln!(stdout, "{}", running.handshake_line())?;
        stdout.flush()?;
    }
    info!(
        pid = %std::process::id(),
        addr = %running.addr(),
        "Executor ready"
    );

    tokio::select! {
        signal = shutdown_signal() => {
            let signal = signal?;
            info!(signal = %signal, "Executor received stop signal");
            stop_process(&handler).await;
        }
        _ = running.stopped() => {
            warn!("Executor server stopped");
        }
    }

    info!("Executor exiting");
    Ok(())
}

/// Never leave the VM behind when the executor itself is asked to go
async fn stop_process(handler: &ExecutorHandler) {
    if handler.has_exited() {
        return;
    }
    match handler.exit().await {
        Ok(_) => info!("Killed managed process"),
        Err(ProcessError::NotLaunched) => debug!("No managed process to kill"),
        Err(e) => warn!(error = %e, "Failed to kill managed process"),
    }
}

#[cfg(unix)]
async fn shutdown_signal() -> Result<&'static str> {
    use tokio::signal::unix::{signal, SignalKind};

    let mut term = signal(SignalKind::terminate())?;
    tokio::select! {
        result = tokio::signal::ctrl_c() => result.map(|_| "SIGINT").map_err(Into::into),
        _ = term.recv() => Ok("SIGTERM"),
    }
}

#[cfg(not(unix))]
async fn shutdown_signal() -> Result<&'static str> {
    tokio::signal::ctrl_c().await?;
    Ok("ctrl-c")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cookie_check() {
        assert!(cookie_matches(Some(MAGIC_COOKIE_VALUE)));
        assert!(!cookie_matches(Some("guess")));
        assert!(!cookie_matches(None));
    }
}
