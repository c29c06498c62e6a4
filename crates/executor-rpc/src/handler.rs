//! Process management behind the executor RPC methods
//!
//! One executor runs at most one process. Its outcome is kept after exit so
//! an agent that reattaches later still receives it.

use std::process::{ExitStatus, Stdio};
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::Command;
use tokio::sync::{broadcast, watch, Mutex};
use tracing::{debug, info, warn};

use qvisor_core::domain::protocol::{
    Ack, HandshakeResponse, LaunchCmdRequest, LaunchCmdResponse, OutputLine, OutputStream,
    EXECUTOR_CAPABILITY, PROTOCOL_VERSION,
};
use qvisor_core::domain::ProcessState;

use crate::error::ProcessError;

/// Output lines buffered per subscriber before it starts skipping
const OUTPUT_BUFFER: usize = 256;

pub struct ExecutorHandler {
    instance_id: String,
    pid: u32,
    /// pid of the launched process
    process: Mutex<Option<u32>>,
    outcome: watch::Sender<Option<ProcessState>>,
    output: broadcast::Sender<OutputLine>,
}

impl ExecutorHandler {
    pub fn new() -> Self {
        let (outcome, _) = watch::channel(None);
        let (output, _) = broadcast::channel(OUTPUT_BUFFER);
        Self {
            instance_id: uuid::Uuid::new_v4().simple().to_string(),
            pid: std::process::id(),
            process: Mutex::new(None),
            outcome,
            output,
        }
    }

    pub fn instance_id(&self) -> &str {
        &self.instance_id
    }

    /// executor.handshake.v1
    pub fn handshake(&self) -> HandshakeResponse {
        HandshakeResponse {
            protocol_version: PROTOCOL_VERSION,
            capability: EXECUTOR_CAPABILITY.to_string(),
            instance_id: self.instance_id.clone(),
            pid: self.pid,
        }
    }

    /// executor.launch_cmd.v1
    pub async fn launch_cmd(
        &self,
        request: LaunchCmdRequest,
    ) -> Result<LaunchCmdResponse, ProcessError> {
        let mut slot = self.process.lock().await;
        if let Some(pid) = *slot {
            return Err(ProcessError::AlreadyLaunched(pid));
        }

        let command = request.command;
        if command.cmd.trim().is_empty() {
            return Err(ProcessError::Validation("command is empty".to_string()));
        }

        let mut cmd = Command::new(&command.cmd);
        cmd.args(&command.args)
            .envs(&request.context.env)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        if request.context.task_dir.is_dir() {
            cmd.current_dir(&request.context.task_dir);
        }

        let mut child = cmd.spawn().map_err(|e| ProcessError::SpawnFailed {
            cmd: command.cmd.clone(),
            reason: e.to_string(),
        })?;
        let pid = child
            .id()
            .ok_or_else(|| ProcessError::Internal("process exited before reporting a pid".into()))?;

        info!(
            task = %request.context.task_name,
            pid = %pid,
            cmd = %command.cmd,
            args = ?command.args,
            "Launched process"
        );

        if let Some(stdout) = child.stdout.take() {
            tokio::spawn(pump_output(stdout, OutputStream::Stdout, self.output.clone()));
        }
        if let Some(stderr) = child.stderr.take() {
            tokio::spawn(pump_output(stderr, OutputStream::Stderr, self.output.clone()));
        }

        let outcome = self.outcome.clone();
        tokio::spawn(async move {
            let state = match child.wait().await {
                Ok(status) => process_state(pid, status),
                Err(e) => {
                    warn!(pid = %pid, error = %e, "Failed to wait on process");
                    ProcessState {
                        pid,
                        exit_code: -1,
                        signal: 0,
                    }
                }
            };
            info!(
                pid = %pid,
                exit_code = %state.exit_code,
                signal = %state.signal,
                "Process exited"
            );
            outcome.send_replace(Some(state));
        });

        *slot = Some(pid);
        Ok(LaunchCmdResponse { pid })
    }

    /// executor.wait.v1
    ///
    /// Blocks until the process exits; returns at once if it already has.
    pub async fn wait(&self) -> Result<ProcessState, ProcessError> {
        if self.process.lock().await.is_none() {
            return Err(ProcessError::NotLaunched);
        }

        let mut rx = self.outcome.subscribe();
        let outcome = rx
            .wait_for(|o| o.is_some())
            .await
            .map_err(|e| ProcessError::Internal(e.to_string()))?;
        (*outcome).ok_or_else(|| ProcessError::Internal("outcome missing".to_string()))
    }

    /// executor.shutdown.v1
    pub async fn shutdown(&self) -> Result<Ack, ProcessError> {
        self.signal(TerminationSignal::Graceful).await
    }

    /// executor.exit.v1
    pub async fn exit(&self) -> Result<Ack, ProcessError> {
        self.signal(TerminationSignal::Forced).await
    }

    /// Stream of the process's output lines
    pub fn subscribe_output(&self) -> broadcast::Receiver<OutputLine> {
        self.output.subscribe()
    }

    pub fn has_exited(&self) -> bool {
        self.outcome.borrow().is_some()
    }

    async fn signal(&self, signal: TerminationSignal) -> Result<Ack, ProcessError> {
        let pid = (*self.process.lock().await).ok_or(ProcessError::NotLaunched)?;

        // The pid may already belong to someone else
        if self.has_exited() {
            debug!(pid = %pid, "Process already exited, nothing to signal");
            return Ok(Ack { ok: true });
        }

        info!(pid = %pid, signal = ?signal, "Signalling process");
        send_signal(pid, signal)?;
        Ok(Ack { ok: true })
    }
}

impl Default for ExecutorHandler {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Clone, Copy)]
enum TerminationSignal {
    Graceful,
    Forced,
}

#[cfg(unix)]
fn send_signal(pid: u32, signal: TerminationSignal) -> Result<(), ProcessError> {
    use nix::sys::signal::{kill, Signal};
    use nix::unistd::Pid;

    let target = i32::try_from(pid).map_err(|e| ProcessError::Signal {
        pid,
        reason: e.to_string(),
    })?;
    let sig = match signal {
        TerminationSignal::Graceful => Signal::SIGTERM,
        TerminationSignal::Forced => Signal::SIGKILL,
    };
    match kill(Pid::from_raw(target), sig) {
        Ok(()) | Err(nix::errno::Errno::ESRCH) => Ok(()),
        Err(e) => Err(ProcessError::Signal {
            pid,
            reason: e.to_string(),
        }),
    }
}

#[cfg(not(unix))]
fn send_signal(pid: u32, _signal: TerminationSignal) -> Result<(), ProcessError> {
    Err(ProcessError::Signal {
        pid,
        reason: "signals are not supported on this platform".to_string(),
    })
}

/// Exit code and signal; a signalled process reports 128 + signal as its code
fn process_state(pid: u32, status: ExitStatus) -> ProcessState {
    #[cfg(unix)]
    {
        use std::os::unix::process::ExitStatusExt;
        if let Some(signal) = status.signal() {
            return ProcessState {
                pid,
                exit_code: 128 + signal,
                signal,
            };
        }
    }

    ProcessState {
        pid,
        exit_code: status.code().unwrap_or(-1),
        signal: 0,
    }
}

async fn pump_output<R>(reader: R, stream: OutputStream, output: broadcast::Sender<OutputLine>)
where
    R: AsyncRead + Unpin,
{
    let mut lines = BufReader::new(reader).lines();
    loop {
        match lines.next_line().await {
            Ok(Some(line)) => {
                match stream {
                    OutputStream::Stdout => info!(target: "qvisor::vm", "{}", line),
                    OutputStream::Stderr => warn!(target: "qvisor::vm", "{}", line),
                }
                // No subscribers is fine, the log file keeps the line
                let _ = output.send(OutputLine { stream, line });
            }
            Ok(None) => break,
            Err(e) => {
                debug!(stream = ?stream, error = %e, "Output stream closed");
                break;
            }
        }
    }
}
