// Executor connection over JSON-RPC (WebSocket)
//
// Control calls (launch, shutdown, exit) and the blocking wait run on
// separate clients so a pending wait never delays a kill.

use async_trait::async_trait;
use jsonrpsee::core::client::{ClientT, Subscription, SubscriptionClientT};
use jsonrpsee::core::ClientError;
use jsonrpsee::rpc_params;
use jsonrpsee::ws_client::{WsClient, WsClientBuilder};
use std::sync::Mutex as StdMutex;
use std::time::Duration;
use tokio::process::Child;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use qvisor_core::domain::protocol::{
    method, Ack, HandshakeResponse, LaunchCmdRequest, LaunchCmdResponse, OutputLine,
    OutputStream, EXECUTOR_CAPABILITY, PROTOCOL_VERSION,
};
use qvisor_core::domain::{ExecCommand, ExecutorContext, ProcessState, ReattachDescriptor};
use qvisor_core::port::{ExecutorConnection, ExecutorError};

#[cfg(unix)]
use crate::process;

/// Default timeout for control requests
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// The wait call blocks for the lifetime of the VM
const WAIT_REQUEST_TIMEOUT: Duration = Duration::from_secs(60 * 60 * 24 * 365);

/// Budget for confirming a reattached executor before killing it
#[cfg(unix)]
const TEARDOWN_CHECK_TIMEOUT: Duration = Duration::from_secs(2);

/// Map a jsonrpsee client error onto the executor port
pub(crate) fn map_client_error(e: ClientError) -> ExecutorError {
    match e {
        ClientError::Call(call_err) => ExecutorError::Rpc {
            code: call_err.code(),
            message: call_err.message().to_string(),
        },
        ClientError::Transport(e) => ExecutorError::ConnectionLost(format!("transport: {}", e)),
        ClientError::RestartNeeded(e) => ExecutorError::ConnectionLost(e.to_string()),
        ClientError::RequestTimeout => {
            ExecutorError::ConnectionLost("request timed out".to_string())
        }
        other => ExecutorError::ConnectionLost(other.to_string()),
    }
}

pub struct RpcExecutorConnection {
    descriptor: ReattachDescriptor,
    control: WsClient,
    waiter: WsClient,
    /// Present when this agent spawned the executor and must reap it
    child: Mutex<Option<Child>>,
    output_forwarder: StdMutex<Option<JoinHandle<()>>>,
}

impl RpcExecutorConnection {
    /// Connect to the executor described by `descriptor` and verify its handshake
    ///
    /// # Errors
    /// - ExecutorError::Unreachable if no connection can be made
    /// - ExecutorError::UnsupportedProtocol if the executor speaks another protocol
    /// - ExecutorError::InstanceMismatch if a different executor answers
    pub async fn connect(
        descriptor: ReattachDescriptor,
        request_timeout: Duration,
    ) -> Result<Self, ExecutorError> {
        let control = build_client(&descriptor, request_timeout, request_timeout).await?;
        request_handshake(&control, &descriptor).await?;
        let waiter = build_client(&descriptor, WAIT_REQUEST_TIMEOUT, request_timeout).await?;

        let connection = Self {
            descriptor,
            control,
            waiter,
            child: Mutex::new(None),
            output_forwarder: StdMutex::new(None),
        };
        connection.forward_output().await;

        debug!(
            executor_addr = %connection.descriptor.addr,
            executor_pid = %connection.descriptor.pid,
            instance_id = %connection.descriptor.instance_id,
            "Connected to executor"
        );
        Ok(connection)
    }

    /// Hand over the executor process this agent spawned, to be killed and
    /// reaped on teardown
    pub fn with_child(mut self, child: Child) -> Self {
        *self.child.get_mut() = Some(child);
        self
    }

    /// Whether the recorded executor still answers at its address
    ///
    /// Uses a fresh connection: a dead executor's pid may have been reused,
    /// so only a matching handshake proves the pid is still ours.
    #[cfg(unix)]
    async fn executor_still_running(&self) -> bool {
        let client =
            match build_client(&self.descriptor, TEARDOWN_CHECK_TIMEOUT, TEARDOWN_CHECK_TIMEOUT)
                .await
            {
                Ok(client) => client,
                Err(_) => return false,
            };
        match request_handshake(&client, &self.descriptor).await {
            Ok(()) => true,
            Err(e) => {
                debug!(executor_pid = %self.descriptor.pid, error = %e, "Executor no longer answers");
                false
            }
        }
    }

    /// Kill a reattached executor, but only one that still proves its identity
    async fn stop_reattached(&self) {
        #[cfg(unix)]
        {
            if !self.executor_still_running().await {
                debug!(executor_pid = %self.descriptor.pid, "Executor already gone, not signalling its pid");
                return;
            }
            if let Err(e) = process::force_kill(self.descriptor.pid) {
                warn!(executor_pid = %self.descriptor.pid, error = %e, "Failed to stop executor");
            }
        }
    }

    /// Relay VM stdout/stderr into the agent's log
    async fn forward_output(&self) {
        let subscription: Subscription<OutputLine> = match self
            .control
            .subscribe(
                method::SUBSCRIBE_OUTPUT,
                rpc_params![],
                method::UNSUBSCRIBE_OUTPUT,
            )
            .await
        {
            Ok(sub) => sub,
            Err(e) => {
                warn!(error = %e, "Executor output subscription failed, VM output is only in the executor log");
                return;
            }
        };

        let executor_pid = self.descriptor.pid;
        let forwarder = tokio::spawn(async move {
            let mut subscription = subscription;
            while let Some(next) = subscription.next().await {
                match next {
                    Ok(OutputLine {
                        stream: OutputStream::Stdout,
                        line,
                    }) => info!(target: "qvisor::vm", executor_pid = %executor_pid, "{}", line),
                    Ok(OutputLine {
                        stream: OutputStream::Stderr,
                        line,
                    }) => warn!(target: "qvisor::vm", executor_pid = %executor_pid, "{}", line),
                    Err(e) => {
                        debug!(error = %e, "Dropping malformed output notification");
                    }
                }
            }
        });

        if let Ok(mut slot) = self.output_forwarder.lock() {
            *slot = Some(forwarder);
        }
    }
}

async fn build_client(
    descriptor: &ReattachDescriptor,
    request_timeout: Duration,
    connection_timeout: Duration,
) -> Result<WsClient, ExecutorError> {
    WsClientBuilder::default()
        .request_timeout(request_timeout)
        .connection_timeout(connection_timeout)
        .build(descriptor.url())
        .await
        .map_err(|e| unreachable(descriptor, e))
}

fn unreachable(descriptor: &ReattachDescriptor, e: ClientError) -> ExecutorError {
    ExecutorError::Unreachable {
        addr: descriptor.addr.clone(),
        reason: e.to_string(),
    }
}

async fn request_handshake(
    client: &WsClient,
    descriptor: &ReattachDescriptor,
) -> Result<(), ExecutorError> {
    let handshake: HandshakeResponse = client
        .request(method::HANDSHAKE, rpc_params![])
        .await
        .map_err(|e| match e {
            ClientError::Call(call) => ExecutorError::UnsupportedProtocol {
                expected: format!("{} v{}", EXECUTOR_CAPABILITY, PROTOCOL_VERSION),
                found: call.message().to_string(),
            },
            other => unreachable(descriptor, other),
        })?;
    verify_handshake(descriptor, &handshake)
}

fn verify_handshake(
    descriptor: &ReattachDescriptor,
    handshake: &HandshakeResponse,
) -> Result<(), ExecutorError> {
    if handshake.protocol_version != PROTOCOL_VERSION
        || handshake.capability != EXECUTOR_CAPABILITY
    {
        return Err(ExecutorError::UnsupportedProtocol {
            expected: format!("{} v{}", EXECUTOR_CAPABILITY, PROTOCOL_VERSION),
            found: format!("{} v{}", handshake.capability, handshake.protocol_version),
        });
    }
    if handshake.instance_id != descriptor.instance_id || handshake.pid != descriptor.pid {
        return Err(ExecutorError::InstanceMismatch {
            addr: descriptor.addr.clone(),
            expected: format!("{} (pid {})", descriptor.instance_id, descriptor.pid),
            found: format!("{} (pid {})", handshake.instance_id, handshake.pid),
        });
    }
    Ok(())
}

#[async_trait]
impl ExecutorConnection for RpcExecutorConnection {
    fn reattach_descriptor(&self) -> ReattachDescriptor {
        self.descriptor.clone()
    }

    async fn launch_cmd(
        &self,
        command: &ExecCommand,
        context: &ExecutorContext,
    ) -> Result<ProcessState, ExecutorError> {
        let request = LaunchCmdRequest {
            command: command.clone(),
            context: context.clone(),
        };
        let response: LaunchCmdResponse = self
            .control
            .request(method::LAUNCH_CMD, rpc_params![request])
            .await
            .map_err(map_client_error)?;

        Ok(ProcessState {
            pid: response.pid,
            exit_code: 0,
            signal: 0,
        })
    }

    async fn wait(&self) -> Result<ProcessState, ExecutorError> {
        self.waiter
            .request(method::WAIT, rpc_params![])
            .await
            .map_err(map_client_error)
    }

    async fn shutdown(&self) -> Result<(), ExecutorError> {
        let _: Ack = self
            .control
            .request(method::SHUTDOWN, rpc_params![])
            .await
            .map_err(map_client_error)?;
        Ok(())
    }

    async fn exit(&self) -> Result<(), ExecutorError> {
        let _: Ack = self
            .control
            .request(method::EXIT, rpc_params![])
            .await
            .map_err(map_client_error)?;
        Ok(())
    }

    async fn teardown(&self) {
        if let Ok(mut slot) = self.output_forwarder.lock() {
            if let Some(forwarder) = slot.take() {
                forwarder.abort();
            }
        }

        let owned = self.child.lock().await.take();
        match owned {
            Some(mut child) => match child.kill().await {
                Ok(()) => debug!(executor_pid = %self.descriptor.pid, "Executor killed and reaped"),
                Err(e) => warn!(executor_pid = %self.descriptor.pid, error = %e, "Failed to stop executor"),
            },
            None => self.stop_reattached().await,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use jsonrpsee::types::ErrorObjectOwned;

    fn descriptor() -> ReattachDescriptor {
        ReattachDescriptor::new("127.0.0.1:40500".parse().unwrap(), 321, "abc")
    }

    fn handshake(instance_id: &str, pid: u32) -> HandshakeResponse {
        HandshakeResponse {
            protocol_version: PROTOCOL_VERSION,
            capability: EXECUTOR_CAPABILITY.to_string(),
            instance_id: instance_id.to_string(),
            pid,
        }
    }

    #[test]
    fn test_handshake_accepts_matching_executor() {
        tokio_test::assert_ok!(verify_handshake(&descriptor(), &handshake("abc", 321)));
    }

    #[test]
    fn test_handshake_detects_other_instance() {
        let err = verify_handshake(&descriptor(), &handshake("other", 321)).unwrap_err();
        assert!(matches!(err, ExecutorError::InstanceMismatch { .. }));

        let err = verify_handshake(&descriptor(), &handshake("abc", 999)).unwrap_err();
        assert!(matches!(err, ExecutorError::InstanceMismatch { .. }));
    }

    #[test]
    fn test_handshake_rejects_other_capability() {
        let mut hs = handshake("abc", 321);
        hs.capability = "plugin".to_string();
        let err = verify_handshake(&descriptor(), &hs).unwrap_err();
        assert!(matches!(err, ExecutorError::UnsupportedProtocol { .. }));
    }

    #[test]
    fn test_call_errors_keep_code() {
        let err = map_client_error(ClientError::Call(ErrorObjectOwned::owned(
            5002,
            "no process running",
            None::<()>,
        )));
        match err {
            ExecutorError::Rpc { code, message } => {
                assert_eq!(code, 5002);
                assert_eq!(message, "no process running");
            }
            other => panic!("unexpected {other:?}"),
        }
        assert!(matches!(
            map_client_error(ClientError::RequestTimeout),
            ExecutorError::ConnectionLost(_)
        ));
    }
}
