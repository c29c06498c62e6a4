//! JSON-RPC Server
//!
//! Serves one ExecutorHandler over WebSocket on localhost.

use crate::error::to_rpc_error;
use crate::handler::ExecutorHandler;
use jsonrpsee::server::{Server, ServerHandle};
use jsonrpsee::types::ErrorObjectOwned;
use jsonrpsee::{PendingSubscriptionSink, RpcModule, SubscriptionMessage};
use qvisor_core::domain::protocol::{method, HandshakeLine, LaunchCmdRequest};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::sync::broadcast::error::RecvError;
use tracing::{debug, info, warn};

/// Executors only ever listen on loopback, on a port the OS picks
pub const DEFAULT_BIND_ADDR: &str = "127.0.0.1:0";

/// Executor RPC Server
pub struct ExecutorServer {
    handler: Arc<ExecutorHandler>,
}

/// A started executor server
pub struct RunningExecutor {
    handle: ServerHandle,
    addr: SocketAddr,
    handler: Arc<ExecutorHandler>,
}

impl RunningExecutor {
    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    pub fn handler(&self) -> &Arc<ExecutorHandler> {
        &self.handler
    }

    /// Line announcing this executor to the process that spawned it
    pub fn handshake_line(&self) -> HandshakeLine {
        HandshakeLine::new(self.addr, self.handler.instance_id())
    }

    /// Stop serving; the managed process is left alone
    pub fn stop(&self) {
        if self.handle.stop().is_err() {
            debug!("Executor server already stopped");
        }
    }

    pub async fn stopped(self) {
        self.handle.stopped().await
    }
}

impl ExecutorServer {
    pub fn new(handler: Arc<ExecutorHandler>) -> Self {
        Self { handler }
    }

    /// Bind and start serving
    pub async fn start(self, bind_addr: &str) -> Result<RunningExecutor, String> {
        let server = Server::builder()
            .build(bind_addr)
            .await
            .map_err(|e| format!("Failed to build server on {}: {}", bind_addr, e))?;
        let addr = server
            .local_addr()
            .map_err(|e| format!("Failed to read bound address: {}", e))?;

        let module = self.module()?;
        let handle = server.start(module);

        info!(
            addr = %addr,
            instance_id = %self.handler.instance_id(),
            "Executor RPC server started (localhost only)"
        );

        Ok(RunningExecutor {
            handle,
            addr,
            handler: self.handler,
        })
    }

    fn module(&self) -> Result<RpcModule<()>, String> {
        let mut module = RpcModule::new(());

        let handler = self.handler.clone();
        module.register_async_method(method::HANDSHAKE, move |_, _, _| {
            let handler = handler.clone();
            async move { Ok::<_, ErrorObjectOwned>(handler.handshake()) }
        })
        .map_err(|e| e.to_string())?;

        let handler = self.handler.clone();
        module.register_async_method(method::LAUNCH_CMD, move |params, _, _| {
            let handler = handler.clone();
            async move {
                let req: LaunchCmdRequest = params.one()?;
                handler.launch_cmd(req).await.map_err(to_rpc_error)
            }
        })
        .map_err(|e| e.to_string())?;

        let handler = self.handler.clone();
        module.register_async_method(method::WAIT, move |_, _, _| {
            let handler = handler.clone();
            async move { handler.wait().await.map_err(to_rpc_error) }
        })
        .map_err(|e| e.to_string())?;

        let handler = self.handler.clone();
        module.register_async_method(method::SHUTDOWN, move |_, _, _| {
            let handler = handler.clone();
            async move { handler.shutdown().await.map_err(to_rpc_error) }
        })
        .map_err(|e| e.to_string())?;

        let handler = self.handler.clone();
        module.register_async_method(method::EXIT, move |_, _, _| {
            let handler = handler.clone();
            async move { handler.exit().await.map_err(to_rpc_error) }
        })
        .map_err(|e| e.to_string())?;

        let handler = self.handler.clone();
        module.register_subscription(
            method::SUBSCRIBE_OUTPUT,
            method::OUTPUT_NOTIFICATION,
            method::UNSUBSCRIBE_OUTPUT,
            move |_, pending, _, _| {
                let handler = handler.clone();
                async move { stream_output(&handler, pending).await }
            },
        )
        .map_err(|e| e.to_string())?;

        Ok(module)
    }
}

async fn stream_output(
    handler: &ExecutorHandler,
    pending: PendingSubscriptionSink,
) -> jsonrpsee::core::SubscriptionResult {
    let mut output = handler.subscribe_output();
    let sink = pending.accept().await?;

    loop {
        tokio::select! {
            _ = sink.closed() => break,
            next = output.recv() => match next {
                Ok(line) => {
                    let msg = SubscriptionMessage::from_json(&line)?;
                    if sink.send(msg).await.is_err() {
                        break;
                    }
                }
                Err(RecvError::Lagged(skipped)) => {
                    warn!(skipped = %skipped, "Output subscriber fell behind, lines dropped");
                }
                Err(RecvError::Closed) => break,
            },
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use jsonrpsee::core::client::ClientT;
    use jsonrpsee::rpc_params;
    use jsonrpsee::ws_client::WsClientBuilder;
    use qvisor_core::domain::protocol::HandshakeResponse;

    #[tokio::test]
    async fn test_serves_handshake_on_ephemeral_port() {
        let running = ExecutorServer::new(Arc::new(ExecutorHandler::new()))
            .start(DEFAULT_BIND_ADDR)
            .await
            .unwrap();
        assert_ne!(running.addr().port(), 0);

        let client = WsClientBuilder::default()
            .build(format!("ws://{}", running.addr()))
            .await
            .unwrap();
        let hs: HandshakeResponse = client
            .request(method::HANDSHAKE, rpc_params![])
            .await
            .unwrap();

        assert_eq!(hs.instance_id, running.handler().instance_id());
        let line = HandshakeLine::parse(&running.handshake_line().to_string()).unwrap();
        assert_eq!(line.addr, running.addr());

        running.stop();
        running.stopped().await;
    }

    #[tokio::test]
    async fn test_wait_before_launch_is_not_found() {
        let running = ExecutorServer::new(Arc::new(ExecutorHandler::new()))
            .start(DEFAULT_BIND_ADDR)
            .await
            .unwrap();
        let client = WsClientBuilder::default()
            .build(format!("ws://{}", running.addr()))
            .await
            .unwrap();

        let err = client
            .request::<serde_json::Value, _>(method::WAIT, rpc_params![])
            .await
            .unwrap_err();
        match err {
            jsonrpsee::core::ClientError::Call(e) => {
                assert_eq!(e.code(), crate::error::code::NOT_FOUND)
            }
            other => panic!("unexpected {other:?}"),
        }
    }
}
