//! Executor wire protocol
//!
//! Shared by the executor server and the agent-side client: method names,
//! handshake, and request/response types.

use serde::{Deserialize, Serialize};
use std::net::SocketAddr;

use crate::domain::launch::{ExecCommand, ExecutorContext};

pub const PROTOCOL_VERSION: u32 = 1;

/// Capability every executor must advertise in its handshake
pub const EXECUTOR_CAPABILITY: &str = "executor";

pub const EXECUTOR_NETWORK: &str = "tcp";

/// Env var the agent sets when spawning an executor
pub const MAGIC_COOKIE_KEY: &str = "QVISOR_EXECUTOR_COOKIE";
pub const MAGIC_COOKIE_VALUE: &str = "d5c1a8e6f0b24e7c9a3f1b2c8d4e6f70";

pub mod method {
    pub const HANDSHAKE: &str = "executor.handshake.v1";
    pub const LAUNCH_CMD: &str = "executor.launch_cmd.v1";
    pub const WAIT: &str = "executor.wait.v1";
    pub const SHUTDOWN: &str = "executor.shutdown.v1";
    pub const EXIT: &str = "executor.exit.v1";
    pub const SUBSCRIBE_OUTPUT: &str = "executor.subscribe_output.v1";
    pub const OUTPUT_NOTIFICATION: &str = "executor.output.v1";
    pub const UNSUBSCRIBE_OUTPUT: &str = "executor.unsubscribe_output.v1";
}

/// executor.handshake.v1
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HandshakeResponse {
    pub protocol_version: u32,
    pub capability: String,
    pub instance_id: String,
    pub pid: u32,
}

/// executor.launch_cmd.v1
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LaunchCmdRequest {
    pub command: ExecCommand,
    pub context: ExecutorContext,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LaunchCmdResponse {
    pub pid: u32,
}

/// Acknowledgement for shutdown / exit
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Ack {
    pub ok: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OutputStream {
    Stdout,
    Stderr,
}

/// One line of process output (executor.output.v1 notification)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutputLine {
    pub stream: OutputStream,
    pub line: String,
}

/// First line an executor prints on stdout: `version|network|addr|instance_id`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HandshakeLine {
    pub protocol_version: u32,
    pub network: String,
    pub addr: SocketAddr,
    pub instance_id: String,
}

impl HandshakeLine {
    pub fn new(addr: SocketAddr, instance_id: impl Into<String>) -> Self {
        Self {
            protocol_version: PROTOCOL_VERSION,
            network: EXECUTOR_NETWORK.to_string(),
            addr,
            instance_id: instance_id.into(),
        }
    }

    pub fn parse(line: &str) -> Result<Self, String> {
        let parts: Vec<&str> = line.trim().split('|').collect();
        if parts.len() != 4 {
            return Err(format!(
                "expected 4 fields in handshake line, got {}: {:?}",
                parts.len(),
                line
            ));
        }

        let protocol_version: u32 = parts[0]
            .parse()
            .map_err(|_| format!("invalid protocol version {:?}", parts[0]))?;
        if protocol_version != PROTOCOL_VERSION {
            return Err(format!(
                "incompatible protocol version {} (expected {})",
                protocol_version, PROTOCOL_VERSION
            ));
        }
        if parts[1] != EXECUTOR_NETWORK {
            return Err(format!("unsupported network {:?}", parts[1]));
        }
        let addr: SocketAddr = parts[2]
            .parse()
            .map_err(|e| format!("invalid address {:?}: {}", parts[2], e))?;
        if parts[3].is_empty() {
            return Err("missing instance id".to_string());
        }

        Ok(Self {
            protocol_version,
            network: parts[1].to_string(),
            addr,
            instance_id: parts[3].to_string(),
        })
    }
}

impl std::fmt::Display for HandshakeLine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{}|{}|{}|{}",
            self.protocol_version, self.network, self.addr, self.instance_id
        )
    }
}
