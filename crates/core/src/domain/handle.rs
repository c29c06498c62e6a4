// Handle Domain Model

use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::time::Duration;

use crate::domain::protocol::{EXECUTOR_NETWORK, PROTOCOL_VERSION};

/// Exit code reported when the outcome of a process is unknown
pub const UNKNOWN_EXIT_CODE: i32 = -1;

/// Process Handle lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum HandleState {
    Starting,
    Running,
    Stopping,
    Exited,
}

impl HandleState {
    /// Exited is terminal; Stopping can only be entered from Running
    pub fn can_transition_to(self, next: HandleState) -> bool {
        use HandleState::*;
        matches!(
            (self, next),
            (Starting, Running)
                | (Starting, Exited)
                | (Running, Stopping)
                | (Running, Exited)
                | (Stopping, Exited)
        )
    }
}

impl std::fmt::Display for HandleState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            HandleState::Starting => write!(f, "STARTING"),
            HandleState::Running => write!(f, "RUNNING"),
            HandleState::Stopping => write!(f, "STOPPING"),
            HandleState::Exited => write!(f, "EXITED"),
        }
    }
}

/// How to reconnect to a live executor
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReattachDescriptor {
    pub protocol_version: u32,
    pub network: String,
    pub addr: String,
    /// OS pid of the executor itself
    pub pid: u32,
    /// Random id the executor picked at boot
    pub instance_id: String,
}

impl ReattachDescriptor {
    pub fn new(addr: SocketAddr, pid: u32, instance_id: impl Into<String>) -> Self {
        Self {
            protocol_version: PROTOCOL_VERSION,
            network: EXECUTOR_NETWORK.to_string(),
            addr: addr.to_string(),
            pid,
            instance_id: instance_id.into(),
        }
    }

    /// Check the descriptor is usable before any connection attempt
    pub fn validate(&self) -> Result<SocketAddr, String> {
        if self.protocol_version != PROTOCOL_VERSION {
            return Err(format!(
                "unsupported protocol version {} (expected {})",
                self.protocol_version, PROTOCOL_VERSION
            ));
        }
        if self.network != EXECUTOR_NETWORK {
            return Err(format!("unsupported network {:?}", self.network));
        }
        if self.pid == 0 {
            return Err("executor pid must be non-zero".to_string());
        }
        if self.instance_id.is_empty() {
            return Err("executor instance id is empty".to_string());
        }
        self.addr
            .parse::<SocketAddr>()
            .map_err(|e| format!("invalid executor address {:?}: {}", self.addr, e))
    }

    /// WebSocket URL of the executor RPC endpoint
    pub fn url(&self) -> String {
        format!("ws://{}", self.addr)
    }
}

/// Durable identity of a running task
///
/// Encoded into the identity string handed to the orchestrator. Holds only
/// what is needed to find and control the running process again.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HandleIdentity {
    pub kill_timeout: Duration,
    pub user_pid: u32,
    pub reattach: ReattachDescriptor,
}

impl HandleIdentity {
    pub fn encode(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    pub fn decode(identity: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(identity)
    }
}

/// Process state as reported by the executor
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProcessState {
    pub pid: u32,
    pub exit_code: i32,
    pub signal: i32,
}

/// Terminal outcome of a supervised process
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WaitResult {
    pub exit_code: i32,
    pub signal: i32,
    pub error: Option<String>,
}

impl WaitResult {
    pub fn new(exit_code: i32, signal: i32, error: Option<String>) -> Self {
        Self {
            exit_code,
            signal,
            error,
        }
    }

    /// Outcome unknown (e.g. the executor connection dropped)
    pub fn unknown(error: impl Into<String>) -> Self {
        Self::new(UNKNOWN_EXIT_CODE, 0, Some(error.into()))
    }

    pub fn successful(&self) -> bool {
        self.exit_code == 0 && self.signal == 0 && self.error.is_none()
    }
}

impl From<ProcessState> for WaitResult {
    fn from(state: ProcessState) -> Self {
        Self::new(state.exit_code, state.signal, None)
    }
}

impl std::fmt::Display for WaitResult {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "exit_code={} signal={}", self.exit_code, self.signal)?;
        if let Some(err) = &self.error {
            write!(f, " error={}", err)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn descriptor() -> ReattachDescriptor {
        ReattachDescriptor::new("127.0.0.1:40123".parse().unwrap(), 4242, "c0ffee")
    }

    #[test]
    fn test_identity_round_trip() {
        let identity = HandleIdentity {
            kill_timeout: Duration::from_millis(1500),
            user_pid: 777,
            reattach: descriptor(),
        };

        let encoded = identity.encode().unwrap();
        let decoded = HandleIdentity::decode(&encoded).unwrap();

        assert_eq!(decoded, identity);
        assert_eq!(decoded.encode().unwrap(), encoded);
    }

    #[test]
    fn test_identity_decode_rejects_garbage() {
        assert!(HandleIdentity::decode("not json").is_err());
        assert!(HandleIdentity::decode(r#"{"user_pid": 1}"#).is_err());
    }

    #[test]
    fn test_descriptor_validation() {
        assert!(descriptor().validate().is_ok());

        let mut bad_addr = descriptor();
        bad_addr.addr = "nowhere".to_string();
        assert!(bad_addr.validate().is_err());

        let mut bad_version = descriptor();
        bad_version.protocol_version = PROTOCOL_VERSION + 1;
        assert!(bad_version.validate().unwrap_err().contains("protocol"));

        let mut no_pid = descriptor();
        no_pid.pid = 0;
        assert!(no_pid.validate().is_err());
    }

    #[test]
    fn test_state_transitions() {
        assert!(HandleState::Running.can_transition_to(HandleState::Stopping));
        assert!(HandleState::Stopping.can_transition_to(HandleState::Exited));
        assert!(!HandleState::Exited.can_transition_to(HandleState::Running));
        assert!(!HandleState::Exited.can_transition_to(HandleState::Stopping));
    }

    #[test]
    fn test_wait_result_from_process_state() {
        let result = WaitResult::from(ProcessState {
            pid: 1,
            exit_code: 0,
            signal: 0,
        });
        assert!(result.successful());

        let unknown = WaitResult::unknown("connection reset");
        assert_eq!(unknown.exit_code, UNKNOWN_EXIT_CODE);
        assert!(!unknown.successful());
    }
}
