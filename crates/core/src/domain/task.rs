// Task Configuration Domain Model

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::time::Duration;

/// Default kill timeout when a task does not set one (5s)
pub const DEFAULT_KILL_TIMEOUT_MS: u64 = 5000;

fn default_kill_timeout_ms() -> u64 {
    DEFAULT_KILL_TIMEOUT_MS
}

/// A task to be run as a QEMU virtual machine
///
/// Decoded from a TOML task file. Driver keys live under `config` and unknown
/// keys are rejected instead of silently dropped.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskConfig {
    pub name: String,

    #[serde(default = "default_kill_timeout_ms")]
    pub kill_timeout_ms: u64,

    #[serde(default)]
    pub resources: Option<Resources>,

    pub config: QemuConfig,
}

impl TaskConfig {
    pub fn kill_timeout(&self) -> Duration {
        Duration::from_millis(self.kill_timeout_ms)
    }

    /// Memory in MB, `None` when missing or zero
    pub fn memory_mb(&self) -> Option<u64> {
        self.resources
            .as_ref()
            .map(|r| r.memory_mb)
            .filter(|mb| *mb > 0)
    }

    /// The network the port map resolves against (first network only)
    pub fn primary_network(&self) -> Option<&NetworkResource> {
        self.resources.as_ref().and_then(|r| r.networks.first())
    }
}

/// Task resource reservation
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Resources {
    #[serde(default)]
    pub memory_mb: u64,

    #[serde(default)]
    pub networks: Vec<NetworkResource>,
}

/// Reserved host ports for one network
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetworkResource {
    #[serde(default)]
    pub reserved_ports: Vec<ReservedPort>,
}

impl NetworkResource {
    /// Map each port label to its reserved host port
    pub fn label_to_values(&self) -> HashMap<&str, u16> {
        self.reserved_ports
            .iter()
            .map(|p| (p.label.as_str(), p.value))
            .collect()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReservedPort {
    pub label: String,
    pub value: u16,
}

/// Guest port keyed by host port label
pub type PortMap = BTreeMap<String, u16>;

/// QEMU driver configuration block
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct QemuConfig {
    #[serde(default)]
    pub artifact_source: String,

    #[serde(default)]
    pub checksum: Option<String>,

    #[serde(default)]
    pub accelerator: Option<String>,

    #[serde(default)]
    pub port_map: Vec<PortMap>,
}

impl QemuConfig {
    /// Accelerator passed to `-machine accel=`, `tcg` unless set
    pub fn accelerator(&self) -> &str {
        match self.accelerator.as_deref() {
            Some(acc) if !acc.is_empty() => acc,
            _ => DEFAULT_ACCELERATOR,
        }
    }
}

/// Software emulation, always available
pub const DEFAULT_ACCELERATOR: &str = "tcg";

/// Hardware-assisted virtualization on Linux hosts
pub const KVM_ACCELERATOR: &str = "kvm";
