// QEMU LaunchSpec Builder
//
// Validation runs to completion before anything touches disk or spawns a
// process, so a bad task never leaves an artifact or executor behind.

use std::path::Path;

use crate::application::constants::{
    NETDEV_ID, PORT_FORWARD_PROTOCOLS, QEMU_BINARY, QEMU_MACHINE_TYPE,
};
use crate::domain::task::KVM_ACCELERATOR;
use crate::domain::{ConfigError, LaunchSpec, PortForward, TaskConfig};

/// A task that passed validation
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LaunchPlan {
    pub task_name: String,
    pub artifact_source: String,
    pub checksum: Option<String>,
    pub accelerator: String,
    pub memory_mb: u64,
    pub port_forwards: Vec<PortForward>,
}

/// Validate a task and resolve its port map
///
/// # Errors
/// - ConfigError::MultiplePortMaps if more than one port_map block is given
/// - ConfigError::MissingArtifactSource if no image source is set
/// - ConfigError::MissingMemory if memory is absent or zero
/// - ConfigError::UnknownPortLabel if a label has no reserved port
pub fn validate(task: &TaskConfig) -> Result<LaunchPlan, ConfigError> {
    if task.name.trim().is_empty() {
        return Err(ConfigError::Invalid("task name cannot be empty".to_string()));
    }

    let driver = &task.config;
    if driver.port_map.len() > 1 {
        return Err(ConfigError::MultiplePortMaps(driver.port_map.len()));
    }

    if driver.artifact_source.trim().is_empty() {
        return Err(ConfigError::MissingArtifactSource);
    }

    // QEMU silently defaults to 128M; require an explicit reservation instead
    let memory_mb = task.memory_mb().ok_or(ConfigError::MissingMemory)?;

    Ok(LaunchPlan {
        task_name: task.name.clone(),
        artifact_source: driver.artifact_source.clone(),
        checksum: driver.checksum.clone().filter(|c| !c.is_empty()),
        accelerator: driver.accelerator().to_string(),
        memory_mb,
        port_forwards: resolve_port_forwards(task)?,
    })
}

/// Resolve port-map labels against the task's reserved ports
fn resolve_port_forwards(task: &TaskConfig) -> Result<Vec<PortForward>, ConfigError> {
    let Some(port_map) = task.config.port_map.first() else {
        return Ok(Vec::new());
    };

    let reserved = task
        .primary_network()
        .map(|n| n.label_to_values())
        .unwrap_or_default();

    port_map
        .iter()
        .map(|(label, guest)| {
            let host = reserved
                .get(label.as_str())
                .ok_or_else(|| ConfigError::UnknownPortLabel(label.clone()))?;
            Ok(PortForward {
                label: label.clone(),
                host: *host,
                guest: *guest,
            })
        })
        .collect()
}

/// Build the QEMU command line for a validated plan and a local image
pub fn build(plan: &LaunchPlan, vm_path: &Path) -> LaunchSpec {
    let vm_id = vm_path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| plan.task_name.clone());

    let mut args: Vec<String> = vec![
        "-machine".into(),
        format!("type={},accel={}", QEMU_MACHINE_TYPE, plan.accelerator),
        "-name".into(),
        vm_id.clone(),
        "-m".into(),
        format!("{}M", plan.memory_mb),
        "-drive".into(),
        format!("file={}", vm_path.display()),
        "-nodefconfig".into(),
        "-nodefaults".into(),
        "-nographic".into(),
    ];

    // Without forwards the VM can still reach out but nothing reaches in
    if !plan.port_forwards.is_empty() {
        let forwarding: Vec<String> = plan
            .port_forwards
            .iter()
            .flat_map(|fwd| {
                PORT_FORWARD_PROTOCOLS
                    .iter()
                    .map(move |proto| format!("hostfwd={}::{}-:{}", proto, fwd.host, fwd.guest))
            })
            .collect();

        args.push("-netdev".into());
        args.push(format!("user,id={},{}", NETDEV_ID, forwarding.join(",")));
        args.push("-device".into());
        args.push(format!("virtio-net,netdev={}", NETDEV_ID));
    }

    if plan.accelerator == KVM_ACCELERATOR {
        args.push("-enable-kvm".into());
        args.push("-cpu".into());
        args.push("host".into());
    }

    LaunchSpec {
        vm_id,
        command: QEMU_BINARY.to_string(),
        args,
        memory_mb: plan.memory_mb,
        port_forwards: plan.port_forwards.clone(),
    }
}
