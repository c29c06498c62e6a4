// Domain Layer - Pure types and invariants

pub mod error;
pub mod handle;
pub mod launch;
pub mod protocol;
pub mod record;
pub mod task;

// Re-exports
pub use error::{ConfigError, DomainError};
pub use handle::{
    HandleIdentity, HandleState, ProcessState, ReattachDescriptor, WaitResult, UNKNOWN_EXIT_CODE,
};
pub use launch::{ExecCommand, ExecutorContext, LaunchSpec, PortForward};
pub use record::{TaskRecord, TaskRecordState};
pub use task::{NetworkResource, PortMap, QemuConfig, ReservedPort, Resources, TaskConfig};
