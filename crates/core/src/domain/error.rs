// Domain Error Types

use thiserror::Error;

#[derive(Error, Debug)]
pub enum DomainError {
    #[error("Validation error: {0}")]
    ValidationError(String),
}

/// Task configuration errors
///
/// Fatal to a launch and never retried. Raised before any side effect.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    #[error("Missing required task resource: memory")]
    MissingMemory,

    #[error("Only one port_map block is allowed in the qemu driver config, got {0}")]
    MultiplePortMaps(usize),

    #[error("Unknown port label {0:?}")]
    UnknownPortLabel(String),

    #[error("Missing artifact_source for qemu image")]
    MissingArtifactSource,

    #[error("Invalid task config: {0}")]
    Invalid(String),
}
