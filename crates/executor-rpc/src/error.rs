//! RPC Error Types
//!
//! Maps process errors to JSON-RPC error codes.

use jsonrpsee::types::ErrorObjectOwned;
use thiserror::Error;

/// RPC Error Codes
pub mod code {
    pub const VALIDATION_ERROR: i32 = 4000;
    pub const NOT_FOUND: i32 = 4001;
    pub const CONFLICT: i32 = 4002;
    pub const INTERNAL_ERROR: i32 = 5000;
    pub const SYSTEM_ERROR: i32 = 5002;
}

/// Errors of the executor's single managed process
#[derive(Error, Debug)]
pub enum ProcessError {
    #[error("Invalid launch request: {0}")]
    Validation(String),

    #[error("No process has been launched")]
    NotLaunched,

    #[error("A process is already running (pid {0})")]
    AlreadyLaunched(u32),

    #[error("Failed to start {cmd}: {reason}")]
    SpawnFailed { cmd: String, reason: String },

    #[error("Failed to signal pid {pid}: {reason}")]
    Signal { pid: u32, reason: String },

    #[error("Internal error: {0}")]
    Internal(String),
}

/// Convert ProcessError to JSON-RPC ErrorObject
pub fn to_rpc_error(err: ProcessError) -> ErrorObjectOwned {
    let code = match &err {
        ProcessError::Validation(_) => code::VALIDATION_ERROR,
        ProcessError::NotLaunched => code::NOT_FOUND,
        ProcessError::AlreadyLaunched(_) => code::CONFLICT,
        ProcessError::SpawnFailed { .. } | ProcessError::Signal { .. } => code::SYSTEM_ERROR,
        ProcessError::Internal(_) => code::INTERNAL_ERROR,
    };
    ErrorObjectOwned::owned(code, err.to_string(), None::<()>)
}
