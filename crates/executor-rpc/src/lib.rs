//! Executor JSON-RPC Layer
//!
//! The executor owns exactly one VM process and outlives the agent that
//! started it. Agents talk to it over JSON-RPC on a localhost WebSocket.

pub mod error;
pub mod handler;
pub mod server;

pub use handler::ExecutorHandler;
pub use server::{ExecutorServer, RunningExecutor};
