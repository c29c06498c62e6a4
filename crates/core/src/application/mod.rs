// Application Layer - Use Cases and Business Logic

pub mod constants;
pub mod driver;
pub mod fingerprint;
pub mod handle;
pub mod launch_spec;
pub mod recovery;
pub mod tasks;

// Re-exports
pub use driver::QemuDriver;
pub use handle::{DoneSignal, ProcessHandle, ResultChannel};
pub use launch_spec::LaunchPlan;
pub use recovery::{RecoveryReport, RecoveryService};
pub use tasks::TaskService;
