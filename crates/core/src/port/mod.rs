// Port Layer - Interfaces for external dependencies

pub mod artifact;
pub mod executor;
pub mod fingerprint;
pub mod handle_repository;
pub mod time_provider;

// Re-exports
pub use artifact::{ArtifactError, ArtifactFetcher};
pub use executor::{ExecutorClient, ExecutorConnection, ExecutorError, LaunchedProcess};
pub use fingerprint::{Fingerprint, FingerprintError, Fingerprinter};
pub use handle_repository::HandleRepository;
pub use time_provider::TimeProvider;
