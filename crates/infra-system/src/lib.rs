// qvisor Infrastructure - System Adapters
// Implements: ExecutorClient, ArtifactFetcher, Fingerprinter

pub mod artifact;
pub mod executor_client;
pub mod fingerprint;
pub mod process;
pub mod rpc_connection;

pub use artifact::LocalArtifactFetcher;
pub use executor_client::RpcExecutorClient;
pub use fingerprint::QemuFingerprinter;
pub use rpc_connection::RpcExecutorConnection;
