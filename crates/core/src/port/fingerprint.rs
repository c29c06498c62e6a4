// Fingerprint Port (hypervisor detection)

use async_trait::async_trait;
use std::collections::BTreeMap;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum FingerprintError {
    #[error("Unable to parse QEMU version string: {0:?}")]
    UnparsableVersion(String),
}

/// What the node reports about the local hypervisor
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Fingerprint {
    Available { version: String },
    Unavailable,
}

impl Fingerprint {
    /// Node attributes advertised for scheduling
    pub fn attributes(&self) -> BTreeMap<String, String> {
        let mut attrs = BTreeMap::new();
        if let Fingerprint::Available { version } = self {
            attrs.insert("driver.qemu".to_string(), "1".to_string());
            attrs.insert("driver.qemu.version".to_string(), version.clone());
        }
        attrs
    }
}

/// Detects the local hypervisor
///
/// A missing binary is `Unavailable`, never an error.
#[async_trait]
pub trait Fingerprinter: Send + Sync {
    async fn fingerprint(&self) -> Result<Fingerprint, FingerprintError>;
}
