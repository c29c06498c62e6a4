// QEMU fingerprinter: probes the local binary for its version

use async_trait::async_trait;
use tokio::process::Command;
use tracing::debug;

use qvisor_core::application::constants::{QEMU_BINARY, QEMU_IMG_BINARY};
use qvisor_core::application::fingerprint::parse_qemu_version;
use qvisor_core::port::{Fingerprint, FingerprintError, Fingerprinter};

pub struct QemuFingerprinter {
    binary: String,
}

impl QemuFingerprinter {
    pub fn new() -> Self {
        if cfg!(windows) {
            Self::with_binary(QEMU_IMG_BINARY)
        } else {
            Self::with_binary(QEMU_BINARY)
        }
    }

    pub fn with_binary(binary: impl Into<String>) -> Self {
        Self {
            binary: binary.into(),
        }
    }
}

impl Default for QemuFingerprinter {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Fingerprinter for QemuFingerprinter {
    async fn fingerprint(&self) -> Result<Fingerprint, FingerprintError> {
        let output = match Command::new(&self.binary).arg("--version").output().await {
            Ok(output) => output,
            Err(e) => {
                debug!(binary = %self.binary, error = %e, "QEMU not found");
                return Ok(Fingerprint::Unavailable);
            }
        };

        if !output.status.success() {
            debug!(binary = %self.binary, status = %output.status, "QEMU version probe failed");
            return Ok(Fingerprint::Unavailable);
        }

        parse_qemu_version(&String::from_utf8_lossy(&output.stdout))
    }
}
