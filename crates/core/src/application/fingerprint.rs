// QEMU version parsing

use regex::Regex;
use std::sync::LazyLock;

use crate::port::fingerprint::{Fingerprint, FingerprintError};

static QEMU_VERSION: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"version (\d[\.\d+]+)").expect("QEMU version pattern is valid")
});

/// Parse `qemu-system-x86_64 --version` output
pub fn parse_qemu_version(output: &str) -> Result<Fingerprint, FingerprintError> {
    let output = output.trim();
    QEMU_VERSION
        .captures(output)
        .and_then(|caps| caps.get(1))
        .map(|m| Fingerprint::Available {
            version: m.as_str().to_string(),
        })
        .ok_or_else(|| FingerprintError::UnparsableVersion(output.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_release_version() {
        let out = "QEMU emulator version 2.4.0, Copyright (c) 2003-2008 Fabrice Bellard\n";
        assert_eq!(
            parse_qemu_version(out).unwrap(),
            Fingerprint::Available {
                version: "2.4.0".to_string()
            }
        );
    }

    #[test]
    fn test_parse_distro_version() {
        let out = "QEMU emulator version 8.2.2 (Debian 1:8.2.2+ds-0ubuntu1)\nCopyright (c) 2003-2023";
        let fp = parse_qemu_version(out).unwrap();
        assert_eq!(fp.attributes().get("driver.qemu.version").unwrap(), "8.2.2");
        assert_eq!(fp.attributes().get("driver.qemu").unwrap(), "1");
    }

    #[test]
    fn test_parse_garbage_is_error() {
        assert!(parse_qemu_version("command not found").is_err());
    }

    #[test]
    fn test_unavailable_has_no_attributes() {
        assert!(Fingerprint::Unavailable.attributes().is_empty());
    }
}
