// Artifact Fetcher Port

use async_trait::async_trait;
use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ArtifactError {
    #[error("Invalid artifact source {0:?}")]
    InvalidSource(String),

    #[error("Failed to fetch artifact {source_url}: {reason}")]
    FetchFailed { source_url: String, reason: String },

    #[error("Unsupported checksum type {0:?}")]
    UnsupportedChecksum(String),

    #[error("Checksum mismatch for {path}: expected {expected}, got {actual}")]
    ChecksumMismatch {
        path: String,
        expected: String,
        actual: String,
    },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Places a verified disk image on local disk
#[async_trait]
pub trait ArtifactFetcher: Send + Sync {
    /// Fetch `source` into `dest_dir` and verify `checksum` (`type:hex`)
    ///
    /// # Returns
    /// Local path of the verified image
    async fn fetch(
        &self,
        dest_dir: &Path,
        source: &str,
        checksum: Option<&str>,
    ) -> Result<PathBuf, ArtifactError>;
}

pub mod mocks {
    use super::*;
    use std::sync::Mutex;

    /// Returns `dest_dir/<file name of source>` without touching disk
    #[derive(Default)]
    pub struct MockArtifactFetcher {
        fail: Option<String>,
        fetched: Mutex<Vec<String>>,
    }

    impl MockArtifactFetcher {
        pub fn new() -> Self {
            Self::default()
        }

        pub fn failing(reason: impl Into<String>) -> Self {
            Self {
                fail: Some(reason.into()),
                fetched: Mutex::new(Vec::new()),
            }
        }

        pub fn fetched(&self) -> Vec<String> {
            self.fetched.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl ArtifactFetcher for MockArtifactFetcher {
        async fn fetch(
            &self,
            dest_dir: &Path,
            source: &str,
            _checksum: Option<&str>,
        ) -> Result<PathBuf, ArtifactError> {
            self.fetched.lock().unwrap().push(source.to_string());
            if let Some(reason) = &self.fail {
                return Err(ArtifactError::FetchFailed {
                    source_url: source.to_string(),
                    reason: reason.clone(),
                });
            }
            let file_name = Path::new(source)
                .file_name()
                .ok_or_else(|| ArtifactError::InvalidSource(source.to_string()))?;
            Ok(dest_dir.join(file_name))
        }
    }
}
