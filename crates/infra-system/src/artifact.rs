// Artifact fetcher: local paths, file:// and http(s):// images with checksum verification

use async_trait::async_trait;
use sha2::{Digest, Sha256, Sha512};
use std::path::{Path, PathBuf};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tracing::{debug, info};

use qvisor_core::port::{ArtifactError, ArtifactFetcher};

const COPY_BUFFER_SIZE: usize = 64 * 1024;

/// Expected digest of an artifact, parsed from `type:hex`
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Checksum {
    Sha256(String),
    Sha512(String),
}

impl Checksum {
    pub fn parse(spec: &str) -> Result<Self, ArtifactError> {
        let (kind, hex) = spec
            .split_once(':')
            .ok_or_else(|| ArtifactError::UnsupportedChecksum(spec.to_string()))?;
        let hex = hex.trim().to_ascii_lowercase();
        if hex.is_empty() || !hex.chars().all(|c| c.is_ascii_hexdigit()) {
            return Err(ArtifactError::UnsupportedChecksum(spec.to_string()));
        }
        match kind.trim().to_ascii_lowercase().as_str() {
            "sha256" => Ok(Checksum::Sha256(hex)),
            "sha512" => Ok(Checksum::Sha512(hex)),
            _ => Err(ArtifactError::UnsupportedChecksum(spec.to_string())),
        }
    }

    fn expected(&self) -> &str {
        match self {
            Checksum::Sha256(hex) | Checksum::Sha512(hex) => hex,
        }
    }

    fn hasher(&self) -> Hasher {
        match self {
            Checksum::Sha256(_) => Hasher::Sha256(Sha256::new()),
            Checksum::Sha512(_) => Hasher::Sha512(Sha512::new()),
        }
    }
}

enum Hasher {
    Sha256(Sha256),
    Sha512(Sha512),
}

impl Hasher {
    fn update(&mut self, data: &[u8]) {
        match self {
            Hasher::Sha256(h) => h.update(data),
            Hasher::Sha512(h) => h.update(data),
        }
    }

    fn finalize_hex(self) -> String {
        match self {
            Hasher::Sha256(h) => format!("{:x}", h.finalize()),
            Hasher::Sha512(h) => format!("{:x}", h.finalize()),
        }
    }
}

/// Where an artifact comes from
#[derive(Debug, Clone, PartialEq, Eq)]
enum Source {
    Http(String),
    File(PathBuf),
}

impl Source {
    fn parse(source: &str) -> Result<Self, ArtifactError> {
        let source = source.trim();
        if source.starts_with("http://") || source.starts_with("https://") {
            return Ok(Source::Http(source.to_string()));
        }
        if let Some(path) = source.strip_prefix("file://") {
            return Ok(Source::File(PathBuf::from(path)));
        }
        if source.contains("://") || source.is_empty() {
            return Err(ArtifactError::InvalidSource(source.to_string()));
        }
        Ok(Source::File(PathBuf::from(source)))
    }

    fn file_name(&self) -> Option<String> {
        let name = match self {
            Source::Http(url) => {
                let path = url.split(['?', '#']).next().unwrap_or(url);
                path.rsplit('/').next().map(str::to_string)
            }
            Source::File(path) => path
                .file_name()
                .map(|n| n.to_string_lossy().into_owned()),
        };
        name.filter(|n| !n.is_empty())
    }
}

/// Fetches VM images into the task's local directory
pub struct LocalArtifactFetcher {
    http: reqwest::Client,
}

impl LocalArtifactFetcher {
    pub fn new() -> Self {
        Self {
            http: reqwest::Client::new(),
        }
    }

    async fn download(
        &self,
        url: &str,
        dest: &Path,
        hasher: &mut Option<Hasher>,
    ) -> Result<(), ArtifactError> {
        let fetch_failed = |reason: String| ArtifactError::FetchFailed {
            source_url: url.to_string(),
            reason,
        };

        let mut response = self
            .http
            .get(url)
            .send()
            .await
            .and_then(|r| r.error_for_status())
            .map_err(|e| fetch_failed(e.to_string()))?;

        let mut file = tokio::fs::File::create(dest).await?;
        while let Some(chunk) = response
            .chunk()
            .await
            .map_err(|e| fetch_failed(e.to_string()))?
        {
            if let Some(h) = hasher.as_mut() {
                h.update(&chunk);
            }
            file.write_all(&chunk).await?;
        }
        file.flush().await?;
        Ok(())
    }

    async fn copy(
        src: &Path,
        dest: &Path,
        hasher: &mut Option<Hasher>,
    ) -> Result<(), ArtifactError> {
        let mut input = tokio::fs::File::open(src)
            .await
            .map_err(|e| ArtifactError::FetchFailed {
                source_url: src.display().to_string(),
                reason: e.to_string(),
            })?;
        let mut output = tokio::fs::File::create(dest).await?;
        let mut buf = vec![0u8; COPY_BUFFER_SIZE];

        loop {
            let n = input.read(&mut buf).await?;
            if n == 0 {
                break;
            }
            if let Some(h) = hasher.as_mut() {
                h.update(&buf[..n]);
            }
            output.write_all(&buf[..n]).await?;
        }
        output.flush().await?;
        Ok(())
    }
}

impl Default for LocalArtifactFetcher {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ArtifactFetcher for LocalArtifactFetcher {
    async fn fetch(
        &self,
        dest_dir: &Path,
        source: &str,
        checksum: Option<&str>,
    ) -> Result<PathBuf, ArtifactError> {
        // Parse everything before touching the filesystem
        let parsed = Source::parse(source)?;
        let checksum = checksum.map(Checksum::parse).transpose()?;
        let file_name = parsed
            .file_name()
            .ok_or_else(|| ArtifactError::InvalidSource(source.to_string()))?;

        tokio::fs::create_dir_all(dest_dir).await?;
        let dest = dest_dir.join(&file_name);
        let partial = dest_dir.join(format!(".{}.part", file_name));
        let mut hasher = checksum.as_ref().map(Checksum::hasher);

        debug!(source = %source, dest = %dest.display(), "Fetching artifact");
        let fetched = match &parsed {
            Source::Http(url) => self.download(url, &partial, &mut hasher).await,
            Source::File(path) => Self::copy(path, &partial, &mut hasher).await,
        };
        if let Err(e) = fetched {
            let _ = tokio::fs::remove_file(&partial).await;
            return Err(e);
        }

        if let (Some(expected), Some(hasher)) = (&checksum, hasher) {
            let actual = hasher.finalize_hex();
            if actual != expected.expected() {
                let _ = tokio::fs::remove_file(&partial).await;
                return Err(ArtifactError::ChecksumMismatch {
                    path: dest.display().to_string(),
                    expected: expected.expected().to_string(),
                    actual,
                });
            }
        }

        tokio::fs::rename(&partial, &dest).await?;
        info!(source = %source, path = %dest.display(), "Artifact ready");
        Ok(dest)
    }
}
