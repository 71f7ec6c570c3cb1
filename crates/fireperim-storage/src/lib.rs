//! Output artifact storage and the feature service HTTP client.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Context;
use sha2::{Digest, Sha256};
use thiserror::Error;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::debug;
use uuid::Uuid;

pub const CRATE_NAME: &str = "fireperim-storage";

#[derive(Debug, Clone)]
pub struct StoredArtifact {
    pub content_hash: String,
    pub absolute_path: PathBuf,
    pub byte_size: usize,
    /// The previous file at this path had identical content.
    pub unchanged: bool,
}

/// Writes the single published document, replacing the previous cycle's file.
#[derive(Debug, Clone)]
pub struct ArtifactStore {
    root: PathBuf,
}

impl ArtifactStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn artifact_path(&self, file_name: &str) -> PathBuf {
        self.root.join(file_name)
    }

    pub fn sha256_hex(bytes: &[u8]) -> String {
        let mut hasher = Sha256::new();
        hasher.update(bytes);
        hex::encode(hasher.finalize())
    }

    async fn existing_hash(path: &Path) -> anyhow::Result<Option<String>> {
        match fs::read(path).await {
            Ok(bytes) => Ok(Some(Self::sha256_hex(&bytes))),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(err) => Err(err).with_context(|| format!("reading {}", path.display())),
        }
    }

    /// Overwrite `file_name` under the root using a temp-file + rename, so a
    /// reader never observes a half-written document.
    pub async fn overwrite(&self, file_name: &str, bytes: &[u8]) -> anyhow::Result<StoredArtifact> {
        let absolute_path = self.artifact_path(file_name);
        fs::create_dir_all(&self.root)
            .await
            .with_context(|| format!("creating output directory {}", self.root.display()))?;

        let content_hash = Self::sha256_hex(bytes);
        let unchanged = Self::existing_hash(&absolute_path).await?.as_deref() == Some(content_hash.as_str());

        let temp_path = self
            .root
            .join(format!(".{}.{}.tmp", Uuid::new_v4(), bytes.len()));

        let mut file = fs::OpenOptions::new()
            .create_new(true)
            .write(true)
            .open(&temp_path)
            .await
            .with_context(|| format!("opening temp artifact file {}", temp_path.display()))?;
        file.write_all(bytes)
            .await
            .with_context(|| format!("writing temp artifact file {}", temp_path.display()))?;
        file.flush()
            .await
            .with_context(|| format!("flushing temp artifact file {}", temp_path.display()))?;
        drop(file);

        if let Err(err) = fs::rename(&temp_path, &absolute_path).await {
            let _ = fs::remove_file(&temp_path).await;
            return Err(err).with_context(|| {
                format!(
                    "atomically renaming temp artifact {} -> {}",
                    temp_path.display(),
                    absolute_path.display()
                )
            });
        }

        debug!(path = %absolute_path.display(), %content_hash, unchanged, "artifact written");
        Ok(StoredArtifact {
            content_hash,
            absolute_path,
            byte_size: bytes.len(),
            unchanged,
        })
    }
}

pub const DEFAULT_USER_AGENT: &str = "fireperim/0.1";

#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    pub timeout: Duration,
    pub user_agent: String,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(30),
            user_agent: DEFAULT_USER_AGENT.to_string(),
        }
    }
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("request to {url} failed: {source}")]
    Transport {
        url: String,
        #[source]
        source: reqwest::Error,
    },
    #[error("http status {status} for {url}")]
    HttpStatus { status: u16, url: String },
}

/// Throttling (429) and server-side (5xx) codes. ArcGIS reuses the HTTP
/// codes inside its `error` envelope, so this applies to both.
pub fn is_transient_code(code: u16) -> bool {
    code == 429 || (500..=599).contains(&code)
}

impl FetchError {
    /// Another attempt may succeed: a transient status, or the request never
    /// got an answer (connect failure, timeout).
    pub fn is_transient(&self) -> bool {
        match self {
            FetchError::Transport { source, .. } => source.is_connect() || source.is_timeout(),
            FetchError::HttpStatus { status, .. } => is_transient_code(*status),
        }
    }
}

/// Single-shot GET client. Whether to try again is the caller's decision.
#[derive(Debug, Clone)]
pub struct HttpClient {
    client: reqwest::Client,
}

impl HttpClient {
    pub fn new(config: &HttpClientConfig) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(config.timeout)
            .user_agent(config.user_agent.clone())
            .build()
            .context("building feature service client")?;
        Ok(Self { client })
    }

    /// GET `url` once and return the body of a 2xx response.
    pub async fn get(&self, url: &str) -> Result<Vec<u8>, FetchError> {
        let transport = |source: reqwest::Error| FetchError::Transport {
            url: url.to_string(),
            source,
        };
        let response = self.client.get(url).send().await.map_err(transport)?;
        let status = response.status();
        if !status.is_success() {
            return Err(FetchError::HttpStatus {
                status: status.as_u16(),
                url: response.url().to_string(),
            });
        }
        let body = response.bytes().await.map_err(transport)?;
        debug!(%status, bytes = body.len(), "feature service responded");
        Ok(body.to_vec())
    }
}
