//! Atomic file storage, the persisted store document, and HTTP fetch utilities.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Context;
use noticias_core::StoreDocument;
use reqwest::StatusCode;
use sha2::{Digest, Sha256};
use thiserror::Error;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info_span, Instrument};
use uuid::Uuid;

pub const CRATE_NAME: &str = "noticias-storage";

pub fn sha256_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hex::encode(hasher.finalize())
}

#[derive(Debug, Clone)]
pub struct StoredArtifact {
    pub content_hash: String,
    pub relative_path: PathBuf,
    pub absolute_path: PathBuf,
    pub byte_size: usize,
}

/// Replace `path` with `bytes` via a sibling temp file and a rename, so
/// readers observe either the old content or the new content, never a mix.
pub async fn write_atomic(path: &Path, bytes: &[u8]) -> anyhow::Result<()> {
    let parent = match path.parent() {
        Some(p) if !p.as_os_str().is_empty() => p.to_path_buf(),
        _ => PathBuf::from("."),
    };
    fs::create_dir_all(&parent)
        .await
        .with_context(|| format!("creating directory {}", parent.display()))?;

    let temp_name = format!(".{}.{}.tmp", Uuid::new_v4(), bytes.len());
    let temp_path = parent.join(temp_name);

    let mut file = fs::OpenOptions::new()
        .create_new(true)
        .write(true)
        .open(&temp_path)
        .await
        .with_context(|| format!("opening temp file {}", temp_path.display()))?;
    let written = async {
        file.write_all(bytes).await?;
        file.flush().await?;
        file.sync_all().await
    }
    .await;
    drop(file);
    if let Err(err) = written {
        let _ = fs::remove_file(&temp_path).await;
        return Err(err).with_context(|| format!("writing temp file {}", temp_path.display()));
    }

    if let Err(err) = fs::rename(&temp_path, path).await {
        let _ = fs::remove_file(&temp_path).await;
        return Err(err).with_context(|| {
            format!(
                "atomically renaming temp file {} -> {}",
                temp_path.display(),
                path.display()
            )
        });
    }
    Ok(())
}

/// Directory of generated binary artifacts (audio files) addressed by relative path.
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

    pub async fn store_named(
        &self,
        relative_path: impl AsRef<Path>,
        bytes: &[u8],
    ) -> anyhow::Result<StoredArtifact> {
        let relative_path = relative_path.as_ref().to_path_buf();
        let absolute_path = self.root.join(&relative_path);
        write_atomic(&absolute_path, bytes).await?;
        Ok(StoredArtifact {
            content_hash: sha256_hex(bytes),
            relative_path,
            absolute_path,
            byte_size: bytes.len(),
        })
    }
}

/// The single JSON document holding the accumulation store.
#[derive(Debug, Clone)]
pub struct StoreFile {
    path: PathBuf,
}

impl StoreFile {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// `Ok(None)` when the file does not exist yet. A file that exists but
    /// does not parse is an error: callers must not treat it as empty.
    pub async fn load(&self) -> anyhow::Result<Option<StoreDocument>> {
        let bytes = match fs::read(&self.path).await {
            Ok(bytes) => bytes,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(err) => {
                return Err(err).with_context(|| format!("reading {}", self.path.display()))
            }
        };
        let doc = serde_json::from_slice(&bytes)
            .with_context(|| format!("parsing store document {}", self.path.display()))?;
        Ok(Some(doc))
    }

    /// Serialize and atomically replace the store; returns the SHA-256 of the written bytes.
    pub async fn save(&self, doc: &StoreDocument) -> anyhow::Result<String> {
        let mut bytes = serde_json::to_vec_pretty(doc).context("serializing store document")?;
        bytes.push(b'\n');
        write_atomic(&self.path, &bytes).await?;
        debug!(path = %self.path.display(), bytes = bytes.len(), "store document written");
        Ok(sha256_hex(&bytes))
    }
}

/// Why a failed response is worth another try; `None` means give up.
fn transient_status(status: StatusCode) -> Option<&'static str> {
    if status == StatusCode::TOO_MANY_REQUESTS {
        Some("throttled")
    } else if status.is_server_error() {
        Some("server error")
    } else {
        None
    }
}

fn transient_transport(err: &reqwest::Error) -> Option<&'static str> {
    if err.is_timeout() {
        Some("timeout")
    } else if err.is_connect() {
        Some("connect failed")
    } else if err.is_request() {
        Some("request failed")
    } else {
        None
    }
}

/// Retries after the first attempt, doubling from `base_delay` up to `max_delay`.
#[derive(Debug, Clone, Copy)]
pub struct BackoffPolicy {
    pub max_retries: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            max_retries: 2,
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(4),
        }
    }
}

impl BackoffPolicy {
    pub fn none() -> Self {
        Self {
            max_retries: 0,
            base_delay: Duration::ZERO,
            max_delay: Duration::ZERO,
        }
    }

    /// Delay before retry number `retry` (zero-based).
    pub fn delay_before_retry(&self, retry: u32) -> Duration {
        let factor = 2u32.checked_pow(retry).unwrap_or(u32::MAX);
        self.base_delay.saturating_mul(factor).min(self.max_delay)
    }
}

#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    pub timeout: Duration,
    pub user_agent: Option<String>,
    pub backoff: BackoffPolicy,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(15),
            user_agent: None,
            backoff: BackoffPolicy::default(),
        }
    }
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("request to {url} failed after {attempts} attempt(s): {source}")]
    Transport {
        url: String,
        attempts: u32,
        #[source]
        source: reqwest::Error,
    },
    #[error("http status {status} for {url} after {attempts} attempt(s)")]
    Status { status: u16, url: String, attempts: u32 },
}

/// GET client for feed downloads: per-call timeout, bounded exponential
/// backoff on timeouts, connect errors, 5xx and 429.
#[derive(Debug, Clone)]
pub struct HttpFetcher {
    client: reqwest::Client,
    backoff: BackoffPolicy,
}

impl HttpFetcher {
    pub fn new(config: HttpClientConfig) -> anyhow::Result<Self> {
        let mut builder = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(config.timeout);

        if let Some(user_agent) = &config.user_agent {
            builder = builder.user_agent(user_agent.clone());
        }

        let client = builder.build().context("building reqwest client")?;
        Ok(Self {
            client,
            backoff: config.backoff,
        })
    }

    /// Body of a successful GET. `feed` names the caller (a category slug)
    /// in the fetch span.
    pub async fn fetch_bytes(&self, run_id: Uuid, feed: &str, url: &str) -> Result<Vec<u8>, FetchError> {
        let span = info_span!("http_fetch", %run_id, feed, url);
        self.fetch_with_retries(url).instrument(span).await
    }

    async fn fetch_with_retries(&self, url: &str) -> Result<Vec<u8>, FetchError> {
        let mut retry = 0u32;
        loop {
            let attempts = retry + 1;
            let reason = match self.client.get(url).send().await {
                Ok(resp) if resp.status().is_success() => {
                    return resp.bytes().await.map(|b| b.to_vec()).map_err(|source| {
                        FetchError::Transport {
                            url: url.to_string(),
                            attempts,
                            source,
                        }
                    });
                }
                Ok(resp) => {
                    let status = resp.status();
                    match transient_status(status) {
                        Some(reason) if retry < self.backoff.max_retries => reason,
                        _ => {
                            return Err(FetchError::Status {
                                status: status.as_u16(),
                                url: resp.url().to_string(),
                                attempts,
                            })
                        }
                    }
                }
                Err(source) => match transient_transport(&source) {
                    Some(reason) if retry < self.backoff.max_retries => reason,
                    _ => {
                        return Err(FetchError::Transport {
                            url: url.to_string(),
                            attempts,
                            source,
                        })
                    }
                },
            };

            let delay = self.backoff.delay_before_retry(retry);
            debug!(attempt = attempts, reason, delay_ms = delay.as_millis() as u64, "feed fetch failed; retrying");
            tokio::time::sleep(delay).await;
            retry += 1;
        }
    }
}
