//! Durable acquisition state, raw page archive and HTTP fetch utilities.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Context;
use chrono::{DateTime, Utc};
use reqwest::header::{HeaderMap, HeaderValue, ACCEPT, ACCEPT_LANGUAGE, CONTENT_TYPE};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use shelf_core::RawListing;
use thiserror::Error;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info_span, warn, Instrument};
use uuid::Uuid;

pub const CRATE_NAME: &str = "shelf-storage";

/// Replace `dest` with `bytes` via a sibling temp file and rename, so readers
/// only ever observe the old or the new content.
pub async fn write_atomic(dest: &Path, bytes: &[u8]) -> anyhow::Result<()> {
    let parent = dest
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."));
    fs::create_dir_all(parent)
        .await
        .with_context(|| format!("creating directory {}", parent.display()))?;

    let file_name = dest
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_else(|| "state".to_string());
    let temp_path = parent.join(format!(".{file_name}.{}.tmp", Uuid::new_v4()));

    let mut file = fs::OpenOptions::new()
        .create_new(true)
        .write(true)
        .open(&temp_path)
        .await
        .with_context(|| format!("opening temp file {}", temp_path.display()))?;
    file.write_all(bytes)
        .await
        .with_context(|| format!("writing temp file {}", temp_path.display()))?;
    file.flush()
        .await
        .with_context(|| format!("flushing temp file {}", temp_path.display()))?;
    file.sync_all()
        .await
        .with_context(|| format!("syncing temp file {}", temp_path.display()))?;
    drop(file);

    if let Err(err) = fs::rename(&temp_path, dest).await {
        let _ = fs::remove_file(&temp_path).await;
        return Err(err).with_context(|| {
            format!(
                "atomically renaming {} -> {}",
                temp_path.display(),
                dest.display()
            )
        });
    }
    Ok(())
}

pub async fn write_json_atomic<T: Serialize + ?Sized>(dest: &Path, value: &T) -> anyhow::Result<()> {
    let bytes = serde_json::to_vec_pretty(value)
        .with_context(|| format!("serializing {}", dest.display()))?;
    write_atomic(dest, &bytes).await
}

/// Read a JSON file, treating a missing file as `None`.
pub async fn read_json_if_exists<T: serde::de::DeserializeOwned>(
    path: &Path,
) -> anyhow::Result<Option<T>> {
    match fs::read(path).await {
        Ok(bytes) => serde_json::from_slice(&bytes)
            .map(Some)
            .with_context(|| format!("parsing {}", path.display())),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(err) => Err(err).with_context(|| format!("reading {}", path.display())),
    }
}

/// Last completed page per category for one source.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Checkpoint {
    pages: BTreeMap<String, u32>,
}

impl Checkpoint {
    pub fn last_page(&self, category: &str) -> u32 {
        self.pages.get(category).copied().unwrap_or(0)
    }

    pub fn resume_page(&self, category: &str) -> u32 {
        self.last_page(category) + 1
    }

    /// Record `page` as completed. Progress never moves backwards.
    pub fn mark_completed(&mut self, category: &str, page: u32) {
        let entry = self.pages.entry(category.to_string()).or_insert(0);
        *entry = (*entry).max(page);
    }

    pub fn is_empty(&self) -> bool {
        self.pages.is_empty()
    }
}

impl FromIterator<(String, u32)> for Checkpoint {
    fn from_iter<I: IntoIterator<Item = (String, u32)>>(iter: I) -> Self {
        Self {
            pages: iter.into_iter().collect(),
        }
    }
}

/// Intermediate dataset plus checkpoint for one source.
///
/// `commit` writes the dataset before the checkpoint. A crash between the two
/// renames leaves a dataset that is ahead of the checkpoint, which only causes
/// the last page to be fetched again; its listings are then dropped by slug.
#[derive(Debug, Clone)]
pub struct AcquisitionStore {
    dataset_path: PathBuf,
    checkpoint_path: PathBuf,
}

impl AcquisitionStore {
    pub fn new(dataset_path: impl Into<PathBuf>, checkpoint_path: impl Into<PathBuf>) -> Self {
        Self {
            dataset_path: dataset_path.into(),
            checkpoint_path: checkpoint_path.into(),
        }
    }

    /// Store layout used by the CLI: `<dir>/<dataset_file>` and
    /// `<dir>/<source_id>_progress.json`.
    pub fn in_dir(dir: &Path, source_id: &str, dataset_file: &str) -> Self {
        Self::new(
            dir.join(dataset_file),
            dir.join(format!("{source_id}_progress.json")),
        )
    }

    pub fn dataset_path(&self) -> &Path {
        &self.dataset_path
    }

    pub fn checkpoint_path(&self) -> &Path {
        &self.checkpoint_path
    }

    pub async fn load_dataset(&self) -> anyhow::Result<Vec<RawListing>> {
        Ok(read_json_if_exists(&self.dataset_path).await?.unwrap_or_default())
    }

    pub async fn load_checkpoint(&self) -> anyhow::Result<Checkpoint> {
        Ok(read_json_if_exists(&self.checkpoint_path)
            .await?
            .unwrap_or_default())
    }

    pub async fn commit(&self, listings: &[RawListing], checkpoint: &Checkpoint) -> anyhow::Result<()> {
        write_json_atomic(&self.dataset_path, listings).await?;
        write_json_atomic(&self.checkpoint_path, checkpoint).await?;
        debug!(
            dataset = %self.dataset_path.display(),
            listings = listings.len(),
            "committed acquisition progress"
        );
        Ok(())
    }
}

/// Hash-addressed archive of raw page bodies, laid out as
/// `<yyyymmdd>/<source_id>/<sha256>.<ext>` under the root.
#[derive(Debug, Clone)]
pub struct PageArchive {
    root: PathBuf,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArchivedPage {
    pub digest: String,
    pub path: PathBuf,
    /// Same body already archived for this source and day.
    pub already_present: bool,
}

impl PageArchive {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn digest(body: &[u8]) -> String {
        hex::encode(Sha256::digest(body))
    }

    pub fn path_for(
        &self,
        fetched_at: DateTime<Utc>,
        source_id: &str,
        digest: &str,
        extension: &str,
    ) -> PathBuf {
        let extension = match extension.trim().trim_start_matches('.') {
            "" => "bin",
            ext => ext,
        };
        self.root
            .join(fetched_at.format("%Y%m%d").to_string())
            .join(source_id)
            .join(format!("{digest}.{extension}"))
    }

    pub async fn archive(
        &self,
        fetched_at: DateTime<Utc>,
        source_id: &str,
        extension: &str,
        body: &[u8],
    ) -> anyhow::Result<ArchivedPage> {
        let digest = Self::digest(body);
        let path = self.path_for(fetched_at, source_id, &digest, extension);
        let already_present = fs::metadata(&path).await.is_ok();
        if !already_present {
            write_atomic(&path, body).await?;
        }
        debug!(source_id, path = %path.display(), already_present, "archived raw page");
        Ok(ArchivedPage {
            digest,
            path,
            already_present,
        })
    }
}

pub const DEFAULT_USER_AGENT: &str =
    "Mozilla/5.0 (X11; Linux x86_64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/124.0 Safari/537.36";

const ACCEPT_PAGES: &str = "text/html,application/xhtml+xml,application/json;q=0.9,*/*;q=0.8";

/// Request timeouts, throttling and 5xx answers are worth another attempt.
pub fn is_transient_status(status: u16) -> bool {
    matches!(status, 408 | 429 | 500..=599)
}

/// Retry schedule for one request: the delay doubles from `first_delay` and is
/// capped at `max_delay`. Page-level retry sits on top of this in the
/// acquisition loop.
#[derive(Debug, Clone, Copy)]
pub struct TransportRetry {
    pub attempts: u32,
    pub first_delay: Duration,
    pub max_delay: Duration,
}

impl Default for TransportRetry {
    fn default() -> Self {
        Self {
            attempts: 2,
            first_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(5),
        }
    }
}

impl TransportRetry {
    pub fn delay_before(&self, retry: u32) -> Duration {
        self.first_delay
            .saturating_mul(2u32.saturating_pow(retry))
            .min(self.max_delay)
    }
}

#[derive(Debug, Clone)]
pub struct FetcherConfig {
    pub timeout: Duration,
    pub user_agent: String,
    pub accept_language: String,
    pub retry: TransportRetry,
}

impl Default for FetcherConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(30),
            user_agent: DEFAULT_USER_AGENT.to_string(),
            accept_language: "en-IN,en;q=0.9".to_string(),
            retry: TransportRetry::default(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct FetchedPage {
    /// URL after redirects.
    pub url: String,
    pub content_type: Option<String>,
    pub body: Vec<u8>,
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("request to {url} failed: {source}")]
    Transport {
        url: String,
        #[source]
        source: reqwest::Error,
    },
    #[error("{url} answered http {status}")]
    Status { status: u16, url: String },
    #[error("{0}")]
    Unavailable(String),
}

impl FetchError {
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Transport { source, .. } => {
                source.is_timeout() || source.is_connect() || source.is_request()
            }
            Self::Status { status, .. } => is_transient_status(*status),
            Self::Unavailable(_) => false,
        }
    }
}

/// Storefront page fetcher with browser-like headers and transport retries.
#[derive(Debug)]
pub struct HttpFetcher {
    client: reqwest::Client,
    retry: TransportRetry,
}

impl HttpFetcher {
    pub fn new(config: FetcherConfig) -> anyhow::Result<Self> {
        let mut headers = HeaderMap::new();
        headers.insert(ACCEPT, HeaderValue::from_static(ACCEPT_PAGES));
        headers.insert(
            ACCEPT_LANGUAGE,
            HeaderValue::from_str(&config.accept_language)
                .with_context(|| format!("invalid Accept-Language {:?}", config.accept_language))?,
        );
        let client = reqwest::Client::builder()
            .default_headers(headers)
            .user_agent(config.user_agent)
            .gzip(true)
            .brotli(true)
            .timeout(config.timeout)
            .build()
            .context("building http client")?;
        Ok(Self {
            client,
            retry: config.retry,
        })
    }

    pub async fn get(&self, source_id: &str, url: &str) -> Result<FetchedPage, FetchError> {
        let mut retry = 0;
        loop {
            match self
                .get_once(url)
                .instrument(info_span!("http_get", source_id, url, retry))
                .await
            {
                Err(err) if err.is_transient() && retry < self.retry.attempts => {
                    let delay = self.retry.delay_before(retry);
                    warn!(source_id, url, retry, ?delay, error = %err, "transient fetch failure");
                    tokio::time::sleep(delay).await;
                    retry += 1;
                }
                outcome => return outcome,
            }
        }
    }

    async fn get_once(&self, url: &str) -> Result<FetchedPage, FetchError> {
        let transport = |source: reqwest::Error| FetchError::Transport {
            url: url.to_string(),
            source,
        };
        let resp = self.client.get(url).send().await.map_err(transport)?;
        let status = resp.status();
        let final_url = resp.url().to_string();
        if !status.is_success() {
            return Err(FetchError::Status {
                status: status.as_u16(),
                url: final_url,
            });
        }
        let content_type = resp
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);
        let body = resp.bytes().await.map_err(transport)?.to_vec();
        Ok(FetchedPage {
            url: final_url,
            content_type,
            body,
        })
    }
}
