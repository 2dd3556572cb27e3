//! Tabular snapshot storage + HTTP fetch utilities for salewatch.

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info_span, warn, Instrument};
use uuid::Uuid;

pub const CRATE_NAME: &str = "salewatch-storage";

pub type Grid = Vec<Vec<String>>;

// ---------------------------------------------------------------------------
// HTTP
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDisposition {
    Retryable,
    NonRetryable,
}

pub fn classify_status(status: StatusCode) -> RetryDisposition {
    if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

pub fn classify_reqwest_error(err: &reqwest::Error) -> RetryDisposition {
    if err.is_timeout() || err.is_connect() || err.is_request() {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

/// Exponential backoff for whole-group extraction retries.
#[derive(Debug, Clone, Copy)]
pub struct BackoffPolicy {
    pub max_retries: usize,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(8),
        }
    }
}

impl BackoffPolicy {
    pub fn delay_for_attempt(&self, attempt_index: usize) -> Duration {
        let factor = 1u32.checked_shl(attempt_index as u32).unwrap_or(u32::MAX);
        let delay = self.base_delay.saturating_mul(factor);
        delay.min(self.max_delay)
    }

    /// Total attempts including the first one.
    pub fn attempts(&self) -> usize {
        self.max_retries + 1
    }
}

#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    pub timeout: Duration,
    pub user_agent: Option<String>,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(60),
            user_agent: None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct FetchedResponse {
    pub status: StatusCode,
    pub final_url: String,
    pub body: String,
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("http status {status} for {url}")]
    HttpStatus { status: u16, url: String },
}

impl FetchError {
    pub fn disposition(&self) -> RetryDisposition {
        match self {
            FetchError::Request(err) => classify_reqwest_error(err),
            FetchError::HttpStatus { status, .. } => StatusCode::from_u16(*status)
                .map(classify_status)
                .unwrap_or(RetryDisposition::NonRetryable),
        }
    }
}

/// Single-attempt page fetcher bounded by the client timeout.
///
/// Retrying is left to the caller so one policy governs a whole extraction.
#[derive(Debug, Clone)]
pub struct HttpFetcher {
    client: reqwest::Client,
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
        Ok(Self { client })
    }

    pub async fn fetch_text(
        &self,
        group_id: &str,
        url: &str,
    ) -> Result<FetchedResponse, FetchError> {
        let span = info_span!("http_fetch", group_id, url);
        self.fetch_once(url).instrument(span).await
    }

    async fn fetch_once(&self, url: &str) -> Result<FetchedResponse, FetchError> {
        let resp = self.client.get(url).send().await?;
        let status = resp.status();
        let final_url = resp.url().to_string();
        if !status.is_success() {
            debug!(status = status.as_u16(), "page fetch rejected");
            return Err(FetchError::HttpStatus {
                status: status.as_u16(),
                url: final_url,
            });
        }
        let body = resp.text().await?;
        Ok(FetchedResponse {
            status,
            final_url,
            body,
        })
    }
}

// ---------------------------------------------------------------------------
// Tabular store
// ---------------------------------------------------------------------------

/// Zero-based cell address used as the top-left corner of a write.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct CellAnchor {
    pub row: usize,
    pub col: usize,
}

impl CellAnchor {
    pub const ORIGIN: CellAnchor = CellAnchor { row: 0, col: 0 };

    pub fn new(row: usize, col: usize) -> Self {
        Self { row, col }
    }

    pub fn to_a1(&self) -> String {
        let mut letters = String::new();
        let mut n = self.col + 1;
        while n > 0 {
            let rem = (n - 1) % 26;
            letters.insert(0, (b'A' + rem as u8) as char);
            n = (n - 1) / 26;
        }
        format!("{letters}{}", self.row + 1)
    }
}

impl fmt::Display for CellAnchor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_a1())
    }
}

/// Cosmetic tab metadata applied after a successful data write.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Presentation {
    pub bold_rows: Vec<usize>,
    pub frozen_rows: usize,
    pub auto_resize_columns: usize,
}

impl Presentation {
    /// Bold header row under the label row, both frozen, every column auto-sized.
    pub fn snapshot_block(column_count: usize) -> Self {
        Self {
            bold_rows: vec![1],
            frozen_rows: 2,
            auto_resize_columns: column_count,
        }
    }
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("tab '{0}' does not exist")]
    MissingTab(String),
    #[error("io error on tab '{tab}'")]
    Io {
        tab: String,
        #[source]
        source: std::io::Error,
    },
    #[error("encoding tab '{tab}'")]
    Encode {
        tab: String,
        #[source]
        source: serde_json::Error,
    },
    #[error("decoding tab '{tab}'")]
    Decode {
        tab: String,
        #[source]
        source: serde_json::Error,
    },
    #[error("backend rejected {operation} on tab '{tab}': {message}")]
    Backend {
        operation: &'static str,
        tab: String,
        message: String,
    },
}

/// Persistence boundary for tabs of string cells.
///
/// Reads never fail: a transport problem degrades to "absent" / "empty" and is
/// logged by the implementation. Writes propagate their errors.
#[async_trait]
pub trait TabularStore: Send + Sync {
    async fn exists(&self, tab: &str) -> bool;

    async fn read_all(&self, tab: &str) -> Grid;

    async fn clear(&self, tab: &str) -> Result<(), StoreError>;

    async fn write_from(
        &self,
        tab: &str,
        anchor: CellAnchor,
        rows: &[Vec<String>],
    ) -> Result<(), StoreError>;

    async fn append(&self, tab: &str, rows: &[Vec<String>]) -> Result<(), StoreError>;

    /// A tab created concurrently by someone else is not an error.
    async fn create_if_missing(&self, tab: &str) -> Result<(), StoreError>;

    async fn apply_presentation(
        &self,
        tab: &str,
        presentation: &Presentation,
    ) -> Result<(), StoreError>;
}

fn write_grid(grid: &mut Grid, anchor: CellAnchor, rows: &[Vec<String>]) {
    let needed = anchor.row + rows.len();
    if grid.len() < needed {
        grid.resize_with(needed, Vec::new);
    }
    for (offset, row) in rows.iter().enumerate() {
        let target = &mut grid[anchor.row + offset];
        let width = anchor.col + row.len();
        if target.len() < width {
            target.resize(width, String::new());
        }
        for (i, cell) in row.iter().enumerate() {
            target[anchor.col + i] = cell.clone();
        }
    }
}

#[derive(Debug, Clone, Default)]
struct MemoryTab {
    rows: Grid,
    presentation: Option<Presentation>,
}

/// Reference store kept in process memory, with failure injection for tests.
#[derive(Debug, Default)]
pub struct InMemoryTabStore {
    tabs: Mutex<HashMap<String, MemoryTab>>,
    failing_writes: Mutex<HashSet<String>>,
    failing_presentation: Mutex<bool>,
}

impl InMemoryTabStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_tab(self, tab: &str, rows: Grid) -> Self {
        self.tabs.lock().insert(
            tab.to_string(),
            MemoryTab {
                rows,
                presentation: None,
            },
        );
        self
    }

    /// Make every clear/write/append on `tab` fail.
    pub fn fail_writes_to(&self, tab: &str) {
        self.failing_writes.lock().insert(tab.to_string());
    }

    pub fn fail_presentation(&self, fail: bool) {
        *self.failing_presentation.lock() = fail;
    }

    pub fn rows(&self, tab: &str) -> Option<Grid> {
        self.tabs.lock().get(tab).map(|t| t.rows.clone())
    }

    pub fn presentation(&self, tab: &str) -> Option<Presentation> {
        self.tabs.lock().get(tab).and_then(|t| t.presentation.clone())
    }

    fn check_writable(&self, operation: &'static str, tab: &str) -> Result<(), StoreError> {
        if self.failing_writes.lock().contains(tab) {
            return Err(StoreError::Backend {
                operation,
                tab: tab.to_string(),
                message: "injected write failure".to_string(),
            });
        }
        Ok(())
    }

    fn with_existing<T>(
        &self,
        tab: &str,
        f: impl FnOnce(&mut MemoryTab) -> T,
    ) -> Result<T, StoreError> {
        let mut tabs = self.tabs.lock();
        let entry = tabs
            .get_mut(tab)
            .ok_or_else(|| StoreError::MissingTab(tab.to_string()))?;
        Ok(f(entry))
    }
}

#[async_trait]
impl TabularStore for InMemoryTabStore {
    async fn exists(&self, tab: &str) -> bool {
        self.tabs.lock().contains_key(tab)
    }

    async fn read_all(&self, tab: &str) -> Grid {
        self.rows(tab).unwrap_or_default()
    }

    async fn clear(&self, tab: &str) -> Result<(), StoreError> {
        self.check_writable("clear", tab)?;
        self.with_existing(tab, |t| t.rows.clear())
    }

    async fn write_from(
        &self,
        tab: &str,
        anchor: CellAnchor,
        rows: &[Vec<String>],
    ) -> Result<(), StoreError> {
        self.check_writable("write", tab)?;
        self.with_existing(tab, |t| write_grid(&mut t.rows, anchor, rows))
    }

    async fn append(&self, tab: &str, rows: &[Vec<String>]) -> Result<(), StoreError> {
        self.check_writable("append", tab)?;
        self.with_existing(tab, |t| t.rows.extend(rows.iter().cloned()))
    }

    async fn create_if_missing(&self, tab: &str) -> Result<(), StoreError> {
        self.tabs.lock().entry(tab.to_string()).or_default();
        Ok(())
    }

    async fn apply_presentation(
        &self,
        tab: &str,
        presentation: &Presentation,
    ) -> Result<(), StoreError> {
        if *self.failing_presentation.lock() {
            return Err(StoreError::Backend {
                operation: "format",
                tab: tab.to_string(),
                message: "injected presentation failure".to_string(),
            });
        }
        self.with_existing(tab, |t| t.presentation = Some(presentation.clone()))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct TabDocument {
    name: String,
    updated_at: DateTime<Utc>,
    rows: Grid,
    #[serde(default)]
    presentation: Option<Presentation>,
}

impl TabDocument {
    fn empty(name: &str) -> Self {
        Self {
            name: name.to_string(),
            updated_at: Utc::now(),
            rows: Vec::new(),
            presentation: None,
        }
    }
}

/// Durable store: one JSON document per tab, replaced via temp-file + atomic rename.
#[derive(Debug, Clone)]
pub struct JsonFileTabStore {
    root: PathBuf,
}

impl JsonFileTabStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Filesystem-safe slug plus a hash suffix so distinct tab names never collide.
    pub fn tab_file_name(tab: &str) -> String {
        let slug = tab
            .to_ascii_lowercase()
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() { c } else { '-' })
            .collect::<String>()
            .split('-')
            .filter(|s| !s.is_empty())
            .collect::<Vec<_>>()
            .join("-");
        let mut hasher = Sha256::new();
        hasher.update(tab.as_bytes());
        let digest = hex::encode(hasher.finalize());
        format!("{}-{}.json", if slug.is_empty() { "tab" } else { &slug }, &digest[..8])
    }

    fn tab_path(&self, tab: &str) -> PathBuf {
        self.root.join(Self::tab_file_name(tab))
    }

    fn io_error(tab: &str) -> impl FnOnce(std::io::Error) -> StoreError + '_ {
        move |source| StoreError::Io {
            tab: tab.to_string(),
            source,
        }
    }

    async fn load(&self, tab: &str) -> Result<TabDocument, StoreError> {
        let path = self.tab_path(tab);
        let text = match fs::read_to_string(&path).await {
            Ok(text) => text,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                return Err(StoreError::MissingTab(tab.to_string()))
            }
            Err(err) => return Err(Self::io_error(tab)(err)),
        };
        serde_json::from_str(&text).map_err(|source| StoreError::Decode {
            tab: tab.to_string(),
            source,
        })
    }

    /// Document to modify in place; an undecodable one is replaced by an empty document.
    async fn load_for_write(&self, tab: &str) -> Result<TabDocument, StoreError> {
        match self.load(tab).await {
            Err(err @ StoreError::Decode { .. }) => {
                warn!(tab, error = %err, "discarding undecodable tab document");
                Ok(TabDocument::empty(tab))
            }
            other => other,
        }
    }

    async fn save(&self, mut doc: TabDocument) -> Result<(), StoreError> {
        let tab = doc.name.clone();
        doc.updated_at = Utc::now();
        let bytes = serde_json::to_vec_pretty(&doc).map_err(|source| StoreError::Encode {
            tab: tab.clone(),
            source,
        })?;

        fs::create_dir_all(&self.root).await.map_err(Self::io_error(&tab))?;
        let final_path = self.tab_path(&tab);
        let temp_path = self
            .root
            .join(format!(".{}.{}.tmp", Uuid::new_v4(), bytes.len()));

        let mut file = fs::OpenOptions::new()
            .create_new(true)
            .write(true)
            .open(&temp_path)
            .await
            .map_err(Self::io_error(&tab))?;
        file.write_all(&bytes).await.map_err(Self::io_error(&tab))?;
        file.flush().await.map_err(Self::io_error(&tab))?;
        drop(file);

        if let Err(err) = fs::rename(&temp_path, &final_path).await {
            let _ = fs::remove_file(&temp_path).await;
            return Err(Self::io_error(&tab)(err));
        }
        Ok(())
    }
}

#[async_trait]
impl TabularStore for JsonFileTabStore {
    async fn exists(&self, tab: &str) -> bool {
        let path = self.tab_path(tab);
        match fs::try_exists(&path).await {
            Ok(found) => found,
            Err(err) => {
                warn!(
                    tab,
                    path = %path.display(),
                    error = %err,
                    "existence check failed; assuming absent"
                );
                false
            }
        }
    }

    async fn read_all(&self, tab: &str) -> Grid {
        match self.load(tab).await {
            Ok(doc) => doc.rows,
            Err(StoreError::MissingTab(_)) => Vec::new(),
            Err(err) => {
                warn!(tab, error = %err, "reading tab failed; treating as empty");
                Vec::new()
            }
        }
    }

    async fn clear(&self, tab: &str) -> Result<(), StoreError> {
        let mut doc = self.load_for_write(tab).await?;
        doc.rows.clear();
        self.save(doc).await
    }

    async fn write_from(
        &self,
        tab: &str,
        anchor: CellAnchor,
        rows: &[Vec<String>],
    ) -> Result<(), StoreError> {
        let mut doc = self.load_for_write(tab).await?;
        write_grid(&mut doc.rows, anchor, rows);
        self.save(doc).await
    }

    async fn append(&self, tab: &str, rows: &[Vec<String>]) -> Result<(), StoreError> {
        let mut doc = self.load_for_write(tab).await?;
        doc.rows.extend(rows.iter().cloned());
        self.save(doc).await
    }

    async fn create_if_missing(&self, tab: &str) -> Result<(), StoreError> {
        fs::create_dir_all(&self.root).await.map_err(Self::io_error(tab))?;
        let path = self.tab_path(tab);
        let bytes = serde_json::to_vec_pretty(&TabDocument::empty(tab)).map_err(|source| {
            StoreError::Encode {
                tab: tab.to_string(),
                source,
            }
        })?;
        let open = fs::OpenOptions::new()
            .create_new(true)
            .write(true)
            .open(&path)
            .await;
        match open {
            Ok(mut file) => {
                file.write_all(&bytes).await.map_err(Self::io_error(tab))?;
                file.flush().await.map_err(Self::io_error(tab))?;
                debug!(tab, path = %path.display(), "created tab");
                Ok(())
            }
            Err(err) if err.kind() == std::io::ErrorKind::AlreadyExists => Ok(()),
            Err(err) => Err(Self::io_error(tab)(err)),
        }
    }

    async fn apply_presentation(
        &self,
        tab: &str,
        presentation: &Presentation,
    ) -> Result<(), StoreError> {
        let mut doc = self.load_for_write(tab).await?;
        doc.presentation = Some(presentation.clone());
        self.save(doc).await
    }
}
