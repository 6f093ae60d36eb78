//! Durable listing corpus + HTTP fetch utilities for adwatch.

use std::collections::HashSet;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::time::Duration;

use adwatch_core::Listing;
use anyhow::Context;
use chrono::Utc;
use fs2::FileExt;
use reqwest::StatusCode;
use thiserror::Error;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio::sync::RwLock;
use tracing::{debug, info, info_span, warn, Instrument};
use uuid::Uuid;

pub const CRATE_NAME: &str = "adwatch-storage";

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("corpus i/o failed for {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("serializing corpus: {0}")]
    Serialize(#[from] serde_json::Error),
    #[error("parsing corpus {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
    #[error("corpus {path} is already opened by another process (lock file {lock})")]
    Locked { path: PathBuf, lock: PathBuf },
}

impl StoreError {
    fn io(path: &Path, source: std::io::Error) -> Self {
        Self::Io {
            path: path.to_path_buf(),
            source,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, serde::Serialize)]
pub struct CorpusStats {
    pub total: usize,
    pub unseen: usize,
}

/// Sole owner of the corpus file.
///
/// An exclusive lock on `<file>.lock` is held for the store's lifetime, so a
/// second store on the same file fails to open instead of overwriting it
/// from a stale copy. Mutations build the next corpus, persist it, and only
/// then swap it into memory while holding the write lock, so writers are
/// totally ordered and readers never observe a half-applied change.
#[derive(Debug)]
pub struct CorpusStore {
    path: PathBuf,
    listings: RwLock<Vec<Listing>>,
    _lock: std::fs::File,
}

fn sibling_path(path: &Path, suffix: &str) -> PathBuf {
    let file_name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "corpus".to_string());
    path.with_file_name(format!("{file_name}{suffix}"))
}

fn acquire_lock(path: &Path) -> Result<std::fs::File, StoreError> {
    let lock_path = sibling_path(path, ".lock");
    if let Some(parent) = lock_path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent).map_err(|source| StoreError::io(parent, source))?;
    }
    let file = std::fs::OpenOptions::new()
        .create(true)
        .truncate(false)
        .read(true)
        .write(true)
        .open(&lock_path)
        .map_err(|source| StoreError::io(&lock_path, source))?;
    match file.try_lock_exclusive() {
        Ok(()) => Ok(file),
        Err(err) if err.raw_os_error() == fs2::lock_contended_error().raw_os_error() => {
            Err(StoreError::Locked {
                path: path.to_path_buf(),
                lock: lock_path,
            })
        }
        Err(source) => Err(StoreError::io(&lock_path, source)),
    }
}

/// Read the corpus file without opening a store: no lock, no writes.
///
/// Safe alongside a running store since every write is a rename. A missing
/// file is an empty corpus.
pub async fn read_snapshot(path: &Path) -> Result<Vec<Listing>, StoreError> {
    match fs::read(path).await {
        Ok(bytes) => serde_json::from_slice(&bytes)
            .map(unique_by_id)
            .map_err(|source| StoreError::Parse {
                path: path.to_path_buf(),
                source,
            }),
        Err(err) if err.kind() == ErrorKind::NotFound => Ok(Vec::new()),
        Err(source) => Err(StoreError::io(path, source)),
    }
}

impl CorpusStore {
    /// Open the corpus at `path`, creating or recovering the file as needed.
    ///
    /// Fails with [`StoreError::Locked`] while another store holds the file.
    pub async fn open(path: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let path = path.into();
        let lock = acquire_lock(&path)?;
        let store = Self {
            path,
            listings: RwLock::new(Vec::new()),
            _lock: lock,
        };
        store.load().await;
        Ok(store)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Re-read the corpus file. Never fails: a missing file becomes an empty
    /// corpus persisted immediately, a corrupt file is moved aside and replaced
    /// by an empty one, an unreadable file is moved aside and the corpus starts
    /// empty in memory.
    pub async fn load(&self) -> Vec<Listing> {
        let mut guard = self.listings.write().await;
        let listings = match fs::read(&self.path).await {
            Ok(bytes) => match serde_json::from_slice::<Vec<Listing>>(&bytes) {
                Ok(listings) => unique_by_id(listings),
                Err(err) => {
                    warn!(
                        path = %self.path.display(),
                        error = %err,
                        "corpus file is corrupt; starting from an empty corpus"
                    );
                    self.quarantine("corrupt").await;
                    self.persist_or_warn(&[]).await;
                    Vec::new()
                }
            },
            Err(err) if err.kind() == ErrorKind::NotFound => {
                info!(path = %self.path.display(), "no corpus file yet; initializing an empty one");
                self.persist_or_warn(&[]).await;
                Vec::new()
            }
            Err(err) => {
                warn!(
                    path = %self.path.display(),
                    error = %err,
                    "corpus file is unreadable; starting from an empty corpus"
                );
                self.quarantine("unreadable").await;
                Vec::new()
            }
        };
        *guard = listings.clone();
        listings
    }

    /// Atomically replace the persisted corpus with `listings`.
    pub async fn save(&self, listings: Vec<Listing>) -> Result<(), StoreError> {
        let mut guard = self.listings.write().await;
        let next = unique_by_id(listings);
        self.persist(&next).await?;
        *guard = next;
        Ok(())
    }

    /// Append the listings whose id is not yet in the corpus and persist.
    ///
    /// Returns exactly the appended listings, flagged `is_new`. Earlier
    /// listings lose their `is_new` flag once a batch adds something. A batch
    /// that adds nothing leaves the file untouched.
    pub async fn merge(&self, candidates: Vec<Listing>) -> Result<Vec<Listing>, StoreError> {
        let mut guard = self.listings.write().await;
        let mut known: HashSet<String> = guard.iter().map(|l| l.id.clone()).collect();

        let mut admitted = Vec::new();
        for mut listing in candidates {
            if !listing.is_admissible() {
                warn!(id = %listing.id, "refusing to merge listing without title or link");
                continue;
            }
            if known.insert(listing.id.clone()) {
                listing.is_new = true;
                admitted.push(listing);
            }
        }

        if admitted.is_empty() {
            debug!("merge found nothing new; corpus left untouched");
            return Ok(admitted);
        }

        let mut next: Vec<Listing> = guard
            .iter()
            .cloned()
            .map(|mut l| {
                l.is_new = false;
                l
            })
            .collect();
        next.extend(admitted.iter().cloned());

        self.persist(&next).await?;
        *guard = next;
        info!(added = admitted.len(), total = guard.len(), "merged new listings into corpus");
        Ok(admitted)
    }

    /// Mark the given ids as seen. Unknown ids are ignored. Returns how many
    /// listings flipped from unseen to seen.
    pub async fn mark_seen<S: AsRef<str>>(&self, ids: &[S]) -> Result<usize, StoreError> {
        let wanted: HashSet<&str> = ids.iter().map(|id| id.as_ref()).collect();
        let mut guard = self.listings.write().await;

        let mut next = guard.clone();
        let mut marked = 0usize;
        for listing in next.iter_mut() {
            if !listing.seen && wanted.contains(listing.id.as_str()) {
                listing.seen = true;
                marked += 1;
            }
        }

        if marked == 0 {
            return Ok(0);
        }

        self.persist(&next).await?;
        *guard = next;
        info!(marked, requested = wanted.len(), "marked listings as seen");
        Ok(marked)
    }

    /// Listings not yet acknowledged, oldest first.
    pub async fn unseen(&self) -> Vec<Listing> {
        self.listings
            .read()
            .await
            .iter()
            .filter(|l| !l.seen)
            .cloned()
            .collect()
    }

    pub async fn listings(&self) -> Vec<Listing> {
        self.listings.read().await.clone()
    }

    pub async fn known_ids(&self) -> HashSet<String> {
        self.listings.read().await.iter().map(|l| l.id.clone()).collect()
    }

    pub async fn stats(&self) -> CorpusStats {
        let guard = self.listings.read().await;
        CorpusStats {
            total: guard.len(),
            unseen: guard.iter().filter(|l| !l.seen).count(),
        }
    }

    async fn persist(&self, listings: &[Listing]) -> Result<(), StoreError> {
        let bytes = serde_json::to_vec_pretty(listings)?;
        write_atomic(&self.path, &bytes).await
    }

    async fn persist_or_warn(&self, listings: &[Listing]) {
        if let Err(err) = self.persist(listings).await {
            warn!(path = %self.path.display(), error = %err, "could not write corpus file");
        }
    }

    /// Move the current file to `<file>.<reason>-<stamp>` so a later write
    /// cannot destroy it.
    async fn quarantine(&self, reason: &str) {
        let stamp = Utc::now().format("%Y%m%d_%H%M%S");
        let target = sibling_path(&self.path, &format!(".{reason}-{stamp}"));
        match fs::rename(&self.path, &target).await {
            Ok(()) => warn!(reason, backup = %target.display(), "moved corpus file aside"),
            Err(err) => warn!(reason, error = %err, "could not move corpus file aside"),
        }
    }
}

fn unique_by_id(listings: Vec<Listing>) -> Vec<Listing> {
    let before = listings.len();
    let mut seen_ids = HashSet::with_capacity(before);
    let unique: Vec<Listing> = listings
        .into_iter()
        .filter(|l| seen_ids.insert(l.id.clone()))
        .collect();
    if unique.len() != before {
        warn!(dropped = before - unique.len(), "dropped duplicate listing ids from corpus");
    }
    unique
}

/// Removes a temp file on drop unless the write it guards was committed.
struct TempFileGuard {
    path: PathBuf,
    armed: bool,
}

impl TempFileGuard {
    fn new(path: PathBuf) -> Self {
        Self { path, armed: true }
    }

    fn disarm(mut self) {
        self.armed = false;
    }
}

impl Drop for TempFileGuard {
    fn drop(&mut self) {
        if self.armed {
            let _ = std::fs::remove_file(&self.path);
        }
    }
}

/// Write bytes through a temp file in the target directory and rename it into place.
pub async fn write_atomic(path: &Path, bytes: &[u8]) -> Result<(), StoreError> {
    let parent = path
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."));
    fs::create_dir_all(parent)
        .await
        .map_err(|source| StoreError::io(parent, source))?;

    let file_name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "corpus".to_string());
    let temp_path = parent.join(format!(".{file_name}.{}.tmp", Uuid::new_v4()));
    let guard = TempFileGuard::new(temp_path.clone());

    let mut file = fs::OpenOptions::new()
        .create_new(true)
        .write(true)
        .open(&temp_path)
        .await
        .map_err(|source| StoreError::io(&temp_path, source))?;
    file.write_all(bytes)
        .await
        .map_err(|source| StoreError::io(&temp_path, source))?;
    file.flush()
        .await
        .map_err(|source| StoreError::io(&temp_path, source))?;
    file.sync_all()
        .await
        .map_err(|source| StoreError::io(&temp_path, source))?;
    drop(file);

    fs::rename(&temp_path, path)
        .await
        .map_err(|source| StoreError::io(path, source))?;
    guard.disarm();
    Ok(())
}

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

#[derive(Debug, Clone, Copy)]
pub struct BackoffPolicy {
    pub max_retries: usize,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            max_retries: 2,
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(5),
        }
    }
}

impl BackoffPolicy {
    pub fn delay_for_attempt(&self, attempt_index: usize) -> Duration {
        let factor = 1u32.checked_shl(attempt_index as u32).unwrap_or(u32::MAX);
        let delay = self.base_delay.saturating_mul(factor);
        delay.min(self.max_delay)
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
            timeout: Duration::from_secs(20),
            user_agent: None,
            backoff: BackoffPolicy::default(),
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
    #[error("request failed after retries: {0}")]
    Request(#[from] reqwest::Error),
    #[error("http status {status} for {url}")]
    HttpStatus { status: u16, url: String },
}

#[derive(Debug)]
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

    /// GET `url` as text, retrying transient failures with capped exponential backoff.
    pub async fn fetch_text(&self, url: &str) -> Result<FetchedResponse, FetchError> {
        let span = info_span!("http_fetch", url);
        self.fetch_with_retries(url).instrument(span).await
    }

    async fn fetch_with_retries(&self, url: &str) -> Result<FetchedResponse, FetchError> {
        let mut attempt = 0usize;
        loop {
            match self.client.get(url).send().await {
                Ok(resp) => {
                    let status = resp.status();
                    let final_url = resp.url().to_string();

                    if status.is_success() {
                        let body = resp.text().await?;
                        return Ok(FetchedResponse {
                            status,
                            final_url,
                            body,
                        });
                    }

                    if classify_status(status) == RetryDisposition::Retryable
                        && attempt < self.backoff.max_retries
                    {
                        debug!(%status, attempt, "retrying after http status");
                        tokio::time::sleep(self.backoff.delay_for_attempt(attempt)).await;
                        attempt += 1;
                        continue;
                    }

                    return Err(FetchError::HttpStatus {
                        status: status.as_u16(),
                        url: final_url,
                    });
                }
                Err(err) => {
                    if classify_reqwest_error(&err) == RetryDisposition::Retryable
                        && attempt < self.backoff.max_retries
                    {
                        debug!(error = %err, attempt, "retrying after request error");
                        tokio::time::sleep(self.backoff.delay_for_attempt(attempt)).await;
                        attempt += 1;
                        continue;
                    }
                    return Err(FetchError::Request(err));
                }
            }
        }
    }
}
