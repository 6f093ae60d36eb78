//! Ingestion orchestration: reconcile, cycle runner, scheduler, exports.

use std::collections::HashSet;
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use adwatch_adapters::{FixturePageFetcher, HtmlPageFetcher, PageFetcher, SourceConfig};
use adwatch_core::{Listing, RawListing};
use adwatch_storage::{BackoffPolicy, CorpusStore, HttpClientConfig, HttpFetcher, StoreError};
use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::{watch, Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{error, info, info_span, warn, Instrument};

pub const CRATE_NAME: &str = "adwatch-sync";

const DEFAULT_USER_AGENT: &str = "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/120.0.0.0 Safari/537.36";

#[derive(Debug, Clone)]
pub struct SyncConfig {
    pub data_file: PathBuf,
    pub export_dir: PathBuf,
    pub source_file: PathBuf,
    pub fixture_dir: Option<PathBuf>,
    pub interval_secs: u64,
    pub run_on_start: bool,
    pub max_pages: u32,
    pub page_timeout_secs: u64,
    pub page_delay_ms: u64,
    pub cron: Option<String>,
    pub user_agent: String,
    pub http_timeout_secs: u64,
    pub web_port: u16,
}

fn env_or<T: FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|v| v.trim().parse().ok())
        .unwrap_or(default)
}

fn env_flag(key: &str) -> bool {
    std::env::var(key)
        .map(|v| matches!(v.trim(), "1" | "true" | "TRUE" | "True" | "yes"))
        .unwrap_or(false)
}

fn env_path(key: &str) -> Option<PathBuf> {
    std::env::var(key)
        .ok()
        .filter(|v| !v.trim().is_empty())
        .map(PathBuf::from)
}

impl SyncConfig {
    pub fn from_env() -> Self {
        Self {
            data_file: env_path("ADWATCH_DATA_FILE").unwrap_or_else(|| PathBuf::from("./data.json")),
            export_dir: env_path("ADWATCH_EXPORT_DIR").unwrap_or_else(|| PathBuf::from("./exports")),
            source_file: env_path("ADWATCH_SOURCE_FILE")
                .unwrap_or_else(|| PathBuf::from("./source.yaml")),
            fixture_dir: env_path("ADWATCH_FIXTURE_DIR"),
            interval_secs: env_or("ADWATCH_INTERVAL_SECS", 300),
            run_on_start: env_flag("ADWATCH_RUN_ON_START"),
            max_pages: env_or("ADWATCH_MAX_PAGES", 3),
            page_timeout_secs: env_or("ADWATCH_PAGE_TIMEOUT_SECS", 60),
            page_delay_ms: env_or("ADWATCH_PAGE_DELAY_MS", 3000),
            cron: std::env::var("ADWATCH_CRON")
                .ok()
                .filter(|v| !v.trim().is_empty()),
            user_agent: std::env::var("ADWATCH_USER_AGENT")
                .unwrap_or_else(|_| DEFAULT_USER_AGENT.to_string()),
            http_timeout_secs: env_or("ADWATCH_HTTP_TIMEOUT_SECS", 20),
            web_port: env_or("ADWATCH_WEB_PORT", 8000),
        }
    }

    pub fn pagination(&self) -> PaginationConfig {
        PaginationConfig {
            max_pages: self.max_pages,
            page_timeout: Duration::from_secs(self.page_timeout_secs),
            page_delay: Duration::from_millis(self.page_delay_ms),
        }
    }

    pub fn scheduler(&self) -> SchedulerConfig {
        SchedulerConfig {
            interval: Duration::from_secs(self.interval_secs.max(1)),
            run_on_start: self.run_on_start,
            cron: self.cron.clone(),
        }
    }

    pub fn http_client_config(&self) -> HttpClientConfig {
        HttpClientConfig {
            timeout: Duration::from_secs(self.http_timeout_secs),
            user_agent: Some(self.user_agent.clone()),
            backoff: BackoffPolicy::default(),
        }
    }
}

/// Build the page fetcher the config asks for: fixtures when a fixture
/// directory is set, live HTML otherwise.
pub fn build_page_fetcher(config: &SyncConfig) -> Result<Arc<dyn PageFetcher>> {
    let source = SourceConfig::load(&config.source_file)?;
    if let Some(dir) = &config.fixture_dir {
        info!(dir = %dir.display(), "using fixture page fetcher");
        return Ok(Arc::new(FixturePageFetcher::new(dir.clone()).with_source(source)));
    }
    let http = HttpFetcher::new(config.http_client_config())?;
    Ok(Arc::new(HtmlPageFetcher::new(http, source)))
}

pub async fn build_runner(config: &SyncConfig) -> Result<Arc<IngestionRunner>> {
    let store = Arc::new(
        CorpusStore::open(&config.data_file)
            .await
            .with_context(|| format!("opening corpus {}", config.data_file.display()))?,
    );
    let fetcher = build_page_fetcher(config).context("building page fetcher")?;
    Ok(Arc::new(IngestionRunner::new(store, fetcher, config.pagination())))
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Reconciliation {
    pub new_listings: Vec<Listing>,
    pub fetched: usize,
    pub invalid: usize,
    pub duplicates_in_batch: usize,
    pub already_known: usize,
}

/// Turns a fetched batch into the listings that are new to the corpus.
#[derive(Debug, Clone)]
pub struct Reconciler {
    store: Arc<CorpusStore>,
}

impl Reconciler {
    pub fn new(store: Arc<CorpusStore>) -> Self {
        Self { store }
    }

    pub fn store(&self) -> &Arc<CorpusStore> {
        &self.store
    }

    pub async fn reconcile(&self, batch: Vec<RawListing>) -> Result<Reconciliation, StoreError> {
        let scraped_at = Utc::now();
        let known = self.store.known_ids().await;
        let mut report = Reconciliation {
            fetched: batch.len(),
            ..Default::default()
        };

        let mut in_batch = HashSet::new();
        let mut candidates = Vec::new();
        for raw in batch {
            if let Some(field) = raw.missing_required_field() {
                warn!(field, title = %raw.title, link = %raw.link, "dropping listing without required field");
                report.invalid += 1;
                continue;
            }
            let listing = Listing::from_raw(raw, scraped_at);
            if known.contains(&listing.id) {
                report.already_known += 1;
                continue;
            }
            if !in_batch.insert(listing.id.clone()) {
                report.duplicates_in_batch += 1;
                continue;
            }
            candidates.push(listing);
        }

        report.new_listings = self.store.merge(candidates).await?;
        Ok(report)
    }
}

#[derive(Debug, Clone, Copy)]
pub struct PaginationConfig {
    pub max_pages: u32,
    pub page_timeout: Duration,
    pub page_delay: Duration,
}

impl Default for PaginationConfig {
    fn default() -> Self {
        Self {
            max_pages: 3,
            page_timeout: Duration::from_secs(60),
            page_delay: Duration::from_secs(3),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Trigger {
    Startup,
    Interval,
    Cron,
    OnDemand,
}

impl fmt::Display for Trigger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Trigger::Startup => "startup",
            Trigger::Interval => "interval",
            Trigger::Cron => "cron",
            Trigger::OnDemand => "on_demand",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CycleReport {
    pub trigger: Trigger,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub pages_fetched: u32,
    pub fetched: usize,
    pub invalid: usize,
    pub duplicates_in_batch: usize,
    pub already_known: usize,
    pub new_listings: usize,
    pub total_listings: usize,
    pub unseen_listings: usize,
}

#[derive(Debug, Error)]
pub enum CycleError {
    #[error("persisting corpus failed: {0}")]
    Store(#[from] StoreError),
    #[error("cycle aborted: {0}")]
    Aborted(String),
}

#[derive(Debug)]
pub enum TriggerOutcome {
    Completed(CycleReport),
    Skipped,
    Failed(CycleError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunnerState {
    Idle,
    Running,
}

struct RunningFlag(Arc<AtomicBool>);

impl RunningFlag {
    fn raise(flag: &Arc<AtomicBool>) -> Self {
        flag.store(true, Ordering::SeqCst);
        Self(Arc::clone(flag))
    }
}

impl Drop for RunningFlag {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

/// Runs ingestion cycles, at most one at a time.
pub struct IngestionRunner {
    fetcher: Arc<dyn PageFetcher>,
    reconciler: Reconciler,
    pagination: PaginationConfig,
    guard: Arc<Mutex<()>>,
    running: Arc<AtomicBool>,
    last_report: RwLock<Option<CycleReport>>,
    last_error: RwLock<Option<String>>,
}

impl IngestionRunner {
    pub fn new(
        store: Arc<CorpusStore>,
        fetcher: Arc<dyn PageFetcher>,
        pagination: PaginationConfig,
    ) -> Self {
        Self {
            fetcher,
            reconciler: Reconciler::new(store),
            pagination,
            guard: Arc::new(Mutex::new(())),
            running: Arc::new(AtomicBool::new(false)),
            last_report: RwLock::new(None),
            last_error: RwLock::new(None),
        }
    }

    pub fn store(&self) -> &Arc<CorpusStore> {
        self.reconciler.store()
    }

    pub fn state(&self) -> RunnerState {
        if self.running.load(Ordering::SeqCst) {
            RunnerState::Running
        } else {
            RunnerState::Idle
        }
    }

    pub async fn last_report(&self) -> Option<CycleReport> {
        self.last_report.read().await.clone()
    }

    pub async fn last_error(&self) -> Option<String> {
        self.last_error.read().await.clone()
    }

    /// Run one cycle unless another is in flight.
    ///
    /// The cycle runs on its own task holding the run guard, so it completes
    /// even if the caller stops waiting, and a panic inside it is reported as
    /// `CycleError::Aborted`.
    pub async fn try_run_cycle(self: &Arc<Self>, trigger: Trigger) -> TriggerOutcome {
        let Ok(permit) = Arc::clone(&self.guard).try_lock_owned() else {
            warn!(%trigger, "ingestion cycle already running; trigger skipped");
            return TriggerOutcome::Skipped;
        };

        let running = RunningFlag::raise(&self.running);
        let runner = Arc::clone(self);
        let handle = tokio::spawn(async move {
            let _permit = permit;
            let _running = running;
            let result = runner
                .run_cycle(trigger)
                .instrument(info_span!("ingestion_cycle", %trigger))
                .await;
            runner.record(&result).await;
            result
        });

        match handle.await {
            Ok(Ok(report)) => TriggerOutcome::Completed(report),
            Ok(Err(err)) => {
                error!(%trigger, error = %err, "ingestion cycle failed");
                TriggerOutcome::Failed(err)
            }
            Err(join_err) => {
                error!(%trigger, error = %join_err, "ingestion cycle panicked");
                let message = join_err.to_string();
                *self.last_error.write().await = Some(message.clone());
                TriggerOutcome::Failed(CycleError::Aborted(message))
            }
        }
    }

    /// Wait until no cycle holds the run guard.
    pub async fn wait_idle(&self) {
        let _idle = self.guard.lock().await;
    }

    async fn record(&self, result: &Result<CycleReport, CycleError>) {
        match result {
            Ok(report) => {
                *self.last_report.write().await = Some(report.clone());
                *self.last_error.write().await = None;
            }
            Err(err) => *self.last_error.write().await = Some(err.to_string()),
        }
    }

    async fn run_cycle(&self, trigger: Trigger) -> Result<CycleReport, CycleError> {
        let started_at = Utc::now();
        info!("ingestion cycle started");

        let (batch, pages_fetched) = self.collect_pages().await;
        let reconciliation = self.reconciler.reconcile(batch).await?;
        let stats = self.store().stats().await;

        let report = CycleReport {
            trigger,
            started_at,
            finished_at: Utc::now(),
            pages_fetched,
            fetched: reconciliation.fetched,
            invalid: reconciliation.invalid,
            duplicates_in_batch: reconciliation.duplicates_in_batch,
            already_known: reconciliation.already_known,
            new_listings: reconciliation.new_listings.len(),
            total_listings: stats.total,
            unseen_listings: stats.unseen,
        };
        info!(
            pages = report.pages_fetched,
            fetched = report.fetched,
            new = report.new_listings,
            invalid = report.invalid,
            total = report.total_listings,
            "ingestion cycle finished"
        );
        Ok(report)
    }

    async fn collect_pages(&self) -> (Vec<RawListing>, u32) {
        let mut batch = Vec::new();
        let mut pages_fetched = 0u32;

        for page in 1..=self.pagination.max_pages {
            let fetched =
                tokio::time::timeout(self.pagination.page_timeout, self.fetcher.fetch_page(page)).await;
            let records = match fetched {
                Ok(Ok(records)) => records,
                Ok(Err(err)) => {
                    warn!(page, error = %err, "page fetch failed; ending pagination");
                    break;
                }
                Err(_) => {
                    warn!(
                        page,
                        timeout_secs = self.pagination.page_timeout.as_secs_f64(),
                        "page fetch timed out; ending pagination"
                    );
                    break;
                }
            };
            if records.is_empty() {
                info!(page, "empty page; ending pagination");
                break;
            }

            info!(page, records = records.len(), "fetched page");
            pages_fetched += 1;
            batch.extend(records);

            if page < self.pagination.max_pages && !self.pagination.page_delay.is_zero() {
                tokio::time::sleep(self.pagination.page_delay).await;
            }
        }

        (batch, pages_fetched)
    }
}

#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    pub interval: Duration,
    pub run_on_start: bool,
    pub cron: Option<String>,
}

/// Background driver: a fixed-delay loop plus an optional cron trigger.
pub struct IngestionScheduler {
    runner: Arc<IngestionRunner>,
    shutdown: watch::Sender<bool>,
    handle: JoinHandle<()>,
    cron: Option<JobScheduler>,
}

impl IngestionScheduler {
    pub async fn start(runner: Arc<IngestionRunner>, config: SchedulerConfig) -> Result<Self> {
        let cron = match &config.cron {
            Some(expr) => Some(start_cron(Arc::clone(&runner), expr).await?),
            None => None,
        };

        let (shutdown, shutdown_rx) = watch::channel(false);
        info!(
            interval_secs = config.interval.as_secs_f64(),
            run_on_start = config.run_on_start,
            "ingestion scheduler started"
        );
        let handle = tokio::spawn(drive(
            Arc::clone(&runner),
            config.interval,
            config.run_on_start,
            shutdown_rx,
        ));

        Ok(Self {
            runner,
            shutdown,
            handle,
            cron,
        })
    }

    /// Request termination and wait for the loop and any in-flight cycle,
    /// whichever trigger started it, to finish.
    pub async fn stop(self) -> Result<()> {
        let Self {
            runner,
            shutdown,
            handle,
            cron,
        } = self;

        let _ = shutdown.send(true);
        if let Some(mut sched) = cron {
            sched.shutdown().await.context("stopping cron scheduler")?;
        }
        handle.await.context("joining ingestion loop")?;
        runner.wait_idle().await;
        info!("ingestion scheduler stopped");
        Ok(())
    }
}

async fn start_cron(runner: Arc<IngestionRunner>, expr: &str) -> Result<JobScheduler> {
    let sched = JobScheduler::new().await.context("creating cron scheduler")?;
    let job = Job::new_async(expr, move |_uuid, _l| {
        let runner = Arc::clone(&runner);
        Box::pin(async move {
            runner.try_run_cycle(Trigger::Cron).await;
        })
    })
    .with_context(|| format!("creating cron job for `{expr}`"))?;
    sched.add(job).await.context("adding cron job")?;
    sched.start().await.context("starting cron scheduler")?;
    info!(cron = expr, "cron trigger registered");
    Ok(sched)
}

async fn drive(
    runner: Arc<IngestionRunner>,
    interval: Duration,
    run_on_start: bool,
    mut shutdown: watch::Receiver<bool>,
) {
    if run_on_start {
        runner.try_run_cycle(Trigger::Startup).await;
    }
    loop {
        if *shutdown.borrow() {
            break;
        }
        tokio::select! {
            _ = tokio::time::sleep(interval) => {}
            _ = shutdown.changed() => break,
        }
        if *shutdown.borrow() {
            break;
        }
        runner.try_run_cycle(Trigger::Interval).await;
    }
}

pub const EXPORT_COLUMNS: [&str; 8] = [
    "title",
    "price",
    "location",
    "date",
    "link",
    "image_url",
    "scraped_at",
    "seen",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExportFormat {
    Csv,
    Excel,
}

impl ExportFormat {
    pub fn file_name(self, include_seen: bool) -> &'static str {
        match (self, include_seen) {
            (ExportFormat::Csv, true) => "listings.csv",
            (ExportFormat::Csv, false) => "unseen_listings.csv",
            (ExportFormat::Excel, true) => "listings.xlsx",
            (ExportFormat::Excel, false) => "unseen_listings.xlsx",
        }
    }
}

impl FromStr for ExportFormat {
    type Err = ExportError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "csv" => Ok(ExportFormat::Csv),
            "excel" | "xlsx" => Ok(ExportFormat::Excel),
            other => Err(ExportError::UnknownFormat(other.to_string())),
        }
    }
}

#[derive(Debug, Error)]
pub enum ExportError {
    #[error("unknown export format `{0}` (expected csv or excel)")]
    UnknownFormat(String),
    #[error("creating export directory {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error(transparent)]
    Csv(#[from] csv::Error),
    #[error(transparent)]
    Xlsx(#[from] rust_xlsxwriter::XlsxError),
}

fn export_row(listing: &Listing) -> [String; 8] {
    [
        listing.title.clone(),
        listing.price.clone(),
        listing.location.clone(),
        listing.date.clone(),
        listing.link.clone(),
        listing.image_url.clone().unwrap_or_default(),
        listing.scraped_at.to_rfc3339(),
        listing.seen.to_string(),
    ]
}

/// Write `listings` (or only the unseen ones) to a tabular file in `dir`.
///
/// Returns `None` without touching the filesystem when nothing qualifies.
pub fn export_listings(
    listings: &[Listing],
    format: ExportFormat,
    dir: &Path,
    include_seen: bool,
) -> Result<Option<PathBuf>, ExportError> {
    let selected: Vec<&Listing> = listings
        .iter()
        .filter(|l| include_seen || !l.seen)
        .collect();
    if selected.is_empty() {
        warn!("no listings to export");
        return Ok(None);
    }

    std::fs::create_dir_all(dir).map_err(|source| ExportError::Io {
        path: dir.to_path_buf(),
        source,
    })?;
    let path = dir.join(format.file_name(include_seen));

    match format {
        ExportFormat::Csv => write_csv(&path, &selected)?,
        ExportFormat::Excel => write_xlsx(&path, &selected)?,
    }

    info!(count = selected.len(), path = %path.display(), "exported listings");
    Ok(Some(path))
}

fn write_csv(path: &Path, listings: &[&Listing]) -> Result<(), ExportError> {
    let mut writer = csv::Writer::from_path(path)?;
    writer.write_record(EXPORT_COLUMNS)?;
    for listing in listings {
        writer.write_record(export_row(listing))?;
    }
    writer.flush().map_err(csv::Error::from)?;
    Ok(())
}

fn write_xlsx(path: &Path, listings: &[&Listing]) -> Result<(), ExportError> {
    let mut workbook = rust_xlsxwriter::Workbook::new();
    let sheet = workbook.add_worksheet();
    sheet.set_name("Listings")?;

    for (col, name) in EXPORT_COLUMNS.iter().enumerate() {
        sheet.write_string(0, col as u16, *name)?;
    }
    for (idx, listing) in listings.iter().enumerate() {
        let row = idx as u32 + 1;
        let cells = export_row(listing);
        for (col, value) in cells.iter().take(7).enumerate() {
            sheet.write_string(row, col as u16, value.as_str())?;
        }
        sheet.write_boolean(row, 7, listing.seen)?;
    }

    workbook.save(path)?;
    Ok(())
}
