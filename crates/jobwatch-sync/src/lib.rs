//! Sync pipeline: snapshot -> reconciliation against the listing store -> report -> delivery.

use std::collections::{BTreeSet, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use jobwatch_adapters::{
    AdapterContext, AdapterError, FixtureSnapshotSource, HttpSnapshotSource, ListingSelectors,
    SnapshotSource, DEFAULT_LISTING_URL,
};
use jobwatch_core::{ListingRecord, RawListing, ReconciliationResult, UNKNOWN};
use jobwatch_storage::{
    error_transience, status_transience, BackoffPolicy, HttpClientConfig, HttpFetcher,
    ListingStore, PageArchive, SqliteListingStore, StoreError, StoredListing, TieBreak,
    DEFAULT_USER_AGENT,
};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::fs;
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{debug, error, info, info_span, warn, Instrument};
use uuid::Uuid;

pub const CRATE_NAME: &str = "jobwatch-sync";

#[derive(Debug, Error)]
pub enum SyncError {
    #[error("snapshot unavailable from {origin}")]
    SnapshotUnavailable {
        origin: String,
        #[source]
        source: AdapterError,
    },
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("listing store invariant violated: {0}")]
    InvariantViolation(String),
    #[error("report delivery failed for {failed} of {total} notifier(s)")]
    Delivery { failed: usize, total: usize },
}

/// Where and how to scrape; loaded from YAML when `JOBWATCH_SOURCE_FILE` is set.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(default)]
pub struct SourceConfig {
    pub listing_url: String,
    pub selectors: ListingSelectors,
}

impl Default for SourceConfig {
    fn default() -> Self {
        Self {
            listing_url: DEFAULT_LISTING_URL.to_string(),
            selectors: ListingSelectors::default(),
        }
    }
}

impl SourceConfig {
    pub fn from_yaml(text: &str) -> Result<Self> {
        serde_yaml::from_str(text).context("parsing source config")
    }

    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("reading {}", path.display()))?;
        Self::from_yaml(&text).with_context(|| format!("loading {}", path.display()))
    }
}

#[derive(Debug, Clone)]
pub struct SyncConfig {
    pub database_url: String,
    pub listing_url: Option<String>,
    pub source_file: Option<PathBuf>,
    pub fixture_html: Option<PathBuf>,
    pub artifacts_dir: PathBuf,
    pub reports_dir: Option<PathBuf>,
    pub csv_path: Option<PathBuf>,
    pub webhook_url: Option<String>,
    pub user_agent: String,
    pub http_timeout_secs: u64,
    pub sync_cron: String,
}

impl SyncConfig {
    pub fn from_env() -> Self {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Build the config from any variable source; blank values count as unset.
    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let env_opt = |name: &str| lookup(name).filter(|v| !v.trim().is_empty());
        Self {
            database_url: env_opt("DATABASE_URL").unwrap_or_else(|| "sqlite://jobs.db".to_string()),
            listing_url: env_opt("JOBWATCH_LISTING_URL"),
            source_file: env_opt("JOBWATCH_SOURCE_FILE").map(PathBuf::from),
            fixture_html: env_opt("JOBWATCH_FIXTURE_HTML").map(PathBuf::from),
            artifacts_dir: env_opt("ARTIFACTS_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from("./artifacts")),
            reports_dir: env_opt("JOBWATCH_REPORTS_DIR").map(PathBuf::from),
            csv_path: env_opt("JOBWATCH_CSV_PATH").map(PathBuf::from),
            webhook_url: env_opt("JOBWATCH_WEBHOOK_URL"),
            user_agent: env_opt("JOBWATCH_USER_AGENT")
                .unwrap_or_else(|| DEFAULT_USER_AGENT.to_string()),
            http_timeout_secs: env_opt("JOBWATCH_HTTP_TIMEOUT_SECS")
                .and_then(|v| v.parse().ok())
                .unwrap_or(20),
            sync_cron: env_opt("JOBWATCH_SYNC_CRON").unwrap_or_else(|| "0 0 7,19 * * *".to_string()),
        }
    }

    pub fn source_config(&self) -> Result<SourceConfig> {
        let mut source = match &self.source_file {
            Some(path) => SourceConfig::load(path)?,
            None => SourceConfig::default(),
        };
        if let Some(url) = &self.listing_url {
            source.listing_url = url.clone();
        }
        Ok(source)
    }
}

/// Diff one snapshot against the store and persist every listing not seen before.
///
/// Inserts happen record by record; a store failure aborts the run but keeps what was already
/// inserted. A duplicate key on insert means another run recorded the listing between our
/// existence check and the insert, so the listing is skipped.
pub async fn reconcile<S>(store: &S, snapshot: &[RawListing]) -> Result<ReconciliationResult, SyncError>
where
    S: ListingStore + ?Sized,
{
    let baseline_employers = store.employers_snapshot().await?;
    let mut new_records = Vec::new();
    let mut inserted_keys = HashSet::new();

    for (position, raw) in snapshot.iter().enumerate() {
        let record = ListingRecord::from_raw(raw);
        if record.identifier.is_unknown() {
            warn!(position, title = ?record.title, "listing number missing; using surrogate key");
        } else if record.has_unknown_fields() {
            debug!(position, identifier = %record.identifier, "listing has unparsed fields");
        }

        let key = record.storage_key();
        if store.exists(&key).await? {
            continue;
        }

        match store.insert(&record).await {
            Ok(()) => {
                inserted_keys.insert(key);
                new_records.push(record);
            }
            Err(StoreError::DuplicateKey(key)) if inserted_keys.contains(&key) => {
                return Err(SyncError::InvariantViolation(format!(
                    "listing {key} reported absent after this run inserted it"
                )));
            }
            Err(StoreError::DuplicateKey(key)) => {
                warn!(key = %key, "listing recorded by a concurrent run; skipping");
            }
            Err(err) => return Err(err.into()),
        }
    }

    let new_employers = new_records
        .iter()
        .filter_map(|record| record.employer.as_ref())
        .filter(|employer| !baseline_employers.contains(*employer))
        .cloned()
        .collect::<BTreeSet<_>>();

    Ok(ReconciliationResult {
        new_records,
        new_employers,
    })
}

pub fn render_report(result: &ReconciliationResult) -> String {
    let mut lines = Vec::new();
    if result.new_records.is_empty() {
        lines.push("No new job postings.".to_string());
    } else {
        lines.push(format!("New job postings ({}):", result.new_records.len()));
        for record in &result.new_records {
            lines.push(format!(
                "- [{}] {} | {} | {}",
                record.identifier,
                record.title.as_deref().unwrap_or(UNKNOWN),
                record.employer.as_deref().unwrap_or(UNKNOWN),
                record.url.as_deref().unwrap_or(UNKNOWN),
            ));
        }
    }

    if !result.new_employers.is_empty() {
        lines.push(String::new());
        lines.push(format!("New employers ({}):", result.new_employers.len()));
        lines.extend(result.new_employers.iter().map(|e| format!("- {e}")));
    }

    let mut text = lines.join("\n");
    text.push('\n');
    text
}

#[derive(Debug, Clone, Serialize)]
pub struct RunReport {
    pub run_id: Uuid,
    pub source: String,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub snapshot_size: usize,
    pub result: ReconciliationResult,
    pub text: String,
    /// Every parsed listing of the run, duplicates included, in page order.
    #[serde(skip)]
    pub snapshot: Vec<ListingRecord>,
}

#[async_trait]
pub trait Notifier: Send + Sync {
    fn name(&self) -> &'static str;

    async fn deliver(&self, report: &RunReport) -> Result<()>;
}

#[derive(Debug, Default)]
pub struct StdoutNotifier;

#[async_trait]
impl Notifier for StdoutNotifier {
    fn name(&self) -> &'static str {
        "stdout"
    }

    async fn deliver(&self, report: &RunReport) -> Result<()> {
        print!("{}", report.text);
        Ok(())
    }
}

/// Writes `<root>/<run_id>/report.txt` and `new_listings.json`.
#[derive(Debug, Clone)]
pub struct ReportDirNotifier {
    root: PathBuf,
}

impl ReportDirNotifier {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn run_dir(&self, run_id: Uuid) -> PathBuf {
        self.root.join(run_id.to_string())
    }
}

#[async_trait]
impl Notifier for ReportDirNotifier {
    fn name(&self) -> &'static str {
        "report-dir"
    }

    async fn deliver(&self, report: &RunReport) -> Result<()> {
        let run_dir = self.run_dir(report.run_id);
        fs::create_dir_all(&run_dir)
            .await
            .with_context(|| format!("creating {}", run_dir.display()))?;

        fs::write(run_dir.join("report.txt"), &report.text)
            .await
            .context("writing report.txt")?;

        let json = serde_json::to_vec_pretty(report).context("serializing run report")?;
        fs::write(run_dir.join("new_listings.json"), json)
            .await
            .context("writing new_listings.json")?;
        Ok(())
    }
}

#[derive(Debug, Serialize)]
struct CsvRow<'a> {
    #[serde(rename = "Job Number")]
    job_number: String,
    #[serde(rename = "Date")]
    date: String,
    #[serde(rename = "Title")]
    title: &'a str,
    #[serde(rename = "URL")]
    url: &'a str,
    #[serde(rename = "Employer")]
    employer: &'a str,
}

impl<'a> From<&'a ListingRecord> for CsvRow<'a> {
    fn from(record: &'a ListingRecord) -> Self {
        Self {
            job_number: record.identifier.to_string(),
            date: record
                .posted_on
                .map(|d| d.to_string())
                .unwrap_or_else(|| UNKNOWN.to_string()),
            title: record.title.as_deref().unwrap_or(UNKNOWN),
            url: record.url.as_deref().unwrap_or(UNKNOWN),
            employer: record.employer.as_deref().unwrap_or(UNKNOWN),
        }
    }
}

pub fn snapshot_csv(records: &[ListingRecord]) -> Result<Vec<u8>> {
    let mut writer = csv::WriterBuilder::new()
        .terminator(csv::Terminator::Any(b'\n'))
        .from_writer(Vec::new());
    if records.is_empty() {
        writer
            .write_record(["Job Number", "Date", "Title", "URL", "Employer"])
            .context("writing csv header")?;
    }
    for record in records {
        writer
            .serialize(CsvRow::from(record))
            .with_context(|| format!("writing csv row for listing {}", record.identifier))?;
    }
    writer
        .into_inner()
        .map_err(|err| anyhow::anyhow!("flushing csv snapshot: {}", err.error()))
}

/// Overwrites one CSV file with the full snapshot of every run, the way the board looked.
#[derive(Debug, Clone)]
pub struct CsvSnapshotNotifier {
    path: PathBuf,
}

impl CsvSnapshotNotifier {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

#[async_trait]
impl Notifier for CsvSnapshotNotifier {
    fn name(&self) -> &'static str {
        "csv-snapshot"
    }

    async fn deliver(&self, report: &RunReport) -> Result<()> {
        for record in &report.snapshot {
            debug!(
                identifier = %record.identifier,
                posted_on = ?record.posted_on,
                title = record.title.as_deref().unwrap_or(UNKNOWN),
                url = record.url.as_deref().unwrap_or(UNKNOWN),
                "snapshot listing"
            );
        }

        let bytes = snapshot_csv(&report.snapshot)?;
        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)
                .await
                .with_context(|| format!("creating {}", parent.display()))?;
        }
        fs::write(&self.path, bytes)
            .await
            .with_context(|| format!("writing {}", self.path.display()))?;
        info!(path = %self.path.display(), rows = report.snapshot.len(), "wrote csv snapshot");
        Ok(())
    }
}

pub fn webhook_payload(report: &RunReport) -> serde_json::Value {
    serde_json::json!({
        "run_id": report.run_id,
        "text": report.text,
        "new_listings": report.result.new_records.len(),
        "new_employers": report.result.new_employers,
    })
}

/// POSTs the report as JSON, retrying transient failures with exponential backoff.
#[derive(Debug, Clone)]
pub struct WebhookNotifier {
    client: reqwest::Client,
    url: String,
    backoff: BackoffPolicy,
}

impl WebhookNotifier {
    pub fn new(http: &HttpFetcher, url: impl Into<String>) -> Self {
        Self {
            client: http.client().clone(),
            url: url.into(),
            backoff: http.backoff(),
        }
    }
}

#[async_trait]
impl Notifier for WebhookNotifier {
    fn name(&self) -> &'static str {
        "webhook"
    }

    async fn deliver(&self, report: &RunReport) -> Result<()> {
        let payload = webhook_payload(report);
        let mut attempt = 0;
        loop {
            let delay = match self.client.post(&self.url).json(&payload).send().await {
                Ok(resp) if resp.status().is_success() => return Ok(()),
                Ok(resp) => {
                    let status = resp.status();
                    match self.backoff.retry_after(attempt, status_transience(status)) {
                        Some(delay) => {
                            debug!(%status, attempt, "webhook refused report; retrying");
                            delay
                        }
                        None => anyhow::bail!(
                            "webhook {} answered {status} after {} attempt(s)",
                            self.url,
                            attempt + 1
                        ),
                    }
                }
                Err(err) => match self.backoff.retry_after(attempt, error_transience(&err)) {
                    Some(delay) => {
                        debug!(error = %err, attempt, "webhook unreachable; retrying");
                        delay
                    }
                    None => {
                        return Err(err).with_context(|| {
                            format!("posting report to {} after {} attempt(s)", self.url, attempt + 1)
                        })
                    }
                },
            };
            tokio::time::sleep(delay).await;
            attempt += 1;
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct SyncRunSummary {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub snapshot_size: usize,
    pub new_listings: usize,
    pub new_employers: usize,
    pub stored_total: usize,
}

pub struct SyncPipeline {
    database_url: String,
    source: Box<dyn SnapshotSource>,
    notifiers: Vec<Box<dyn Notifier>>,
}

impl SyncPipeline {
    pub fn new(database_url: impl Into<String>, source: Box<dyn SnapshotSource>) -> Self {
        Self {
            database_url: database_url.into(),
            source,
            notifiers: Vec::new(),
        }
    }

    pub fn with_notifier(mut self, notifier: Box<dyn Notifier>) -> Self {
        self.notifiers.push(notifier);
        self
    }

    pub fn from_config(config: &SyncConfig) -> Result<Self> {
        let source_config = config.source_config()?;
        let http = HttpFetcher::new(HttpClientConfig {
            timeout: Duration::from_secs(config.http_timeout_secs),
            user_agent: config.user_agent.clone(),
            ..Default::default()
        })?;

        let source: Box<dyn SnapshotSource> = match &config.fixture_html {
            Some(path) => Box::new(FixtureSnapshotSource::new(
                path.clone(),
                source_config.listing_url,
                source_config.selectors,
            )),
            None => Box::new(
                HttpSnapshotSource::new(http.clone(), source_config.listing_url, source_config.selectors)
                    .with_archive(PageArchive::new(config.artifacts_dir.clone())),
            ),
        };

        let mut pipeline =
            Self::new(config.database_url.clone(), source).with_notifier(Box::new(StdoutNotifier));
        if let Some(dir) = &config.reports_dir {
            pipeline = pipeline.with_notifier(Box::new(ReportDirNotifier::new(dir.clone())));
        }
        if let Some(path) = &config.csv_path {
            pipeline = pipeline.with_notifier(Box::new(CsvSnapshotNotifier::new(path.clone())));
        }
        if let Some(url) = &config.webhook_url {
            pipeline = pipeline.with_notifier(Box::new(WebhookNotifier::new(&http, url.clone())));
        }
        Ok(pipeline)
    }

    pub async fn run_once(&self) -> Result<SyncRunSummary> {
        let ctx = AdapterContext::new();
        let span = info_span!("sync_run", run_id = %ctx.run_id);
        self.run_with_context(ctx).instrument(span).await
    }

    async fn run_with_context(&self, ctx: AdapterContext) -> Result<SyncRunSummary> {
        let started_at = Utc::now();
        let snapshot = self
            .source
            .snapshot(&ctx)
            .await
            .map_err(|source| SyncError::SnapshotUnavailable {
                origin: self.source.describe(),
                source,
            })?;
        info!(listings = snapshot.listings.len(), source = %snapshot.source_url, "snapshot captured");

        let store = SqliteListingStore::open(&self.database_url)
            .await
            .map_err(SyncError::from)?;
        let outcome = async {
            let result = reconcile(&store, &snapshot.listings).await?;
            let stored_total = store.count().await?;
            Ok::<_, SyncError>((result, stored_total))
        }
        .await;
        store.close().await;
        let (result, stored_total) = outcome?;

        info!(
            new_listings = result.new_records.len(),
            new_employers = result.new_employers.len(),
            stored_total,
            "reconciliation complete"
        );

        let report = RunReport {
            run_id: ctx.run_id,
            source: snapshot.source_url.clone(),
            started_at,
            finished_at: Utc::now(),
            snapshot_size: snapshot.listings.len(),
            text: render_report(&result),
            result,
            snapshot: snapshot.listings.iter().map(ListingRecord::from_raw).collect(),
        };
        self.deliver(&report).await?;

        Ok(SyncRunSummary {
            run_id: report.run_id,
            started_at: report.started_at,
            finished_at: report.finished_at,
            snapshot_size: report.snapshot_size,
            new_listings: report.result.new_records.len(),
            new_employers: report.result.new_employers.len(),
            stored_total,
        })
    }

    async fn deliver(&self, report: &RunReport) -> Result<(), SyncError> {
        let mut failed = 0usize;
        for notifier in &self.notifiers {
            if let Err(err) = notifier.deliver(report).await {
                error!(notifier = notifier.name(), error = %format!("{err:#}"), "report delivery failed");
                failed += 1;
            }
        }
        if failed > 0 {
            return Err(SyncError::Delivery {
                failed,
                total: self.notifiers.len(),
            });
        }
        Ok(())
    }
}

pub async fn run_sync_once_from_env() -> Result<SyncRunSummary> {
    let config = SyncConfig::from_env();
    SyncPipeline::from_config(&config)?.run_once().await
}

pub async fn build_scheduler(pipeline: Arc<SyncPipeline>, cron: &str) -> Result<JobScheduler> {
    let sched = JobScheduler::new().await.context("creating scheduler")?;
    let job = Job::new_async(cron, move |_uuid, _lock| {
        let pipeline = Arc::clone(&pipeline);
        Box::pin(async move {
            match pipeline.run_once().await {
                Ok(summary) => info!(
                    run_id = %summary.run_id,
                    new_listings = summary.new_listings,
                    "scheduled sync finished"
                ),
                Err(err) => error!(error = %format!("{err:#}"), "scheduled sync failed"),
            }
        })
    })
    .with_context(|| format!("creating scheduler job for cron {cron}"))?;
    sched.add(job).await.context("adding scheduler job")?;
    Ok(sched)
}

/// Run the sync on `JOBWATCH_SYNC_CRON` until Ctrl+C.
pub async fn run_scheduled_from_env() -> Result<()> {
    let config = SyncConfig::from_env();
    let pipeline = Arc::new(SyncPipeline::from_config(&config)?);
    let mut sched = build_scheduler(pipeline, &config.sync_cron).await?;
    sched.start().await.context("starting scheduler")?;
    info!(cron = %config.sync_cron, "scheduler started");

    tokio::signal::ctrl_c()
        .await
        .context("waiting for ctrl-c")?;
    sched.shutdown().await.context("stopping scheduler")?;
    info!("scheduler stopped");
    Ok(())
}

/// Delete the `count` most recently posted listings so the next sync reports them as new again.
pub async fn prune_most_recent<S>(
    store: &S,
    count: usize,
    tie_break: TieBreak,
) -> Result<Vec<StoredListing>, StoreError>
where
    S: ListingStore + ?Sized,
{
    let doomed = store.most_recent(count, tie_break).await?;
    for listing in &doomed {
        store.delete(&listing.key).await?;
        info!(key = %listing.key, posted_on = ?listing.posted_on, "deleted listing");
    }
    Ok(doomed)
}

pub fn render_prune_summary(deleted: &[StoredListing]) -> String {
    if deleted.is_empty() {
        return "No rows found. Nothing to delete.\n".to_string();
    }
    let mut text = String::from("Deleting these rows:\n");
    for listing in deleted {
        let posted_on = listing
            .posted_on
            .map(|d| d.to_string())
            .unwrap_or_else(|| UNKNOWN.to_string());
        text.push_str(&format!("{} | {}\n", listing.key, posted_on));
    }
    text
}

pub async fn run_prune_from_env(count: usize) -> Result<Vec<StoredListing>> {
    let config = SyncConfig::from_env();
    let store = SqliteListingStore::open(&config.database_url).await?;
    let outcome = prune_most_recent(&store, count, TieBreak::default()).await;
    store.close().await;
    Ok(outcome?)
}
