//! Listing persistence, page archiving and HTTP fetch utilities for jobwatch.

use std::cmp::Ordering;
use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use jobwatch_core::{is_sentinel, is_surrogate_key, Identifier, ListingRecord, LEGACY_UNKNOWN, UNKNOWN};
use reqwest::StatusCode;
use sha2::{Digest, Sha256};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions, SqliteRow};
use sqlx::Row;
use thiserror::Error;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::{debug, info, info_span, warn, Instrument};
use uuid::Uuid;

pub const CRATE_NAME: &str = "jobwatch-storage";

const DATE_FORMAT: &str = "%Y-%m-%d";

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("listing {0} is already recorded")]
    DuplicateKey(String),
    #[error("listing store unavailable while {operation}: {reason}")]
    Unavailable {
        operation: &'static str,
        reason: String,
    },
}

impl StoreError {
    pub fn is_duplicate_key(&self) -> bool {
        matches!(self, StoreError::DuplicateKey(_))
    }
}

fn unavailable(operation: &'static str) -> impl FnOnce(sqlx::Error) -> StoreError {
    move |err| StoreError::Unavailable {
        operation,
        reason: err.to_string(),
    }
}

/// Secondary order applied to listings sharing the same posting date.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TieBreak {
    #[default]
    KeyAscending,
    KeyDescending,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredListing {
    pub key: String,
    pub posted_on: Option<NaiveDate>,
}

/// Durable keyed set of every listing seen so far.
#[async_trait]
pub trait ListingStore: Send + Sync {
    async fn exists(&self, key: &str) -> Result<bool, StoreError>;

    async fn find(&self, key: &str) -> Result<Option<ListingRecord>, StoreError>;

    /// Insert a brand-new record; never overwrites.
    async fn insert(&self, record: &ListingRecord) -> Result<(), StoreError>;

    /// Distinct known employers currently stored.
    async fn employers_snapshot(&self) -> Result<BTreeSet<String>, StoreError>;

    /// Latest listings first; undated listings sort after every dated one.
    async fn most_recent(
        &self,
        limit: usize,
        tie_break: TieBreak,
    ) -> Result<Vec<StoredListing>, StoreError>;

    async fn delete(&self, key: &str) -> Result<bool, StoreError>;

    async fn count(&self) -> Result<usize, StoreError>;
}

fn date_column(posted_on: Option<NaiveDate>) -> String {
    posted_on
        .map(|d| d.format(DATE_FORMAT).to_string())
        .unwrap_or_else(|| UNKNOWN.to_string())
}

fn parse_date_column(value: Option<&str>) -> Option<NaiveDate> {
    value
        .filter(|v| !is_sentinel(v))
        .and_then(|v| NaiveDate::parse_from_str(v, DATE_FORMAT).ok())
}

fn text_column(value: Option<&str>) -> String {
    value.unwrap_or(UNKNOWN).to_string()
}

fn parse_text_column(value: Option<String>) -> Option<String> {
    value.filter(|v| !v.is_empty() && !is_sentinel(v))
}

fn identifier_for_key(key: &str) -> Identifier {
    if is_surrogate_key(key) || is_sentinel(key) {
        Identifier::Unknown
    } else {
        Identifier::Known(key.to_string())
    }
}

fn compare_recency(a: &StoredListing, b: &StoredListing, tie_break: TieBreak) -> Ordering {
    let by_date = match (a.posted_on, b.posted_on) {
        (Some(x), Some(y)) => y.cmp(&x),
        (Some(_), None) => Ordering::Less,
        (None, Some(_)) => Ordering::Greater,
        (None, None) => Ordering::Equal,
    };
    by_date.then_with(|| match tie_break {
        TieBreak::KeyAscending => a.key.cmp(&b.key),
        TieBreak::KeyDescending => b.key.cmp(&a.key),
    })
}

/// SQLite-backed listing store.
///
/// Works against databases written by the legacy scraper: the `employer` column is added on
/// open when missing, existing rows default to unknown.
#[derive(Debug, Clone)]
pub struct SqliteListingStore {
    pool: SqlitePool,
}

impl SqliteListingStore {
    pub async fn open(database_url: &str) -> Result<Self, StoreError> {
        let options = SqliteConnectOptions::from_str(database_url)
            .map_err(unavailable("parsing database url"))?
            .create_if_missing(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect_with(options)
            .await
            .map_err(unavailable("connecting"))?;
        let store = Self { pool };
        store.bootstrap().await?;
        debug!(database_url, "listing store opened");
        Ok(store)
    }

    pub async fn open_in_memory() -> Result<Self, StoreError> {
        Self::open("sqlite::memory:").await
    }

    pub async fn close(self) {
        self.pool.close().await;
    }

    async fn bootstrap(&self) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS jobs (
                job_number TEXT PRIMARY KEY,
                date       TEXT,
                title      TEXT,
                url        TEXT,
                employer   TEXT NOT NULL DEFAULT 'unknown'
            )
            "#,
        )
        .execute(&self.pool)
        .await
        .map_err(unavailable("creating jobs table"))?;

        let columns = sqlx::query("SELECT name FROM pragma_table_info('jobs')")
            .fetch_all(&self.pool)
            .await
            .map_err(unavailable("inspecting jobs table"))?;
        let has_employer = columns
            .iter()
            .filter_map(|row| row.try_get::<String, _>("name").ok())
            .any(|name| name == "employer");

        if !has_employer {
            sqlx::query("ALTER TABLE jobs ADD COLUMN employer TEXT NOT NULL DEFAULT 'unknown'")
                .execute(&self.pool)
                .await
                .map_err(unavailable("adding employer column"))?;
            info!("migrated jobs table: added employer column");
        }
        Ok(())
    }

    fn record_from_row(row: &SqliteRow) -> Result<ListingRecord, StoreError> {
        let key: String = row
            .try_get("job_number")
            .map_err(unavailable("decoding job_number"))?;
        let date: Option<String> = row.try_get("date").map_err(unavailable("decoding date"))?;
        let employer: Option<String> = row
            .try_get("employer")
            .map_err(unavailable("decoding employer"))?;
        let title: Option<String> = row.try_get("title").map_err(unavailable("decoding title"))?;
        let url: Option<String> = row.try_get("url").map_err(unavailable("decoding url"))?;
        Ok(ListingRecord {
            identifier: identifier_for_key(&key),
            posted_on: parse_date_column(date.as_deref()),
            employer: parse_text_column(employer),
            title: parse_text_column(title),
            url: parse_text_column(url),
        })
    }
}

#[async_trait]
impl ListingStore for SqliteListingStore {
    async fn exists(&self, key: &str) -> Result<bool, StoreError> {
        let row = sqlx::query("SELECT 1 FROM jobs WHERE job_number = ?1")
            .bind(key)
            .fetch_optional(&self.pool)
            .await
            .map_err(unavailable("checking listing"))?;
        Ok(row.is_some())
    }

    async fn find(&self, key: &str) -> Result<Option<ListingRecord>, StoreError> {
        let row = sqlx::query(
            "SELECT job_number, date, employer, title, url FROM jobs WHERE job_number = ?1",
        )
        .bind(key)
        .fetch_optional(&self.pool)
        .await
        .map_err(unavailable("loading listing"))?;
        row.as_ref().map(Self::record_from_row).transpose()
    }

    async fn insert(&self, record: &ListingRecord) -> Result<(), StoreError> {
        let key = record.storage_key();
        let result = sqlx::query(
            r#"
            INSERT INTO jobs (job_number, date, employer, title, url)
            VALUES (?1, ?2, ?3, ?4, ?5)
            "#,
        )
        .bind(&key)
        .bind(date_column(record.posted_on))
        .bind(text_column(record.employer.as_deref()))
        .bind(text_column(record.title.as_deref()))
        .bind(text_column(record.url.as_deref()))
        .execute(&self.pool)
        .await;

        match result {
            Ok(_) => Ok(()),
            Err(sqlx::Error::Database(db_err)) if db_err.is_unique_violation() => {
                Err(StoreError::DuplicateKey(key))
            }
            Err(err) => Err(unavailable("inserting listing")(err)),
        }
    }

    async fn employers_snapshot(&self) -> Result<BTreeSet<String>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT DISTINCT employer
              FROM jobs
             WHERE employer IS NOT NULL
               AND employer NOT IN (?1, ?2, '')
            "#,
        )
        .bind(UNKNOWN)
        .bind(LEGACY_UNKNOWN)
        .fetch_all(&self.pool)
        .await
        .map_err(unavailable("loading employers"))?;

        rows.iter()
            .map(|row| {
                row.try_get::<String, _>("employer")
                    .map_err(unavailable("decoding employer"))
            })
            .collect()
    }

    async fn most_recent(
        &self,
        limit: usize,
        tie_break: TieBreak,
    ) -> Result<Vec<StoredListing>, StoreError> {
        let sql = match tie_break {
            TieBreak::KeyAscending => {
                r#"
                SELECT job_number, date
                  FROM jobs
                 ORDER BY CASE WHEN date IS NULL OR date IN (?1, ?2) THEN 1 ELSE 0 END,
                          date DESC,
                          job_number ASC
                 LIMIT ?3
                "#
            }
            TieBreak::KeyDescending => {
                r#"
                SELECT job_number, date
                  FROM jobs
                 ORDER BY CASE WHEN date IS NULL OR date IN (?1, ?2) THEN 1 ELSE 0 END,
                          date DESC,
                          job_number DESC
                 LIMIT ?3
                "#
            }
        };
        let limit = i64::try_from(limit).unwrap_or(i64::MAX);
        let rows = sqlx::query(sql)
            .bind(UNKNOWN)
            .bind(LEGACY_UNKNOWN)
            .bind(limit)
            .fetch_all(&self.pool)
            .await
            .map_err(unavailable("loading most recent listings"))?;

        rows.iter()
            .map(|row| {
                let key: String = row
                    .try_get("job_number")
                    .map_err(unavailable("decoding job_number"))?;
                let date: Option<String> =
                    row.try_get("date").map_err(unavailable("decoding date"))?;
                Ok(StoredListing {
                    key,
                    posted_on: parse_date_column(date.as_deref()),
                })
            })
            .collect()
    }

    async fn delete(&self, key: &str) -> Result<bool, StoreError> {
        let result = sqlx::query("DELETE FROM jobs WHERE job_number = ?1")
            .bind(key)
            .execute(&self.pool)
            .await
            .map_err(unavailable("deleting listing"))?;
        Ok(result.rows_affected() > 0)
    }

    async fn count(&self) -> Result<usize, StoreError> {
        let row = sqlx::query("SELECT COUNT(*) AS n FROM jobs")
            .fetch_one(&self.pool)
            .await
            .map_err(unavailable("counting listings"))?;
        let n: i64 = row.try_get("n").map_err(unavailable("decoding count"))?;
        Ok(usize::try_from(n).unwrap_or_default())
    }
}

/// In-process listing store, mainly for tests.
#[derive(Debug, Default)]
pub struct MemoryListingStore {
    rows: Mutex<BTreeMap<String, ListingRecord>>,
}

impl MemoryListingStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_records(records: impl IntoIterator<Item = ListingRecord>) -> Self {
        let rows = records
            .into_iter()
            .map(|record| (record.storage_key(), record))
            .collect();
        Self {
            rows: Mutex::new(rows),
        }
    }

    pub async fn keys(&self) -> Vec<String> {
        self.rows.lock().await.keys().cloned().collect()
    }
}

#[async_trait]
impl ListingStore for MemoryListingStore {
    async fn exists(&self, key: &str) -> Result<bool, StoreError> {
        Ok(self.rows.lock().await.contains_key(key))
    }

    async fn find(&self, key: &str) -> Result<Option<ListingRecord>, StoreError> {
        Ok(self.rows.lock().await.get(key).cloned())
    }

    async fn insert(&self, record: &ListingRecord) -> Result<(), StoreError> {
        let key = record.storage_key();
        let mut rows = self.rows.lock().await;
        if rows.contains_key(&key) {
            return Err(StoreError::DuplicateKey(key));
        }
        rows.insert(key, record.clone());
        Ok(())
    }

    async fn employers_snapshot(&self) -> Result<BTreeSet<String>, StoreError> {
        Ok(self
            .rows
            .lock()
            .await
            .values()
            .filter_map(|record| record.employer.clone())
            .collect())
    }

    async fn most_recent(
        &self,
        limit: usize,
        tie_break: TieBreak,
    ) -> Result<Vec<StoredListing>, StoreError> {
        let mut listings = self
            .rows
            .lock()
            .await
            .iter()
            .map(|(key, record)| StoredListing {
                key: key.clone(),
                posted_on: record.posted_on,
            })
            .collect::<Vec<_>>();
        listings.sort_by(|a, b| compare_recency(a, b, tie_break));
        listings.truncate(limit);
        Ok(listings)
    }

    async fn delete(&self, key: &str) -> Result<bool, StoreError> {
        Ok(self.rows.lock().await.remove(key).is_some())
    }

    async fn count(&self) -> Result<usize, StoreError> {
        Ok(self.rows.lock().await.len())
    }
}

#[derive(Debug, Clone)]
pub struct ArchivedPage {
    pub content_hash: String,
    pub relative_path: PathBuf,
    pub absolute_path: PathBuf,
    pub byte_size: usize,
    pub deduplicated: bool,
}

/// Content-addressed archive of fetched listing pages.
#[derive(Debug, Clone)]
pub struct PageArchive {
    root: PathBuf,
}

impl PageArchive {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn sha256_hex(bytes: &[u8]) -> String {
        hex::encode(Sha256::digest(bytes))
    }

    /// `<YYYYmmdd>/<sha256>.<ext>`: one directory per day, identical pages share a file.
    pub fn page_relative_path(
        fetched_at: DateTime<Utc>,
        content_hash: &str,
        extension: &str,
    ) -> PathBuf {
        let ext = match extension.trim_start_matches('.').trim() {
            "" => "bin",
            ext => ext,
        };
        PathBuf::from(fetched_at.format("%Y%m%d").to_string())
            .join(format!("{content_hash}.{ext}"))
    }

    pub async fn archive_page(
        &self,
        fetched_at: DateTime<Utc>,
        extension: &str,
        bytes: &[u8],
    ) -> anyhow::Result<ArchivedPage> {
        let content_hash = Self::sha256_hex(bytes);
        let relative_path = Self::page_relative_path(fetched_at, &content_hash, extension);
        let absolute_path = self.root.join(&relative_path);

        let written = write_new_file_atomically(&absolute_path, bytes).await?;
        Ok(ArchivedPage {
            content_hash,
            relative_path,
            absolute_path,
            byte_size: bytes.len(),
            deduplicated: !written,
        })
    }
}

/// Write through a temp file + rename. Returns `false` when the target already existed.
async fn write_new_file_atomically(path: &Path, bytes: &[u8]) -> anyhow::Result<bool> {
    let parent = path
        .parent()
        .with_context(|| format!("archive path {} has no parent", path.display()))?;
    fs::create_dir_all(parent)
        .await
        .with_context(|| format!("creating archive directory {}", parent.display()))?;

    if fs::try_exists(path)
        .await
        .with_context(|| format!("checking archive path {}", path.display()))?
    {
        return Ok(false);
    }

    let temp_path = parent.join(format!(".{}.tmp", Uuid::new_v4()));
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
    drop(file);

    match fs::rename(&temp_path, path).await {
        Ok(()) => Ok(true),
        Err(err) if err.kind() == std::io::ErrorKind::AlreadyExists => {
            let _ = fs::remove_file(&temp_path).await;
            Ok(false)
        }
        Err(err) => {
            let _ = fs::remove_file(&temp_path).await;
            Err(err).with_context(|| {
                format!("renaming {} -> {}", temp_path.display(), path.display())
            })
        }
    }
}

/// Whether a failed request is worth repeating.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transience {
    Transient,
    Permanent,
}

/// Server trouble, throttling and request timeouts are transient; any other status is final.
pub fn status_transience(status: StatusCode) -> Transience {
    match status {
        s if s.is_server_error() => Transience::Transient,
        StatusCode::TOO_MANY_REQUESTS | StatusCode::REQUEST_TIMEOUT => Transience::Transient,
        _ => Transience::Permanent,
    }
}

pub fn error_transience(err: &reqwest::Error) -> Transience {
    if err.is_timeout() || err.is_connect() {
        Transience::Transient
    } else {
        Transience::Permanent
    }
}

/// Exponential backoff shared by the listing fetch and webhook delivery.
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
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(8),
        }
    }
}

impl BackoffPolicy {
    pub fn delay_for_attempt(&self, attempt_index: usize) -> Duration {
        let factor = u32::try_from(attempt_index)
            .ok()
            .and_then(|shift| 1u32.checked_shl(shift))
            .unwrap_or(u32::MAX);
        self.base_delay.saturating_mul(factor).min(self.max_delay)
    }

    /// Delay before the next try, or `None` once the failure is permanent or retries are spent.
    pub fn retry_after(&self, attempt_index: usize, transience: Transience) -> Option<Duration> {
        (transience == Transience::Transient && attempt_index < self.max_retries)
            .then(|| self.delay_for_attempt(attempt_index))
    }
}

pub const DEFAULT_USER_AGENT: &str = "jobwatch-bot/0.1";

#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    pub timeout: Duration,
    pub user_agent: String,
    pub backoff: BackoffPolicy,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(20),
            user_agent: DEFAULT_USER_AGENT.to_string(),
            backoff: BackoffPolicy::default(),
        }
    }
}

/// Listing page body together with the URL it was served from after redirects.
#[derive(Debug, Clone)]
pub struct FetchedPage {
    pub final_url: String,
    pub body: Vec<u8>,
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("{url} unreachable after {attempts} attempt(s)")]
    Unreachable {
        url: String,
        attempts: usize,
        #[source]
        source: reqwest::Error,
    },
    #[error("{url} answered HTTP {status} after {attempts} attempt(s)")]
    Rejected {
        url: String,
        status: u16,
        attempts: usize,
    },
}

#[derive(Debug, Clone)]
pub struct HttpFetcher {
    client: reqwest::Client,
    backoff: BackoffPolicy,
}

impl HttpFetcher {
    pub fn new(config: HttpClientConfig) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(config.timeout)
            .user_agent(config.user_agent)
            .build()
            .context("building listing HTTP client")?;
        Ok(Self {
            client,
            backoff: config.backoff,
        })
    }

    pub fn client(&self) -> &reqwest::Client {
        &self.client
    }

    pub fn backoff(&self) -> BackoffPolicy {
        self.backoff
    }

    pub async fn fetch_page(&self, run_id: Uuid, url: &str) -> Result<FetchedPage, FetchError> {
        let span = info_span!("http_fetch", %run_id, url);
        self.fetch_with_retries(url).instrument(span).await
    }

    async fn fetch_with_retries(&self, url: &str) -> Result<FetchedPage, FetchError> {
        let unreachable = |attempt: usize, source| FetchError::Unreachable {
            url: url.to_string(),
            attempts: attempt + 1,
            source,
        };

        let mut attempt = 0;
        loop {
            let delay = match self.client.get(url).send().await {
                Ok(resp) if resp.status().is_success() => {
                    let final_url = resp.url().to_string();
                    let body = resp
                        .bytes()
                        .await
                        .map_err(|err| unreachable(attempt, err))?
                        .to_vec();
                    debug!(bytes = body.len(), attempt, "fetched listing page");
                    return Ok(FetchedPage { final_url, body });
                }
                Ok(resp) => {
                    let status = resp.status();
                    match self.backoff.retry_after(attempt, status_transience(status)) {
                        Some(delay) => {
                            warn!(%status, attempt, "listing page refused; retrying");
                            delay
                        }
                        None => {
                            return Err(FetchError::Rejected {
                                url: resp.url().to_string(),
                                status: status.as_u16(),
                                attempts: attempt + 1,
                            })
                        }
                    }
                }
                Err(err) => match self.backoff.retry_after(attempt, error_transience(&err)) {
                    Some(delay) => {
                        warn!(error = %err, attempt, "listing page unreachable; retrying");
                        delay
                    }
                    None => return Err(unreachable(attempt, err)),
                },
            };
            tokio::time::sleep(delay).await;
            attempt += 1;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn ymd(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    fn listing(number: &str, posted_on: Option<NaiveDate>, employer: Option<&str>) -> ListingRecord {
        ListingRecord {
            identifier: Identifier::Known(number.to_string()),
            posted_on,
            employer: employer.map(str::to_string),
            title: Some(format!("Physiotherapeut:in {number}")),
            url: Some(format!("https://physioswiss.ch/stelleninserate/{number}/")),
        }
    }

    fn keys(listings: &[StoredListing]) -> Vec<&str> {
        listings.iter().map(|l| l.key.as_str()).collect()
    }

    #[tokio::test]
    async fn sqlite_insert_is_new_only() {
        let store = SqliteListingStore::open_in_memory().await.unwrap();
        let record = listing("502200", Some(ymd(2025, 10, 5)), Some("Acme"));

        assert!(!store.exists("502200").await.unwrap());
        store.insert(&record).await.unwrap();
        assert!(store.exists("502200").await.unwrap());

        let err = store.insert(&record).await.unwrap_err();
        assert!(err.is_duplicate_key());
        assert_eq!(store.count().await.unwrap(), 1);
        assert_eq!(store.find("502200").await.unwrap(), Some(record));
        assert_eq!(store.find("missing").await.unwrap(), None);
    }

    #[tokio::test]
    async fn sqlite_round_trips_unknown_fields() {
        let store = SqliteListingStore::open_in_memory().await.unwrap();
        let record = ListingRecord {
            identifier: Identifier::Unknown,
            posted_on: None,
            employer: None,
            title: Some("Praxis sucht Verstärkung".to_string()),
            url: None,
        };
        let key = record.storage_key();
        store.insert(&record).await.unwrap();

        let loaded = store.find(&key).await.unwrap().unwrap();
        assert_eq!(loaded, record);
        assert!(store.employers_snapshot().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn employers_snapshot_skips_unknown_markers() {
        let store = SqliteListingStore::open_in_memory().await.unwrap();
        store.insert(&listing("1", None, Some("Acme"))).await.unwrap();
        store.insert(&listing("2", None, Some("Beta"))).await.unwrap();
        store.insert(&listing("3", None, Some("Acme"))).await.unwrap();
        store.insert(&listing("4", None, None)).await.unwrap();

        let employers = store.employers_snapshot().await.unwrap();
        assert_eq!(
            employers,
            BTreeSet::from(["Acme".to_string(), "Beta".to_string()])
        );
    }

    #[tokio::test]
    async fn most_recent_orders_undated_last() {
        let store = SqliteListingStore::open_in_memory().await.unwrap();
        store.insert(&listing("10", None, None)).await.unwrap();
        store.insert(&listing("11", Some(ymd(2025, 1, 2)), None)).await.unwrap();
        store.insert(&listing("12", Some(ymd(2025, 3, 1)), None)).await.unwrap();
        store.insert(&listing("13", Some(ymd(2025, 1, 2)), None)).await.unwrap();

        let asc = store.most_recent(10, TieBreak::KeyAscending).await.unwrap();
        assert_eq!(keys(&asc), vec!["12", "11", "13", "10"]);
        assert_eq!(asc[3].posted_on, None);

        let desc = store.most_recent(3, TieBreak::KeyDescending).await.unwrap();
        assert_eq!(keys(&desc), vec!["12", "13", "11"]);
    }

    #[tokio::test]
    async fn memory_store_matches_sqlite_ordering() {
        let records = vec![
            listing("10", None, None),
            listing("11", Some(ymd(2025, 1, 2)), None),
            listing("12", Some(ymd(2025, 3, 1)), None),
            listing("13", Some(ymd(2025, 1, 2)), None),
        ];
        let store = MemoryListingStore::with_records(records);
        let asc = store.most_recent(10, TieBreak::KeyAscending).await.unwrap();
        assert_eq!(keys(&asc), vec!["12", "11", "13", "10"]);
        assert!(store.delete("12").await.unwrap());
        assert!(!store.delete("12").await.unwrap());
        assert_eq!(store.count().await.unwrap(), 3);
    }

    #[tokio::test]
    async fn legacy_table_gains_employer_column_without_losing_rows() {
        let dir = tempdir().expect("tempdir");
        let url = format!("sqlite://{}", dir.path().join("jobs.db").display());

        {
            let options = SqliteConnectOptions::from_str(&url)
                .unwrap()
                .create_if_missing(true);
            let pool = SqlitePoolOptions::new()
                .max_connections(1)
                .connect_with(options)
                .await
                .unwrap();
            sqlx::query(
                "CREATE TABLE jobs (job_number TEXT PRIMARY KEY, date TEXT, title TEXT, url TEXT)",
            )
            .execute(&pool)
            .await
            .unwrap();
            sqlx::query("INSERT INTO jobs VALUES ('502200', '2025-10-05', 'Physio', 'https://x/1')")
                .execute(&pool)
                .await
                .unwrap();
            sqlx::query("INSERT INTO jobs VALUES ('N/A', 'N/A', 'Orphan', 'N/A')")
                .execute(&pool)
                .await
                .unwrap();
            pool.close().await;
        }

        let store = SqliteListingStore::open(&url).await.unwrap();
        assert_eq!(store.count().await.unwrap(), 2);
        let legacy = store.find("502200").await.unwrap().unwrap();
        assert_eq!(legacy.posted_on, Some(ymd(2025, 10, 5)));
        assert_eq!(legacy.employer, None);
        assert_eq!(legacy.title.as_deref(), Some("Physio"));

        let orphan = store.find("N/A").await.unwrap().unwrap();
        assert_eq!(orphan.identifier, Identifier::Unknown);
        assert_eq!(orphan.url, None);

        let recent = store.most_recent(10, TieBreak::KeyAscending).await.unwrap();
        assert_eq!(keys(&recent), vec!["502200", "N/A"]);

        store.insert(&listing("7", None, Some("Acme"))).await.unwrap();
        store.close().await;

        let reopened = SqliteListingStore::open(&url).await.unwrap();
        assert_eq!(reopened.count().await.unwrap(), 3);
        assert_eq!(
            reopened.employers_snapshot().await.unwrap(),
            BTreeSet::from(["Acme".to_string()])
        );
    }

    #[test]
    fn page_hashing_is_stable() {
        let hash = PageArchive::sha256_hex(b"hello world");
        assert_eq!(
            hash,
            "b94d27b9934d3e08a52e52d7da7dabfac484efe37a5380ee9088f7ace2efcde9"
        );
    }

    #[tokio::test]
    async fn unchanged_pages_are_archived_once() {
        let dir = tempdir().expect("tempdir");
        let archive = PageArchive::new(dir.path());
        let fetched_at = DateTime::parse_from_rfc3339("2025-10-05T07:00:00Z")
            .expect("ts")
            .with_timezone(&Utc);

        let first = archive
            .archive_page(fetched_at, "html", b"<html>listing</html>")
            .await
            .expect("first archive");
        let second = archive
            .archive_page(fetched_at, ".html", b"<html>listing</html>")
            .await
            .expect("second archive");

        assert!(!first.deduplicated);
        assert!(second.deduplicated);
        assert_eq!(first.relative_path, second.relative_path);
        assert!(first.relative_path.starts_with("20251005"));
        assert!(first.absolute_path.exists());
    }

    #[test]
    fn backoff_doubles_until_capped() {
        let policy = BackoffPolicy {
            max_retries: 5,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_millis(350),
        };

        assert_eq!(policy.delay_for_attempt(0), Duration::from_millis(100));
        assert_eq!(policy.delay_for_attempt(1), Duration::from_millis(200));
        assert_eq!(policy.delay_for_attempt(2), Duration::from_millis(350));
        assert_eq!(policy.delay_for_attempt(64), Duration::from_millis(350));
    }

    #[test]
    fn only_transient_statuses_are_retried() {
        assert_eq!(status_transience(StatusCode::BAD_GATEWAY), Transience::Transient);
        assert_eq!(status_transience(StatusCode::TOO_MANY_REQUESTS), Transience::Transient);
        assert_eq!(status_transience(StatusCode::REQUEST_TIMEOUT), Transience::Transient);
        assert_eq!(status_transience(StatusCode::NOT_FOUND), Transience::Permanent);
        assert_eq!(status_transience(StatusCode::FORBIDDEN), Transience::Permanent);
    }

    #[test]
    fn retry_budget_is_spent_then_exhausted() {
        let policy = BackoffPolicy {
            max_retries: 2,
            base_delay: Duration::from_millis(10),
            max_delay: Duration::from_millis(15),
        };

        assert_eq!(
            policy.retry_after(0, Transience::Transient),
            Some(Duration::from_millis(10))
        );
        assert_eq!(
            policy.retry_after(1, Transience::Transient),
            Some(Duration::from_millis(15))
        );
        assert_eq!(policy.retry_after(2, Transience::Transient), None);
        assert_eq!(policy.retry_after(0, Transience::Permanent), None);
    }
}
