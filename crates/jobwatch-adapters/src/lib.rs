//! Listing page extraction: turns the physioswiss job board into raw snapshot rows.

use std::path::PathBuf;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use jobwatch_core::RawListing;
use jobwatch_storage::{FetchError, HttpFetcher, PageArchive};
use scraper::{ElementRef, Html, Selector};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info};
use url::Url;
use uuid::Uuid;

pub const CRATE_NAME: &str = "jobwatch-adapters";

pub const DEFAULT_LISTING_URL: &str = "https://physioswiss.ch/stelleninserate/?_per_page=5000";

#[derive(Debug, Error)]
pub enum AdapterError {
    #[error("invalid selector `{selector}`: {reason}")]
    Selector { selector: String, reason: String },
    #[error(transparent)]
    Fetch(#[from] FetchError),
    #[error("reading fixture {path}: {source}")]
    Fixture {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error(transparent)]
    Anyhow(#[from] anyhow::Error),
}

/// CSS selectors for one listing card and its fields, relative to the card.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ListingSelectors {
    pub card: String,
    pub title: String,
    pub link: String,
    pub number: String,
    pub date: String,
    pub employer: String,
}

impl Default for ListingSelectors {
    fn default() -> Self {
        Self {
            card: "article.tease-jobad".to_string(),
            title: "h2.tease-jobad__title".to_string(),
            link: "a.tease-jobad__link".to_string(),
            number: "p.tease-jobad__number".to_string(),
            date: "p.tease-jobad__date time".to_string(),
            employer: ".tease-jobad__employer".to_string(),
        }
    }
}

struct CompiledSelectors {
    card: Selector,
    title: Selector,
    link: Selector,
    number: Selector,
    date: Selector,
    employer: Selector,
}

impl CompiledSelectors {
    fn compile(selectors: &ListingSelectors) -> Result<Self, AdapterError> {
        Ok(Self {
            card: compile_selector(&selectors.card)?,
            title: compile_selector(&selectors.title)?,
            link: compile_selector(&selectors.link)?,
            number: compile_selector(&selectors.number)?,
            date: compile_selector(&selectors.date)?,
            employer: compile_selector(&selectors.employer)?,
        })
    }
}

fn compile_selector(selector: &str) -> Result<Selector, AdapterError> {
    Selector::parse(selector).map_err(|e| AdapterError::Selector {
        selector: selector.to_string(),
        reason: e.to_string(),
    })
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AdapterContext {
    pub run_id: Uuid,
    pub fetched_at: DateTime<Utc>,
}

impl AdapterContext {
    pub fn new() -> Self {
        Self {
            run_id: Uuid::new_v4(),
            fetched_at: Utc::now(),
        }
    }
}

impl Default for AdapterContext {
    fn default() -> Self {
        Self::new()
    }
}

/// One complete extraction pass over the listing page, in page order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Snapshot {
    pub source_url: String,
    pub fetched_at: DateTime<Utc>,
    pub listings: Vec<RawListing>,
}

#[async_trait]
pub trait SnapshotSource: Send + Sync {
    fn describe(&self) -> String;

    async fn snapshot(&self, ctx: &AdapterContext) -> Result<Snapshot, AdapterError>;
}

fn text_or_none(value: String) -> Option<String> {
    let collapsed = value.split_whitespace().collect::<Vec<_>>().join(" ");
    if collapsed.is_empty() {
        None
    } else {
        Some(collapsed)
    }
}

fn first_text(card: &ElementRef<'_>, selector: &Selector) -> Option<String> {
    card.select(selector)
        .next()
        .and_then(|n| text_or_none(n.text().collect::<String>()))
}

fn first_href(card: &ElementRef<'_>, selector: &Selector, base: Option<&Url>) -> Option<String> {
    let href = card
        .select(selector)
        .next()
        .and_then(|n| n.value().attr("href"))
        .and_then(|s| text_or_none(s.to_string()))?;
    match base.and_then(|b| b.join(&href).ok()) {
        Some(resolved) => Some(resolved.to_string()),
        None => Some(href),
    }
}

/// Extract every listing card from a rendered listing page.
///
/// Missing elements become `None`; links are resolved against `page_url` when it parses.
pub fn extract_listings(
    html: &str,
    page_url: &str,
    selectors: &ListingSelectors,
) -> Result<Vec<RawListing>, AdapterError> {
    let compiled = CompiledSelectors::compile(selectors)?;
    let base = Url::parse(page_url).ok();
    let document = Html::parse_document(html);

    let listings = document
        .select(&compiled.card)
        .map(|card| RawListing {
            identifier_text: first_text(&card, &compiled.number),
            date_text: first_text(&card, &compiled.date),
            employer_text: first_text(&card, &compiled.employer),
            title_text: first_text(&card, &compiled.title),
            url_text: first_href(&card, &compiled.link, base.as_ref()),
        })
        .collect::<Vec<_>>();
    debug!(cards = listings.len(), "extracted listing cards");
    Ok(listings)
}

/// Fetches the live listing page, archives it and extracts the cards.
#[derive(Debug, Clone)]
pub struct HttpSnapshotSource {
    http: HttpFetcher,
    archive: Option<PageArchive>,
    listing_url: String,
    selectors: ListingSelectors,
}

impl HttpSnapshotSource {
    pub fn new(http: HttpFetcher, listing_url: impl Into<String>, selectors: ListingSelectors) -> Self {
        Self {
            http,
            archive: None,
            listing_url: listing_url.into(),
            selectors,
        }
    }

    pub fn with_archive(mut self, archive: PageArchive) -> Self {
        self.archive = Some(archive);
        self
    }
}

#[async_trait]
impl SnapshotSource for HttpSnapshotSource {
    fn describe(&self) -> String {
        self.listing_url.clone()
    }

    async fn snapshot(&self, ctx: &AdapterContext) -> Result<Snapshot, AdapterError> {
        let response = self.http.fetch_page(ctx.run_id, &self.listing_url).await?;

        if let Some(archive) = &self.archive {
            let archived = archive
                .archive_page(ctx.fetched_at, "html", &response.body)
                .await?;
            info!(
                path = %archived.relative_path.display(),
                deduplicated = archived.deduplicated,
                "archived listing page"
            );
        }

        let html = String::from_utf8_lossy(&response.body);
        let listings = extract_listings(&html, &response.final_url, &self.selectors)?;
        Ok(Snapshot {
            source_url: response.final_url,
            fetched_at: ctx.fetched_at,
            listings,
        })
    }
}

/// Reads a saved listing page from disk instead of fetching it.
#[derive(Debug, Clone)]
pub struct FixtureSnapshotSource {
    path: PathBuf,
    page_url: String,
    selectors: ListingSelectors,
}

impl FixtureSnapshotSource {
    pub fn new(path: impl Into<PathBuf>, page_url: impl Into<String>, selectors: ListingSelectors) -> Self {
        Self {
            path: path.into(),
            page_url: page_url.into(),
            selectors,
        }
    }
}

#[async_trait]
impl SnapshotSource for FixtureSnapshotSource {
    fn describe(&self) -> String {
        self.path.display().to_string()
    }

    async fn snapshot(&self, ctx: &AdapterContext) -> Result<Snapshot, AdapterError> {
        let html = tokio::fs::read_to_string(&self.path)
            .await
            .map_err(|source| AdapterError::Fixture {
                path: self.path.clone(),
                source,
            })?;
        let listings = extract_listings(&html, &self.page_url, &self.selectors)?;
        Ok(Snapshot {
            source_url: self.page_url.clone(),
            fetched_at: ctx.fetched_at,
            listings,
        })
    }
}
