//! Core listing model and field parsers for jobwatch.

use std::collections::BTreeSet;
use std::fmt;

use chrono::NaiveDate;
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub const CRATE_NAME: &str = "jobwatch-core";

/// Text written at the persistence and rendering boundary for a field that could not be parsed.
pub const UNKNOWN: &str = "unknown";

/// Sentinel the legacy scraper wrote for missing fields.
pub const LEGACY_UNKNOWN: &str = "N/A";

const SURROGATE_PREFIX: &str = "unknown-";

static JOB_NUMBER: Lazy<Regex> = Lazy::new(|| Regex::new(r"J-([0-9]+)").expect("valid regex"));

static GERMAN_DATE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^([0-9]+)\.\s+(\w+)\s+([0-9]{4})").expect("valid regex"));

const GERMAN_MONTHS: [(&str, u32); 12] = [
    ("Januar", 1),
    ("Februar", 2),
    ("März", 3),
    ("April", 4),
    ("Mai", 5),
    ("Juni", 6),
    ("Juli", 7),
    ("August", 8),
    ("September", 9),
    ("Oktober", 10),
    ("November", 11),
    ("Dezember", 12),
];

/// Listing number as printed on the board, or the explicit unknown marker.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Identifier {
    Known(String),
    Unknown,
}

impl Identifier {
    pub fn is_unknown(&self) -> bool {
        matches!(self, Identifier::Unknown)
    }
}

impl fmt::Display for Identifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Identifier::Known(value) => f.write_str(value),
            Identifier::Unknown => f.write_str(UNKNOWN),
        }
    }
}

/// One card of the listing page as handed over by the extractor, before any parsing.
///
/// `None` means the element was missing from the card. The employer is optional because older
/// page layouts only carried four fields.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RawListing {
    pub identifier_text: Option<String>,
    pub date_text: Option<String>,
    #[serde(default)]
    pub employer_text: Option<String>,
    pub title_text: Option<String>,
    pub url_text: Option<String>,
}

/// Normalized posting.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ListingRecord {
    pub identifier: Identifier,
    pub posted_on: Option<NaiveDate>,
    pub employer: Option<String>,
    pub title: Option<String>,
    pub url: Option<String>,
}

impl ListingRecord {
    pub fn from_raw(raw: &RawListing) -> Self {
        Self {
            identifier: raw
                .identifier_text
                .as_deref()
                .map(parse_identifier)
                .unwrap_or(Identifier::Unknown),
            posted_on: raw.date_text.as_deref().and_then(parse_date),
            employer: raw.employer_text.as_deref().and_then(parse_text),
            title: raw.title_text.as_deref().and_then(parse_text),
            url: raw.url_text.as_deref().and_then(parse_url),
        }
    }

    /// Primary key of the record in the persisted set.
    ///
    /// Known identifiers key themselves. Unknown identifiers get a UUIDv5 derived from the
    /// remaining fields: stable across runs for the same posting, distinct for distinct postings.
    pub fn storage_key(&self) -> String {
        match &self.identifier {
            Identifier::Known(value) => value.clone(),
            Identifier::Unknown => {
                let fingerprint = format!(
                    "{}|{}|{}|{}",
                    self.posted_on.map(|d| d.to_string()).unwrap_or_default(),
                    self.employer.as_deref().unwrap_or_default(),
                    self.title.as_deref().unwrap_or_default(),
                    self.url.as_deref().unwrap_or_default(),
                );
                format!(
                    "{SURROGATE_PREFIX}{}",
                    Uuid::new_v5(&Uuid::NAMESPACE_URL, fingerprint.as_bytes())
                )
            }
        }
    }

    pub fn has_unknown_fields(&self) -> bool {
        self.identifier.is_unknown()
            || self.posted_on.is_none()
            || self.employer.is_none()
            || self.title.is_none()
            || self.url.is_none()
    }
}

pub fn is_surrogate_key(key: &str) -> bool {
    key.starts_with(SURROGATE_PREFIX)
}

/// Outcome of reconciling one snapshot against the persisted set.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReconciliationResult {
    pub new_records: Vec<ListingRecord>,
    pub new_employers: BTreeSet<String>,
}

/// Extract the number following the `J-` label, e.g. `"Nr. J-502200"` -> `502200`.
pub fn parse_identifier(raw: &str) -> Identifier {
    JOB_NUMBER
        .captures(raw)
        .and_then(|caps| caps.get(1))
        .map(|m| Identifier::Known(m.as_str().to_string()))
        .unwrap_or(Identifier::Unknown)
}

/// Parse a German long-form date such as `"5. Oktober 2025"`.
pub fn parse_date(raw: &str) -> Option<NaiveDate> {
    let caps = GERMAN_DATE.captures(raw.trim())?;
    let day: u32 = caps.get(1)?.as_str().parse().ok()?;
    let month = german_month_number(caps.get(2)?.as_str())?;
    let year: i32 = caps.get(3)?.as_str().parse().ok()?;
    NaiveDate::from_ymd_opt(year, month, day)
}

pub fn german_month_number(name: &str) -> Option<u32> {
    GERMAN_MONTHS
        .iter()
        .find(|(month, _)| *month == name)
        .map(|(_, number)| *number)
}

/// Collapse whitespace; empty text and sentinels become `None`.
pub fn parse_text(raw: &str) -> Option<String> {
    let collapsed = raw.split_whitespace().collect::<Vec<_>>().join(" ");
    if collapsed.is_empty() || is_sentinel(&collapsed) {
        None
    } else {
        Some(collapsed)
    }
}

pub fn parse_url(raw: &str) -> Option<String> {
    let trimmed = raw.trim();
    if trimmed.is_empty() || is_sentinel(trimmed) {
        None
    } else {
        Some(trimmed.to_string())
    }
}

pub fn is_sentinel(value: &str) -> bool {
    value == UNKNOWN || value == LEGACY_UNKNOWN
}
