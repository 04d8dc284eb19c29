//! Data models shared by the crawl pipeline.
//!
//! - [`ListingReference`]: one paginated table of contents to walk
//! - [`DetailReference`]: one item found on a listing page
//! - [`PageContent`]: the rendered HTML of a page plus its final URL
//! - [`ArticleRecord`]: the fixed-schema output row
//!
//! Records never omit a column. Anything the parser could not find is stored
//! as [`NOT_AVAILABLE`] so every run produces the same header.

use serde::{Deserialize, Serialize};

use crate::error::{CrawlError, CrawlResult};

/// Sentinel stored for fields whose fallback chain produced nothing.
pub const NOT_AVAILABLE: &str = "N/A";

/// One listing unit (volume, issue or archive month) with a paginated table of contents.
///
/// `url_template` may contain a `{page}` placeholder. Templates without one
/// describe single-page listings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ListingReference {
    /// Human readable label used in logs, e.g. `vol 62 / issue 8`.
    pub label: String,
    pub url_template: String,
    pub volume: Option<String>,
    pub issue: Option<String>,
    /// Publication date known from the listing itself (e.g. derived from the volume number).
    pub date_hint: Option<String>,
    /// Page count known up front. `None` means it is discovered from page 1.
    pub fixed_pages: Option<u32>,
}

impl ListingReference {
    pub fn single(label: impl Into<String>, url: impl Into<String>) -> Self {
        Self {
            label: label.into(),
            url_template: url.into(),
            volume: None,
            issue: None,
            date_hint: None,
            fixed_pages: Some(1),
        }
    }

    /// Render the URL of page `page` (1-based).
    pub fn page_url(&self, page: u32) -> String {
        self.url_template.replace("{page}", &page.to_string())
    }

    /// Whether the template can address more than one page at all.
    pub fn is_paginated(&self) -> bool {
        self.url_template.contains("{page}")
    }
}

/// An item discovered on a listing page.
///
/// `url` is `None` when the listing renders the item as a click handler
/// without an `href`; the orchestrator then re-opens `listing_url` and
/// clicks the element at `position`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DetailReference {
    pub url: Option<String>,
    pub position: usize,
    pub listing_url: String,
}

/// Rendered page as returned by the fetcher.
#[derive(Debug, Clone)]
pub struct PageContent {
    /// Final URL after redirects or client-side navigation.
    pub url: String,
    pub html: String,
}

/// The unit of output: one article or news item.
///
/// Column order follows field order and is stable across runs and targets.
/// `url` is the natural key; the checkpoint store drops later rows with a
/// URL it has already seen.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArticleRecord {
    pub volume: String,
    pub issue: String,
    pub date: String,
    pub title: String,
    pub authors: String,
    #[serde(rename = "abstract")]
    pub abstract_text: String,
    pub keywords: String,
    pub url: String,
}

/// Field values collected for a record before the URL is attached.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RecordFields {
    pub volume: Option<String>,
    pub issue: Option<String>,
    pub date: Option<String>,
    pub title: Option<String>,
    pub authors: Option<String>,
    pub abstract_text: Option<String>,
    pub keywords: Option<String>,
}

impl ArticleRecord {
    /// Build a record, replacing blank fields with [`NOT_AVAILABLE`].
    ///
    /// # Errors
    ///
    /// Returns [`CrawlError::Config`] when `url` is blank, since a record
    /// without its key can never be deduplicated or resumed.
    pub fn new(url: impl Into<String>, fields: RecordFields) -> CrawlResult<Self> {
        let url = url.into().trim().to_string();
        if url.is_empty() {
            return Err(CrawlError::Config(
                "article record requires a non-empty url".to_string(),
            ));
        }
        Ok(Self {
            volume: or_sentinel(fields.volume),
            issue: or_sentinel(fields.issue),
            date: or_sentinel(fields.date),
            title: or_sentinel(fields.title),
            authors: or_sentinel(fields.authors),
            abstract_text: or_sentinel(fields.abstract_text),
            keywords: or_sentinel(fields.keywords),
            url,
        })
    }
}

fn or_sentinel(value: Option<String>) -> String {
    match value {
        Some(v) if !v.trim().is_empty() => v.trim().to_string(),
        _ => NOT_AVAILABLE.to_string(),
    }
}
