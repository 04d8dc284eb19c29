//! Detail-page parsing with ordered fallback chains.
//!
//! Each field is described by a list of extraction strategies that are
//! tried in order. **The first strategy that yields a non-empty value wins.**
//! When every strategy comes back empty the field stays `None`, and the
//! record builder stores the `N/A` sentinel for it.
//!
//! ```ignore
//! let abstract_chain = FieldChain(vec![
//!     Extract::Text("div.abstract.author"),
//!     Extract::Text("div[id^='sp']"),
//!     Extract::JoinedText { selector: "article p", sep: " ", limit: Some(5) },
//! ]);
//! ```
//!
//! Post-processing is field specific: the abstract loses a leading
//! `Abstract` label, keywords are deduplicated case-insensitively in
//! first-seen order, and dates go through [`normalize_date`].

use chrono::{DateTime, NaiveDate, NaiveDateTime};
use itertools::Itertools;
use scraper::{ElementRef, Html};
use serde_json::Value;
use tracing::debug;

use crate::html::{element_text, parse_selector};
use crate::utils::clean_text;

const ARTICLE_TYPES: &[&str] = &[
    "article",
    "newsarticle",
    "reportagenewsarticle",
    "scholarlyarticle",
    "blogposting",
];

/// Field of the page's JSON-LD article object.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LdField {
    Headline,
    Description,
    DatePublished,
}

impl LdField {
    fn key(self) -> &'static str {
        match self {
            LdField::Headline => "headline",
            LdField::Description => "description",
            LdField::DatePublished => "datePublished",
        }
    }
}

/// One strategy for a single-valued field.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Extract {
    /// Text of the first match.
    Text(&'static str),
    /// Non-empty texts of the matches (at most `limit`), joined with `sep`.
    JoinedText {
        selector: &'static str,
        sep: &'static str,
        limit: Option<usize>,
    },
    /// An attribute of the first match, e.g. a `<meta content>`.
    Attr {
        selector: &'static str,
        attr: &'static str,
    },
    JsonLd(LdField),
    /// First `next` element after an `h2`/`h3` whose text contains `heading`.
    AfterHeading {
        heading: &'static str,
        next: &'static str,
    },
}

/// One strategy for a list-valued field.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ListExtract {
    /// Text of every match.
    Each(&'static str),
    /// An attribute of the first match, split on `,` and `;`.
    SplitAttr {
        selector: &'static str,
        attr: &'static str,
    },
    /// Text of the first match, split on `,` and `;`.
    SplitText(&'static str),
    JsonLdKeywords,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FieldChain(pub Vec<Extract>);

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ListChain(pub Vec<ListExtract>);

/// Extraction rules for every field of a detail page.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DetailRules {
    pub title: FieldChain,
    pub authors: ListChain,
    pub abstract_text: FieldChain,
    pub keywords: ListChain,
    pub date: FieldChain,
}

/// Fields extracted from one detail page. `None` means the whole chain missed.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ParsedDetail {
    pub title: Option<String>,
    pub authors: Option<String>,
    pub abstract_text: Option<String>,
    pub keywords: Option<String>,
    pub date: Option<String>,
}

/// Parsed document plus its JSON-LD article object, looked up once.
struct PageView {
    document: Html,
    ld: Option<Value>,
}

impl PageView {
    fn new(html: &str) -> Self {
        let document = Html::parse_document(html);
        let ld = find_ld_article(&document);
        Self { document, ld }
    }

    fn ld_str(&self, key: &str) -> Option<String> {
        self.ld
            .as_ref()
            .and_then(|ld| ld.get(key))
            .and_then(Value::as_str)
            .map(clean_text)
    }
}

impl FieldChain {
    fn resolve(&self, page: &PageView) -> Option<String> {
        self.0
            .iter()
            .find_map(|strategy| run_extract(strategy, page).filter(|v| !v.is_empty()))
    }
}

impl ListChain {
    fn resolve(&self, page: &PageView) -> Vec<String> {
        self.0
            .iter()
            .map(|strategy| run_list_extract(strategy, page))
            .find(|items| !items.is_empty())
            .unwrap_or_default()
    }
}

/// Parse a detail page with `rules`.
pub fn parse_detail(html: &str, rules: &DetailRules) -> ParsedDetail {
    let page = PageView::new(html);

    let title = rules.title.resolve(&page);
    let abstract_text = rules
        .abstract_text
        .resolve(&page)
        .map(|a| strip_abstract_label(&a))
        .filter(|a| !a.is_empty());
    let authors = Some(rules.authors.resolve(&page).join(", ")).filter(|a| !a.is_empty());
    let keywords = Some(dedup_keywords(rules.keywords.resolve(&page)).join(", "))
        .filter(|k| !k.is_empty());
    let date = rules.date.resolve(&page).map(|d| normalize_date(&d));

    if title.is_none() {
        debug!("Title chain yielded nothing");
    }
    ParsedDetail {
        title,
        authors,
        abstract_text,
        keywords,
        date,
    }
}

fn run_extract(strategy: &Extract, page: &PageView) -> Option<String> {
    let doc = &page.document;
    match strategy {
        Extract::Text(css) => {
            let sel = selector_or_skip(css)?;
            doc.select(&sel).next().map(|el| element_text(&el))
        }
        Extract::JoinedText {
            selector,
            sep,
            limit,
        } => {
            let sel = selector_or_skip(selector)?;
            let texts = doc
                .select(&sel)
                .map(|el| element_text(&el))
                .filter(|t| !t.is_empty())
                .take(limit.unwrap_or(usize::MAX))
                .collect::<Vec<_>>();
            Some(texts.join(*sep))
        }
        Extract::Attr { selector, attr } => {
            let sel = selector_or_skip(selector)?;
            doc.select(&sel)
                .find_map(|el| el.value().attr(attr))
                .map(clean_text)
        }
        Extract::JsonLd(field) => page.ld_str(field.key()),
        Extract::AfterHeading { heading, next } => {
            let next_sel = selector_or_skip(next)?;
            let needle = heading.to_lowercase();
            let mut past_heading = false;
            for el in doc.root_element().descendants().filter_map(ElementRef::wrap) {
                let name = el.value().name();
                if !past_heading {
                    if (name == "h2" || name == "h3")
                        && element_text(&el).to_lowercase().contains(&needle)
                    {
                        past_heading = true;
                    }
                    continue;
                }
                if next_sel.matches(&el) {
                    return Some(element_text(&el));
                }
            }
            None
        }
    }
}

fn run_list_extract(strategy: &ListExtract, page: &PageView) -> Vec<String> {
    let doc = &page.document;
    let items = match strategy {
        ListExtract::Each(css) => match selector_or_skip(css) {
            Some(sel) => doc.select(&sel).map(|el| element_text(&el)).collect(),
            None => Vec::new(),
        },
        ListExtract::SplitAttr { selector, attr } => selector_or_skip(selector)
            .and_then(|sel| {
                doc.select(&sel)
                    .find_map(|el| el.value().attr(attr))
                    .map(split_list)
            })
            .unwrap_or_default(),
        ListExtract::SplitText(css) => selector_or_skip(css)
            .and_then(|sel| doc.select(&sel).next().map(|el| split_list(&element_text(&el))))
            .unwrap_or_default(),
        ListExtract::JsonLdKeywords => match page.ld.as_ref().and_then(|ld| ld.get("keywords")) {
            Some(Value::Array(items)) => items
                .iter()
                .filter_map(|v| match v {
                    Value::String(s) => Some(clean_text(s)),
                    Value::Null => None,
                    other => Some(other.to_string()),
                })
                .collect(),
            Some(Value::String(s)) => split_list(s),
            _ => Vec::new(),
        },
    };
    items.into_iter().filter(|s| !s.is_empty()).collect()
}

fn selector_or_skip(css: &str) -> Option<scraper::Selector> {
    match parse_selector(css) {
        Ok(sel) => Some(sel),
        Err(e) => {
            debug!(error = %e, "Skipping strategy with invalid selector");
            None
        }
    }
}

fn split_list(raw: &str) -> Vec<String> {
    raw.split([',', ';'])
        .map(clean_text)
        .filter(|s| !s.is_empty())
        .collect()
}

/// First JSON-LD object on the page whose `@type` is an article type.
fn find_ld_article(document: &Html) -> Option<Value> {
    let sel = parse_selector(r#"script[type="application/ld+json"]"#).ok()?;
    for script in document.select(&sel) {
        let raw = script.text().collect::<String>();
        let Ok(payload) = serde_json::from_str::<Value>(&raw) else {
            continue;
        };
        let candidates = match payload {
            Value::Array(items) => items,
            Value::Object(ref map) if map.contains_key("@graph") => match map.get("@graph") {
                Some(Value::Array(items)) => items.clone(),
                _ => Vec::new(),
            },
            obj @ Value::Object(_) => vec![obj],
            _ => continue,
        };
        if let Some(article) = candidates.into_iter().find(is_article) {
            return Some(article);
        }
    }
    None
}

fn is_article(item: &Value) -> bool {
    let types: Vec<String> = match item.get("@type").or_else(|| item.get("type")) {
        Some(Value::String(t)) => vec![t.to_lowercase()],
        Some(Value::Array(ts)) => ts
            .iter()
            .filter_map(Value::as_str)
            .map(str::to_lowercase)
            .collect(),
        _ => Vec::new(),
    };
    types.iter().any(|t| ARTICLE_TYPES.contains(&t.as_str()))
}

/// Remove a leading "Abstract" label left over from the page heading.
pub fn strip_abstract_label(text: &str) -> String {
    let trimmed = text.trim();
    match trimmed.get(..8) {
        Some(head) if head.eq_ignore_ascii_case("abstract") => trimmed[8..]
            .trim_start_matches([':', '.', ' ', '\u{a0}'])
            .trim()
            .to_string(),
        _ => trimmed.to_string(),
    }
}

/// Deduplicate case-insensitively, keeping the first spelling seen.
pub fn dedup_keywords(keywords: Vec<String>) -> Vec<String> {
    keywords
        .into_iter()
        .map(|k| clean_text(&k))
        .filter(|k| !k.is_empty())
        .unique_by(|k| k.to_lowercase())
        .collect()
}

const NAMED_DATETIME_FORMATS: &[&str] = &["%B %d, %Y at %I:%M %p", "%b %d, %Y at %I:%M %p"];
const ISO_DATE_FORMATS: &[&str] = &["%Y-%m-%d", "%Y/%m/%d"];
const NAMED_DATE_FORMATS: &[&str] = &["%B %d, %Y", "%d %B %Y", "%b %d, %Y", "%d %b %Y", "%B %Y"];

/// Normalize a date string to ISO-8601, or return it unchanged.
///
/// Tries RFC 3339 / ISO date forms first, then named-month forms. A value
/// that matches nothing is returned verbatim; dates are never dropped.
pub fn normalize_date(raw: &str) -> String {
    let s = raw.trim();

    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return dt.to_rfc3339();
    }
    if let Ok(dt) = NaiveDateTime::parse_from_str(s, "%Y-%m-%dT%H:%M:%S") {
        return dt.format("%Y-%m-%dT%H:%M:%S").to_string();
    }
    for fmt in ISO_DATE_FORMATS {
        if let Ok(d) = NaiveDate::parse_from_str(s, fmt) {
            return d.format("%Y-%m-%d").to_string();
        }
    }
    for fmt in NAMED_DATETIME_FORMATS {
        if let Ok(dt) = NaiveDateTime::parse_from_str(s, fmt) {
            return dt.format("%Y-%m-%dT%H:%M:%S").to_string();
        }
    }
    for fmt in NAMED_DATE_FORMATS {
        // "%B %Y" has no day; pin it to the first.
        let (candidate, fmt) = if *fmt == "%B %Y" {
            (format!("1 {s}"), "%d %B %Y")
        } else {
            (s.to_string(), *fmt)
        };
        if let Ok(d) = NaiveDate::parse_from_str(&candidate, fmt) {
            return d.format("%Y-%m-%d").to_string();
        }
    }
    raw.to_string()
}
