//! Link collection from paginated tables of contents.
//!
//! A listing unit is walked page by page:
//!
//! 1. Page 1 is fetched and the page count is taken from the listing
//!    reference, or discovered from a `Page X of N` marker, or from the
//!    highest `aria-label="Page N"` pagination control, or assumed to be 1.
//! 2. Every page is scanned for item elements. Each item yields a
//!    [`DetailReference`]; items whose link is a script handler rather than
//!    an anchor are kept as position-only placeholders.
//! 3. The first page with no item elements at all ends the walk for the
//!    unit. A page whose items were all filtered out is skipped.

use std::collections::HashSet;

use once_cell::sync::Lazy;
use regex::Regex;
use scraper::Html;
use tracing::{debug, info, instrument, warn};

use crate::error::{CrawlError, CrawlResult};
use crate::fetcher::{FetchOptions, fetch_ready};
use crate::html::{absolutize, element_href, element_text, parse_selector};
use crate::models::{DetailReference, ListingReference, PageContent};
use crate::transport::Session;

static PAGE_OF_TOTAL: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"[Pp]age\s+\d+\s+of\s+(\d+)").unwrap());
static PAGE_LABEL: Lazy<Regex> = Lazy::new(|| Regex::new(r"^Page\s+(\d+)$").unwrap());

/// Where an item's link lives relative to the matched item element.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HrefSource {
    /// The item's own `href`, or that of its nearest `<a>` ancestor.
    Element,
    /// The first descendant matching this selector.
    Descendant(String),
}

/// Keep only items whose sub-element text equals `text`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LabelFilter {
    pub selector: String,
    pub text: String,
}

/// How to find items on one listing page.
#[derive(Debug, Clone)]
pub struct LinkRules {
    /// Selector matching one element per listing item. Positions index into this match list.
    pub item: String,
    pub href_from: HrefSource,
    /// Keep only hrefs matching this pattern (tested on the raw and the absolute form).
    pub href_pattern: Option<Regex>,
    /// Pattern source with `{volume}` / `{issue}` slots, compiled per listing
    /// by [`LinkRules::for_listing`].
    pub href_template: Option<String>,
    pub require_label: Option<LabelFilter>,
    /// Keep items without a link as positional placeholders.
    pub keep_unlinked: bool,
    /// Selector to wait for before reading a listing page.
    pub ready: Option<String>,
}

impl LinkRules {
    pub fn new(item: impl Into<String>) -> Self {
        Self {
            item: item.into(),
            href_from: HrefSource::Element,
            href_pattern: None,
            href_template: None,
            require_label: None,
            keep_unlinked: false,
            ready: None,
        }
    }

    /// Rules specialised to `listing`, with the href template filled in.
    ///
    /// Slot values are regex-escaped; a listing without a volume or issue
    /// leaves the template's slot as `[^/]+`.
    pub fn for_listing(&self, listing: &ListingReference) -> CrawlResult<LinkRules> {
        let Some(template) = &self.href_template else {
            return Ok(self.clone());
        };
        let slot = |value: &Option<String>| {
            value
                .as_deref()
                .map(regex::escape)
                .unwrap_or_else(|| "[^/]+".to_string())
        };
        let source = template
            .replace("{volume}", &slot(&listing.volume))
            .replace("{issue}", &slot(&listing.issue));
        let pattern = Regex::new(&source)
            .map_err(|e| CrawlError::Config(format!("invalid href pattern {source:?}: {e}")))?;
        Ok(LinkRules {
            href_pattern: Some(pattern),
            ..self.clone()
        })
    }
}

/// Page count advertised by a listing page, defaulting to 1.
pub fn discover_total_pages(html: &str) -> u32 {
    let document = Html::parse_document(html);
    let text = document.root_element().text().collect::<Vec<_>>().join(" ");
    if let Some(total) = PAGE_OF_TOTAL
        .captures(&text)
        .and_then(|c| c[1].parse::<u32>().ok())
    {
        return total.max(1);
    }

    let Ok(labelled) = parse_selector("a[aria-label]") else {
        return 1;
    };
    document
        .select(&labelled)
        .filter_map(|a| a.value().attr("aria-label"))
        .filter_map(|label| {
            PAGE_LABEL
                .captures(label.trim())
                .and_then(|c| c[1].parse::<u32>().ok())
        })
        .max()
        .unwrap_or(1)
        .max(1)
}

/// Result of scanning one listing page.
#[derive(Debug, Default)]
pub struct PageLinks {
    /// Elements matching the item selector, before any filtering.
    pub items: usize,
    pub refs: Vec<DetailReference>,
}

/// Extract item references from one listing page, deduplicated by URL.
pub fn extract_links(html: &str, page_url: &str, rules: &LinkRules) -> CrawlResult<PageLinks> {
    let document = Html::parse_document(html);
    let item_sel = parse_selector(&rules.item)?;
    let descendant_sel = match &rules.href_from {
        HrefSource::Descendant(css) => Some(parse_selector(css)?),
        HrefSource::Element => None,
    };
    let label_sel = match &rules.require_label {
        Some(filter) => Some((parse_selector(&filter.selector)?, filter.text.as_str())),
        None => None,
    };

    let mut seen = HashSet::new();
    let mut refs = Vec::new();
    let mut items = 0;
    for (position, item) in document.select(&item_sel).enumerate() {
        items += 1;
        if let Some((sel, wanted)) = &label_sel {
            let matches = item
                .select(sel)
                .next()
                .map(|label| element_text(&label) == *wanted)
                .unwrap_or(false);
            if !matches {
                continue;
            }
        }

        let href = match &descendant_sel {
            Some(sel) => item.select(sel).next().and_then(|a| element_href(&a)),
            None => element_href(&item),
        };

        let Some(href) = href else {
            if rules.keep_unlinked {
                refs.push(DetailReference {
                    url: None,
                    position,
                    listing_url: page_url.to_string(),
                });
            }
            continue;
        };

        if href.contains("#comments") {
            continue;
        }
        let Some(absolute) = absolutize(page_url, href) else {
            debug!(%href, "Unresolvable href");
            continue;
        };
        if let Some(pattern) = &rules.href_pattern {
            if !pattern.is_match(href) && !pattern.is_match(&absolute) {
                continue;
            }
        }
        if seen.insert(absolute.clone()) {
            refs.push(DetailReference {
                url: Some(absolute),
                position,
                listing_url: page_url.to_string(),
            });
        }
    }
    Ok(PageLinks { items, refs })
}

/// Walk every page of `listing` and return its item references in page order.
///
/// `first_page` is page 1 when the caller has already loaded it. Fails only
/// when the first page cannot be loaded; a failure on a later page ends the
/// walk with what was collected so far.
#[instrument(level = "info", skip_all, fields(listing = %listing.label))]
pub async fn collect_listing_links<S: Session>(
    session: &mut S,
    listing: &ListingReference,
    rules: &LinkRules,
    opts: &FetchOptions,
    first_page: Option<PageContent>,
) -> CrawlResult<Vec<DetailReference>> {
    let first = match first_page {
        Some(page) => page,
        None => fetch_ready(session, &listing.page_url(1), rules.ready.as_deref(), opts).await?,
    };

    let total_pages = match listing.fixed_pages {
        Some(n) => n,
        None if listing.is_paginated() => discover_total_pages(&first.html),
        None => 1,
    };
    info!(total_pages, "Listing page count");

    let mut collected: Vec<DetailReference> = Vec::new();
    let mut seen: HashSet<String> = HashSet::new();
    let mut first = Some(first);

    for page in 1..=total_pages {
        let page_url = listing.page_url(page);
        let content = match first.take() {
            Some(content) => content,
            None => match fetch_ready(session, &page_url, rules.ready.as_deref(), opts).await {
                Ok(content) => content,
                Err(e) => {
                    warn!(page, url = %page_url, error = %e, "Listing page failed; ending pagination");
                    break;
                }
            },
        };

        let links = extract_links(&content.html, &page_url, rules)?;
        if links.items == 0 {
            info!(page, "No items on page; ending pagination");
            break;
        }
        if links.refs.is_empty() {
            debug!(page, items = links.items, "Every item on page was filtered out");
            continue;
        }

        let before = collected.len();
        for link in links.refs {
            let duplicate = link
                .url
                .as_ref()
                .is_some_and(|url| !seen.insert(url.clone()));
            if !duplicate {
                collected.push(link);
            }
        }
        debug!(page, added = collected.len() - before, "Collected listing page");
    }

    info!(count = collected.len(), "Collected listing links");
    Ok(collected)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::CrawlConfig;
    use crate::transport::SessionFactory;
    use crate::transport::fake::{FakeFactory, FakeWeb};

    const SCIENCEDIRECT_TOC: &str = r#"
        <ol>
          <li><a href="/science/article/pii/S1"><span class="js-article-title text-l">First</span></a></li>
          <li><span class="js-article-title text-l">Click only</span></li>
          <li><a href="/science/article/pii/S1"><span class="js-article-title text-l">Duplicate</span></a></li>
        </ol>"#;

    #[test]
    fn test_discover_total_pages_from_text() {
        let html = "<div><p>Showing results</p><span>Page 1 of 7</span></div>";
        assert_eq!(discover_total_pages(html), 7);
    }

    #[test]
    fn test_discover_total_pages_from_aria_labels() {
        let html = r#"<nav>
            <a aria-label="Page 1" href="/1">1</a>
            <a aria-label="Page 4" href="/4">4</a>
            <a aria-label="Page 2" href="/2">2</a>
            <a aria-label="Next page" href="/2">next</a>
        </nav>"#;
        assert_eq!(discover_total_pages(html), 4);
    }

    #[test]
    fn test_discover_total_pages_defaults_to_one() {
        assert_eq!(discover_total_pages("<p>nothing here</p>"), 1);
        assert_eq!(discover_total_pages("<p>Page 1 of 0</p>"), 1);
    }

    #[test]
    fn test_extract_links_keeps_unlinked_placeholders() {
        let mut rules = LinkRules::new("span.js-article-title.text-l");
        rules.keep_unlinked = true;
        let refs = extract_links(
            SCIENCEDIRECT_TOC,
            "https://www.sciencedirect.com/journal/x/vol/1/suppl/C",
            &rules,
        )
        .unwrap()
        .refs;

        assert_eq!(refs.len(), 2);
        assert_eq!(
            refs[0].url.as_deref(),
            Some("https://www.sciencedirect.com/science/article/pii/S1")
        );
        assert_eq!(refs[1].url, None);
        assert_eq!(refs[1].position, 1);
    }

    #[test]
    fn test_extract_links_drops_unlinked_by_default() {
        let rules = LinkRules::new("span.js-article-title.text-l");
        let page = extract_links(SCIENCEDIRECT_TOC, "https://www.sciencedirect.com/", &rules).unwrap();
        assert_eq!(page.items, 3);
        assert_eq!(page.refs.len(), 1);
    }

    #[test]
    fn test_extract_links_pattern_and_comments() {
        let html = r#"
            <a href="/news/801/ai-chips">story</a>
            <a href="/news/801/ai-chips#comments">comments</a>
            <a href="/about">about</a>
            <a href="https://www.theverge.com/2025/9/1/robots">dated</a>"#;
        let mut rules = LinkRules::new("a[href]");
        rules.href_pattern = Some(
            Regex::new(r"^(/|https?://www\.theverge\.com/)(\d{4}/\d{1,2}/\d{1,2}/|news/)").unwrap(),
        );
        let refs = extract_links(html, "https://www.theverge.com/archives/ai/2025/9/1", &rules)
            .unwrap()
            .refs;
        let urls: Vec<_> = refs.iter().filter_map(|r| r.url.clone()).collect();
        assert_eq!(
            urls,
            vec![
                "https://www.theverge.com/news/801/ai-chips".to_string(),
                "https://www.theverge.com/2025/9/1/robots".to_string(),
            ]
        );
    }

    #[test]
    fn test_extract_links_label_filter() {
        let html = r#"<ul class="posts">
            <li><a class="label" href="/c/ai">AI</a><h3><a href="https://tc.example/a">A</a></h3></li>
            <li><a class="label" href="/c/apps">Apps</a><h3><a href="https://tc.example/b">B</a></h3></li>
        </ul>"#;
        let mut rules = LinkRules::new("ul.posts > li");
        rules.href_from = HrefSource::Descendant("h3 > a".into());
        rules.require_label = Some(LabelFilter {
            selector: "a.label".into(),
            text: "AI".into(),
        });
        let page = extract_links(html, "https://tc.example/category/ai/page/1/", &rules).unwrap();
        assert_eq!(page.items, 2);
        assert_eq!(page.refs.len(), 1);
        assert_eq!(page.refs[0].url.as_deref(), Some("https://tc.example/a"));
    }

    #[tokio::test]
    async fn test_pagination_stops_at_first_empty_page() {
        let base = "https://archive.example/ai/2025/9";
        let mut web = FakeWeb::default();
        web.page(
            &format!("{base}/1"),
            r#"<p>Page 1 of 5</p><a href="/news/1">one</a><a href="/news/2">two</a>"#,
        )
        .page(&format!("{base}/2"), "<p>Page 2 of 5</p><p>nothing left</p>")
        .page(&format!("{base}/3"), r#"<a href="/news/3">three</a>"#);
        let factory = FakeFactory::new(web);
        let mut session = factory.create().await.unwrap();

        let listing = ListingReference {
            label: "2025-09".into(),
            url_template: format!("{base}/{{page}}"),
            volume: None,
            issue: None,
            date_hint: None,
            fixed_pages: None,
        };
        let mut rules = LinkRules::new("a[href]");
        rules.href_pattern = Some(Regex::new(r"/news/").unwrap());
        let opts = FetchOptions::from_config(&CrawlConfig::instant());

        let refs = collect_listing_links(&mut session, &listing, &rules, &opts, None)
            .await
            .unwrap();

        assert_eq!(refs.len(), 2);
        let web = factory.web.borrow();
        assert_eq!(web.visits(&format!("{base}/2")), 1);
        assert_eq!(web.visits(&format!("{base}/3")), 0);
    }

    #[tokio::test]
    async fn test_filtered_out_page_does_not_end_pagination() {
        let base = "https://tc.example/category/ai/page";
        let mut web = FakeWeb::default();
        web.page(
            &format!("{base}/1/"),
            r#"<ul class="posts"><li><a class="label">Apps</a><h3><a href="/apps">A</a></h3></li></ul>"#,
        )
        .page(
            &format!("{base}/2/"),
            r#"<ul class="posts"><li><a class="label">AI</a><h3><a href="/chips">C</a></h3></li></ul>"#,
        );
        let factory = FakeFactory::new(web);
        let mut session = factory.create().await.unwrap();

        let listing = ListingReference {
            label: "pages".into(),
            url_template: format!("{base}/{{page}}/"),
            volume: None,
            issue: None,
            date_hint: None,
            fixed_pages: Some(2),
        };
        let mut rules = LinkRules::new("ul.posts > li");
        rules.href_from = HrefSource::Descendant("h3 > a".into());
        rules.require_label = Some(LabelFilter {
            selector: "a.label".into(),
            text: "AI".into(),
        });
        let opts = FetchOptions::from_config(&CrawlConfig::instant());

        let refs = collect_listing_links(&mut session, &listing, &rules, &opts, None)
            .await
            .unwrap();

        assert_eq!(factory.web.borrow().visits(&format!("{base}/2/")), 1);
        assert_eq!(refs.len(), 1);
        assert_eq!(refs[0].url.as_deref(), Some("https://tc.example/chips"));
    }

    #[tokio::test]
    async fn test_preloaded_first_page_is_not_fetched_again() {
        let url = "https://toc.example/single";
        let mut web = FakeWeb::default();
        web.page(url, r#"<a href="/a">a</a>"#);
        let factory = FakeFactory::new(web);
        let mut session = factory.create().await.unwrap();
        let opts = FetchOptions::from_config(&CrawlConfig::instant());
        let first = fetch_ready(&mut session, url, None, &opts).await.unwrap();

        let listing = ListingReference::single("single", url);
        let refs = collect_listing_links(&mut session, &listing, &LinkRules::new("a[href]"), &opts, Some(first))
            .await
            .unwrap();

        assert_eq!(refs.len(), 1);
        assert_eq!(factory.web.borrow().visits(url), 1);
    }

    #[tokio::test]
    async fn test_duplicates_across_pages_are_dropped() {
        let base = "https://toc.example/cat/page";
        let mut web = FakeWeb::default();
        web.page(&format!("{base}/1"), r#"<a href="/a">a</a><a href="/b">b</a>"#)
            .page(&format!("{base}/2"), r#"<a href="/b">b</a><a href="/c">c</a>"#);
        let factory = FakeFactory::new(web);
        let mut session = factory.create().await.unwrap();

        let listing = ListingReference {
            label: "pages".into(),
            url_template: format!("{base}/{{page}}"),
            volume: None,
            issue: None,
            date_hint: None,
            fixed_pages: Some(2),
        };
        let opts = FetchOptions::from_config(&CrawlConfig::instant());
        let refs = collect_listing_links(&mut session, &listing, &LinkRules::new("a[href]"), &opts, None)
            .await
            .unwrap();
        let urls: Vec<_> = refs.iter().filter_map(|r| r.url.as_deref()).collect();
        assert_eq!(
            urls,
            vec!["https://toc.example/a", "https://toc.example/b", "https://toc.example/c"]
        );
        assert_eq!(refs[2].listing_url, format!("{base}/2"));
    }

    #[test]
    fn test_href_template_is_filled_per_listing() {
        let mut rules = LinkRules::new("a[href]");
        rules.href_template = Some(r"/misq/vol{volume}/iss{issue}/\d+/?$".to_string());
        let mut listing = ListingReference::single("vol 47 / iss 3", "https://aisel.aisnet.org/misq/vol47/iss3/");
        listing.volume = Some("47".into());
        listing.issue = Some("3".into());

        let rules = rules.for_listing(&listing).unwrap();
        let html = r#"
            <a href="/misq/vol47/iss3/5/">article</a>
            <a href="/misq/vol47/iss4/1/">next issue</a>
            <a href="/misq/vol47/iss3/">issue home</a>"#;
        let refs = extract_links(html, &listing.page_url(1), &rules).unwrap().refs;
        assert_eq!(refs.len(), 1);
        assert_eq!(
            refs[0].url.as_deref(),
            Some("https://aisel.aisnet.org/misq/vol47/iss3/5/")
        );
    }
}
