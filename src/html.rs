//! Thin helpers over `scraper` shared by the link collector, the detail
//! parser and the HTTP transport.

use scraper::{ElementRef, Html, Selector};
use url::Url;

use crate::error::{CrawlError, CrawlResult};
use crate::utils::clean_text;

pub fn parse_selector(css: &str) -> CrawlResult<Selector> {
    Selector::parse(css).map_err(|e| CrawlError::Config(format!("invalid selector `{css}`: {e}")))
}

/// Whitespace-collapsed text content of an element.
pub fn element_text(el: &ElementRef<'_>) -> String {
    clean_text(&el.text().collect::<Vec<_>>().join(" "))
}

/// The `href` an element navigates to: its own, or that of its nearest `<a>` ancestor.
pub fn element_href<'a>(el: &ElementRef<'a>) -> Option<&'a str> {
    if let Some(href) = el.value().attr("href") {
        return non_empty(href);
    }
    el.ancestors()
        .filter_map(ElementRef::wrap)
        .find(|a| a.value().name() == "a")
        .and_then(|a| a.value().attr("href"))
        .and_then(non_empty)
}

fn non_empty(href: &str) -> Option<&str> {
    let trimmed = href.trim();
    if trimmed.is_empty() || trimmed.starts_with("javascript:") {
        None
    } else {
        Some(trimmed)
    }
}

/// Resolve `href` against `base`, falling back to `href` itself when `base` is unparsable.
pub fn absolutize(base: &str, href: &str) -> Option<String> {
    match Url::parse(base) {
        Ok(base) => base.join(href).ok().map(|u| u.to_string()),
        Err(_) => Url::parse(href).ok().map(|u| u.to_string()),
    }
}

/// Whether `css` matches at least one element of `html`.
pub fn has_match(html: &str, css: &str) -> CrawlResult<bool> {
    let selector = parse_selector(css)?;
    let document = Html::parse_document(html);
    Ok(document.select(&selector).next().is_some())
}
