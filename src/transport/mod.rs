//! Fetching sessions.
//!
//! The crawl core never talks to a browser or HTTP client directly; it drives
//! a [`Session`] created by a [`SessionFactory`]. Two transports exist:
//!
//! | Transport | Module | Used for |
//! |-----------|--------|----------|
//! | HTTP | [`http`] | static archives and tables of contents |
//! | Browser | [`browser`] | script-rendered listings, click-only items |
//!
//! A session may become unusable at any time (crashed driver, dropped
//! connection). Callers borrow it for a single operation and hand failures
//! to [`crate::recovery::SessionManager`], which owns it.

use std::time::Duration;

use crate::config::DelayRange;
use crate::error::CrawlResult;

pub mod browser;
#[cfg(test)]
pub mod fake;
pub mod http;

/// One live fetching session.
pub trait Session {
    /// Navigate to `url`, failing with `Timeout` once `timeout` elapses.
    async fn navigate(&mut self, url: &str, timeout: Duration) -> CrawlResult<()>;

    /// URL of the current document, after redirects or client-side navigation.
    async fn current_url(&mut self) -> CrawlResult<String>;

    /// Rendered HTML of the current document.
    async fn content(&mut self) -> CrawlResult<String>;

    /// Wait until `selector` matches at least one element.
    async fn wait_for(&mut self, selector: &str, timeout: Duration) -> CrawlResult<()>;

    /// Scroll the `index`-th match of `selector` into view, pause, click it and
    /// wait for the resulting navigation.
    ///
    /// Fails with `StaleReference` when the element is no longer present.
    async fn click_nth(
        &mut self,
        selector: &str,
        index: usize,
        pause: DelayRange,
        timeout: Duration,
    ) -> CrawlResult<()>;

    /// Scroll to the end of the document so lazily rendered sections load.
    async fn scroll_to_bottom(&mut self) -> CrawlResult<()>;

    /// Click a cookie-consent button if one appears. Returns whether it did.
    async fn dismiss_consent(&mut self, selector: &str) -> CrawlResult<bool>;

    async fn close(self) -> CrawlResult<()>
    where
        Self: Sized;
}

/// Creates sessions that all share one configuration.
pub trait SessionFactory {
    type Session: Session;

    async fn create(&self) -> CrawlResult<Self::Session>;
}
