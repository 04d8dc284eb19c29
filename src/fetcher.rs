//! Page fetching with pacing, and per-kind backoff for callers that retry.
//!
//! [`fetch`] performs exactly **one** navigation attempt. It never retries;
//! instead it reports whether the failure was a `Timeout` or a transport
//! error so the caller can pick a backoff with [`Backoff::delay_for`].
//! [`fetch_ready`] is [`fetch`] followed by a wait for a ready selector and a
//! scroll to the bottom of the page.
//!
//! After every successful navigation a randomized settle delay is injected.
//! It paces requests like a human reader would and gives script-rendered
//! content time to appear.

use std::time::{Duration, Instant};

use tracing::{debug, instrument, warn};

use crate::config::{CrawlConfig, DelayRange};
use crate::error::{CrawlResult, ErrorKind};
use crate::models::PageContent;
use crate::transport::Session;
use crate::utils::{jittered, pause};

/// Timing options for a single fetch.
#[derive(Debug, Clone, Copy)]
pub struct FetchOptions {
    pub load_timeout: Duration,
    pub wait_timeout: Duration,
    pub settle: DelayRange,
}

impl FetchOptions {
    pub fn from_config(config: &CrawlConfig) -> Self {
        Self {
            load_timeout: config.page_load_timeout(),
            wait_timeout: config.element_wait_timeout(),
            settle: config.politeness_delay,
        }
    }
}

/// Navigate to `url` once and return the rendered page.
#[instrument(level = "debug", skip_all, fields(%url))]
pub async fn fetch<S: Session>(
    session: &mut S,
    url: &str,
    opts: &FetchOptions,
) -> CrawlResult<PageContent> {
    let t0 = Instant::now();
    session.navigate(url, opts.load_timeout).await.inspect_err(|e| {
        warn!(
            elapsed_ms = t0.elapsed().as_millis() as u64,
            kind = ?e.kind(),
            error = %e,
            "Navigation failed"
        );
    })?;
    pause(opts.settle).await;
    read_page(session).await
}

/// Like [`fetch`], then wait for `ready` to appear and scroll to the bottom
/// so lazily rendered sections are in the returned HTML.
#[instrument(level = "debug", skip_all, fields(%url))]
pub async fn fetch_ready<S: Session>(
    session: &mut S,
    url: &str,
    ready: Option<&str>,
    opts: &FetchOptions,
) -> CrawlResult<PageContent> {
    fetch(session, url, opts).await?;
    render_lazy(session, ready, opts).await
}

/// Finish loading the current document after a click: settle, wait for `ready`, scroll, read.
pub async fn settle_ready<S: Session>(
    session: &mut S,
    ready: Option<&str>,
    opts: &FetchOptions,
) -> CrawlResult<PageContent> {
    pause(opts.settle).await;
    render_lazy(session, ready, opts).await
}

async fn render_lazy<S: Session>(
    session: &mut S,
    ready: Option<&str>,
    opts: &FetchOptions,
) -> CrawlResult<PageContent> {
    if let Some(selector) = ready {
        session.wait_for(selector, opts.wait_timeout).await?;
    }
    session.scroll_to_bottom().await?;
    read_page(session).await
}

async fn read_page<S: Session>(session: &mut S) -> CrawlResult<PageContent> {
    let url = session.current_url().await?;
    let html = session.content().await?;
    debug!(%url, bytes = html.len(), "Page content read");
    Ok(PageContent { url, html })
}

/// Randomized backoff between retries, chosen by failure kind.
///
/// Timeouts usually clear quickly; transport and stale-element failures
/// get the longer range.
#[derive(Debug, Clone, Copy)]
pub struct Backoff {
    pub timeout: DelayRange,
    pub transport: DelayRange,
}

impl Backoff {
    pub fn from_config(config: &CrawlConfig) -> Self {
        Self {
            timeout: config.backoff_timeout,
            transport: config.backoff_transport,
        }
    }

    pub fn range_for(&self, kind: ErrorKind) -> DelayRange {
        match kind {
            ErrorKind::Timeout => self.timeout,
            _ => self.transport,
        }
    }

    pub fn delay_for(&self, kind: ErrorKind) -> Duration {
        jittered(self.range_for(kind))
    }
}
