//! The crawl loop.
//!
//! ```text
//! for each listing unit           (volume, issue, archive month)
//!   collect links over its pages  (listing::collect_listing_links)
//!   for each detail reference
//!     fetch or click, parse, append to the checkpoint store
//!     every K appends: flush, recycle the session, re-open the listing
//! finally: close the session, flush the store
//! ```
//!
//! The crawl is strictly sequential: one session, one request at a time.
//! Transient failures are retried with per-kind backoff and escalate to a
//! session recovery when they repeat. A unit whose session cannot be
//! recovered is skipped. Cancellation stops the loop between steps, and the
//! store is flushed on every exit path.

use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

use crate::checkpoint::CheckpointStore;
use crate::config::CrawlConfig;
use crate::detail::{DetailRules, parse_detail};
use crate::error::{CrawlError, CrawlResult};
use crate::fetcher::{Backoff, FetchOptions, fetch_ready, settle_ready};
use crate::listing::{LinkRules, collect_listing_links};
use crate::models::{ArticleRecord, DetailReference, ListingReference, RecordFields};
use crate::recovery::{Escalation, SessionManager, escalation};
use crate::transport::{Session, SessionFactory};
use crate::utils::{pause_or_cancel, truncate_for_log};

/// Everything the crawl loop needs to know about one target site.
#[derive(Debug, Clone)]
pub struct CrawlPlan {
    pub links: LinkRules,
    /// Selector whose `position`-th match is clicked for items without an href.
    pub click_selector: String,
    /// Element that marks a detail page as rendered.
    pub detail_ready: Option<String>,
    pub detail: DetailRules,
    pub consent: Option<String>,
}

/// Outcome of a run.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct CrawlSummary {
    pub units: usize,
    pub units_abandoned: usize,
    pub appended: usize,
    pub skipped_existing: usize,
    pub failed_items: usize,
    pub interrupted: bool,
}

/// Per-run switches that come from the command line.
#[derive(Debug, Clone, Copy, Default)]
pub struct RunOptions {
    /// Skip references whose url is already in the store.
    pub resume: bool,
    /// Stop after this many newly appended records.
    pub limit: Option<usize>,
}

pub struct Crawler<F: SessionFactory> {
    config: CrawlConfig,
    plan: CrawlPlan,
    manager: SessionManager<F>,
    store: CheckpointStore,
    cancel: CancellationToken,
    opts: FetchOptions,
    backoff: Backoff,
    run: RunOptions,
    summary: CrawlSummary,
    since_checkpoint: usize,
    consecutive_failures: u32,
}

impl<F: SessionFactory> Crawler<F> {
    pub fn new(
        config: CrawlConfig,
        plan: CrawlPlan,
        factory: F,
        store: CheckpointStore,
        run: RunOptions,
        cancel: CancellationToken,
    ) -> Self {
        let opts = FetchOptions::from_config(&config);
        let backoff = Backoff::from_config(&config);
        let manager = SessionManager::new(
            factory,
            config.recovery_attempts,
            opts,
            backoff,
            cancel.clone(),
        )
        .with_consent(plan.consent.clone());
        Self {
            config,
            plan,
            manager,
            store,
            cancel,
            opts,
            backoff,
            run,
            summary: CrawlSummary::default(),
            since_checkpoint: 0,
            consecutive_failures: 0,
        }
    }

    #[cfg(test)]
    pub fn store(&self) -> &CheckpointStore {
        &self.store
    }

    #[cfg(test)]
    pub fn manager(&self) -> &SessionManager<F> {
        &self.manager
    }

    /// Crawl every unit in order and return what happened.
    ///
    /// Cancellation is not an error: the summary comes back with
    /// `interrupted` set after the store has been flushed. Fatal errors are
    /// returned after the same cleanup.
    #[instrument(level = "info", skip_all, fields(units = units.len()))]
    pub async fn run(&mut self, units: &[ListingReference]) -> CrawlResult<CrawlSummary> {
        let outcome = self.crawl_units(units).await;

        self.manager.shutdown().await;
        let flushed = self.flush_or_dump().await;

        match outcome {
            Ok(()) => {
                flushed?;
                info!(summary = ?self.summary, "Crawl finished");
                Ok(self.summary.clone())
            }
            Err(CrawlError::Interrupted) => {
                self.summary.interrupted = true;
                flushed?;
                warn!(summary = ?self.summary, "Crawl interrupted; partial results saved");
                Ok(self.summary.clone())
            }
            Err(e) => {
                error!(error = %e, "Crawl aborted");
                if let Err(flush_err) = flushed {
                    error!(error = %flush_err, "Final flush also failed");
                }
                Err(e)
            }
        }
    }

    async fn flush_or_dump(&mut self) -> CrawlResult<()> {
        match self.store.flush().await {
            Ok(()) => Ok(()),
            Err(e) => {
                error!(error = %e, "Checkpoint flush failed; dumping records");
                match self.store.dump_emergency().await {
                    Ok(path) => error!(path = %path.display(), "Records preserved in emergency dump"),
                    Err(dump_err) => error!(error = %dump_err, "Records could not be preserved"),
                }
                Err(e)
            }
        }
    }

    fn check_cancelled(&self) -> CrawlResult<()> {
        if self.cancel.is_cancelled() {
            Err(CrawlError::Interrupted)
        } else {
            Ok(())
        }
    }

    fn limit_reached(&self) -> bool {
        self.run
            .limit
            .is_some_and(|limit| self.summary.appended >= limit)
    }

    async fn crawl_units(&mut self, units: &[ListingReference]) -> CrawlResult<()> {
        for unit in units {
            self.check_cancelled()?;
            if self.limit_reached() {
                info!(limit = ?self.run.limit, "Record limit reached");
                break;
            }
            self.summary.units += 1;

            match self.crawl_unit(unit).await {
                Ok(()) => {}
                Err(CrawlError::Abandoned { listing, attempts }) => {
                    self.summary.units_abandoned += 1;
                    error!(unit = %unit.label, %listing, attempts, "Listing unit abandoned");
                }
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }

    #[instrument(level = "info", skip_all, fields(unit = %unit.label))]
    async fn crawl_unit(&mut self, unit: &ListingReference) -> CrawlResult<()> {
        let links = self.collect_links(unit).await?;
        if links.is_empty() {
            info!("Listing has no items");
            return Ok(());
        }

        for link in &links {
            self.check_cancelled()?;
            if self.limit_reached() {
                break;
            }
            if self.run.resume {
                if let Some(url) = link.url.as_deref() {
                    if self.store.contains(url) {
                        self.summary.skipped_existing += 1;
                        debug!(%url, "Already collected");
                        continue;
                    }
                }
            }

            if self.crawl_item(unit, link).await? {
                self.summary.appended += 1;
                self.since_checkpoint += 1;
                if self.since_checkpoint >= self.config.checkpoint_every {
                    self.checkpoint(&link.listing_url).await?;
                }
            }
        }

        if self.store.pending() > 0 {
            self.store.flush().await?;
        }
        info!(appended = self.summary.appended, total = self.store.len(), "Unit finished");
        Ok(())
    }

    /// Collect the unit's links, recovering the session once on failure.
    async fn collect_links(&mut self, unit: &ListingReference) -> CrawlResult<Vec<DetailReference>> {
        let ready = self.plan.links.ready.clone();
        match self.try_collect(unit).await {
            Ok(links) => Ok(links),
            Err(e) if e.is_transient() => {
                warn!(error = %e, "Listing collection failed; recovering session");
                self.manager
                    .recover(&unit.page_url(1), ready.as_deref())
                    .await?;
                self.try_collect(unit).await.map_err(|e| {
                    if e.is_transient() {
                        CrawlError::Abandoned {
                            listing: unit.page_url(1),
                            attempts: self.config.recovery_attempts,
                        }
                    } else {
                        e
                    }
                })
            }
            Err(e) => Err(e),
        }
    }

    async fn try_collect(&mut self, unit: &ListingReference) -> CrawlResult<Vec<DetailReference>> {
        let opts = self.opts;
        let rules = self.plan.links.for_listing(unit)?;
        let first = self
            .manager
            .open_listing(&unit.page_url(1), rules.ready.as_deref())
            .await?;
        let session = self.manager.session().await?;
        collect_listing_links(session, unit, &rules, &opts, Some(first)).await
    }

    /// Fetch one item with retries. Returns whether a new record was stored.
    async fn crawl_item(&mut self, unit: &ListingReference, link: &DetailReference) -> CrawlResult<bool> {
        let attempts = self.config.max_retries + 1;
        let ready = self.plan.links.ready.clone();

        for attempt in 1..=attempts {
            self.check_cancelled()?;
            let cancel = self.cancel.clone();
            let outcome = tokio::select! {
                biased;
                _ = cancel.cancelled() => Err(CrawlError::Interrupted),
                result = self.fetch_item(unit, link) => result,
            };

            match outcome {
                Ok(record) => {
                    self.consecutive_failures = 0;
                    let title = truncate_for_log(&record.title, 80);
                    let url = record.url.clone();
                    if self.store.push(record) {
                        info!(%url, %title, "Record stored");
                        return Ok(true);
                    }
                    self.summary.skipped_existing += 1;
                    debug!(%url, "Record already stored");
                    return Ok(false);
                }
                Err(e) if e.is_transient() => {
                    self.consecutive_failures += 1;
                    warn!(
                        attempt,
                        max = attempts,
                        position = link.position,
                        url = link.url.as_deref().unwrap_or("<click>"),
                        kind = ?e.kind(),
                        error = %e,
                        "Item fetch failed"
                    );
                    if attempt == attempts {
                        break;
                    }
                    pause_or_cancel(self.backoff.delay_for(e.kind()), &self.cancel).await?;

                    match escalation(&e, self.consecutive_failures, link.url.is_none()) {
                        Escalation::Retry => {}
                        Escalation::ReloadListing => {
                            // Placeholders re-open the listing on every attempt anyway.
                            if link.url.is_some() {
                                self.reopen_listing(&link.listing_url).await;
                            }
                        }
                        Escalation::Recover => {
                            self.manager
                                .recover(&link.listing_url, ready.as_deref())
                                .await?;
                            self.consecutive_failures = 0;
                        }
                    }
                }
                Err(e) => return Err(e),
            }
        }

        self.summary.failed_items += 1;
        warn!(
            position = link.position,
            url = link.url.as_deref().unwrap_or("<click>"),
            "Item skipped after retries"
        );
        Ok(false)
    }

    async fn fetch_item(&mut self, unit: &ListingReference, link: &DetailReference) -> CrawlResult<ArticleRecord> {
        let opts = self.opts;
        let click_pause = self.config.click_pause;
        let plan = &self.plan;
        let session = self.manager.session().await?;

        let page = match link.url.as_deref() {
            Some(url) => fetch_ready(session, url, plan.detail_ready.as_deref(), &opts).await?,
            None => {
                fetch_ready(session, &link.listing_url, plan.links.ready.as_deref(), &opts).await?;
                session
                    .click_nth(&plan.click_selector, link.position, click_pause, opts.load_timeout)
                    .await?;
                settle_ready(session, plan.detail_ready.as_deref(), &opts).await?
            }
        };

        let parsed = parse_detail(&page.html, &plan.detail);
        let url = link.url.clone().unwrap_or(page.url);
        ArticleRecord::new(
            url,
            RecordFields {
                volume: unit.volume.clone(),
                issue: unit.issue.clone(),
                date: parsed.date.or_else(|| unit.date_hint.clone()),
                title: parsed.title,
                authors: parsed.authors,
                abstract_text: parsed.abstract_text,
                keywords: parsed.keywords,
            },
        )
    }

    async fn reopen_listing(&mut self, listing_url: &str) {
        let ready = self.plan.links.ready.clone();
        if let Err(e) = self.manager.open_listing(listing_url, ready.as_deref()).await {
            warn!(url = %listing_url, error = %e, "Listing page did not reload");
        }
    }

    /// Flush, then start a fresh session on the same listing page.
    async fn checkpoint(&mut self, listing_url: &str) -> CrawlResult<()> {
        self.store.flush().await?;
        self.since_checkpoint = 0;
        self.manager.recycle().await;
        self.reopen_listing(listing_url).await;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::detail::{Extract, FieldChain};
    use crate::transport::fake::{FakeFactory, FakeWeb};
    use std::path::Path;

    const TOC: &str = "https://journal.example/vol/7/toc";
    const ITEM: &str = "li.article a, li.article span.title";

    fn toc_html(items: &[Option<&str>]) -> String {
        let lis = items
            .iter()
            .enumerate()
            .map(|(i, href)| match href {
                Some(h) => format!(r#"<li class="article"><a href="{h}">Item {i}</a></li>"#),
                None => format!(r#"<li class="article"><span class="title">Item {i}</span></li>"#),
            })
            .collect::<String>();
        format!("<ol>{lis}</ol>")
    }

    fn detail_html(title: &str) -> String {
        format!(r#"<h1 class="title">{title}</h1><div class="abstract">About {title}.</div>"#)
    }

    fn plan() -> CrawlPlan {
        let mut links = LinkRules::new(ITEM);
        links.keep_unlinked = true;
        CrawlPlan {
            links,
            click_selector: ITEM.to_string(),
            detail_ready: Some("h1.title".to_string()),
            detail: DetailRules {
                title: FieldChain(vec![Extract::Text("h1.title")]),
                abstract_text: FieldChain(vec![Extract::Text("div.abstract")]),
                ..Default::default()
            },
            consent: None,
        }
    }

    fn unit() -> ListingReference {
        let mut unit = ListingReference::single("vol 7", TOC);
        unit.volume = Some("7".to_string());
        unit.date_hint = Some("2023-04".to_string());
        unit
    }

    async fn crawler(
        web: FakeWeb,
        path: &Path,
        config: CrawlConfig,
        run: RunOptions,
        cancel: CancellationToken,
    ) -> Crawler<FakeFactory> {
        let store = CheckpointStore::open(path).await.unwrap();
        Crawler::new(config, plan(), FakeFactory::new(web), store, run, cancel)
    }

    fn two_item_web() -> FakeWeb {
        let mut web = FakeWeb::default();
        web.page(TOC, &toc_html(&[Some("https://journal.example/a/1"), None]))
            .page("https://journal.example/a/1", &detail_html("First"))
            .page("https://journal.example/a/2", &detail_html("Second"))
            .click(TOC, ITEM, 1, "https://journal.example/a/2");
        web
    }

    #[tokio::test]
    async fn test_two_items_href_and_click_only() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out.csv");
        let mut crawler = crawler(
            two_item_web(),
            &path,
            CrawlConfig::instant(),
            RunOptions::default(),
            CancellationToken::new(),
        )
        .await;

        let summary = crawler.run(&[unit()]).await.unwrap();
        assert_eq!(summary.appended, 2);
        assert_eq!(summary.failed_items, 0);

        let stored = CheckpointStore::open(&path).await.unwrap();
        let records = stored.records();
        assert_eq!(records[0].url, "https://journal.example/a/1");
        assert_eq!(records[0].title, "First");
        assert_eq!(records[0].volume, "7");
        assert_eq!(records[0].date, "2023-04");
        assert_eq!(records[1].url, "https://journal.example/a/2");
        assert_eq!(records[1].abstract_text, "About Second.");
        assert_eq!(records[1].keywords, "N/A");
    }

    #[tokio::test]
    async fn test_resume_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out.csv");
        let resume = RunOptions {
            resume: true,
            limit: None,
        };

        let mut first = crawler(two_item_web(), &path, CrawlConfig::instant(), resume, CancellationToken::new()).await;
        first.run(&[unit()]).await.unwrap();
        let before = std::fs::read_to_string(&path).unwrap();

        let mut second = crawler(two_item_web(), &path, CrawlConfig::instant(), resume, CancellationToken::new()).await;
        let summary = second.run(&[unit()]).await.unwrap();
        assert_eq!(summary.appended, 0);
        assert_eq!(summary.skipped_existing, 2);
        assert_eq!(second.manager().factory().web.borrow().visits("https://journal.example/a/1"), 0);
        assert_eq!(std::fs::read_to_string(&path).unwrap(), before);
    }

    #[tokio::test]
    async fn test_interrupted_run_keeps_completed_records() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out.csv");
        let cancel = CancellationToken::new();
        let mut web = FakeWeb::default();
        web.page(
            TOC,
            &toc_html(&[
                Some("https://journal.example/a/1"),
                Some("https://journal.example/a/2"),
                Some("https://journal.example/a/3"),
            ]),
        )
        .page("https://journal.example/a/1", &detail_html("One"))
        .page("https://journal.example/a/2", &detail_html("Two"))
        .page("https://journal.example/a/3", &detail_html("Three"));
        web.cancel_on = Some(("https://journal.example/a/2".to_string(), cancel.clone()));

        let mut crawler = crawler(web, &path, CrawlConfig::instant(), RunOptions::default(), cancel).await;
        let summary = crawler.run(&[unit()]).await.unwrap();
        assert!(summary.interrupted);
        assert_eq!(summary.appended, 2);

        let stored = CheckpointStore::open(&path).await.unwrap();
        assert!(stored.contains("https://journal.example/a/1"));
        assert!(stored.contains("https://journal.example/a/2"));
        assert!(!stored.contains("https://journal.example/a/3"));
        let web = crawler.manager().factory().web.borrow();
        assert_eq!(web.visits("https://journal.example/a/3"), 0);
        assert_eq!(web.sessions_closed, 1);
    }

    #[tokio::test]
    async fn test_unrecoverable_unit_is_skipped() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out.csv");
        let other_toc = "https://journal.example/vol/8/toc";
        let mut web = two_item_web();
        web.page(other_toc, "<p>moved</p>");
        web.flaky(other_toc, 100);

        let mut crawler = crawler(web, &path, CrawlConfig::instant(), RunOptions::default(), CancellationToken::new()).await;
        let units = vec![ListingReference::single("vol 8", other_toc), unit()];
        let summary = crawler.run(&units).await.unwrap();

        assert_eq!(summary.units, 2);
        assert_eq!(summary.units_abandoned, 1);
        assert_eq!(summary.appended, 2);
        // one initial attempt plus the bounded recovery attempts
        assert_eq!(crawler.manager().factory().web.borrow().visits(other_toc), 4);
    }

    #[tokio::test]
    async fn test_flaky_item_is_retried() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out.csv");
        let mut web = two_item_web();
        web.flaky("https://journal.example/a/1", 1);

        let mut crawler = crawler(web, &path, CrawlConfig::instant(), RunOptions::default(), CancellationToken::new()).await;
        let summary = crawler.run(&[unit()]).await.unwrap();
        assert_eq!(summary.appended, 2);
        assert_eq!(summary.failed_items, 0);
        assert_eq!(crawler.manager().factory().web.borrow().visits("https://journal.example/a/1"), 2);
    }

    #[tokio::test]
    async fn test_item_skipped_after_retries() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out.csv");
        let mut web = two_item_web();
        web.flaky("https://journal.example/a/1", 100);

        let mut crawler = crawler(web, &path, CrawlConfig::instant(), RunOptions::default(), CancellationToken::new()).await;
        let summary = crawler.run(&[unit()]).await.unwrap();
        assert_eq!(summary.failed_items, 1);
        assert_eq!(summary.appended, 1);
        assert!(crawler.store().contains("https://journal.example/a/2"));
    }

    #[tokio::test]
    async fn test_checkpoint_cadence_recycles_session() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out.csv");
        let mut config = CrawlConfig::instant();
        config.checkpoint_every = 1;

        let mut crawler = crawler(two_item_web(), &path, config, RunOptions::default(), CancellationToken::new()).await;
        crawler.run(&[unit()]).await.unwrap();

        let web = crawler.manager().factory().web.borrow();
        assert_eq!(web.sessions_created, 3);
        assert_eq!(web.sessions_closed, 3);
    }

    #[tokio::test]
    async fn test_consent_dismissed_before_second_listing_page() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out.csv");
        let page1 = "https://journal.example/cat/1";
        let page2 = "https://journal.example/cat/2";
        let mut web = FakeWeb::default();
        web.page(
            page1,
            &format!(r#"<button class="accept">OK</button>{}"#, toc_html(&[Some("https://journal.example/a/1")])),
        )
        .page(page2, &toc_html(&[Some("https://journal.example/a/2")]))
        .page("https://journal.example/a/1", &detail_html("First"))
        .page("https://journal.example/a/2", &detail_html("Second"));

        let mut unit = unit();
        unit.url_template = "https://journal.example/cat/{page}".to_string();
        unit.fixed_pages = Some(2);
        let mut plan = plan();
        plan.consent = Some("button.accept".to_string());
        let store = CheckpointStore::open(&path).await.unwrap();
        let mut crawler = Crawler::new(
            CrawlConfig::instant(),
            plan,
            FakeFactory::new(web),
            store,
            RunOptions::default(),
            CancellationToken::new(),
        );

        let summary = crawler.run(&[unit]).await.unwrap();
        assert_eq!(summary.appended, 2);
        let web = crawler.manager().factory().web.borrow();
        assert_eq!(web.consent_seen_on, vec![page1.to_string()]);
        assert_eq!(web.visits(page2), 1);
    }

    #[tokio::test]
    async fn test_failed_flush_dumps_records_and_aborts() {
        let dir = tempfile::tempdir().unwrap();
        let stem = format!("crawl-flush-failure-{}", std::process::id());
        let path = dir.path().join(format!("{stem}.csv"));
        let mut crawler = crawler(
            two_item_web(),
            &path,
            CrawlConfig::instant(),
            RunOptions::default(),
            CancellationToken::new(),
        )
        .await;
        // A directory at the output path makes the final rename fail.
        std::fs::create_dir(&path).unwrap();

        let err = crawler.run(&[unit()]).await.unwrap_err();
        assert!(matches!(err, CrawlError::Persistence { .. }));
        assert_eq!(crawler.manager().factory().web.borrow().sessions_closed, 1);

        let prefix = format!("{stem}-emergency-");
        let dumps: Vec<_> = std::fs::read_dir(std::env::temp_dir())
            .unwrap()
            .filter_map(|entry| entry.ok().map(|e| e.path()))
            .filter(|p| {
                p.file_name()
                    .and_then(|n| n.to_str())
                    .is_some_and(|n| n.starts_with(&prefix) && n.ends_with(".json"))
            })
            .collect();
        assert_eq!(dumps.len(), 1);
        let records: Vec<ArticleRecord> =
            serde_json::from_str(&std::fs::read_to_string(&dumps[0]).unwrap()).unwrap();
        let urls: Vec<_> = records.iter().map(|r| r.url.as_str()).collect();
        assert_eq!(urls, vec!["https://journal.example/a/1", "https://journal.example/a/2"]);
        for dump in dumps {
            let _ = std::fs::remove_file(dump);
        }
    }

    #[tokio::test]
    async fn test_limit_stops_early() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out.csv");
        let run = RunOptions {
            resume: false,
            limit: Some(1),
        };

        let mut crawler = crawler(two_item_web(), &path, CrawlConfig::instant(), run, CancellationToken::new()).await;
        let summary = crawler.run(&[unit(), unit()]).await.unwrap();
        assert_eq!(summary.appended, 1);
        assert_eq!(summary.units, 1);
        assert_eq!(crawler.manager().factory().web.borrow().visits("https://journal.example/a/2"), 0);
    }
}
