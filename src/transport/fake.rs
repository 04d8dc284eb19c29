//! Scripted in-memory site used by unit tests.
//!
//! Pages are plain HTML strings keyed by URL. Clicks are resolved through an
//! explicit `(page url, selector, index) -> target url` table, which lets
//! tests model listing items that have no `href` at all.

use std::cell::RefCell;
use std::collections::HashMap;
use std::rc::Rc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use super::{Session, SessionFactory};
use crate::config::DelayRange;
use crate::error::{CrawlError, CrawlResult};
use crate::html::has_match;

#[derive(Debug, Default)]
pub struct FakeWeb {
    pages: HashMap<String, String>,
    clicks: HashMap<(String, String, usize), String>,
    /// Remaining forced timeouts per URL.
    flaky: HashMap<String, u32>,
    pub always_timeout: bool,
    /// Cancel this token when the given URL is navigated to.
    pub cancel_on: Option<(String, CancellationToken)>,
    pub navigations: Vec<String>,
    /// Page that was showing each time a consent banner was dismissed.
    pub consent_seen_on: Vec<String>,
    pub sessions_created: usize,
    pub sessions_closed: usize,
}

impl FakeWeb {
    pub fn page(&mut self, url: &str, html: &str) -> &mut Self {
        self.pages.insert(url.to_string(), html.to_string());
        self
    }

    pub fn click(&mut self, from: &str, selector: &str, index: usize, to: &str) -> &mut Self {
        self.clicks
            .insert((from.to_string(), selector.to_string(), index), to.to_string());
        self
    }

    /// Make the next `times` navigations to `url` time out.
    pub fn flaky(&mut self, url: &str, times: u32) -> &mut Self {
        self.flaky.insert(url.to_string(), times);
        self
    }

    pub fn visits(&self, url: &str) -> usize {
        self.navigations.iter().filter(|u| *u == url).count()
    }
}

#[derive(Debug, Clone, Default)]
pub struct FakeFactory {
    pub web: Rc<RefCell<FakeWeb>>,
}

impl FakeFactory {
    pub fn new(web: FakeWeb) -> Self {
        Self {
            web: Rc::new(RefCell::new(web)),
        }
    }
}

impl SessionFactory for FakeFactory {
    type Session = FakeSession;

    async fn create(&self) -> CrawlResult<FakeSession> {
        self.web.borrow_mut().sessions_created += 1;
        Ok(FakeSession {
            web: Rc::clone(&self.web),
            current: None,
        })
    }
}

#[derive(Debug)]
pub struct FakeSession {
    web: Rc<RefCell<FakeWeb>>,
    current: Option<String>,
}

impl FakeSession {
    fn current_html(&self) -> CrawlResult<String> {
        let url = self
            .current
            .as_ref()
            .ok_or_else(|| CrawlError::Transport("no page loaded".to_string()))?;
        self.web
            .borrow()
            .pages
            .get(url)
            .cloned()
            .ok_or_else(|| CrawlError::Transport(format!("404 {url}")))
    }
}

impl Session for FakeSession {
    async fn navigate(&mut self, url: &str, timeout: Duration) -> CrawlResult<()> {
        let mut web = self.web.borrow_mut();
        web.navigations.push(url.to_string());
        if let Some((trigger, token)) = &web.cancel_on {
            if trigger == url {
                token.cancel();
            }
        }
        if web.always_timeout {
            return Err(CrawlError::timeout(url, timeout));
        }
        if let Some(left) = web.flaky.get_mut(url) {
            if *left > 0 {
                *left -= 1;
                return Err(CrawlError::timeout(url, timeout));
            }
        }
        if !web.pages.contains_key(url) {
            return Err(CrawlError::Transport(format!("404 {url}")));
        }
        self.current = Some(url.to_string());
        Ok(())
    }

    async fn current_url(&mut self) -> CrawlResult<String> {
        self.current
            .clone()
            .ok_or_else(|| CrawlError::Transport("no page loaded".to_string()))
    }

    async fn content(&mut self) -> CrawlResult<String> {
        self.current_html()
    }

    async fn wait_for(&mut self, selector: &str, timeout: Duration) -> CrawlResult<()> {
        if has_match(&self.current_html()?, selector)? {
            Ok(())
        } else {
            Err(CrawlError::timeout(selector, timeout))
        }
    }

    async fn click_nth(
        &mut self,
        selector: &str,
        index: usize,
        _pause: DelayRange,
        timeout: Duration,
    ) -> CrawlResult<()> {
        let from = self.current_url().await?;
        let target = self
            .web
            .borrow()
            .clicks
            .get(&(from, selector.to_string(), index))
            .cloned()
            .ok_or_else(|| CrawlError::StaleReference(format!("{selector}[{index}]")))?;
        self.navigate(&target, timeout).await
    }

    async fn scroll_to_bottom(&mut self) -> CrawlResult<()> {
        Ok(())
    }

    async fn dismiss_consent(&mut self, selector: &str) -> CrawlResult<bool> {
        let html = self.current_html()?;
        let page = self.current.clone().unwrap_or_default();
        self.web.borrow_mut().consent_seen_on.push(page);
        has_match(&html, selector)
    }

    async fn close(self) -> CrawlResult<()> {
        self.web.borrow_mut().sessions_closed += 1;
        Ok(())
    }
}
