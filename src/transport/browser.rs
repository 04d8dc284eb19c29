//! Browser transport built on `chromiumoxide`.
//!
//! Each [`BrowserSession`] owns one Chrome process and a single tab. The
//! session is launched with a fixed window size and user agent, hides the
//! automation banner, and (optionally) masks `navigator.webdriver` on every
//! new document.

use std::time::Duration;

use chromiumoxide::{
    Page,
    browser::{Browser, BrowserConfig},
    cdp::browser_protocol::page::AddScriptToEvaluateOnNewDocumentParams,
};
use futures::StreamExt;
use tokio::{
    task::JoinHandle,
    time::{interval, timeout},
};
use tracing::{debug, info, instrument};

use super::{Session, SessionFactory};
use crate::config::{DelayRange, TransportConfig};
use crate::error::{CrawlError, CrawlResult};
use crate::utils::pause;

const MASK_WEBDRIVER_JS: &str =
    "Object.defineProperty(navigator, 'webdriver', {get: () => undefined})";
const CLICK_JS: &str = "function() { this.click(); }";
const POLL_EVERY: Duration = Duration::from_millis(250);
const CONSENT_WAIT: Duration = Duration::from_secs(5);

#[derive(Debug, Clone)]
pub struct BrowserFactory {
    config: TransportConfig,
    launch_timeout: Duration,
}

impl BrowserFactory {
    pub fn new(config: TransportConfig, launch_timeout: Duration) -> Self {
        Self {
            config,
            launch_timeout,
        }
    }
}

impl SessionFactory for BrowserFactory {
    type Session = BrowserSession;

    #[instrument(level = "info", skip_all, fields(headless = self.config.headless))]
    async fn create(&self) -> CrawlResult<BrowserSession> {
        let browser_config = build_browser_config(&self.config, self.launch_timeout)?;

        let (browser, mut handler) = Browser::launch(browser_config).await?;

        let handle = tokio::spawn(async move {
            while let Some(h) = handler.next().await {
                if h.is_err() {
                    break;
                }
            }
        });

        let page = browser.new_page("about:blank").await?;
        if self.config.mask_automation {
            if let Err(e) = page
                .execute(AddScriptToEvaluateOnNewDocumentParams::new(
                    MASK_WEBDRIVER_JS.to_string(),
                ))
                .await
            {
                debug!(error = %e, "Webdriver masking script was not installed");
            }
        }

        info!("Browser session launched");
        Ok(BrowserSession {
            browser,
            handler: handle,
            page,
        })
    }
}

fn build_browser_config(config: &TransportConfig, launch_timeout: Duration) -> CrawlResult<BrowserConfig> {
    let mut builder = BrowserConfig::builder()
        .window_size(config.window_width, config.window_height)
        .request_timeout(launch_timeout)
        .arg("--disable-blink-features=AutomationControlled")
        .arg(format!("--user-agent={}", config.user_agent))
        .arg("--disable-infobars")
        .arg("--disable-extensions")
        .arg("--disable-popup-blocking")
        .arg("--no-sandbox")
        .arg("--disable-dev-shm-usage");

    if config.headless {
        builder = builder.arg("--headless=new");
    } else {
        builder = builder.with_head();
    }

    if let Some(path) = &config.chrome_path {
        builder = builder.chrome_executable(path);
    }

    builder.build().map_err(CrawlError::Transport)
}

pub struct BrowserSession {
    browser: Browser,
    handler: JoinHandle<()>,
    page: Page,
}

impl Session for BrowserSession {
    #[instrument(level = "debug", skip_all, fields(%url))]
    async fn navigate(&mut self, url: &str, limit: Duration) -> CrawlResult<()> {
        timeout(limit, self.page.goto(url))
            .await
            .map_err(|_| CrawlError::timeout(url, limit))??;
        Ok(())
    }

    async fn current_url(&mut self) -> CrawlResult<String> {
        Ok(self.page.url().await?.unwrap_or_default())
    }

    async fn content(&mut self) -> CrawlResult<String> {
        Ok(self.page.content().await?)
    }

    async fn wait_for(&mut self, selector: &str, limit: Duration) -> CrawlResult<()> {
        let page = &self.page;
        timeout(limit, async {
            let mut ticker = interval(POLL_EVERY);
            loop {
                ticker.tick().await;
                // The document may still be swapping; treat lookup errors as "not yet".
                if let Ok(found) = page.find_elements(selector).await {
                    if !found.is_empty() {
                        return;
                    }
                }
            }
        })
        .await
        .map_err(|_| CrawlError::timeout(selector, limit))
    }

    #[instrument(level = "debug", skip_all, fields(%selector, index))]
    async fn click_nth(
        &mut self,
        selector: &str,
        index: usize,
        click_pause: DelayRange,
        limit: Duration,
    ) -> CrawlResult<()> {
        let elements = self.page.find_elements(selector).await?;
        let element = elements.into_iter().nth(index).ok_or_else(|| {
            CrawlError::StaleReference(format!("{selector}[{index}] not on page"))
        })?;

        element.scroll_into_view().await?;
        pause(click_pause).await;
        element.call_js_fn(CLICK_JS, false).await?;

        timeout(limit, self.page.wait_for_navigation())
            .await
            .map_err(|_| CrawlError::timeout(format!("navigation after clicking {selector}"), limit))??;
        Ok(())
    }

    async fn scroll_to_bottom(&mut self) -> CrawlResult<()> {
        self.page
            .evaluate("window.scrollTo(0, document.body.scrollHeight);")
            .await?;
        Ok(())
    }

    async fn dismiss_consent(&mut self, selector: &str) -> CrawlResult<bool> {
        if self.wait_for(selector, CONSENT_WAIT).await.is_err() {
            debug!(%selector, "No consent banner");
            return Ok(false);
        }
        let button = self.page.find_element(selector).await?;
        button.click().await?;
        info!("Cookie consent accepted");
        Ok(true)
    }

    async fn close(mut self) -> CrawlResult<()> {
        let _ = self.browser.close().await;
        let _ = self.handler.await;
        Ok(())
    }
}

