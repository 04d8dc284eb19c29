//! Plain HTTP transport built on `reqwest`.
//!
//! Suitable for server-rendered pages. "Clicking" an element follows its
//! `href`; elements that only carry a script click handler cannot be
//! followed and fail with a transport error.

use std::time::Duration;

use reqwest::header::{ACCEPT_LANGUAGE, HeaderMap, HeaderValue};
use scraper::Html;
use tracing::{debug, instrument};

use super::{Session, SessionFactory};
use crate::config::{DelayRange, TransportConfig};
use crate::error::{CrawlError, CrawlResult};
use crate::html::{absolutize, element_href, has_match, parse_selector};

#[derive(Debug, Clone)]
pub struct HttpFactory {
    client: reqwest::Client,
}

impl HttpFactory {
    pub fn new(config: &TransportConfig) -> CrawlResult<Self> {
        let mut headers = HeaderMap::new();
        let lang = HeaderValue::from_str(&config.accept_language)
            .map_err(|e| CrawlError::Config(format!("invalid accept_language: {e}")))?;
        headers.insert(ACCEPT_LANGUAGE, lang);

        let client = reqwest::Client::builder()
            .user_agent(config.user_agent.clone())
            .default_headers(headers)
            .build()?;
        Ok(Self { client })
    }
}

impl SessionFactory for HttpFactory {
    type Session = HttpSession;

    async fn create(&self) -> CrawlResult<HttpSession> {
        Ok(HttpSession {
            client: self.client.clone(),
            current: None,
        })
    }
}

#[derive(Debug)]
struct Loaded {
    url: String,
    html: String,
}

#[derive(Debug)]
pub struct HttpSession {
    client: reqwest::Client,
    current: Option<Loaded>,
}

impl HttpSession {
    fn loaded(&self) -> CrawlResult<&Loaded> {
        self.current
            .as_ref()
            .ok_or_else(|| CrawlError::Transport("no page loaded".to_string()))
    }
}

impl Session for HttpSession {
    #[instrument(level = "debug", skip_all, fields(%url))]
    async fn navigate(&mut self, url: &str, timeout: Duration) -> CrawlResult<()> {
        let resp = self
            .client
            .get(url)
            .timeout(timeout)
            .send()
            .await
            .map_err(|e| timeout_or_transport(e, url, timeout))?;

        let status = resp.status();
        if status.is_client_error() || status.is_server_error() {
            return Err(CrawlError::Transport(format!("HTTP {status} for {url}")));
        }

        let final_url = resp.url().to_string();
        let html = resp
            .text()
            .await
            .map_err(|e| timeout_or_transport(e, url, timeout))?;
        debug!(bytes = html.len(), %final_url, "Fetched page");
        self.current = Some(Loaded {
            url: final_url,
            html,
        });
        Ok(())
    }

    async fn current_url(&mut self) -> CrawlResult<String> {
        Ok(self.loaded()?.url.clone())
    }

    async fn content(&mut self) -> CrawlResult<String> {
        Ok(self.loaded()?.html.clone())
    }

    async fn wait_for(&mut self, selector: &str, timeout: Duration) -> CrawlResult<()> {
        // A static document never changes; either the element is there or it never will be.
        if has_match(&self.loaded()?.html, selector)? {
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
        let target = {
            let loaded = self.loaded()?;
            let sel = parse_selector(selector)?;
            let document = Html::parse_document(&loaded.html);
            let element = document.select(&sel).nth(index).ok_or_else(|| {
                CrawlError::StaleReference(format!("{selector}[{index}] not on page"))
            })?;
            let href = element_href(&element).ok_or_else(|| {
                CrawlError::Transport(format!(
                    "{selector}[{index}] has no href; clicking it needs a browser session"
                ))
            })?;
            absolutize(&loaded.url, href)
                .ok_or_else(|| CrawlError::Transport(format!("unresolvable href {href}")))?
        };
        self.navigate(&target, timeout).await
    }

    async fn scroll_to_bottom(&mut self) -> CrawlResult<()> {
        Ok(())
    }

    async fn dismiss_consent(&mut self, _selector: &str) -> CrawlResult<bool> {
        Ok(false)
    }

    async fn close(self) -> CrawlResult<()> {
        Ok(())
    }
}

fn timeout_or_transport(err: reqwest::Error, url: &str, timeout: Duration) -> CrawlError {
    if err.is_timeout() {
        CrawlError::timeout(url, timeout)
    } else {
        CrawlError::from(err)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn session_with(url: &str, html: &str) -> HttpSession {
        HttpSession {
            client: reqwest::Client::new(),
            current: Some(Loaded {
                url: url.to_string(),
                html: html.to_string(),
            }),
        }
    }

    #[test]
    fn test_factory_builds_with_defaults() {
        assert!(HttpFactory::new(&TransportConfig::default()).is_ok());
    }

    #[tokio::test]
    async fn test_wait_for_missing_selector_times_out() {
        let mut session = session_with("https://example.org/", "<p>hi</p>");
        let err = session
            .wait_for("h1.title", Duration::from_secs(1))
            .await
            .unwrap_err();
        assert!(matches!(err, CrawlError::Timeout { .. }));
        assert!(session.wait_for("p", Duration::from_secs(1)).await.is_ok());
    }

    #[tokio::test]
    async fn test_click_without_href_needs_browser() {
        let mut session = session_with(
            "https://example.org/toc",
            r#"<span class="item">click me</span>"#,
        );
        let err = session
            .click_nth("span.item", 0, DelayRange::zero(), Duration::from_secs(1))
            .await
            .unwrap_err();
        assert!(matches!(err, CrawlError::Transport(_)));
    }

    #[tokio::test]
    async fn test_click_past_end_is_stale() {
        let mut session = session_with(
            "https://example.org/toc",
            r#"<a class="item" href="/a/1">one</a>"#,
        );
        let err = session
            .click_nth("a.item", 4, DelayRange::zero(), Duration::from_secs(1))
            .await
            .unwrap_err();
        assert!(matches!(err, CrawlError::StaleReference(_)));
    }

    #[tokio::test]
    async fn test_no_page_loaded() {
        let mut session = HttpFactory::new(&TransportConfig::default())
            .unwrap()
            .create()
            .await
            .unwrap();
        assert!(session.content().await.is_err());
    }
}
