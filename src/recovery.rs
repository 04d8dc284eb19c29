//! Session ownership and recovery.
//!
//! [`SessionManager`] is the only owner of the live session. Everything else
//! borrows it for one operation through [`SessionManager::session`].
//!
//! ```text
//!  Healthy ──failure──▶ Degraded ──▶ Recovering ──ok──▶ Healthy
//!                                        │
//!                              bound exhausted
//!                                        ▼
//!                                    Abandoned
//! ```
//!
//! Recovery closes the old session, creates a fresh one, and re-opens the
//! listing page that was being worked on. It gives up after
//! `recovery_attempts` tries so a dead site cannot stall the whole run.

use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

use crate::error::{CrawlError, CrawlResult, ErrorKind};
use crate::fetcher::{Backoff, FetchOptions, fetch_ready};
use crate::models::PageContent;
use crate::transport::{Session, SessionFactory};
use crate::utils::pause_or_cancel;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Healthy,
    Degraded,
    Recovering,
    Abandoned,
}

/// What the orchestrator should do before retrying a failed item.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Escalation {
    Retry,
    ReloadListing,
    Recover,
}

/// Pick the escalation step for a transient failure.
///
/// `consecutive_failures` counts failed attempts in a row, this one included.
/// Items without an href are always reached through their listing page.
pub fn escalation(err: &CrawlError, consecutive_failures: u32, placeholder: bool) -> Escalation {
    if consecutive_failures >= 2 {
        return Escalation::Recover;
    }
    match err.kind() {
        ErrorKind::StaleReference => Escalation::ReloadListing,
        _ if placeholder => Escalation::ReloadListing,
        _ => Escalation::Retry,
    }
}

pub struct SessionManager<F: SessionFactory> {
    factory: F,
    session: Option<F::Session>,
    state: SessionState,
    max_attempts: u32,
    opts: FetchOptions,
    backoff: Backoff,
    cancel: CancellationToken,
    consent: Option<String>,
    consent_done: bool,
}

impl<F: SessionFactory> SessionManager<F> {
    pub fn new(
        factory: F,
        max_attempts: u32,
        opts: FetchOptions,
        backoff: Backoff,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            factory,
            session: None,
            state: SessionState::Healthy,
            max_attempts,
            opts,
            backoff,
            cancel,
            consent: None,
            consent_done: false,
        }
    }

    /// Cookie-consent button to click once per fresh session.
    pub fn with_consent(mut self, selector: Option<String>) -> Self {
        self.consent = selector;
        self
    }

    #[cfg(test)]
    pub fn state(&self) -> SessionState {
        self.state
    }

    #[cfg(test)]
    pub fn factory(&self) -> &F {
        &self.factory
    }

    /// Borrow the live session, creating one if there is none.
    pub async fn session(&mut self) -> CrawlResult<&mut F::Session> {
        let session = match self.session.take() {
            Some(session) => session,
            None => {
                let fresh = self.factory.create().await?;
                self.consent_done = false;
                self.state = SessionState::Healthy;
                debug!("Session created");
                fresh
            }
        };
        Ok(self.session.insert(session))
    }

    /// Load a listing page in the live session. The cookie banner is
    /// dismissed as soon as the first page of a fresh session is up.
    pub async fn open_listing(&mut self, url: &str, ready: Option<&str>) -> CrawlResult<PageContent> {
        let opts = self.opts;
        let session = self.session().await?;
        let page = fetch_ready(session, url, ready, &opts).await?;
        self.ensure_consent().await;
        Ok(page)
    }

    async fn ensure_consent(&mut self) {
        if self.consent_done {
            return;
        }
        let Some(selector) = self.consent.clone() else {
            return;
        };
        if let Some(session) = self.session.as_mut() {
            match session.dismiss_consent(&selector).await {
                Ok(clicked) => debug!(clicked, "Consent check done"),
                Err(e) => warn!(error = %e, "Consent banner could not be dismissed"),
            }
            self.consent_done = true;
        }
    }

    /// Replace the session with a fresh one and re-open `listing_url`.
    ///
    /// Returns [`CrawlError::Abandoned`] once every attempt has failed and
    /// [`CrawlError::Interrupted`] if the run is cancelled meanwhile.
    #[instrument(level = "info", skip_all, fields(listing = %listing_url))]
    pub async fn recover(&mut self, listing_url: &str, ready: Option<&str>) -> CrawlResult<()> {
        self.state = SessionState::Degraded;
        warn!("Session degraded; recreating");
        self.close_current().await;

        for attempt in 1..=self.max_attempts {
            self.state = SessionState::Recovering;
            match self.restore(listing_url, ready).await {
                Ok(()) => {
                    self.state = SessionState::Healthy;
                    info!(attempt, "Session recovered");
                    return Ok(());
                }
                Err(e) if !e.is_transient() => {
                    self.close_current().await;
                    return Err(e);
                }
                Err(e) => {
                    warn!(attempt, max = self.max_attempts, error = %e, "Recovery attempt failed");
                    self.close_current().await;
                    if attempt < self.max_attempts {
                        pause_or_cancel(self.backoff.delay_for(e.kind()), &self.cancel).await?;
                    }
                }
            }
        }

        self.state = SessionState::Abandoned;
        error!(attempts = self.max_attempts, "Session could not be recovered");
        Err(CrawlError::Abandoned {
            listing: listing_url.to_string(),
            attempts: self.max_attempts,
        })
    }

    async fn restore(&mut self, listing_url: &str, ready: Option<&str>) -> CrawlResult<()> {
        if self.cancel.is_cancelled() {
            return Err(CrawlError::Interrupted);
        }
        self.open_listing(listing_url, ready).await.map(|_| ())
    }

    /// Routine recreation between checkpoints. The next [`session`](Self::session)
    /// call launches the replacement.
    pub async fn recycle(&mut self) {
        self.close_current().await;
        self.state = SessionState::Healthy;
        info!("Session recycled");
    }

    /// Close the session at the end of a run.
    pub async fn shutdown(&mut self) {
        if self.session.is_some() {
            self.close_current().await;
            info!("Session closed");
        }
    }

    async fn close_current(&mut self) {
        self.consent_done = false;
        if let Some(session) = self.session.take() {
            if let Err(e) = session.close().await {
                debug!(error = %e, "Ignoring error while closing session");
            }
        }
    }
}
