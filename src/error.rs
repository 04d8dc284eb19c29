//! Error taxonomy for the crawl pipeline.
//!
//! Failures are split by how the caller should react to them:
//!
//! | Kind | Examples | Reaction |
//! |------|----------|----------|
//! | [`ErrorKind::Timeout`] | navigation or element wait exceeded its budget | retry, then session recovery |
//! | [`ErrorKind::Transport`] | network or driver failure, HTTP 4xx/5xx | retry, then session recovery |
//! | [`ErrorKind::StaleReference`] | element vanished after a re-render | reload the listing page, then retry |
//! | [`ErrorKind::Abandoned`] | session recovery exhausted its bound | skip the listing unit |
//! | [`ErrorKind::Fatal`] | unwritable output, bad configuration, interruption | flush and stop the run |
//!
//! A field whose whole fallback chain comes back empty is *not* an error; the
//! detail parser records the `N/A` sentinel instead.

use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

/// Coarse classification used for backoff and escalation decisions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Timeout,
    Transport,
    StaleReference,
    Abandoned,
    Fatal,
}

#[derive(Error, Debug)]
pub enum CrawlError {
    #[error("timed out after {after:?} waiting for {what}")]
    Timeout { what: String, after: Duration },

    #[error("transport error: {0}")]
    Transport(String),

    #[error("stale element reference: {0}")]
    StaleReference(String),

    #[error("could not write {path}: {source}")]
    Persistence {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("configuration error: {0}")]
    Config(String),

    #[error("listing {listing} abandoned after {attempts} recovery attempts")]
    Abandoned { listing: String, attempts: u32 },

    #[error("crawl interrupted")]
    Interrupted,
}

pub type CrawlResult<T> = Result<T, CrawlError>;

impl CrawlError {
    pub fn timeout(what: impl Into<String>, after: Duration) -> Self {
        CrawlError::Timeout {
            what: what.into(),
            after,
        }
    }

    pub fn persistence(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        CrawlError::Persistence {
            path: path.into(),
            source,
        }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            CrawlError::Timeout { .. } => ErrorKind::Timeout,
            CrawlError::Transport(_) => ErrorKind::Transport,
            CrawlError::StaleReference(_) => ErrorKind::StaleReference,
            CrawlError::Abandoned { .. } => ErrorKind::Abandoned,
            CrawlError::Persistence { .. } | CrawlError::Config(_) | CrawlError::Interrupted => {
                ErrorKind::Fatal
            }
        }
    }

    /// Whether the failure is worth retrying locally.
    pub fn is_transient(&self) -> bool {
        matches!(
            self.kind(),
            ErrorKind::Timeout | ErrorKind::Transport | ErrorKind::StaleReference
        )
    }
}

impl From<reqwest::Error> for CrawlError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            let what = err
                .url()
                .map(|u| u.to_string())
                .unwrap_or_else(|| "response".to_string());
            CrawlError::Timeout {
                what,
                after: Duration::ZERO,
            }
        } else {
            CrawlError::Transport(err.to_string())
        }
    }
}

impl From<chromiumoxide::error::CdpError> for CrawlError {
    fn from(err: chromiumoxide::error::CdpError) -> Self {
        match err {
            chromiumoxide::error::CdpError::Timeout => CrawlError::Timeout {
                what: "browser command".to_string(),
                after: Duration::ZERO,
            },
            chromiumoxide::error::CdpError::NotFound => {
                CrawlError::StaleReference("node no longer in document".to_string())
            }
            other => CrawlError::Transport(other.to_string()),
        }
    }
}
