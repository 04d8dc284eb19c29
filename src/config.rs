//! Crawl configuration.
//!
//! Settings come from an optional YAML file and are then overridden by CLI
//! flags (see [`crate::cli::Cli::apply_overrides`]). Every field has a
//! default, so an empty or missing file is a valid configuration.
//!
//! ```yaml
//! politeness_delay: { min_secs: 1.0, max_secs: 3.0 }
//! checkpoint_every: 20
//! max_retries: 1
//! recovery_attempts: 3
//! transport:
//!   headless: true
//!   mask_automation: true
//! ```

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{info, instrument};

use crate::error::{CrawlError, CrawlResult};

pub const DEFAULT_USER_AGENT: &str = "Mozilla/5.0 (Macintosh; Intel Mac OS X 10_15_7) \
     AppleWebKit/537.36 (KHTML, like Gecko) Chrome/120.0.0.0 Safari/537.36";

/// Inclusive range of seconds a randomized pause is drawn from.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct DelayRange {
    pub min_secs: f64,
    pub max_secs: f64,
}

impl DelayRange {
    pub const fn new(min_secs: f64, max_secs: f64) -> Self {
        Self { min_secs, max_secs }
    }

    #[cfg(test)]
    pub const fn zero() -> Self {
        Self::new(0.0, 0.0)
    }

    fn is_valid(&self) -> bool {
        self.min_secs >= 0.0 && self.min_secs <= self.max_secs
    }
}

/// Options handed to every session the factory creates.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TransportConfig {
    pub user_agent: String,
    pub accept_language: String,
    pub headless: bool,
    /// Hide `navigator.webdriver` from page scripts.
    pub mask_automation: bool,
    pub window_width: u32,
    pub window_height: u32,
    pub chrome_path: Option<String>,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            user_agent: DEFAULT_USER_AGENT.to_string(),
            accept_language: "en-US,en;q=0.9".to_string(),
            headless: false,
            mask_automation: true,
            window_width: 1920,
            window_height: 1080,
            chrome_path: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CrawlConfig {
    /// Settle delay injected after each navigation.
    pub politeness_delay: DelayRange,
    /// Pause between scrolling an element into view and clicking it.
    pub click_pause: DelayRange,
    pub backoff_timeout: DelayRange,
    pub backoff_transport: DelayRange,
    pub page_load_timeout_secs: u64,
    pub element_wait_timeout_secs: u64,
    /// Persist and recycle the session every this many appended records.
    pub checkpoint_every: usize,
    /// Retries per item after the first attempt.
    pub max_retries: u32,
    /// Fresh sessions tried before a listing unit is abandoned.
    pub recovery_attempts: u32,
    pub transport: TransportConfig,
}

impl Default for CrawlConfig {
    fn default() -> Self {
        Self {
            politeness_delay: DelayRange::new(1.0, 3.0),
            click_pause: DelayRange::new(0.6, 1.5),
            backoff_timeout: DelayRange::new(3.0, 5.0),
            backoff_transport: DelayRange::new(5.0, 8.0),
            page_load_timeout_secs: 60,
            element_wait_timeout_secs: 30,
            checkpoint_every: 20,
            max_retries: 1,
            recovery_attempts: 3,
            transport: TransportConfig::default(),
        }
    }
}

impl CrawlConfig {
    /// Load a YAML configuration file.
    #[instrument(level = "info", skip_all, fields(path = %path.as_ref().display()))]
    pub fn from_yaml_file(path: impl AsRef<Path>) -> CrawlResult<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path).map_err(|e| {
            CrawlError::Config(format!("cannot read {}: {e}", path.display()))
        })?;
        let config = Self::from_yaml_str(&raw)?;
        info!("Loaded crawl configuration");
        Ok(config)
    }

    pub fn from_yaml_str(raw: &str) -> CrawlResult<Self> {
        if raw.trim().is_empty() {
            return Ok(Self::default());
        }
        serde_yaml::from_str(raw).map_err(|e| CrawlError::Config(e.to_string()))
    }

    pub fn page_load_timeout(&self) -> Duration {
        Duration::from_secs(self.page_load_timeout_secs)
    }

    pub fn element_wait_timeout(&self) -> Duration {
        Duration::from_secs(self.element_wait_timeout_secs)
    }

    pub fn validate(&self) -> CrawlResult<()> {
        if self.checkpoint_every == 0 {
            return Err(CrawlError::Config(
                "checkpoint_every must be at least 1".to_string(),
            ));
        }
        if self.recovery_attempts == 0 {
            return Err(CrawlError::Config(
                "recovery_attempts must be at least 1".to_string(),
            ));
        }
        let ranges = [
            ("politeness_delay", self.politeness_delay),
            ("click_pause", self.click_pause),
            ("backoff_timeout", self.backoff_timeout),
            ("backoff_transport", self.backoff_transport),
        ];
        for (name, range) in ranges {
            if !range.is_valid() {
                return Err(CrawlError::Config(format!(
                    "{name} must satisfy 0 <= min_secs <= max_secs"
                )));
            }
        }
        Ok(())
    }

    /// Configuration with every pause set to zero, for tests.
    #[cfg(test)]
    pub fn instant() -> Self {
        Self {
            politeness_delay: DelayRange::zero(),
            click_pause: DelayRange::zero(),
            backoff_timeout: DelayRange::zero(),
            backoff_transport: DelayRange::zero(),
            page_load_timeout_secs: 1,
            element_wait_timeout_secs: 1,
            ..Self::default()
        }
    }
}
