//! Helpers for pacing, logging and file system checks.
//!
//! - Randomized pauses drawn from a [`DelayRange`], and pauses raced against
//!   a cancellation token
//! - String truncation for log previews
//! - Output path validation before a crawl starts

use std::error::Error;
use std::fs as stdfs;
use std::path::Path;
use std::time::Duration;

use rand::{Rng, rng};
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::{info, instrument};

use crate::config::DelayRange;
use crate::error::{CrawlError, CrawlResult};

/// Draw a duration uniformly from `range`.
pub fn jittered(range: DelayRange) -> Duration {
    if range.max_secs <= 0.0 {
        return Duration::ZERO;
    }
    let secs = if range.max_secs > range.min_secs {
        rng().random_range(range.min_secs..=range.max_secs)
    } else {
        range.min_secs
    };
    Duration::from_secs_f64(secs.max(0.0))
}

/// Sleep for a random duration within `range`.
pub async fn pause(range: DelayRange) {
    let delay = jittered(range);
    if !delay.is_zero() {
        sleep(delay).await;
    }
}

/// Sleep for `delay`, returning [`CrawlError::Interrupted`] as soon as `cancel` fires.
pub async fn pause_or_cancel(delay: Duration, cancel: &CancellationToken) -> CrawlResult<()> {
    if cancel.is_cancelled() {
        return Err(CrawlError::Interrupted);
    }
    if delay.is_zero() {
        return Ok(());
    }
    tokio::select! {
        _ = cancel.cancelled() => Err(CrawlError::Interrupted),
        _ = sleep(delay) => Ok(()),
    }
}

/// Truncate a string for logging purposes.
///
/// Cuts on a character boundary so titles in any script are safe to preview.
///
/// ```ignore
/// assert_eq!(truncate_for_log("short", 100), "short");
/// assert_eq!(truncate_for_log(&"a".repeat(500), 10), "aaaaaaaaaa…(+490 bytes)");
/// ```
pub fn truncate_for_log(s: &str, max: usize) -> String {
    if s.len() <= max {
        return s.to_string();
    }
    let cut = s
        .char_indices()
        .map(|(i, _)| i)
        .take_while(|i| *i <= max)
        .last()
        .unwrap_or(0);
    format!("{}…(+{} bytes)", &s[..cut], s.len() - cut)
}

/// Collapse runs of whitespace into single spaces and trim.
pub fn clean_text(s: &str) -> String {
    s.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Ensure the parent directory of `path` exists and accepts new files.
///
/// Creates the directory if needed, then writes and removes a probe file
/// next to the output.
#[instrument(level = "info", skip_all, fields(path = %path.display()))]
pub async fn ensure_writable_file(path: &Path) -> Result<(), Box<dyn Error>> {
    let parent = match path.parent() {
        Some(p) if !p.as_os_str().is_empty() => p.to_path_buf(),
        _ => std::env::current_dir()?,
    };
    tokio::fs::create_dir_all(&parent).await?;

    if path.is_dir() {
        return Err(format!("{} is a directory", path.display()).into());
    }
    if path.exists() {
        stdfs::OpenOptions::new().append(true).open(path)?;
    }

    // Try a small sync write using std fs (simpler error surface)
    let probe_path = parent.join("..__probe_write__");
    match stdfs::File::create(&probe_path) {
        Ok(_) => {
            let _ = stdfs::remove_file(&probe_path);
            info!("Output location is writable");
            Ok(())
        }
        Err(e) => Err(Box::new(e)),
    }
}
