//! # Journal Crawler
//!
//! A resumable crawler that collects article metadata from scholarly-journal
//! tables of contents and news-site archives into a single CSV file.
//!
//! ## Features
//!
//! - Walks paginated listings (volumes, issues, monthly archives, category pages)
//! - Parses detail pages with ordered fallback selectors per field
//! - Retries transient failures and recreates a broken browser session
//! - Checkpoints results periodically and resumes without duplicates
//!
//! ## Usage
//!
//! ```sh
//! journal_crawler --target dss --volumes 176-180 --output dss.csv
//! journal_crawler --target dss --volumes 176-190 --output dss.csv --resume
//! ```
//!
//! ## Architecture
//!
//! 1. **Units**: the site profile turns CLI arguments into listing units
//! 2. **Links**: each unit's pages are scanned for item references
//! 3. **Details**: each item is fetched (or clicked) and parsed
//! 4. **Checkpoint**: records are flushed every K items and on exit

use std::error::Error;

use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use tracing_subscriber::{EnvFilter, fmt as tfmt};

mod checkpoint;
mod cli;
mod config;
mod detail;
mod error;
mod fetcher;
mod html;
mod listing;
mod models;
mod orchestrator;
mod recovery;
mod sites;
mod transport;
mod utils;

use checkpoint::CheckpointStore;
use cli::Cli;
use config::CrawlConfig;
use orchestrator::{CrawlSummary, Crawler};
use sites::TransportKind;
use transport::browser::BrowserFactory;
use transport::http::HttpFactory;
use utils::ensure_writable_file;

#[tokio::main]
async fn main() -> Result<(), Box<dyn Error>> {
    // --- Tracing init ---
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tfmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_file(false)
        .with_line_number(false)
        .with_timer(tracing_subscriber::fmt::time::UtcTime::rfc_3339())
        .init();

    let start_time = std::time::Instant::now();
    info!("journal_crawler starting up");

    // Parse CLI
    let args = Cli::parse();
    debug!(target_site = ?args.target, output = %args.output.display(), "Parsed CLI arguments");

    // ---- Load config ----
    let mut config = match &args.config {
        Some(path) => CrawlConfig::from_yaml_file(path)?,
        None => CrawlConfig::default(),
    };
    args.apply_overrides(&mut config);
    config.validate()?;

    let site = sites::profile(args.target);
    let units = site.units(&args.unit_args())?;
    let plan = site.plan()?;
    info!(site = site.name, units = units.len(), "Crawl planned");

    // Early check: ensure the output file is writable
    if let Err(e) = ensure_writable_file(&args.output).await {
        error!(
            path = %args.output.display(),
            error = %e,
            "Output file is not writable (fix perms or choose a different path, e.g. --output ~/Downloads/crawl.csv)"
        );
        return Err(e);
    }

    let store = CheckpointStore::open(&args.output).await?;
    info!(path = %store.path().display(), records = store.len(), resume = args.resume, "Checkpoint store ready");
    if args.resume && store.is_empty() {
        warn!("--resume given but the output file has no records yet; starting fresh");
    }

    // ---- Ctrl-C stops the crawl after the current step ----
    let cancel = CancellationToken::new();
    {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                warn!("Interrupt received; saving progress");
                cancel.cancel();
            }
        });
    }

    let transport = args.transport.unwrap_or(site.transport);
    info!(?transport, "Using transport");
    let run = args.run_options();

    let summary: CrawlSummary = match transport {
        TransportKind::Http => {
            let factory = HttpFactory::new(&config.transport)?;
            let mut crawler = Crawler::new(config, plan, factory, store, run, cancel);
            crawler.run(&units).await?
        }
        TransportKind::Browser => {
            let factory = BrowserFactory::new(config.transport.clone(), config.page_load_timeout());
            let mut crawler = Crawler::new(config, plan, factory, store, run, cancel);
            crawler.run(&units).await?
        }
    };

    let elapsed = start_time.elapsed();
    info!(
        ?elapsed,
        secs = elapsed.as_secs(),
        appended = summary.appended,
        skipped_existing = summary.skipped_existing,
        failed_items = summary.failed_items,
        units_abandoned = summary.units_abandoned,
        "Execution complete"
    );

    if summary.interrupted {
        return Err(format!(
            "crawl interrupted; {} records saved to {}",
            summary.appended,
            args.output.display()
        )
        .into());
    }
    Ok(())
}
