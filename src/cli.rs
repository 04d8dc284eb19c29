//! Command-line interface definitions for the journal crawler.
//!
//! Flags override values loaded from the optional YAML config file. A few
//! options can also come from environment variables.

use std::path::PathBuf;

use clap::Parser;

use crate::config::CrawlConfig;
use crate::orchestrator::RunOptions;
use crate::sites::{Target, TransportKind, UnitArgs};

/// Command-line arguments for the crawler.
///
/// # Examples
///
/// ```sh
/// # DSS volumes 176 to 180 in a visible browser
/// journal_crawler --target dss --volumes 176-180 --output dss.csv
///
/// # MIS Quarterly issues 3 and 4 of volume 47, continuing an earlier run
/// journal_crawler --target misq --volumes 47 --issues 3,4 --output misq.csv --resume
///
/// # The Verge AI archive for one quarter
/// journal_crawler --target theverge --start 2025-07-01 --end 2025-09-30 --output verge.csv
/// ```
#[derive(Parser, Debug)]
#[command(author, version, about)]
pub struct Cli {
    /// Site to crawl
    #[arg(short, long, value_enum)]
    pub target: Target,

    /// CSV file to write (and to resume from)
    #[arg(short, long, env = "CRAWLER_OUTPUT")]
    pub output: PathBuf,

    /// First day of the archive range (YYYY-MM-DD)
    #[arg(long)]
    pub start: Option<String>,

    /// Last day of the archive range (YYYY-MM-DD)
    #[arg(long)]
    pub end: Option<String>,

    /// Archive section slug
    #[arg(long)]
    pub section: Option<String>,

    /// Volume range, e.g. `47-49` or `62`
    #[arg(long)]
    pub volumes: Option<String>,

    /// Comma separated issue numbers, e.g. `1,2,3`
    #[arg(long)]
    pub issues: Option<String>,

    /// Number of listing pages to walk
    #[arg(long)]
    pub pages: Option<u32>,

    /// Skip items whose url is already in the output file
    #[arg(long)]
    pub resume: bool,

    /// Stop after this many new records
    #[arg(long)]
    pub limit: Option<usize>,

    /// Optional path to config.yaml file
    #[arg(short, long, env = "CRAWLER_CONFIG")]
    pub config: Option<PathBuf>,

    /// Run the browser without a window
    #[arg(long, conflicts_with = "visible")]
    pub headless: bool,

    /// Run the browser with a window
    #[arg(long)]
    pub visible: bool,

    /// Override the site's default transport
    #[arg(long, value_enum)]
    pub transport: Option<TransportKind>,

    /// Persist and recycle the session every K records
    #[arg(long)]
    pub checkpoint_every: Option<usize>,

    /// Retries per item after the first attempt
    #[arg(long)]
    pub max_retries: Option<u32>,

    /// Browser executable to launch
    #[arg(long, env = "CHROME_PATH")]
    pub chrome_path: Option<String>,
}

impl Cli {
    /// Apply flag values on top of a loaded configuration.
    pub fn apply_overrides(&self, config: &mut CrawlConfig) {
        if self.headless {
            config.transport.headless = true;
        }
        if self.visible {
            config.transport.headless = false;
        }
        if let Some(k) = self.checkpoint_every {
            config.checkpoint_every = k;
        }
        if let Some(n) = self.max_retries {
            config.max_retries = n;
        }
        if let Some(path) = &self.chrome_path {
            config.transport.chrome_path = Some(path.clone());
        }
    }

    pub fn unit_args(&self) -> UnitArgs {
        UnitArgs {
            volumes: self.volumes.clone(),
            issues: self.issues.clone(),
            start: self.start.clone(),
            end: self.end.clone(),
            section: self.section.clone(),
            pages: self.pages,
        }
    }

    pub fn run_options(&self) -> RunOptions {
        RunOptions {
            resume: self.resume,
            limit: self.limit,
        }
    }
}
