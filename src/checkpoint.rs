//! Durable, deduplicated record store backed by a CSV file.
//!
//! The store is loaded once when a run starts, then only appended to in
//! memory. [`CheckpointStore::flush`] rewrites the whole file. Both old and
//! new rows are written through a temporary sibling, which is then renamed
//! over the target, so a crash mid-write never truncates earlier results.
//!
//! Rows are keyed by `url`. The first record seen for a url wins, whether it
//! came from the prior file or from this run.
//!
//! The file starts with a UTF-8 byte-order mark so spreadsheet tools detect
//! the encoding. The mark is stripped again on load.

use std::collections::HashSet;
use std::io;
use std::path::{Path, PathBuf};

use chrono::Utc;
use tokio::fs;
use tracing::{error, info, instrument, warn};

use crate::error::{CrawlError, CrawlResult};
use crate::models::ArticleRecord;

const BOM: &str = "\u{feff}";
const HEADER: [&str; 8] = [
    "volume", "issue", "date", "title", "authors", "abstract", "keywords", "url",
];

#[derive(Debug)]
pub struct CheckpointStore {
    path: PathBuf,
    records: Vec<ArticleRecord>,
    urls: HashSet<String>,
    /// Number of records already on disk.
    flushed: usize,
}

impl CheckpointStore {
    /// Open the store at `path`, loading any rows a previous run left there.
    ///
    /// A missing file is an empty store. A file that exists but cannot be
    /// read or parsed is an error, never silently replaced.
    #[instrument(level = "info", skip_all, fields(path = %path.as_ref().display()))]
    pub async fn open(path: impl AsRef<Path>) -> CrawlResult<Self> {
        let path = path.as_ref().to_path_buf();
        let mut store = Self {
            path,
            records: Vec::new(),
            urls: HashSet::new(),
            flushed: 0,
        };

        let raw = match fs::read(&store.path).await {
            Ok(raw) => raw,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                info!("No prior checkpoint; starting empty");
                return Ok(store);
            }
            Err(e) => return Err(CrawlError::persistence(&store.path, e)),
        };

        let text = String::from_utf8(raw).map_err(|e| {
            CrawlError::persistence(&store.path, io::Error::new(io::ErrorKind::InvalidData, e))
        })?;
        let body = text.strip_prefix(BOM).unwrap_or(&text);

        let mut reader = csv::Reader::from_reader(body.as_bytes());
        for row in reader.deserialize::<ArticleRecord>() {
            let record = row.map_err(|e| CrawlError::persistence(&store.path, io::Error::from(e)))?;
            store.insert(record);
        }
        store.flushed = store.records.len();

        info!(records = store.records.len(), "Loaded prior checkpoint");
        Ok(store)
    }

    fn insert(&mut self, record: ArticleRecord) -> bool {
        if !self.urls.insert(record.url.clone()) {
            return false;
        }
        self.records.push(record);
        true
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn contains(&self, url: &str) -> bool {
        self.urls.contains(url)
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Records appended since the last successful flush.
    pub fn pending(&self) -> usize {
        self.records.len() - self.flushed
    }

    #[cfg(test)]
    pub fn records(&self) -> &[ArticleRecord] {
        &self.records
    }

    /// Append `record` unless its url is already stored. Returns whether it was added.
    pub fn push(&mut self, record: ArticleRecord) -> bool {
        self.insert(record)
    }

    /// Rewrite the file with every record, via a temporary file and rename.
    #[instrument(level = "info", skip_all, fields(path = %self.path.display()))]
    pub async fn flush(&mut self) -> CrawlResult<()> {
        let bytes = self
            .encode()
            .map_err(|e| CrawlError::persistence(&self.path, e))?;

        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)
                .await
                .map_err(|e| CrawlError::persistence(parent, e))?;
        }

        let tmp = self.tmp_path();
        fs::write(&tmp, &bytes)
            .await
            .map_err(|e| CrawlError::persistence(&tmp, e))?;
        if let Err(e) = fs::rename(&tmp, &self.path).await {
            let _ = fs::remove_file(&tmp).await;
            return Err(CrawlError::persistence(&self.path, e));
        }

        let written = self.pending();
        self.flushed = self.records.len();
        info!(total = self.records.len(), new = written, "Checkpoint written");
        Ok(())
    }

    fn encode(&self) -> io::Result<Vec<u8>> {
        let mut buf = BOM.as_bytes().to_vec();
        {
            let mut writer = csv::WriterBuilder::new()
                .has_headers(false)
                .from_writer(&mut buf);
            writer.write_record(HEADER)?;
            for record in &self.records {
                writer.serialize(record)?;
            }
            writer.flush()?;
        }
        Ok(buf)
    }

    fn tmp_path(&self) -> PathBuf {
        let mut name = self
            .path
            .file_name()
            .map(|n| n.to_os_string())
            .unwrap_or_else(|| "checkpoint.csv".into());
        name.push(".tmp");
        self.path.with_file_name(name)
    }

    /// Write every in-memory record as JSON to the system temp directory.
    ///
    /// Last resort when [`flush`](Self::flush) fails. Returns the dump path.
    #[instrument(level = "info", skip_all)]
    pub async fn dump_emergency(&self) -> CrawlResult<PathBuf> {
        let json = serde_json::to_string_pretty(&self.records)
            .map_err(|e| CrawlError::persistence(&self.path, io::Error::other(e)))?;
        let stem = self
            .path
            .file_stem()
            .and_then(|s| s.to_str())
            .unwrap_or("crawl");
        let dump = std::env::temp_dir().join(format!(
            "{stem}-emergency-{}.json",
            Utc::now().format("%Y%m%dT%H%M%S")
        ));

        match fs::write(&dump, json).await {
            Ok(()) => {
                warn!(path = %dump.display(), records = self.records.len(), "Emergency dump written");
                Ok(dump)
            }
            Err(e) => {
                error!(path = %dump.display(), error = %e, "Emergency dump failed");
                Err(CrawlError::persistence(dump, e))
            }
        }
    }
}
