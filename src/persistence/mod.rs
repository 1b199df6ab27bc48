pub mod failures;
pub mod jsonl;

use crate::error::Result;
use crate::models::{Bar, SeriesKey};
use chrono::{DateTime, Utc};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tokio::fs;
use tokio::io::AsyncWriteExt;

pub use failures::FailureJournal;
pub use jsonl::JsonlLog;

/// Local bar cache
///
/// One NDJSON file per series key under `dir` (e.g. `cache/NASDAQ__AAPL__1h.ndjson`).
/// Each key has a single logical writer; callers serialize writers per key.
#[derive(Debug, Clone)]
pub struct BarCache {
    dir: PathBuf,
}

impl BarCache {
    /// # Arguments
    /// * `dir` - Cache directory, created on first write
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn path_for(&self, key: &SeriesKey) -> PathBuf {
        self.dir.join(format!("{}.ndjson", key.file_stem()))
    }

    pub async fn exists(&self, key: &SeriesKey) -> bool {
        fs::metadata(self.path_for(key)).await.is_ok()
    }

    /// Append bars in arrival order without deduplication
    pub async fn append(&self, key: &SeriesKey, bars: &[Bar]) -> Result<usize> {
        if bars.is_empty() {
            return Ok(0);
        }
        fs::create_dir_all(&self.dir).await?;

        let mut buf = String::new();
        for bar in bars {
            buf.push_str(&serde_json::to_string(bar)?);
            buf.push('\n');
        }

        let mut file = fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(self.path_for(key))
            .await?;
        file.write_all(buf.as_bytes()).await?;
        file.flush().await?;

        tracing::debug!("Appended {} bars to {}", bars.len(), key);
        Ok(bars.len())
    }

    /// Replace the whole series (temp file + rename)
    pub async fn overwrite(&self, key: &SeriesKey, bars: &[Bar]) -> Result<()> {
        fs::create_dir_all(&self.dir).await?;

        let mut buf = String::with_capacity(bars.len() * 96);
        for bar in bars {
            buf.push_str(&serde_json::to_string(bar)?);
            buf.push('\n');
        }

        let path = self.path_for(key);
        let tmp = path.with_extension("ndjson.tmp");
        fs::write(&tmp, buf.as_bytes()).await?;
        fs::rename(&tmp, &path).await?;

        Ok(())
    }

    /// Merge `new` into the cached series
    ///
    /// New bars replace cached bars with the same timestamp. The result is sorted
    /// ascending and written back. Returns the merged series length.
    pub async fn merge(&self, key: &SeriesKey, new: &[Bar]) -> Result<usize> {
        let existing = self.load(key, None).await?;

        let mut by_ts: BTreeMap<DateTime<Utc>, Bar> = BTreeMap::new();
        for bar in existing {
            by_ts.insert(bar.timestamp, bar);
        }
        for bar in new {
            by_ts.insert(bar.timestamp, bar.clone());
        }

        let merged: Vec<Bar> = by_ts.into_values().collect();
        self.overwrite(key, &merged).await?;

        tracing::debug!("Merged {} bars into {} ({} total)", new.len(), key, merged.len());
        Ok(merged.len())
    }

    /// Load the series, or only its most recent `limit` bars
    ///
    /// A missing file is an empty series. `Some(0)` means all.
    pub async fn load(&self, key: &SeriesKey, limit: Option<usize>) -> Result<Vec<Bar>> {
        let (bars, skipped) = self.load_with_skipped(key, limit).await?;
        if skipped > 0 {
            tracing::debug!("Skipped {} malformed lines in {}", skipped, key);
        }
        Ok(bars)
    }

    /// Like [`load`](Self::load) and also returns the number of malformed lines skipped
    pub async fn load_with_skipped(
        &self,
        key: &SeriesKey,
        limit: Option<usize>,
    ) -> Result<(Vec<Bar>, usize)> {
        let content = match fs::read_to_string(self.path_for(key)).await {
            Ok(c) => c,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok((Vec::new(), 0)),
            Err(e) => return Err(e.into()),
        };

        let mut bars = Vec::new();
        let mut skipped = 0;
        for line in content.lines() {
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            match serde_json::from_str::<Bar>(line) {
                Ok(bar) => bars.push(bar),
                Err(_) => skipped += 1,
            }
        }

        if let Some(limit) = limit.filter(|l| *l > 0) {
            if bars.len() > limit {
                bars.drain(..bars.len() - limit);
            }
        }

        Ok((bars, skipped))
    }

    pub async fn count(&self, key: &SeriesKey) -> Result<usize> {
        Ok(self.load(key, None).await?.len())
    }
}
