use crate::error::Result;
use crate::models::FailureRecord;
use std::path::{Path, PathBuf};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;

/// Durable list of downloads that failed terminally
#[derive(Debug)]
pub struct FailureJournal {
    path: PathBuf,
    lock: Mutex<()>,
}

impl FailureJournal {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            lock: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub async fn record(&self, record: &FailureRecord) -> Result<()> {
        let mut line = serde_json::to_string(record)?;
        line.push('\n');

        let _guard = self.lock.lock().await;
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent).await?;
        }
        let mut file = fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .await?;
        file.write_all(line.as_bytes()).await?;
        Ok(())
    }

    /// All records, oldest first. Malformed lines are dropped.
    pub async fn load(&self) -> Result<Vec<FailureRecord>> {
        let _guard = self.lock.lock().await;
        self.read_unlocked().await
    }

    /// Remove up to `max` oldest records and return them with the number left behind
    ///
    /// The journal is rewritten with the remainder, or deleted when nothing remains.
    pub async fn take_oldest(&self, max: usize) -> Result<(Vec<FailureRecord>, usize)> {
        let _guard = self.lock.lock().await;
        let mut records = self.read_unlocked().await?;
        records.sort_by_key(|r| r.timestamp);

        let take = max.min(records.len());
        let remainder = records.split_off(take);

        if remainder.is_empty() {
            match fs::remove_file(&self.path).await {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(e.into()),
            }
        } else {
            let mut buf = String::new();
            for r in &remainder {
                buf.push_str(&serde_json::to_string(r)?);
                buf.push('\n');
            }
            let tmp = self.path.with_extension("jsonl.tmp");
            fs::write(&tmp, buf.as_bytes()).await?;
            fs::rename(&tmp, &self.path).await?;
        }

        Ok((records, remainder.len()))
    }

    async fn read_unlocked(&self) -> Result<Vec<FailureRecord>> {
        let content = match fs::read_to_string(&self.path).await {
            Ok(c) => c,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        Ok(content
            .lines()
            .filter(|l| !l.trim().is_empty())
            .filter_map(|l| serde_json::from_str(l).ok())
            .collect())
    }
}
