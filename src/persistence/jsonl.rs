use crate::error::Result;
use chrono::Utc;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::{Map, Value};
use std::path::{Path, PathBuf};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;

/// Append-only JSON-lines log
///
/// Used for the signal audit log, the trace/event log, snapshot rows and
/// order attempts. Appends are serialized and each line goes out in a single write.
#[derive(Debug)]
pub struct JsonlLog {
    path: PathBuf,
    lock: Mutex<()>,
}

impl JsonlLog {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            lock: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub async fn append<T: Serialize>(&self, record: &T) -> Result<()> {
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
        file.flush().await?;
        Ok(())
    }

    /// Append `{ts, ...fields}` where `fields` is a JSON object
    pub async fn append_event(&self, event: &str, fields: Value) -> Result<()> {
        let mut record = Map::new();
        record.insert("ts".to_string(), Value::String(Utc::now().to_rfc3339()));
        record.insert("event".to_string(), Value::String(event.to_string()));
        if let Value::Object(extra) = fields {
            record.extend(extra);
        }
        self.append(&Value::Object(record)).await
    }

    /// Read back every line that parses as `T`. Missing file yields nothing.
    pub async fn read_all<T: DeserializeOwned>(&self) -> Result<Vec<T>> {
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
