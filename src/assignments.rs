//! Read-only access to per-ticker moving-average assignments.

use serde::Deserialize;
use std::path::{Path, PathBuf};

use crate::error::{Error, Result};
use crate::models::{Assignment, Timeframe};

/// Source of assignments, in file order
pub trait AssignmentStore: Send + Sync {
    fn list_assignments(&self) -> Result<Vec<Assignment>>;

    fn get(&self, ticker: &str) -> Result<Option<Assignment>> {
        Ok(self
            .list_assignments()?
            .into_iter()
            .find(|a| a.ticker.eq_ignore_ascii_case(ticker)))
    }
}

/// Fixed in-memory list
#[derive(Debug, Clone, Default)]
pub struct StaticAssignments {
    assignments: Vec<Assignment>,
}

impl StaticAssignments {
    pub fn new(assignments: Vec<Assignment>) -> Self {
        Self { assignments }
    }
}

impl AssignmentStore for StaticAssignments {
    fn list_assignments(&self) -> Result<Vec<Assignment>> {
        Ok(self.assignments.clone())
    }
}

#[derive(Debug, Deserialize)]
struct AssignmentRow {
    ticker: String,
    #[serde(rename = "type")]
    ma_type: String,
    length: String,
    #[serde(default)]
    timeframe: Option<String>,
}

impl AssignmentRow {
    fn into_assignment(self) -> Result<Assignment> {
        let ticker = self.ticker.trim().to_string();
        if ticker.is_empty() {
            return Err(Error::InvalidInput("empty ticker".to_string()));
        }
        let length: usize = self
            .length
            .trim()
            .parse()
            .map_err(|_| Error::InvalidInput(format!("bad length for {}: {}", ticker, self.length)))?;
        if length == 0 {
            return Err(Error::InvalidInput(format!("length must be > 0 for {}", ticker)));
        }
        let timeframe = match self.timeframe.as_deref().map(str::trim) {
            None | Some("") => Timeframe::Hourly,
            Some(tf) => tf.parse()?,
        };

        Ok(Assignment {
            ticker,
            ma_type: self.ma_type.parse()?,
            length,
            timeframe,
        })
    }
}

/// `ticker,type,length[,timeframe]` sheet. Timeframe defaults to hourly.
///
/// Malformed rows are skipped with a warning; a missing file is an empty list.
#[derive(Debug, Clone)]
pub struct CsvAssignmentStore {
    path: PathBuf,
}

impl CsvAssignmentStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl AssignmentStore for CsvAssignmentStore {
    fn list_assignments(&self) -> Result<Vec<Assignment>> {
        if !self.path.exists() {
            return Ok(Vec::new());
        }

        let mut reader = csv::ReaderBuilder::new()
            .trim(csv::Trim::All)
            .flexible(true)
            .from_path(&self.path)
            .map_err(|e| Error::InvalidInput(format!("failed to open {}: {}", self.path.display(), e)))?;

        let mut assignments = Vec::new();
        for (line, row) in reader.deserialize::<AssignmentRow>().enumerate() {
            let parsed = row
                .map_err(|e| Error::InvalidInput(e.to_string()))
                .and_then(AssignmentRow::into_assignment);
            match parsed {
                Ok(a) => assignments.push(a),
                Err(e) => tracing::warn!("Skipping assignment row {}: {}", line + 2, e),
            }
        }

        Ok(assignments)
    }
}
