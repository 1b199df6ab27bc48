//! Point-in-time view of every assignment against freshly merged bars.
//!
//! A snapshot refreshes the caches the assignments need, then derives one row
//! per assignment: the bar in effect at the snapshot time, the assigned MA over
//! bars up to it, distance to the MA and the break-even flag.

use chrono::{DateTime, NaiveTime, Utc};
use chrono_tz::Tz;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use std::time::Instant;

use crate::assignments::AssignmentStore;
use crate::backfill::{backfill_symbol, BarAggregator};
use crate::config::SchedulerSettings;
use crate::download::{DownloadCoordinator, FetchOutcome};
use crate::error::{Error, Result};
use crate::indicators::moving_average::{distance_pct, moving_average};
use crate::models::{bare_symbol, Assignment, Bar, Granularity, MaType, SeriesKey, Timeframe};
use crate::persistence::JsonlLog;
use crate::signals::BreakEvenGate;

/// Bars loaded per series when building rows
pub const SNAPSHOT_BAR_LIMIT: usize = 365;

/// One assignment as seen at snapshot time
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SnapshotRow {
    pub ts: DateTime<Utc>,
    pub ticker: String,
    pub ma_type: MaType,
    pub length: usize,
    pub timeframe: Timeframe,
    pub ma_value: Option<f64>,
    pub last_close: Option<f64>,
    pub last_bar_time: Option<DateTime<Utc>>,
    pub distance_pct: Option<f64>,
    pub avg_cost: Option<f64>,
    #[serde(rename = "abv_be")]
    pub above_break_even: bool,
}

/// Line written to the snapshot log
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SnapshotRecord {
    pub start_ts: DateTime<Utc>,
    pub end_ts: DateTime<Utc>,
    pub rows: Vec<SnapshotRow>,
}

/// Index of the bar in effect at `at`
///
/// The latest bar at or before `at`, or the last bar when none qualifies.
/// Before the session opens, a daily bar dated today has not traded yet, so
/// the previous one is used.
pub fn select_bar(
    bars: &[Bar],
    at: DateTime<Utc>,
    timeframe: Timeframe,
    tz: Tz,
    session_open: NaiveTime,
) -> Option<usize> {
    if bars.is_empty() {
        return None;
    }
    let mut idx = bars
        .iter()
        .rposition(|b| b.timestamp <= at)
        .unwrap_or(bars.len() - 1);

    if timeframe == Timeframe::Daily {
        let local = at.with_timezone(&tz);
        // Daily bars are stamped with their session date at midnight UTC
        if local.time() < session_open && bars[idx].timestamp.date_naive() == local.date_naive() && idx > 0 {
            idx -= 1;
        }
    }
    Some(idx)
}

/// Build a row from a series already loaded for the assignment's timeframe
pub fn build_row(
    assignment: &Assignment,
    bars: &[Bar],
    at: DateTime<Utc>,
    avg_cost: Option<f64>,
    tz: Tz,
    session_open: NaiveTime,
) -> SnapshotRow {
    let mut row = SnapshotRow {
        ts: at,
        ticker: assignment.ticker.clone(),
        ma_type: assignment.ma_type,
        length: assignment.length,
        timeframe: assignment.timeframe,
        ma_value: None,
        last_close: None,
        last_bar_time: None,
        distance_pct: None,
        avg_cost,
        above_break_even: false,
    };

    let Some(idx) = select_bar(bars, at, assignment.timeframe, tz, session_open) else {
        return row;
    };
    let chosen = &bars[idx];
    let closes: Vec<f64> = bars[..=idx].iter().map(|b| b.close).collect();

    row.last_close = Some(chosen.close);
    row.last_bar_time = Some(chosen.timestamp);
    row.ma_value = moving_average(assignment.ma_type, &closes, assignment.length);
    if let Some(ma) = row.ma_value {
        row.distance_pct = distance_pct(chosen.close, ma);
        row.above_break_even = BreakEvenGate::above_break_even(chosen.close, ma, avg_cost);
    }
    row
}

/// Refreshes caches and builds snapshot rows
pub struct SnapshotBuilder {
    coordinator: Arc<DownloadCoordinator>,
    assignments: Arc<dyn AssignmentStore>,
    aggregator: BarAggregator,
    tz: Tz,
    session_open: NaiveTime,
    log: Option<Arc<JsonlLog>>,
    trace: Option<Arc<JsonlLog>>,
}

impl SnapshotBuilder {
    pub fn new(
        coordinator: Arc<DownloadCoordinator>,
        assignments: Arc<dyn AssignmentStore>,
        scheduler: &SchedulerSettings,
    ) -> Result<Self> {
        let session_open = NaiveTime::from_hms_opt(scheduler.open_hour, scheduler.open_minute, 0)
            .ok_or_else(|| {
                Error::InvalidInput(format!(
                    "bad session open {}:{}",
                    scheduler.open_hour, scheduler.open_minute
                ))
            })?;
        Ok(Self {
            coordinator,
            assignments,
            aggregator: BarAggregator::hourly(),
            tz: scheduler.timezone()?,
            session_open,
            log: None,
            trace: None,
        })
    }

    /// Append each snapshot to `log`
    pub fn with_log(mut self, log: Arc<JsonlLog>) -> Self {
        self.log = Some(log);
        self
    }

    pub fn with_trace(mut self, trace: Arc<JsonlLog>) -> Self {
        self.trace = Some(trace);
        self
    }

    pub fn coordinator(&self) -> &Arc<DownloadCoordinator> {
        &self.coordinator
    }

    /// Refresh the caches and build one row per assignment
    pub async fn take(&self, at: DateTime<Utc>) -> Result<SnapshotRecord> {
        let started = Instant::now();
        let assignments = self.assignments.list_assignments()?;
        self.trace_event(
            "minute_snapshot_start",
            json!({ "at": at.to_rfc3339(), "assignments": assignments.len() }),
        )
        .await;

        let (hourly, daily) = partition_tickers(&assignments);
        self.refresh_daily(&daily).await;
        for symbol in &hourly {
            if let Err(e) = self.refresh_hourly(symbol).await {
                tracing::warn!(symbol = %symbol, "Hourly refresh failed: {}", e);
            }
        }

        let costs = self.average_costs().await;
        let mut rows = Vec::with_capacity(assignments.len());
        for assignment in &assignments {
            let key = SeriesKey::new(&assignment.ticker, assignment.timeframe.granularity());
            let bars = match self
                .coordinator
                .cache()
                .load(&key, Some(SNAPSHOT_BAR_LIMIT))
                .await
            {
                Ok(bars) => bars,
                Err(e) => {
                    tracing::warn!(ticker = %assignment.ticker, "Failed to load {}: {}", key, e);
                    Vec::new()
                }
            };
            let avg_cost = costs.get(bare_symbol(&assignment.ticker)).copied();
            rows.push(build_row(assignment, &bars, at, avg_cost, self.tz, self.session_open));
        }

        let record = SnapshotRecord {
            start_ts: at,
            end_ts: Utc::now(),
            rows,
        };
        if let Some(log) = &self.log {
            log.append(&record).await?;
        }

        let elapsed = started.elapsed();
        tracing::info!(
            "📸 Snapshot: {} rows ({} hourly, {} daily tickers) in {:.2}s",
            record.rows.len(),
            hourly.len(),
            daily.len(),
            elapsed.as_secs_f64()
        );
        self.trace_event(
            "minute_snapshot_done",
            json!({ "rows": record.rows.len(), "duration_ms": elapsed.as_millis() as u64 }),
        )
        .await;

        Ok(record)
    }

    async fn refresh_daily(&self, symbols: &[String]) {
        if symbols.is_empty() {
            return;
        }
        let fetched = self.coordinator.batch_daily(symbols).await;
        for (symbol, bars) in fetched {
            if bars.is_empty() {
                continue;
            }
            let key = SeriesKey::new(&symbol, Granularity::Daily);
            if let Err(e) = self.coordinator.merge_bars(&key, &bars).await {
                tracing::warn!(symbol = %symbol, "Daily merge failed: {}", e);
            }
        }
    }

    /// Latest fine bars (backfill on failure), merged and rolled into the hourly cache
    async fn refresh_hourly(&self, symbol: &str) -> Result<()> {
        let settings = self.coordinator.settings();
        let fine = match self
            .coordinator
            .fetch_fine(symbol, settings.fine_lookback_days, None)
            .await
        {
            FetchOutcome::Bars(bars) => bars,
            FetchOutcome::Empty => Vec::new(),
            FetchOutcome::Failed(e) => {
                tracing::info!(symbol = %symbol, "Fine fetch failed ({}), backfilling", e);
                let (bars, _) = backfill_symbol(
                    &self.coordinator,
                    symbol,
                    settings.backfill_target,
                    settings.backfill_page_days,
                )
                .await?;
                bars
            }
        };

        let fine_key = SeriesKey::new(symbol, Granularity::Fine);
        if !fine.is_empty() {
            self.coordinator.merge_bars(&fine_key, &fine).await?;
        }

        let cached = self.coordinator.cache().load(&fine_key, None).await?;
        let hourly = self.aggregator.aggregate(&cached);
        if !hourly.is_empty() {
            let hourly_key = SeriesKey::new(symbol, Granularity::Hourly);
            self.coordinator.merge_bars(&hourly_key, &hourly).await?;
        }
        Ok(())
    }

    /// Average cost per bare symbol. Empty when positions are unavailable.
    async fn average_costs(&self) -> HashMap<String, f64> {
        match self.coordinator.connector().live_positions().await {
            Ok(positions) => positions
                .into_iter()
                .filter_map(|p| p.avg_cost.map(|c| (bare_symbol(&p.symbol).to_string(), c)))
                .collect(),
            Err(e) => {
                tracing::warn!("Positions unavailable for snapshot: {}", e);
                HashMap::new()
            }
        }
    }

    async fn trace_event(&self, event: &str, fields: serde_json::Value) {
        if let Some(trace) = &self.trace {
            if let Err(e) = trace.append_event(event, fields).await {
                tracing::warn!("Failed to write trace event {}: {}", event, e);
            }
        }
    }
}

/// Unique tickers per timeframe, sorted
fn partition_tickers(assignments: &[Assignment]) -> (Vec<String>, Vec<String>) {
    let mut hourly = BTreeSet::new();
    let mut daily = BTreeSet::new();
    for a in assignments {
        match a.timeframe {
            Timeframe::Hourly => hourly.insert(a.ticker.clone()),
            Timeframe::Daily => daily.insert(a.ticker.clone()),
        };
    }
    (hourly.into_iter().collect(), daily.into_iter().collect())
}
