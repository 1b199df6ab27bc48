pub mod aggregator;
pub mod validator;

use chrono::{DateTime, Utc};
use std::collections::BTreeMap;

use crate::download::{DownloadCoordinator, FetchOutcome};
use crate::error::{Error, Result};
use crate::models::Bar;

pub use aggregator::{BarAggregator, RawBar};
pub use validator::BarValidator;

/// Fine bars in one regular session (6.5h of 30-minute bars)
pub const FINE_BARS_PER_SESSION: usize = 13;

/// Minimum page budget for a backfill
const MIN_BACKFILL_PAGES: usize = 10;

/// Statistics from a backfill operation
#[derive(Debug, Clone, PartialEq, Default)]
pub struct BackfillStats {
    pub pages: usize,
    pub fetched_bars: usize,
    pub unique_bars: usize,
    pub kept_bars: usize,
}

/// Page budget: `max(10, target / bars_per_page + 2)`
pub fn max_backfill_pages(target: usize, page_days: u32) -> usize {
    let bars_per_page = (page_days.max(1) as usize) * FINE_BARS_PER_SESSION;
    MIN_BACKFILL_PAGES.max(target / bars_per_page + 2)
}

/// Page backwards through fine bars for one symbol
///
/// Each page asks for bars strictly older than the earliest bar seen so far.
/// Stops on an empty page, a page with nothing older, once `target` unique
/// bars are collected, or when the page budget runs out.
///
/// # Returns
/// At most `target` most recent bars, ascending
pub async fn backfill_symbol(
    coordinator: &DownloadCoordinator,
    symbol: &str,
    target: usize,
    page_days: u32,
) -> Result<(Vec<Bar>, BackfillStats)> {
    let max_pages = max_backfill_pages(target, page_days);
    let mut stats = BackfillStats::default();
    let mut collected: BTreeMap<DateTime<Utc>, Bar> = BTreeMap::new();
    let mut cursor: Option<DateTime<Utc>> = None;

    tracing::info!(
        symbol = %symbol,
        "Backfilling {} fine bars ({} days/page, max {} pages)",
        target,
        page_days,
        max_pages
    );

    while stats.pages < max_pages && collected.len() < target {
        let outcome = coordinator.fetch_fine(symbol, page_days, cursor).await;
        stats.pages += 1;

        let page = match outcome {
            FetchOutcome::Bars(bars) => bars,
            FetchOutcome::Empty => break,
            FetchOutcome::Failed(e) if collected.is_empty() => return Err(Error::Connector(e)),
            FetchOutcome::Failed(e) => {
                tracing::warn!(symbol = %symbol, "Backfill stopped early: {}", e);
                break;
            }
        };
        stats.fetched_bars += page.len();

        let Some(earliest) = page.iter().map(|b| b.timestamp).min() else {
            break;
        };
        for bar in page {
            collected.insert(bar.timestamp, bar);
        }

        if cursor.is_some_and(|c| earliest >= c) {
            tracing::debug!(symbol = %symbol, "Backfill page had no older bars");
            break;
        }
        cursor = Some(earliest);
    }

    stats.unique_bars = collected.len();
    let mut bars: Vec<Bar> = collected.into_values().collect();
    if bars.len() > target {
        bars.drain(..bars.len() - target);
    }
    stats.kept_bars = bars.len();

    tracing::info!(
        symbol = %symbol,
        "✓ Backfill done: {} pages, {} bars kept",
        stats.pages,
        stats.kept_bars
    );

    Ok((bars, stats))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio_test::assert_err;
    use crate::api::{AdaptiveRateLimiter, ConnectorHandle, PaperConnector};
    use crate::config::DownloadSettings;
    use crate::error::ConnectorError;
    use crate::persistence::BarCache;
    use chrono::{Duration, TimeZone};
    use std::sync::Arc;
    use std::time::Duration as StdDuration;

    async fn coordinator(paper: &PaperConnector, dir: &std::path::Path) -> DownloadCoordinator {
        let (handle, _task) = ConnectorHandle::spawn(paper.clone()).await.unwrap();
        DownloadCoordinator::new(
            handle,
            BarCache::new(dir.join("cache")),
            Arc::new(AdaptiveRateLimiter::new(
                StdDuration::from_millis(1),
                StdDuration::from_millis(1),
                StdDuration::from_millis(5),
            )),
            DownloadSettings {
                requests_per_minute: None,
                ..DownloadSettings::default()
            },
        )
    }

    /// One bar per day, newest on 2024-06-30
    fn one_bar_per_day(days: i64) -> Vec<Bar> {
        let last = Utc.with_ymd_and_hms(2024, 6, 30, 15, 0, 0).unwrap();
        (0..days)
            .map(|d| Bar::flat(last - Duration::days(d), 100.0 + d as f64, 1))
            .collect()
    }

    #[test]
    fn test_page_budget() {
        assert_eq!(max_backfill_pages(4, 1), 10);
        assert_eq!(max_backfill_pages(1000, 1), 78);
        assert_eq!(max_backfill_pages(1000, 0), 78);
    }

    #[tokio::test]
    async fn test_backfill_returns_most_recent_target() {
        let dir = tempfile::tempdir().unwrap();
        let paper = PaperConnector::new();
        paper.set_fine_bars("NASDAQ:AAPL", one_bar_per_day(20));
        let coord = coordinator(&paper, dir.path()).await;

        let (bars, stats) = backfill_symbol(&coord, "NASDAQ:AAPL", 5, 1).await.unwrap();

        assert_eq!(bars.len(), 5);
        assert_eq!(stats.pages, 5);
        assert!(bars.windows(2).all(|w| w[0].timestamp < w[1].timestamp));
        assert_eq!(bars.last().unwrap().timestamp, Utc.with_ymd_and_hms(2024, 6, 30, 15, 0, 0).unwrap());
    }

    #[tokio::test]
    async fn test_backfill_stops_when_history_exhausted() {
        let dir = tempfile::tempdir().unwrap();
        let paper = PaperConnector::new();
        paper.set_fine_bars("NASDAQ:AAPL", one_bar_per_day(3));
        let coord = coordinator(&paper, dir.path()).await;

        let (bars, stats) = backfill_symbol(&coord, "NASDAQ:AAPL", 50, 1).await.unwrap();

        assert_eq!(bars.len(), 3);
        // Three pages with data, then an empty one
        assert_eq!(stats.pages, 4);
    }

    #[tokio::test]
    async fn test_backfill_bounded_by_page_budget() {
        let dir = tempfile::tempdir().unwrap();
        let paper = PaperConnector::new();
        paper.set_fine_bars("NASDAQ:AAPL", one_bar_per_day(200));
        let coord = coordinator(&paper, dir.path()).await;

        let (bars, stats) = backfill_symbol(&coord, "NASDAQ:AAPL", 1000, 1).await.unwrap();

        assert_eq!(stats.pages, max_backfill_pages(1000, 1));
        assert_eq!(bars.len(), 78);
    }

    #[tokio::test]
    async fn test_backfill_error_before_any_data() {
        let dir = tempfile::tempdir().unwrap();
        let paper = PaperConnector::new();
        paper.push_error("NASDAQ:AAPL", ConnectorError::Connection("reset".to_string()));
        let coord = coordinator(&paper, dir.path()).await;

        let result = backfill_symbol(&coord, "NASDAQ:AAPL", 5, 1).await;

        let err = assert_err!(result);
        assert!(matches!(err, Error::Connector(_)));
    }
}
