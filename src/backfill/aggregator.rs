use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::models::{Bar, Granularity};

/// Bar record as it arrives from an untyped source (timestamp still a string)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawBar {
    pub timestamp: String,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    #[serde(default)]
    pub volume: u64,
}

impl RawBar {
    /// Parse into a typed bar. Accepts RFC 3339, `YYYY-MM-DD HH:MM:SS` (UTC) and `YYYY-MM-DD`.
    pub fn parse(&self) -> Option<Bar> {
        let ts = parse_timestamp(&self.timestamp)?;
        Some(Bar::new(ts, self.open, self.high, self.low, self.close, self.volume))
    }
}

fn parse_timestamp(raw: &str) -> Option<DateTime<Utc>> {
    let raw = raw.trim();
    if let Ok(dt) = DateTime::parse_from_rfc3339(raw) {
        return Some(dt.with_timezone(&Utc));
    }
    if let Ok(naive) = NaiveDateTime::parse_from_str(raw, "%Y-%m-%d %H:%M:%S") {
        return Some(naive.and_utc());
    }
    NaiveDate::parse_from_str(raw, "%Y-%m-%d")
        .ok()
        .and_then(|d| d.and_hms_opt(0, 0, 0))
        .map(|naive| naive.and_utc())
}

/// Rolls fine bars up into coarser buckets
///
/// Buckets are aligned to UTC boundaries:
/// - Hourly: minutes and seconds truncated
/// - Daily: truncated to midnight UTC
pub struct BarAggregator {
    target: Granularity,
}

impl BarAggregator {
    /// Create an aggregator for the given target granularity
    pub fn new(target: Granularity) -> Self {
        Self { target }
    }

    pub fn hourly() -> Self {
        Self::new(Granularity::Hourly)
    }

    pub fn daily() -> Self {
        Self::new(Granularity::Daily)
    }

    pub fn target(&self) -> Granularity {
        self.target
    }

    /// Aggregate bars in any order into ascending target-granularity bars
    ///
    /// Duplicate timestamps keep the last one seen. Each output bar carries its bucket start.
    pub fn aggregate(&self, bars: &[Bar]) -> Vec<Bar> {
        let deduped = dedupe_keep_last(bars);
        self.bucket_into_windows(deduped)
            .into_iter()
            .filter_map(|(bucket_start, members)| synthesize_bar(bucket_start, &members))
            .collect()
    }

    /// Same as [`aggregate`](Self::aggregate) for untyped records. Unparsable timestamps are dropped.
    pub fn aggregate_raw(&self, raw: &[RawBar]) -> Vec<Bar> {
        let mut dropped = 0usize;
        let bars: Vec<Bar> = raw
            .iter()
            .filter_map(|r| {
                let parsed = r.parse();
                if parsed.is_none() {
                    dropped += 1;
                }
                parsed
            })
            .collect();

        if dropped > 0 {
            tracing::debug!("Dropped {} raw bars with unparsable timestamps", dropped);
        }

        self.aggregate(&bars)
    }

    /// Group bars by bucket start (seconds since epoch)
    fn bucket_into_windows(&self, bars: Vec<Bar>) -> BTreeMap<i64, Vec<Bar>> {
        let width = self.target.bucket_secs();
        let mut buckets: BTreeMap<i64, Vec<Bar>> = BTreeMap::new();

        for bar in bars {
            let bucket = bar.timestamp.timestamp().div_euclid(width) * width;
            buckets.entry(bucket).or_default().push(bar);
        }

        buckets
    }
}

/// Dedupe by exact timestamp, later entries win. Output ascending.
fn dedupe_keep_last(bars: &[Bar]) -> Vec<Bar> {
    let mut by_ts: BTreeMap<DateTime<Utc>, Bar> = BTreeMap::new();
    for bar in bars {
        by_ts.insert(bar.timestamp, bar.clone());
    }
    by_ts.into_values().collect()
}

/// Members arrive sorted by timestamp
fn synthesize_bar(bucket_start: i64, members: &[Bar]) -> Option<Bar> {
    let first = members.first()?;
    let last = members.last()?;
    let timestamp = DateTime::from_timestamp(bucket_start, 0)?;

    Some(Bar {
        timestamp,
        open: first.open,
        high: members.iter().fold(f64::NEG_INFINITY, |a, b| a.max(b.high)),
        low: members.iter().fold(f64::INFINITY, |a, b| a.min(b.low)),
        close: last.close,
        volume: members.iter().map(|b| b.volume).sum(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn create_test_bar(h: u32, m: u32, open: f64, high: f64, low: f64, close: f64, volume: u64) -> Bar {
        Bar::new(
            Utc.with_ymd_and_hms(2024, 3, 4, h, m, 0).unwrap(),
            open,
            high,
            low,
            close,
            volume,
        )
    }

    #[test]
    fn test_aggregate_empty() {
        assert!(BarAggregator::hourly().aggregate(&[]).is_empty());
    }

    #[test]
    fn test_two_fine_bars_make_one_hour() {
        let bars = vec![
            create_test_bar(10, 0, 10.0, 12.0, 9.0, 11.0, 100),
            create_test_bar(10, 30, 11.0, 13.0, 10.0, 12.0, 50),
        ];

        let hourly = BarAggregator::hourly().aggregate(&bars);

        assert_eq!(hourly, vec![create_test_bar(10, 0, 10.0, 13.0, 9.0, 12.0, 150)]);
    }

    #[test]
    fn test_half_hour_closes_roll_into_hour() {
        let bars = vec![
            create_test_bar(9, 0, 8.0, 8.0, 8.0, 8.0, 100),
            create_test_bar(9, 30, 9.0, 9.0, 9.0, 9.0, 50),
        ];

        let hourly = BarAggregator::hourly().aggregate(&bars);

        assert_eq!(hourly, vec![create_test_bar(9, 0, 8.0, 9.0, 8.0, 9.0, 150)]);
    }

    #[test]
    fn test_out_of_order_input_sorted_within_bucket() {
        let bars = vec![
            create_test_bar(11, 30, 21.0, 22.0, 20.5, 21.5, 5),
            create_test_bar(10, 30, 11.0, 13.0, 10.0, 12.0, 50),
            create_test_bar(11, 0, 20.0, 21.0, 19.0, 20.5, 7),
            create_test_bar(10, 0, 10.0, 12.0, 9.0, 11.0, 100),
        ];

        let hourly = BarAggregator::hourly().aggregate(&bars);

        assert_eq!(hourly.len(), 2);
        assert_eq!(hourly[0].open, 10.0);
        assert_eq!(hourly[0].close, 12.0);
        assert_eq!(hourly[1].timestamp, Utc.with_ymd_and_hms(2024, 3, 4, 11, 0, 0).unwrap());
        assert_eq!(hourly[1].open, 20.0);
        assert_eq!(hourly[1].close, 21.5);
        assert_eq!(hourly[1].volume, 12);
    }

    #[test]
    fn test_duplicate_timestamp_keeps_last() {
        let bars = vec![
            create_test_bar(10, 0, 10.0, 12.0, 9.0, 11.0, 100),
            create_test_bar(10, 0, 10.5, 12.5, 9.5, 11.5, 200),
        ];

        let hourly = BarAggregator::hourly().aggregate(&bars);

        assert_eq!(hourly.len(), 1);
        assert_eq!(hourly[0].close, 11.5);
        assert_eq!(hourly[0].volume, 200);
    }

    #[test]
    fn test_aggregate_is_idempotent() {
        let bars = vec![
            create_test_bar(9, 30, 9.0, 9.5, 8.5, 9.2, 10),
            create_test_bar(10, 0, 10.0, 12.0, 9.0, 11.0, 100),
            create_test_bar(10, 30, 11.0, 13.0, 10.0, 12.0, 50),
            create_test_bar(13, 30, 14.0, 14.0, 13.0, 13.5, 1),
        ];
        let agg = BarAggregator::hourly();

        let once = agg.aggregate(&bars);
        let twice = agg.aggregate(&once);

        assert_eq!(once, twice);
    }

    #[test]
    fn test_hourly_input_is_degenerate_case() {
        let hourly_input = vec![
            create_test_bar(10, 0, 10.0, 12.0, 9.0, 11.0, 100),
            create_test_bar(11, 0, 11.0, 11.5, 10.0, 10.5, 80),
        ];

        let out = BarAggregator::hourly().aggregate(&hourly_input);

        assert_eq!(out, hourly_input);
    }

    #[test]
    fn test_daily_truncates_to_midnight_utc() {
        let bars = vec![
            create_test_bar(14, 30, 10.0, 10.0, 10.0, 10.0, 1),
            create_test_bar(20, 0, 12.0, 12.0, 12.0, 12.0, 1),
        ];

        let daily = BarAggregator::daily().aggregate(&bars);

        assert_eq!(daily.len(), 1);
        assert_eq!(daily[0].timestamp, Utc.with_ymd_and_hms(2024, 3, 4, 0, 0, 0).unwrap());
        assert_eq!(daily[0].open, 10.0);
        assert_eq!(daily[0].close, 12.0);
    }

    #[test]
    fn test_aggregate_raw_drops_unparsable() {
        let raw = vec![
            RawBar {
                timestamp: "2024-03-04T10:00:00Z".to_string(),
                open: 10.0,
                high: 12.0,
                low: 9.0,
                close: 11.0,
                volume: 100,
            },
            RawBar {
                timestamp: "not a date".to_string(),
                open: 99.0,
                high: 99.0,
                low: 99.0,
                close: 99.0,
                volume: 1,
            },
            RawBar {
                timestamp: "2024-03-04 10:30:00".to_string(),
                open: 11.0,
                high: 13.0,
                low: 10.0,
                close: 12.0,
                volume: 50,
            },
        ];

        let hourly = BarAggregator::hourly().aggregate_raw(&raw);

        assert_eq!(hourly, vec![create_test_bar(10, 0, 10.0, 13.0, 9.0, 12.0, 150)]);
    }

    #[test]
    fn test_raw_date_only_parses_to_midnight() {
        let raw = RawBar {
            timestamp: "2024-03-04".to_string(),
            open: 1.0,
            high: 1.0,
            low: 1.0,
            close: 1.0,
            volume: 0,
        };
        let bar = raw.parse().unwrap();
        assert_eq!(bar.timestamp, Utc.with_ymd_and_hms(2024, 3, 4, 0, 0, 0).unwrap());
    }
}
