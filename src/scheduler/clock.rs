use chrono::{DateTime, Duration, TimeZone, Timelike, Utc};
use chrono_tz::Tz;
use serde::{Deserialize, Serialize};

use crate::models::Timeframe;

/// Which wake-up the hour loop is handling
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TickKind {
    TopOfHour,
    /// A few seconds before the venue close hour
    PreClose,
}

/// Timeframes due for evaluation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct EvaluationWindow {
    pub hourly: bool,
    pub daily: bool,
}

impl EvaluationWindow {
    pub fn for_tick(kind: TickKind) -> Self {
        match kind {
            TickKind::TopOfHour => Self {
                hourly: true,
                daily: false,
            },
            TickKind::PreClose => Self {
                hourly: true,
                daily: true,
            },
        }
    }

    pub fn includes(&self, timeframe: Timeframe) -> bool {
        match timeframe {
            Timeframe::Hourly => self.hourly,
            Timeframe::Daily => self.daily,
        }
    }

    pub fn is_empty(&self) -> bool {
        !self.hourly && !self.daily
    }
}

/// Classify a venue-local wall time
///
/// From `close_hour-1:59:55` through the first minute of `close_hour` both
/// timeframes are due. The first minute of any other hour is hourly only.
/// Anything else is an empty window.
pub fn evaluation_window<T: TimeZone>(local: &DateTime<T>, close_hour: u32, lead_secs: u32) -> EvaluationWindow {
    let secs_of_day = local.num_seconds_from_midnight();
    let close_secs = close_hour * 3600;
    let preclose_start = close_secs.saturating_sub(lead_secs);

    if secs_of_day >= preclose_start && secs_of_day < close_secs + 60 {
        return EvaluationWindow::for_tick(TickKind::PreClose);
    }
    if local.minute() == 0 {
        return EvaluationWindow::for_tick(TickKind::TopOfHour);
    }
    EvaluationWindow::default()
}

/// Next multiple of `period` strictly after `now` (epoch-aligned)
pub fn next_boundary(now: DateTime<Utc>, period: Duration) -> DateTime<Utc> {
    let step = period.num_milliseconds().max(1);
    let ms = now.timestamp_millis();
    let next = ms - ms.rem_euclid(step) + step;
    DateTime::from_timestamp_millis(next).unwrap_or(now + period)
}

/// Next wall-clock minute
pub fn next_minute_boundary(now: DateTime<Utc>) -> DateTime<Utc> {
    next_boundary(now, Duration::minutes(1))
}

/// Next top of the hour in `tz`, strictly after `now`
pub fn next_top_of_hour(now: DateTime<Utc>, tz: Tz) -> DateTime<Utc> {
    let local = now.with_timezone(&tz);
    let into_hour = Duration::seconds((local.minute() * 60 + local.second()) as i64)
        + Duration::nanoseconds(local.nanosecond() as i64);
    let hour_start = local - into_hour;
    (hour_start + Duration::hours(1)).with_timezone(&Utc)
}

/// Next hour-loop wake-up after `now`
///
/// Normally the next top of the hour. When that hour is `close_hour` the wake
/// moves `lead` earlier and becomes a pre-close tick. Wakes already in the
/// past roll forward to the following hour.
pub fn next_hourly_wake(
    now: DateTime<Utc>,
    tz: Tz,
    close_hour: u32,
    lead: Duration,
) -> (DateTime<Utc>, TickKind) {
    let mut target = next_top_of_hour(now, tz);
    loop {
        let (wake, kind) = if target.with_timezone(&tz).hour() == close_hour {
            (target - lead, TickKind::PreClose)
        } else {
            (target, TickKind::TopOfHour)
        };
        if wake > now {
            return (wake, kind);
        }
        target += Duration::hours(1);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono_tz::America::New_York;

    fn ny(y: i32, m: u32, d: u32, h: u32, min: u32, s: u32) -> DateTime<Utc> {
        New_York
            .with_ymd_and_hms(y, m, d, h, min, s)
            .unwrap()
            .with_timezone(&Utc)
    }

    #[test]
    fn test_next_minute_boundary() {
        let now = Utc.with_ymd_and_hms(2024, 3, 4, 10, 15, 42).unwrap();
        assert_eq!(
            next_minute_boundary(now),
            Utc.with_ymd_and_hms(2024, 3, 4, 10, 16, 0).unwrap()
        );
        // Exactly on a boundary moves to the next one
        let on = Utc.with_ymd_and_hms(2024, 3, 4, 10, 16, 0).unwrap();
        assert_eq!(
            next_minute_boundary(on),
            Utc.with_ymd_and_hms(2024, 3, 4, 10, 17, 0).unwrap()
        );
    }

    #[test]
    fn test_next_top_of_hour_in_venue_tz() {
        let now = ny(2024, 3, 4, 10, 15, 0);
        assert_eq!(next_top_of_hour(now, New_York), ny(2024, 3, 4, 11, 0, 0));
    }

    #[test]
    fn test_wake_before_close_is_early() {
        // 15:30 NY -> 15:59:55 pre-close
        let now = ny(2024, 3, 4, 15, 30, 0);
        let (wake, kind) = next_hourly_wake(now, New_York, 16, Duration::seconds(5));
        assert_eq!(wake, ny(2024, 3, 4, 15, 59, 55));
        assert_eq!(kind, TickKind::PreClose);
    }

    #[test]
    fn test_wake_inside_lead_window_rolls_forward() {
        let now = ny(2024, 3, 4, 15, 59, 57);
        let (wake, kind) = next_hourly_wake(now, New_York, 16, Duration::seconds(5));
        assert_eq!(wake, ny(2024, 3, 4, 17, 0, 0));
        assert_eq!(kind, TickKind::TopOfHour);
    }

    #[test]
    fn test_wake_regular_hour() {
        let now = ny(2024, 3, 4, 10, 0, 0);
        let (wake, kind) = next_hourly_wake(now, New_York, 16, Duration::seconds(5));
        assert_eq!(wake, ny(2024, 3, 4, 11, 0, 0));
        assert_eq!(kind, TickKind::TopOfHour);
    }

    #[test]
    fn test_wake_across_dst_change() {
        // 2024-03-10 02:00 NY does not exist; 01:30 EST -> 03:00 EDT
        let now = ny(2024, 3, 10, 1, 30, 0);
        let (wake, _) = next_hourly_wake(now, New_York, 16, Duration::seconds(5));
        assert_eq!(wake, ny(2024, 3, 10, 3, 0, 0));
        assert_eq!(wake - now, Duration::minutes(30));
    }

    #[test]
    fn test_evaluation_window() {
        let at = |h, m, s| New_York.with_ymd_and_hms(2024, 3, 4, h, m, s).unwrap();

        let w = evaluation_window(&at(11, 0, 2), 16, 5);
        assert!(w.includes(Timeframe::Hourly));
        assert!(!w.includes(Timeframe::Daily));

        let w = evaluation_window(&at(15, 59, 55), 16, 5);
        assert!(w.hourly && w.daily);

        let w = evaluation_window(&at(16, 0, 3), 16, 5);
        assert!(w.daily);

        let w = evaluation_window(&at(15, 59, 50), 16, 5);
        assert!(w.is_empty());

        let w = evaluation_window(&at(12, 30, 0), 16, 5);
        assert!(w.is_empty());
    }
}
