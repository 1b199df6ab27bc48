use chrono::{DateTime, Duration, Utc};
use chrono_tz::Tz;
use std::sync::Arc;
use tokio::task::JoinHandle;

use super::clock::{next_hourly_wake, TickKind};
use super::{SchedulerEvent, StopSignal, TickHandler};
use crate::config::SchedulerSettings;
use crate::error::Result;
use crate::persistence::JsonlLog;

/// Expected gap between hour-loop wakes
const HOUR_INTERVAL_SECS: i64 = 3600;
/// Gap above this multiple of the interval is reported as late
const LATE_FACTOR: f64 = 1.5;

/// Top-of-hour / pre-close loop in venue time
pub struct HourLoop {
    tz: Tz,
    close_hour: u32,
    lead: Duration,
    max_chunk: std::time::Duration,
    handler: Arc<dyn TickHandler>,
    trace: Option<Arc<JsonlLog>>,
    stop: StopSignal,
    last_wake: Option<DateTime<Utc>>,
}

impl HourLoop {
    pub fn new(
        settings: &SchedulerSettings,
        handler: Arc<dyn TickHandler>,
        stop: StopSignal,
    ) -> Result<Self> {
        Ok(Self {
            tz: settings.timezone()?,
            close_hour: settings.close_hour,
            lead: Duration::seconds(settings.preclose_lead_secs as i64),
            max_chunk: settings.max_chunk(),
            handler,
            trace: None,
            stop,
            last_wake: None,
        })
    }

    pub fn with_trace(mut self, trace: Arc<JsonlLog>) -> Self {
        self.trace = Some(trace);
        self
    }

    /// Events for a wake at `woke_at`, updating the previous-wake marker
    pub fn wake_events(&mut self, kind: TickKind, woke_at: DateTime<Utc>) -> Vec<SchedulerEvent> {
        let mut events = Vec::with_capacity(2);

        if let Some(prev) = self.last_wake {
            let gap = (woke_at - prev).num_seconds();
            if gap as f64 > HOUR_INTERVAL_SECS as f64 * LATE_FACTOR {
                events.push(SchedulerEvent::WokeLate {
                    expected_secs: HOUR_INTERVAL_SECS,
                    actual_secs: gap,
                    woke_at,
                });
            }
        }
        self.last_wake = Some(woke_at);

        events.push(SchedulerEvent::Heartbeat { kind, woke_at });
        events
    }

    async fn emit(&self, event: &SchedulerEvent) {
        match event {
            SchedulerEvent::WokeLate { actual_secs, .. } => {
                tracing::warn!("Hour loop woke late ({}s since previous wake)", actual_secs)
            }
            SchedulerEvent::Heartbeat { kind, .. } => tracing::info!("⏰ Hour loop tick: {:?}", kind),
        }
        if let Some(trace) = &self.trace {
            let mut record = serde_json::to_value(event).unwrap_or_default();
            if let Some(obj) = record.as_object_mut() {
                obj.insert("ts".to_string(), serde_json::Value::String(Utc::now().to_rfc3339()));
            }
            if let Err(e) = trace.append(&record).await {
                tracing::warn!("Failed to write scheduler event: {}", e);
            }
        }
    }

    /// Handle one wake: events, then the tick callback (errors logged)
    pub async fn handle_wake(&mut self, kind: TickKind, woke_at: DateTime<Utc>) {
        for event in self.wake_events(kind, woke_at) {
            self.emit(&event).await;
        }
        if let Err(e) = self.handler.on_tick(kind, woke_at).await {
            tracing::warn!("Tick handler failed ({:?}): {:#}", kind, e);
        }
    }

    pub async fn run(mut self) {
        tracing::info!(
            "Hour loop started (tz {}, close hour {})",
            self.tz,
            self.close_hour
        );

        loop {
            let now = Utc::now();
            let (wake, kind) = next_hourly_wake(now, self.tz, self.close_hour, self.lead);
            let wait = (wake - now).to_std().unwrap_or_default();
            tracing::debug!("Hour loop sleeping until {} ({:?})", wake, kind);

            if !self.stop.sleep_chunked(wait, self.max_chunk).await {
                break;
            }
            self.handle_wake(kind, Utc::now()).await;
        }

        tracing::info!("Hour loop exiting");
    }

    pub fn spawn(self) -> JoinHandle<()> {
        tokio::spawn(self.run())
    }
}
