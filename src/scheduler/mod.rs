pub mod clock;
pub mod hourly;
pub mod minute;
pub mod stop;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::time::Duration;
use tokio::task::JoinHandle;

pub use clock::{
    evaluation_window, next_boundary, next_hourly_wake, next_minute_boundary, next_top_of_hour,
    EvaluationWindow, TickKind,
};
pub use hourly::HourLoop;
pub use minute::{MinuteLoop, SymbolSet};
pub use stop::StopSignal;

/// Lifecycle events written to the trace log
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum SchedulerEvent {
    Heartbeat {
        kind: TickKind,
        woke_at: DateTime<Utc>,
    },
    /// Gap since the previous wake exceeded 1.5x the expected interval
    WokeLate {
        expected_secs: i64,
        actual_secs: i64,
        woke_at: DateTime<Utc>,
    },
}

/// Per-symbol work for the minute loop
#[async_trait]
pub trait MinuteTask: Send + Sync {
    async fn fetch(&self, symbol: &str) -> anyhow::Result<()>;

    async fn update(&self, symbol: &str) -> anyhow::Result<()>;
}

/// Work triggered by the hour loop
#[async_trait]
pub trait TickHandler: Send + Sync {
    async fn on_tick(&self, kind: TickKind, woke_at: DateTime<Utc>) -> anyhow::Result<()>;
}

/// Join a loop task, aborting it if it overruns `timeout`
pub async fn join_with_timeout(name: &str, mut handle: JoinHandle<()>, timeout: Duration) {
    match tokio::time::timeout(timeout, &mut handle).await {
        Ok(Ok(())) => tracing::info!("{} stopped", name),
        Ok(Err(e)) => tracing::warn!("{} task failed: {}", name, e),
        Err(_) => {
            tracing::warn!("{} did not stop within {:?}, aborting", name, timeout);
            handle.abort();
        }
    }
}
