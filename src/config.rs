//! Runtime settings.
//!
//! Loaded from an optional `sellmanager.toml` plus `SELLMANAGER__*`
//! environment variables (e.g. `SELLMANAGER__DOWNLOAD__WORKERS=4`).

use crate::error::{Error, Result};
use crate::models::ExecutionMode;
use chrono_tz::Tz;
use config::{Config, Environment, File};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Settings {
    /// Root for cache files and logs
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,
    /// Allow real orders (still gated by confirmation)
    #[serde(default)]
    pub live: bool,
    #[serde(default)]
    pub logging: LoggingSettings,
    #[serde(default)]
    pub download: DownloadSettings,
    #[serde(default)]
    pub rate_limit: RateLimitSettings,
    #[serde(default)]
    pub scheduler: SchedulerSettings,
    #[serde(default)]
    pub orders: OrderSettings,
}

fn default_data_dir() -> PathBuf {
    PathBuf::from("data")
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
            live: false,
            logging: LoggingSettings::default(),
            download: DownloadSettings::default(),
            rate_limit: RateLimitSettings::default(),
            scheduler: SchedulerSettings::default(),
            orders: OrderSettings::default(),
        }
    }
}

impl Settings {
    /// Load settings. `path` overrides the default optional `sellmanager.toml`.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        dotenvy::dotenv().ok();

        let file = match path {
            Some(p) => File::from(p).required(true),
            None => File::with_name("sellmanager").required(false),
        };

        let settings = Config::builder()
            .add_source(file)
            .add_source(
                Environment::with_prefix("SELLMANAGER")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?
            .try_deserialize::<Settings>()?;

        settings.validate()?;
        Ok(settings)
    }

    pub fn validate(&self) -> Result<()> {
        if self.download.workers == 0 || self.download.concurrency == 0 {
            return Err(Error::InvalidInput(
                "download workers and concurrency must be > 0".to_string(),
            ));
        }
        if self.download.batch_size == 0 {
            return Err(Error::InvalidInput("batch_size must be > 0".to_string()));
        }
        let rl = &self.rate_limit;
        if !(rl.floor_ms <= rl.initial_delay_ms && rl.initial_delay_ms <= rl.ceiling_ms) {
            return Err(Error::InvalidInput(format!(
                "rate limit must satisfy floor <= initial <= ceiling (got {} / {} / {})",
                rl.floor_ms, rl.initial_delay_ms, rl.ceiling_ms
            )));
        }
        if self.scheduler.close_hour > 23 {
            return Err(Error::InvalidInput(format!(
                "close_hour out of range: {}",
                self.scheduler.close_hour
            )));
        }
        self.scheduler.timezone()?;
        Ok(())
    }

    pub fn execution_mode(&self) -> ExecutionMode {
        if self.live {
            ExecutionMode::Live
        } else {
            ExecutionMode::Simulate
        }
    }

    pub fn cache_dir(&self) -> PathBuf {
        self.data_dir.join("cache")
    }

    pub fn failures_path(&self) -> PathBuf {
        self.data_dir.join("download_failures.jsonl")
    }

    pub fn logs_dir(&self) -> PathBuf {
        self.data_dir.join("logs")
    }

    pub fn signals_log_path(&self) -> PathBuf {
        self.logs_dir().join("signals.jsonl")
    }

    pub fn trace_log_path(&self) -> PathBuf {
        self.logs_dir().join("trace.jsonl")
    }

    pub fn snapshot_log_path(&self) -> PathBuf {
        self.logs_dir().join("minute_snapshot.jsonl")
    }

    pub fn orders_log_path(&self) -> PathBuf {
        self.logs_dir().join("orders.jsonl")
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingSettings {
    pub level: String,
    /// "pretty" or "json"
    pub format: String,
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: "pretty".to_string(),
        }
    }
}

impl LoggingSettings {
    pub fn is_json(&self) -> bool {
        self.format.eq_ignore_ascii_case("json")
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DownloadSettings {
    /// Background queue workers
    pub workers: usize,
    /// Concurrent connector calls
    pub concurrency: usize,
    pub batch_size: usize,
    /// Pause between daily batches
    pub batch_delay_secs: f64,
    pub fine_lookback_days: u32,
    pub daily_lookback_days: u32,
    /// Days requested per backfill page
    pub backfill_page_days: u32,
    /// Fine bars kept by the snapshot's fallback backfill
    pub backfill_target: usize,
    /// Worker dequeue poll timeout
    pub queue_poll_ms: u64,
    pub stop_timeout_ms: u64,
    /// Optional burst quota on top of the adaptive delay
    pub requests_per_minute: Option<u32>,
}

impl Default for DownloadSettings {
    fn default() -> Self {
        Self {
            workers: 2,
            concurrency: 4,
            batch_size: 32,
            batch_delay_secs: 6.0,
            fine_lookback_days: 1,
            daily_lookback_days: 2,
            backfill_page_days: 5,
            backfill_target: 4,
            queue_poll_ms: 1000,
            stop_timeout_ms: 2000,
            requests_per_minute: Some(60),
        }
    }
}

impl DownloadSettings {
    pub fn batch_delay(&self) -> Duration {
        Duration::from_secs_f64(self.batch_delay_secs.max(0.0))
    }

    pub fn queue_poll(&self) -> Duration {
        Duration::from_millis(self.queue_poll_ms)
    }

    pub fn stop_timeout(&self) -> Duration {
        Duration::from_millis(self.stop_timeout_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RateLimitSettings {
    pub initial_delay_ms: u64,
    pub floor_ms: u64,
    pub ceiling_ms: u64,
}

impl Default for RateLimitSettings {
    fn default() -> Self {
        Self {
            initial_delay_ms: 100,
            floor_ms: 10,
            ceiling_ms: 30_000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerSettings {
    /// IANA name of the venue timezone
    pub timezone: String,
    /// Venue regular-session open (local)
    pub open_hour: u32,
    pub open_minute: u32,
    /// Venue close hour (local)
    pub close_hour: u32,
    /// How far ahead of the close hour the pre-close tick fires
    pub preclose_lead_secs: u64,
    /// Longest uninterrupted sleep before re-checking the stop signal
    pub max_chunk_ms: u64,
    pub stop_timeout_ms: u64,
}

impl Default for SchedulerSettings {
    fn default() -> Self {
        Self {
            timezone: "America/New_York".to_string(),
            open_hour: 9,
            open_minute: 30,
            close_hour: 16,
            preclose_lead_secs: 5,
            max_chunk_ms: 5000,
            stop_timeout_ms: 2000,
        }
    }
}

impl SchedulerSettings {
    pub fn timezone(&self) -> Result<Tz> {
        self.timezone
            .parse::<Tz>()
            .map_err(|e| Error::InvalidInput(format!("bad timezone {}: {}", self.timezone, e)))
    }

    pub fn preclose_lead(&self) -> Duration {
        Duration::from_secs(self.preclose_lead_secs)
    }

    pub fn max_chunk(&self) -> Duration {
        Duration::from_millis(self.max_chunk_ms.max(1))
    }

    pub fn stop_timeout(&self) -> Duration {
        Duration::from_millis(self.stop_timeout_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OrderSettings {
    pub fill_timeout_ms: u64,
    pub poll_interval_ms: u64,
    pub cancel_verify_attempts: u32,
    pub cancel_verify_delay_ms: u64,
    /// How long to look for an order in open orders when no trade handle came back
    pub reconcile_window_ms: u64,
}

impl Default for OrderSettings {
    fn default() -> Self {
        Self {
            fill_timeout_ms: 15_000,
            poll_interval_ms: 500,
            cancel_verify_attempts: 5,
            cancel_verify_delay_ms: 1500,
            reconcile_window_ms: 2000,
        }
    }
}

impl OrderSettings {
    pub fn fill_timeout(&self) -> Duration {
        Duration::from_millis(self.fill_timeout_ms)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms.max(1))
    }

    pub fn cancel_verify_delay(&self) -> Duration {
        Duration::from_millis(self.cancel_verify_delay_ms)
    }

    pub fn reconcile_window(&self) -> Duration {
        Duration::from_millis(self.reconcile_window_ms)
    }
}
