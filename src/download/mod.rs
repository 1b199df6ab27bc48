pub mod queue;

use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Instant;

use chrono::{DateTime, Utc};
use serde_json::json;
use tokio::sync::{Mutex, Semaphore};
use tokio::task::JoinSet;

use crate::api::{AdaptiveRateLimiter, BurstQuota, ConnectorHandle, ConnectorResult};
use crate::backfill::BarValidator;
use crate::config::DownloadSettings;
use crate::error::{ConnectorError, Error, Result};
use crate::models::{Bar, DownloadKind, SeriesKey};
use crate::persistence::{BarCache, JsonlLog};

pub use queue::{DownloadQueue, RetryStats};

/// Result of one guarded connector call
#[derive(Debug)]
pub enum FetchOutcome {
    Bars(Vec<Bar>),
    /// Request succeeded but returned nothing
    Empty,
    Failed(ConnectorError),
}

impl FetchOutcome {
    /// Bars, or an empty vec for Empty/Failed
    pub fn into_bars(self) -> Vec<Bar> {
        match self {
            FetchOutcome::Bars(bars) => bars,
            _ => Vec::new(),
        }
    }

    pub fn is_failed(&self) -> bool {
        matches!(self, FetchOutcome::Failed(_))
    }
}

/// Every connector bar request goes through here
///
/// Bounds concurrency with a semaphore, applies the optional burst quota and
/// the adaptive delay, feeds the outcome back into the limiter and merges into
/// the cache under a per-key lock.
pub struct DownloadCoordinator {
    connector: ConnectorHandle,
    cache: BarCache,
    limiter: Arc<AdaptiveRateLimiter>,
    quota: Option<BurstQuota>,
    permits: Semaphore,
    validator: BarValidator,
    key_locks: StdMutex<HashMap<SeriesKey, Arc<Mutex<()>>>>,
    trace: Option<Arc<JsonlLog>>,
    settings: DownloadSettings,
}

impl DownloadCoordinator {
    pub fn new(
        connector: ConnectorHandle,
        cache: BarCache,
        limiter: Arc<AdaptiveRateLimiter>,
        settings: DownloadSettings,
    ) -> Self {
        let quota = settings.requests_per_minute.and_then(BurstQuota::per_minute);
        Self {
            connector,
            cache,
            limiter,
            quota,
            permits: Semaphore::new(settings.concurrency.max(1)),
            validator: BarValidator::new(),
            key_locks: StdMutex::new(HashMap::new()),
            trace: None,
            settings,
        }
    }

    /// Emit download_done / download_failed events to `trace`
    pub fn with_trace(mut self, trace: Arc<JsonlLog>) -> Self {
        self.trace = Some(trace);
        self
    }

    pub fn cache(&self) -> &BarCache {
        &self.cache
    }

    pub fn connector(&self) -> &ConnectorHandle {
        &self.connector
    }

    pub fn limiter(&self) -> &Arc<AdaptiveRateLimiter> {
        &self.limiter
    }

    pub fn settings(&self) -> &DownloadSettings {
        &self.settings
    }

    /// Fetch the configured lookback for `symbol`
    pub async fn fetch(&self, symbol: &str, kind: DownloadKind) -> FetchOutcome {
        match kind {
            DownloadKind::Daily => {
                let days = self.settings.daily_lookback_days;
                self.guarded(symbol, kind, self.connector.fetch_daily_bars(symbol, days))
                    .await
            }
            DownloadKind::Fine => {
                self.fetch_fine(symbol, self.settings.fine_lookback_days, None)
                    .await
            }
        }
    }

    pub async fn fetch_fine(
        &self,
        symbol: &str,
        lookback_days: u32,
        end_before: Option<DateTime<Utc>>,
    ) -> FetchOutcome {
        self.guarded(
            symbol,
            DownloadKind::Fine,
            self.connector
                .fetch_fine_bars(symbol, lookback_days, end_before),
        )
        .await
    }

    async fn guarded<F>(&self, symbol: &str, kind: DownloadKind, call: F) -> FetchOutcome
    where
        F: Future<Output = ConnectorResult<Vec<Bar>>>,
    {
        let Ok(_permit) = self.permits.acquire().await else {
            return FetchOutcome::Failed(ConnectorError::Other("download permits closed".to_string()));
        };

        if let Some(quota) = &self.quota {
            quota.until_ready().await;
        }
        tokio::time::sleep(self.limiter.delay()).await;

        let started = Instant::now();
        let result = call.await;
        let duration_ms = started.elapsed().as_millis() as u64;

        match result {
            Ok(bars) if bars.is_empty() => {
                self.limiter.on_failure("empty_response");
                tracing::debug!(symbol = %symbol, kind = ?kind, "Empty response");
                self.trace_event(
                    "download_done",
                    json!({"symbol": symbol, "kind": kind, "bars": 0, "duration_ms": duration_ms}),
                )
                .await;
                FetchOutcome::Empty
            }
            Ok(bars) => {
                self.limiter.on_success();
                let (bars, rejected) = self.validator.filter_valid(symbol, bars);
                self.trace_event(
                    "download_done",
                    json!({
                        "symbol": symbol,
                        "kind": kind,
                        "bars": bars.len(),
                        "rejected": rejected,
                        "duration_ms": duration_ms,
                    }),
                )
                .await;
                if bars.is_empty() {
                    FetchOutcome::Empty
                } else {
                    FetchOutcome::Bars(bars)
                }
            }
            Err(e) => {
                self.limiter.on_failure(&e.to_string());
                tracing::warn!(symbol = %symbol, kind = ?kind, "Download failed: {}", e);
                self.trace_event(
                    "download_failed",
                    json!({
                        "symbol": symbol,
                        "kind": kind,
                        "error": e.to_string(),
                        "duration_ms": duration_ms,
                    }),
                )
                .await;
                FetchOutcome::Failed(e)
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

    fn key_lock(&self, key: &SeriesKey) -> Arc<Mutex<()>> {
        let mut locks = self
            .key_locks
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        locks.entry(key.clone()).or_default().clone()
    }

    /// Merge into the cache with the key's writer lock held
    pub async fn merge_bars(&self, key: &SeriesKey, bars: &[Bar]) -> Result<usize> {
        let lock = self.key_lock(key);
        let _guard = lock.lock().await;
        self.cache.merge(key, bars).await
    }

    /// Fetch and merge. Returns bars received (0 for an empty response).
    pub async fn fetch_and_merge(&self, symbol: &str, kind: DownloadKind) -> Result<usize> {
        match self.fetch(symbol, kind).await {
            FetchOutcome::Bars(bars) => {
                let key = SeriesKey::new(symbol, kind.granularity());
                self.merge_bars(&key, &bars).await?;
                Ok(bars.len())
            }
            FetchOutcome::Empty => Ok(0),
            FetchOutcome::Failed(e) => Err(Error::Connector(e)),
        }
    }

    /// Daily bars for many symbols, in fixed-size batches
    ///
    /// Fetches inside a batch run concurrently (bounded by the semaphore). The
    /// inter-batch delay is applied between batches only. Every requested
    /// symbol is present in the result; failures map to an empty vec.
    pub async fn batch_daily(self: &Arc<Self>, symbols: &[String]) -> HashMap<String, Vec<Bar>> {
        let mut results: HashMap<String, Vec<Bar>> = HashMap::new();
        let batches: Vec<&[String]> = symbols.chunks(self.settings.batch_size.max(1)).collect();
        let total = batches.len();

        for (i, batch) in batches.into_iter().enumerate() {
            let mut set = JoinSet::new();
            for symbol in batch {
                let this = Arc::clone(self);
                let symbol = symbol.clone();
                set.spawn(async move {
                    let outcome = this.fetch(&symbol, DownloadKind::Daily).await;
                    (symbol, outcome.into_bars())
                });
            }

            while let Some(joined) = set.join_next().await {
                match joined {
                    Ok((symbol, bars)) => {
                        results.insert(symbol, bars);
                    }
                    Err(e) => tracing::warn!("Daily batch task failed: {}", e),
                }
            }

            tracing::info!("Daily batch {}/{} done ({} symbols)", i + 1, total, batch.len());

            if i + 1 < total {
                tokio::time::sleep(self.settings.batch_delay()).await;
            }
        }

        for symbol in symbols {
            results.entry(symbol.clone()).or_default();
        }
        results
    }
}
