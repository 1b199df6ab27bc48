use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tokio::task::JoinHandle;

use super::clock::next_boundary;
use super::{MinuteTask, StopSignal};

/// Tracked symbols, replaceable while the loop runs
#[derive(Debug, Clone, Default)]
pub struct SymbolSet {
    inner: Arc<RwLock<Vec<String>>>,
}

impl SymbolSet {
    pub fn new(symbols: Vec<String>) -> Self {
        Self {
            inner: Arc::new(RwLock::new(symbols)),
        }
    }

    pub async fn replace(&self, symbols: Vec<String>) {
        *self.inner.write().await = symbols;
    }

    pub async fn snapshot(&self) -> Vec<String> {
        self.inner.read().await.clone()
    }
}

/// Wall-clock aligned refresh loop
///
/// Sleeps to the next boundary of `period` (one minute by default), then runs
/// fetch and update for each tracked symbol in order. Per-symbol errors are
/// logged and do not stop the cycle.
pub struct MinuteLoop {
    symbols: SymbolSet,
    task: Arc<dyn MinuteTask>,
    stop: StopSignal,
    period: Duration,
    max_chunk: Duration,
}

impl MinuteLoop {
    pub fn new(symbols: SymbolSet, task: Arc<dyn MinuteTask>, stop: StopSignal) -> Self {
        Self {
            symbols,
            task,
            stop,
            period: Duration::from_secs(60),
            max_chunk: Duration::from_secs(5),
        }
    }

    pub fn with_period(mut self, period: Duration) -> Self {
        self.period = period;
        self
    }

    pub fn with_max_chunk(mut self, max_chunk: Duration) -> Self {
        self.max_chunk = max_chunk;
        self
    }

    /// One pass over the tracked symbols. Returns how many completed both steps.
    pub async fn run_once(&self) -> usize {
        let symbols = self.symbols.snapshot().await;
        let mut ok = 0;

        for symbol in &symbols {
            if self.stop.is_stopped() {
                break;
            }
            if let Err(e) = self.task.fetch(symbol).await {
                tracing::warn!(symbol = %symbol, "Minute fetch failed: {:#}", e);
                continue;
            }
            match self.task.update(symbol).await {
                Ok(()) => ok += 1,
                Err(e) => tracing::warn!(symbol = %symbol, "Minute update failed: {:#}", e),
            }
        }

        tracing::debug!("Minute cycle: {}/{} symbols updated", ok, symbols.len());
        ok
    }

    pub async fn run(self) {
        let period = chrono::Duration::from_std(self.period).unwrap_or(chrono::Duration::minutes(1));
        tracing::info!("Minute loop started ({:?} period)", self.period);

        loop {
            let now = Utc::now();
            let wait = (next_boundary(now, period) - now)
                .to_std()
                .unwrap_or(Duration::ZERO);
            if !self.stop.sleep_chunked(wait, self.max_chunk).await {
                break;
            }
            self.run_once().await;
        }

        tracing::info!("Minute loop exiting");
    }

    pub fn spawn(self) -> JoinHandle<()> {
        tokio::spawn(self.run())
    }
}
