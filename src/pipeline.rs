//! Glue between the scheduler loops and the data/signal/execution services.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::sync::Arc;

use crate::backfill::BarAggregator;
use crate::download::DownloadCoordinator;
use crate::error::Result;
use crate::execution::{ExecutionReport, Executor};
use crate::models::{Decision, DownloadKind, Granularity, SeriesKey, SignalEntry};
use crate::scheduler::{EvaluationWindow, MinuteTask, TickHandler, TickKind};
use crate::signals::SignalEngine;
use crate::snapshot::{SnapshotBuilder, SnapshotRecord};

/// Minute-loop work: pull the latest fine bars, then roll them into hourly
pub struct CacheRefresh {
    coordinator: Arc<DownloadCoordinator>,
    aggregator: BarAggregator,
}

impl CacheRefresh {
    pub fn new(coordinator: Arc<DownloadCoordinator>) -> Self {
        Self {
            coordinator,
            aggregator: BarAggregator::hourly(),
        }
    }
}

#[async_trait]
impl MinuteTask for CacheRefresh {
    async fn fetch(&self, symbol: &str) -> anyhow::Result<()> {
        let received = self
            .coordinator
            .fetch_and_merge(symbol, DownloadKind::Fine)
            .await?;
        tracing::debug!(symbol = %symbol, "Fetched {} fine bars", received);
        Ok(())
    }

    async fn update(&self, symbol: &str) -> anyhow::Result<()> {
        let fine = self
            .coordinator
            .cache()
            .load(&SeriesKey::new(symbol, Granularity::Fine), None)
            .await?;
        let hourly = self.aggregator.aggregate(&fine);
        if !hourly.is_empty() {
            self.coordinator
                .merge_bars(&SeriesKey::new(symbol, Granularity::Hourly), &hourly)
                .await?;
        }
        Ok(())
    }
}

/// What one evaluation cycle produced
#[derive(Debug)]
pub struct CycleSummary {
    pub snapshot: SnapshotRecord,
    pub signals: Vec<SignalEntry>,
    pub executions: Vec<ExecutionReport>,
}

impl CycleSummary {
    pub fn sell_count(&self) -> usize {
        self.signals
            .iter()
            .filter(|s| s.decision == Decision::SellSignal)
            .count()
    }
}

/// Hour-loop work: snapshot, evaluate, and hand sell signals to the executor
pub struct EvaluationCycle {
    snapshot: SnapshotBuilder,
    engine: SignalEngine,
    executor: Option<Executor>,
}

impl EvaluationCycle {
    pub fn new(snapshot: SnapshotBuilder, engine: SignalEngine) -> Self {
        Self {
            snapshot,
            engine,
            executor: None,
        }
    }

    pub fn with_executor(mut self, executor: Executor) -> Self {
        self.executor = Some(executor);
        self
    }

    pub async fn run_cycle(&self, at: DateTime<Utc>, window: EvaluationWindow) -> Result<CycleSummary> {
        let snapshot = self.snapshot.take(at).await?;
        let signals = self.engine.evaluate_rows(&snapshot.rows, &window).await?;

        let mut executions = Vec::new();
        if let Some(executor) = &self.executor {
            for entry in signals.iter().filter(|e| e.decision == Decision::SellSignal) {
                match executor.handle(entry).await {
                    Ok(report) => executions.push(report),
                    Err(e) => tracing::warn!(ticker = %entry.ticker, "Execution failed: {}", e),
                }
            }
        }

        Ok(CycleSummary {
            snapshot,
            signals,
            executions,
        })
    }
}

#[async_trait]
impl TickHandler for EvaluationCycle {
    async fn on_tick(&self, kind: TickKind, woke_at: DateTime<Utc>) -> anyhow::Result<()> {
        let summary = self
            .run_cycle(woke_at, EvaluationWindow::for_tick(kind))
            .await?;
        tracing::info!(
            "Cycle {:?}: {} signals, {} sells, {} executions",
            kind,
            summary.signals.len(),
            summary.sell_count(),
            summary.executions.len()
        );
        Ok(())
    }
}
