use async_trait::async_trait;
use serde::Serialize;
use std::sync::Arc;

use crate::error::{Error, Result};
use crate::execution::{LifecycleReport, OrderLifecycleManager};
use crate::models::{bare_symbol, Decision, ExecutionMode, LivePosition, OrderType, SignalEntry};

#[derive(Debug, Clone, PartialEq)]
pub enum ExecutionAction {
    Execute { quantity: f64 },
    Simulate { quantity: f64 },
    Skip,
}

#[derive(Debug, Clone)]
pub struct ExecutionDecision {
    pub action: ExecutionAction,
    pub reason: String,
}

/// Human sign-off in front of every live order
#[async_trait]
pub trait Confirmation: Send + Sync {
    async fn confirm(&self, entry: &SignalEntry, quantity: f64) -> bool;
}

/// Declines everything
#[derive(Debug, Clone, Copy, Default)]
pub struct AutoDeny;

#[async_trait]
impl Confirmation for AutoDeny {
    async fn confirm(&self, _entry: &SignalEntry, _quantity: f64) -> bool {
        false
    }
}

#[async_trait]
impl<F> Confirmation for F
where
    F: Fn(&SignalEntry, f64) -> bool + Send + Sync,
{
    async fn confirm(&self, entry: &SignalEntry, quantity: f64) -> bool {
        self(entry, quantity)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum ExecutionReport {
    Skipped { ticker: String, reason: String },
    /// Dry run: what would have been sold
    Simulated { ticker: String, quantity: f64 },
    /// Confirmation refused
    Declined { ticker: String, quantity: f64 },
    Completed(LifecycleReport),
}

/// Turns sell signals into order attempts
pub struct Executor {
    orders: OrderLifecycleManager,
    confirmation: Arc<dyn Confirmation>,
    mode: ExecutionMode,
    order_type: OrderType,
}

impl Executor {
    /// Executor with the deny-all confirmation
    pub fn new(orders: OrderLifecycleManager, mode: ExecutionMode) -> Self {
        Self {
            orders,
            confirmation: Arc::new(AutoDeny),
            mode,
            order_type: OrderType::Market,
        }
    }

    pub fn with_confirmation(mut self, confirmation: Arc<dyn Confirmation>) -> Self {
        self.confirmation = confirmation;
        self
    }

    pub fn with_order_type(mut self, order_type: OrderType) -> Self {
        self.order_type = order_type;
        self
    }

    pub fn mode(&self) -> ExecutionMode {
        self.mode
    }

    /// Decide what to do with an evaluated signal
    pub fn process_signal(
        &self,
        entry: &SignalEntry,
        position: Option<&LivePosition>,
    ) -> ExecutionDecision {
        if entry.decision != Decision::SellSignal {
            return ExecutionDecision {
                action: ExecutionAction::Skip,
                reason: format!("No sell signal ({:?})", entry.decision),
            };
        }

        let quantity = position.map(|p| p.quantity).unwrap_or(0.0);
        if quantity == 0.0 {
            return ExecutionDecision {
                action: ExecutionAction::Skip,
                reason: "No position to sell".to_string(),
            };
        }

        match self.mode {
            ExecutionMode::Simulate => ExecutionDecision {
                action: ExecutionAction::Simulate { quantity },
                reason: "Dry run".to_string(),
            },
            ExecutionMode::Live => ExecutionDecision {
                action: ExecutionAction::Execute { quantity },
                reason: format!("Sell signal on {} live units", quantity),
            },
        }
    }

    /// Act on one signal entry against current broker positions
    pub async fn handle(&self, entry: &SignalEntry) -> Result<ExecutionReport> {
        let positions = if entry.decision == Decision::SellSignal {
            self.orders
                .connector()
                .live_positions()
                .await
                .map_err(Error::Connector)?
        } else {
            Vec::new()
        };
        let position = positions
            .iter()
            .find(|p| bare_symbol(&p.symbol) == bare_symbol(&entry.ticker));

        let decision = self.process_signal(entry, position);
        let ticker = entry.ticker.clone();

        match decision.action {
            ExecutionAction::Skip => {
                tracing::debug!(ticker = %ticker, "Not executing: {}", decision.reason);
                Ok(ExecutionReport::Skipped {
                    ticker,
                    reason: decision.reason,
                })
            }
            ExecutionAction::Simulate { quantity } => {
                tracing::info!(ticker = %ticker, "🧪 [DRY RUN] Would sell {}", quantity);
                Ok(ExecutionReport::Simulated { ticker, quantity })
            }
            ExecutionAction::Execute { quantity } => {
                if !self.confirmation.confirm(entry, quantity).await {
                    tracing::info!(ticker = %ticker, "Sell of {} not confirmed", quantity);
                    return Ok(ExecutionReport::Declined { ticker, quantity });
                }
                let report = self
                    .orders
                    .close_position(&ticker, quantity, self.order_type.clone())
                    .await?;
                Ok(ExecutionReport::Completed(report))
            }
        }
    }
}
