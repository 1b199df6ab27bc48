use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::sync::Arc;
use tokio::time::Instant;

use crate::api::ConnectorHandle;
use crate::config::OrderSettings;
use crate::error::Result;
use crate::models::{LivePosition, OpenOrder, OrderAttempt, OrderStatus, OrderType, TradeHandle, TradeStatus};
use crate::persistence::JsonlLog;

/// Broker state captured around an order
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StateSnapshot {
    pub captured_at: Option<DateTime<Utc>>,
    pub positions: Vec<LivePosition>,
    pub open_orders: Vec<OpenOrder>,
}

/// Outcome of cancelling one leftover order
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CancelVerification {
    pub order_id: String,
    /// Gone from the open-orders list
    pub verified: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Everything that happened to one order attempt
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LifecycleReport {
    pub attempt: OrderAttempt,
    pub order_id: Option<String>,
    /// False when the broker returned no handle and the order never showed up
    pub confirmed: bool,
    pub before: StateSnapshot,
    pub after: StateSnapshot,
    pub cancellations: Vec<CancelVerification>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl LifecycleReport {
    pub fn status(&self) -> OrderStatus {
        self.attempt.status()
    }

    pub fn all_cancels_verified(&self) -> bool {
        self.cancellations.iter().all(|c| c.verified)
    }
}

/// Drives one closing order from placement to a terminal state
///
/// `Placed -> {Filled, Cancelled, Timeout, Error}`. Only a fill triggers
/// cleanup of the symbol's other working orders. Nothing is resubmitted.
pub struct OrderLifecycleManager {
    connector: ConnectorHandle,
    settings: OrderSettings,
    audit: Option<Arc<JsonlLog>>,
}

impl OrderLifecycleManager {
    pub fn new(connector: ConnectorHandle, settings: OrderSettings) -> Self {
        Self {
            connector,
            settings,
            audit: None,
        }
    }

    /// Append every report to `audit`
    pub fn with_audit(mut self, audit: Arc<JsonlLog>) -> Self {
        self.audit = Some(audit);
        self
    }

    pub fn connector(&self) -> &ConnectorHandle {
        &self.connector
    }

    /// Sell `quantity` (the live position size) of `symbol`
    pub async fn close_position(
        &self,
        symbol: &str,
        quantity: f64,
        order_type: OrderType,
    ) -> Result<LifecycleReport> {
        let before = self.capture().await;
        let mut attempt = OrderAttempt::new(symbol, -quantity, order_type.clone());
        let mut order_id = None;
        let mut confirmed = true;
        let mut error = None;

        tracing::info!(symbol = %symbol, "📤 Placing {:?} order for {}", order_type, -quantity);

        let status = match self.connector.place_order(symbol, -quantity, order_type).await {
            Err(e) => {
                tracing::warn!(symbol = %symbol, "Order placement failed: {}", e);
                error = Some(e.to_string());
                OrderStatus::Error
            }
            Ok(Some(handle)) => {
                order_id = Some(handle.order_id.clone());
                let (status, poll_error) = self.wait_for_fill(&handle).await;
                error = poll_error;
                status
            }
            Ok(None) => {
                order_id = self.reconcile(symbol, &before.open_orders).await;
                confirmed = order_id.is_some();
                if !confirmed {
                    tracing::warn!(symbol = %symbol, "No trade handle and order not visible; treating as placed");
                }
                OrderStatus::Placed
            }
        };
        if status != OrderStatus::Placed {
            attempt.transition(status)?;
        }

        let cancellations = if status == OrderStatus::Filled {
            self.cancel_remaining(symbol).await
        } else {
            Vec::new()
        };

        let report = LifecycleReport {
            attempt,
            order_id,
            confirmed,
            before,
            after: self.capture().await,
            cancellations,
            error,
        };

        tracing::info!(
            symbol = %symbol,
            "Order finished: {:?} ({} leftover orders cancelled)",
            report.status(),
            report.cancellations.len()
        );
        if let Some(audit) = &self.audit {
            audit.append(&report).await?;
        }
        Ok(report)
    }

    /// Poll until filled/cancelled or the fill timeout passes
    async fn wait_for_fill(&self, handle: &TradeHandle) -> (OrderStatus, Option<String>) {
        let deadline = Instant::now() + self.settings.fill_timeout();

        loop {
            match self.connector.trade_status(handle).await {
                Ok(TradeStatus::Filled) => return (OrderStatus::Filled, None),
                Ok(TradeStatus::Cancelled) => return (OrderStatus::Cancelled, None),
                Ok(TradeStatus::Pending) => {}
                Err(e) => {
                    tracing::warn!("Status poll failed for {}: {}", handle.order_id, e);
                    return (OrderStatus::Error, Some(e.to_string()));
                }
            }

            if Instant::now() >= deadline {
                tracing::warn!(
                    "Order {} not filled within {:?}",
                    handle.order_id,
                    self.settings.fill_timeout()
                );
                return (OrderStatus::Timeout, None);
            }
            tokio::time::sleep(self.settings.poll_interval()).await;
        }
    }

    /// Look for the order in open orders for a short window
    ///
    /// Orders already working before placement are never taken as the new one.
    async fn reconcile(&self, symbol: &str, known: &[OpenOrder]) -> Option<String> {
        let deadline = Instant::now() + self.settings.reconcile_window();
        let known: HashSet<&str> = known.iter().map(|o| o.order_id.as_str()).collect();

        loop {
            match self.connector.open_orders().await {
                Ok(orders) => {
                    if let Some(order) = orders
                        .iter()
                        .rev()
                        .find(|o| o.matches_symbol(symbol) && !known.contains(o.order_id.as_str()))
                    {
                        return Some(order.order_id.clone());
                    }
                }
                Err(e) => tracing::debug!("Open orders unavailable during reconcile: {}", e),
            }
            if Instant::now() >= deadline {
                return None;
            }
            tokio::time::sleep(self.settings.poll_interval()).await;
        }
    }

    /// Cancel the symbol's working orders and confirm they are gone
    async fn cancel_remaining(&self, symbol: &str) -> Vec<CancelVerification> {
        let orders = match self.connector.open_orders().await {
            Ok(orders) => orders,
            Err(e) => {
                tracing::warn!(symbol = %symbol, "Cannot list open orders after fill: {}", e);
                return Vec::new();
            }
        };

        let mut results: Vec<CancelVerification> = Vec::new();
        for order in orders.iter().filter(|o| o.matches_symbol(symbol)) {
            let error = self
                .connector
                .cancel_order(&order.order_id)
                .await
                .err()
                .map(|e| e.to_string());
            results.push(CancelVerification {
                order_id: order.order_id.clone(),
                verified: false,
                error,
            });
        }
        if results.is_empty() {
            return results;
        }

        let attempts = self.settings.cancel_verify_attempts.max(1);
        for i in 0..attempts {
            if let Ok(open) = self.connector.open_orders().await {
                let still_open: HashSet<&str> = open.iter().map(|o| o.order_id.as_str()).collect();
                for r in results.iter_mut() {
                    r.verified = !still_open.contains(r.order_id.as_str());
                }
            }
            if results.iter().all(|r| r.verified) {
                break;
            }
            if i + 1 < attempts {
                tokio::time::sleep(self.settings.cancel_verify_delay()).await;
            }
        }

        for r in results.iter().filter(|r| !r.verified) {
            tracing::warn!(symbol = %symbol, "Cancel of {} not verified", r.order_id);
        }
        results
    }

    /// Positions and open orders, best-effort
    async fn capture(&self) -> StateSnapshot {
        let positions = self.connector.live_positions().await.unwrap_or_else(|e| {
            tracing::debug!("Positions unavailable for snapshot: {}", e);
            Vec::new()
        });
        let open_orders = self.connector.open_orders().await.unwrap_or_else(|e| {
            tracing::debug!("Open orders unavailable for snapshot: {}", e);
            Vec::new()
        });
        StateSnapshot {
            captured_at: Some(Utc::now()),
            positions,
            open_orders,
        }
    }
}
