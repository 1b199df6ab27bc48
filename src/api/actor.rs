//! Single-owner connector task.
//!
//! The connector lives inside one spawned task. Callers talk to it through a
//! cloneable [`ConnectorHandle`] that sends commands over an `mpsc` queue and
//! awaits `oneshot` replies, so connector calls are serialized.

use chrono::{DateTime, Utc};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

use super::{ConnectorResult, MarketConnector};
use crate::error::ConnectorError;
use crate::models::{Bar, LivePosition, OpenOrder, OrderType, TradeHandle, TradeStatus};

const COMMAND_QUEUE_DEPTH: usize = 64;

type Reply<T> = oneshot::Sender<ConnectorResult<T>>;

enum Command {
    FetchDaily {
        symbol: String,
        lookback_days: u32,
        reply: Reply<Vec<Bar>>,
    },
    FetchFine {
        symbol: String,
        lookback_days: u32,
        end_before: Option<DateTime<Utc>>,
        reply: Reply<Vec<Bar>>,
    },
    Positions {
        reply: Reply<Vec<LivePosition>>,
    },
    OpenOrders {
        reply: Reply<Vec<OpenOrder>>,
    },
    PlaceOrder {
        symbol: String,
        quantity: f64,
        order_type: OrderType,
        reply: Reply<Option<TradeHandle>>,
    },
    CancelOrder {
        order_id: String,
        reply: Reply<()>,
    },
    TradeStatus {
        handle: TradeHandle,
        reply: Reply<TradeStatus>,
    },
    Shutdown {
        reply: Reply<()>,
    },
}

/// Cloneable front for a connector owned by a background task
#[derive(Debug, Clone)]
pub struct ConnectorHandle {
    tx: mpsc::Sender<Command>,
}

impl ConnectorHandle {
    /// Connect, then move the connector into its own task
    ///
    /// A failed connect is returned to the caller and no task is spawned.
    pub async fn spawn<C: MarketConnector>(
        mut connector: C,
    ) -> ConnectorResult<(Self, JoinHandle<()>)> {
        connector.connect().await?;
        tracing::info!("Connector connected");

        let (tx, rx) = mpsc::channel(COMMAND_QUEUE_DEPTH);
        let task = tokio::spawn(run(connector, rx));
        Ok((Self { tx }, task))
    }

    async fn call<T>(&self, build: impl FnOnce(Reply<T>) -> Command) -> ConnectorResult<T> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(build(reply))
            .await
            .map_err(|_| ConnectorError::NotConnected)?;
        rx.await.map_err(|_| ConnectorError::NotConnected)?
    }

    pub async fn fetch_daily_bars(&self, symbol: &str, lookback_days: u32) -> ConnectorResult<Vec<Bar>> {
        let symbol = symbol.to_string();
        self.call(|reply| Command::FetchDaily {
            symbol,
            lookback_days,
            reply,
        })
        .await
    }

    pub async fn fetch_fine_bars(
        &self,
        symbol: &str,
        lookback_days: u32,
        end_before: Option<DateTime<Utc>>,
    ) -> ConnectorResult<Vec<Bar>> {
        let symbol = symbol.to_string();
        self.call(|reply| Command::FetchFine {
            symbol,
            lookback_days,
            end_before,
            reply,
        })
        .await
    }

    pub async fn live_positions(&self) -> ConnectorResult<Vec<LivePosition>> {
        self.call(|reply| Command::Positions { reply }).await
    }

    pub async fn open_orders(&self) -> ConnectorResult<Vec<OpenOrder>> {
        self.call(|reply| Command::OpenOrders { reply }).await
    }

    pub async fn place_order(
        &self,
        symbol: &str,
        quantity: f64,
        order_type: OrderType,
    ) -> ConnectorResult<Option<TradeHandle>> {
        let symbol = symbol.to_string();
        self.call(|reply| Command::PlaceOrder {
            symbol,
            quantity,
            order_type,
            reply,
        })
        .await
    }

    pub async fn cancel_order(&self, order_id: &str) -> ConnectorResult<()> {
        let order_id = order_id.to_string();
        self.call(|reply| Command::CancelOrder { order_id, reply }).await
    }

    pub async fn trade_status(&self, handle: &TradeHandle) -> ConnectorResult<TradeStatus> {
        let handle = handle.clone();
        self.call(|reply| Command::TradeStatus { handle, reply }).await
    }

    /// Disconnect and stop the task. Later calls fail with `NotConnected`.
    pub async fn shutdown(&self) -> ConnectorResult<()> {
        self.call(|reply| Command::Shutdown { reply }).await
    }
}

async fn run<C: MarketConnector>(mut connector: C, mut rx: mpsc::Receiver<Command>) {
    while let Some(cmd) = rx.recv().await {
        match cmd {
            Command::FetchDaily {
                symbol,
                lookback_days,
                reply,
            } => {
                let _ = reply.send(connector.fetch_daily_bars(&symbol, lookback_days).await);
            }
            Command::FetchFine {
                symbol,
                lookback_days,
                end_before,
                reply,
            } => {
                let _ = reply.send(
                    connector
                        .fetch_fine_bars(&symbol, lookback_days, end_before)
                        .await,
                );
            }
            Command::Positions { reply } => {
                let _ = reply.send(connector.live_positions().await);
            }
            Command::OpenOrders { reply } => {
                let _ = reply.send(connector.open_orders().await);
            }
            Command::PlaceOrder {
                symbol,
                quantity,
                order_type,
                reply,
            } => {
                let _ = reply.send(connector.place_order(&symbol, quantity, &order_type).await);
            }
            Command::CancelOrder { order_id, reply } => {
                let _ = reply.send(connector.cancel_order(&order_id).await);
            }
            Command::TradeStatus { handle, reply } => {
                let _ = reply.send(connector.trade_status(&handle).await);
            }
            Command::Shutdown { reply } => {
                let result = connector.disconnect().await;
                tracing::info!("Connector disconnected");
                let _ = reply.send(result);
                return;
            }
        }
    }

    // Every handle dropped
    if let Err(e) = connector.disconnect().await {
        tracing::warn!("Connector disconnect failed: {}", e);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio_test::{assert_err, assert_ok};
    use crate::api::PaperConnector;

    #[tokio::test]
    async fn test_spawn_fails_when_connect_fails() {
        let paper = PaperConnector::new();
        paper.fail_connect();

        let result = ConnectorHandle::spawn(paper).await;
        let err = assert_err!(result);
        assert!(matches!(err, ConnectorError::Connection(_)));
    }

    #[tokio::test]
    async fn test_calls_routed_to_connector() {
        let paper = PaperConnector::new();
        paper.set_position("NASDAQ:AAPL", 10.0, Some(150.0));

        let (handle, task) = assert_ok!(ConnectorHandle::spawn(paper.clone()).await);

        let positions = assert_ok!(handle.live_positions().await);
        assert_eq!(positions.len(), 1);
        assert_eq!(positions[0].quantity, 10.0);

        handle.shutdown().await.unwrap();
        task.await.unwrap();
        assert!(!paper.is_connected());

        let after = handle.open_orders().await;
        assert!(matches!(assert_err!(after), ConnectorError::NotConnected));
    }

    #[tokio::test]
    async fn test_handle_clones_share_connector() {
        let paper = PaperConnector::new();
        let (handle, _task) = ConnectorHandle::spawn(paper.clone()).await.unwrap();

        let mut joins = Vec::new();
        for i in 0..8 {
            let h = handle.clone();
            joins.push(tokio::spawn(async move {
                h.fetch_daily_bars(&format!("SYM{}", i), 2).await
            }));
        }
        for j in joins {
            j.await.unwrap().unwrap();
        }

        assert_eq!(paper.request_count(), 8);
    }
}
