//! In-memory connector for simulation and tests.

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};

use super::{ConnectorResult, MarketConnector};
use crate::error::ConnectorError;
use crate::models::{
    bare_symbol, Bar, LivePosition, OpenOrder, OrderType, TradeHandle, TradeStatus,
};

/// What happens to an order after `place_order`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FillBehaviour {
    /// Filled on the first status poll
    Immediate,
    /// Stays pending forever
    Never,
    /// Broker cancels it
    Cancel,
    /// Accepted without a trade handle; shows up in open orders
    NoHandle,
    /// Accepted without a trade handle and never listed
    Swallow,
    /// Status polls fail
    StatusError,
}

#[derive(Debug)]
struct PaperState {
    connected: bool,
    fail_connect: bool,
    daily: HashMap<String, Vec<Bar>>,
    fine: HashMap<String, Vec<Bar>>,
    scripted_errors: HashMap<String, VecDeque<ConnectorError>>,
    positions: HashMap<String, LivePosition>,
    open_orders: Vec<OpenOrder>,
    trades: HashMap<String, (String, f64, TradeStatus)>,
    fill_behaviour: FillBehaviour,
    sticky_orders: HashSet<String>,
    placed: Vec<(String, f64, OrderType)>,
    cancelled: Vec<String>,
    requests: usize,
    next_order_id: u64,
}

/// Scriptable paper connector
///
/// Clones share state, so a test can keep one clone for setup and assertions
/// while another is owned by a [`ConnectorHandle`](super::ConnectorHandle).
#[derive(Debug, Clone)]
pub struct PaperConnector {
    state: Arc<Mutex<PaperState>>,
}

impl PaperConnector {
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(PaperState {
                connected: false,
                fail_connect: false,
                daily: HashMap::new(),
                fine: HashMap::new(),
                scripted_errors: HashMap::new(),
                positions: HashMap::new(),
                open_orders: Vec::new(),
                trades: HashMap::new(),
                fill_behaviour: FillBehaviour::Immediate,
                sticky_orders: HashSet::new(),
                placed: Vec::new(),
                cancelled: Vec::new(),
                requests: 0,
                next_order_id: 1,
            })),
        }
    }

    fn lock(&self) -> MutexGuard<'_, PaperState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn fail_connect(&self) {
        self.lock().fail_connect = true;
    }

    pub fn is_connected(&self) -> bool {
        self.lock().connected
    }

    pub fn set_daily_bars(&self, symbol: &str, bars: Vec<Bar>) {
        self.lock().daily.insert(symbol.to_string(), bars);
    }

    pub fn set_fine_bars(&self, symbol: &str, bars: Vec<Bar>) {
        self.lock().fine.insert(symbol.to_string(), bars);
    }

    /// Queue an error for the next bar request on `symbol`
    pub fn push_error(&self, symbol: &str, error: ConnectorError) {
        self.lock()
            .scripted_errors
            .entry(symbol.to_string())
            .or_default()
            .push_back(error);
    }

    pub fn set_position(&self, symbol: &str, quantity: f64, avg_cost: Option<f64>) {
        self.lock().positions.insert(
            symbol.to_string(),
            LivePosition {
                symbol: symbol.to_string(),
                quantity,
                avg_cost,
            },
        );
    }

    /// Add a resting order (e.g. a protective stop)
    pub fn add_open_order(&self, symbol: &str, quantity: f64, order_type: OrderType) -> String {
        let mut state = self.lock();
        let order_id = format!("paper-{}", state.next_order_id);
        state.next_order_id += 1;
        state.open_orders.push(OpenOrder {
            order_id: order_id.clone(),
            symbol: symbol.to_string(),
            quantity,
            order_type,
        });
        order_id
    }

    /// Cancels for this order are acknowledged but it stays open
    pub fn make_sticky(&self, order_id: &str) {
        self.lock().sticky_orders.insert(order_id.to_string());
    }

    pub fn set_fill_behaviour(&self, behaviour: FillBehaviour) {
        self.lock().fill_behaviour = behaviour;
    }

    pub fn placed_orders(&self) -> Vec<(String, f64, OrderType)> {
        self.lock().placed.clone()
    }

    pub fn cancelled_orders(&self) -> Vec<String> {
        self.lock().cancelled.clone()
    }

    pub fn position(&self, symbol: &str) -> Option<LivePosition> {
        self.lock().positions.get(symbol).cloned()
    }

    /// Bar requests served so far
    pub fn request_count(&self) -> usize {
        self.lock().requests
    }

    fn take_scripted_error(state: &mut PaperState, symbol: &str) -> Option<ConnectorError> {
        state
            .scripted_errors
            .get_mut(symbol)
            .and_then(|queue| queue.pop_front())
    }

    fn ensure_connected(state: &PaperState) -> ConnectorResult<()> {
        if state.connected {
            Ok(())
        } else {
            Err(ConnectorError::NotConnected)
        }
    }
}

impl Default for PaperConnector {
    fn default() -> Self {
        Self::new()
    }
}

/// Bars within `lookback_days` of the newest bar that passes `end_before`
fn window(bars: &[Bar], lookback_days: u32, end_before: Option<DateTime<Utc>>) -> Vec<Bar> {
    let eligible: Vec<&Bar> = bars
        .iter()
        .filter(|b| end_before.map_or(true, |end| b.timestamp < end))
        .collect();
    let Some(newest) = eligible.iter().map(|b| b.timestamp).max() else {
        return Vec::new();
    };
    let start = newest - Duration::days(lookback_days as i64);
    let mut out: Vec<Bar> = eligible
        .into_iter()
        .filter(|b| b.timestamp > start)
        .cloned()
        .collect();
    out.sort_by_key(|b| b.timestamp);
    out
}

#[async_trait]
impl MarketConnector for PaperConnector {
    async fn connect(&mut self) -> ConnectorResult<()> {
        let mut state = self.lock();
        if state.fail_connect {
            return Err(ConnectorError::Connection("paper connect refused".to_string()));
        }
        state.connected = true;
        Ok(())
    }

    async fn disconnect(&mut self) -> ConnectorResult<()> {
        self.lock().connected = false;
        Ok(())
    }

    async fn fetch_daily_bars(
        &mut self,
        symbol: &str,
        lookback_days: u32,
    ) -> ConnectorResult<Vec<Bar>> {
        let mut state = self.lock();
        Self::ensure_connected(&state)?;
        state.requests += 1;
        if let Some(err) = Self::take_scripted_error(&mut state, symbol) {
            return Err(err);
        }
        Ok(state
            .daily
            .get(symbol)
            .map(|bars| window(bars, lookback_days, None))
            .unwrap_or_default())
    }

    async fn fetch_fine_bars(
        &mut self,
        symbol: &str,
        lookback_days: u32,
        end_before: Option<DateTime<Utc>>,
    ) -> ConnectorResult<Vec<Bar>> {
        let mut state = self.lock();
        Self::ensure_connected(&state)?;
        state.requests += 1;
        if let Some(err) = Self::take_scripted_error(&mut state, symbol) {
            return Err(err);
        }
        Ok(state
            .fine
            .get(symbol)
            .map(|bars| window(bars, lookback_days, end_before))
            .unwrap_or_default())
    }

    async fn live_positions(&mut self) -> ConnectorResult<Vec<LivePosition>> {
        let state = self.lock();
        Self::ensure_connected(&state)?;
        Ok(state.positions.values().cloned().collect())
    }

    async fn open_orders(&mut self) -> ConnectorResult<Vec<OpenOrder>> {
        let state = self.lock();
        Self::ensure_connected(&state)?;
        Ok(state.open_orders.clone())
    }

    async fn place_order(
        &mut self,
        symbol: &str,
        quantity: f64,
        order_type: &OrderType,
    ) -> ConnectorResult<Option<TradeHandle>> {
        let mut state = self.lock();
        Self::ensure_connected(&state)?;
        if quantity == 0.0 {
            return Err(ConnectorError::Rejected("zero quantity".to_string()));
        }

        let order_id = format!("paper-{}", state.next_order_id);
        state.next_order_id += 1;
        state
            .placed
            .push((symbol.to_string(), quantity, order_type.clone()));

        match state.fill_behaviour {
            FillBehaviour::NoHandle => {
                state.open_orders.push(OpenOrder {
                    order_id,
                    symbol: symbol.to_string(),
                    quantity,
                    order_type: order_type.clone(),
                });
                Ok(None)
            }
            FillBehaviour::Swallow => Ok(None),
            _ => {
                state
                    .trades
                    .insert(order_id.clone(), (symbol.to_string(), quantity, TradeStatus::Pending));
                Ok(Some(TradeHandle { order_id }))
            }
        }
    }

    async fn cancel_order(&mut self, order_id: &str) -> ConnectorResult<()> {
        let mut state = self.lock();
        Self::ensure_connected(&state)?;
        if !state.open_orders.iter().any(|o| o.order_id == order_id) {
            return Err(ConnectorError::NotFound(order_id.to_string()));
        }
        state.cancelled.push(order_id.to_string());
        if !state.sticky_orders.contains(order_id) {
            state.open_orders.retain(|o| o.order_id != order_id);
        }
        Ok(())
    }

    async fn trade_status(&mut self, handle: &TradeHandle) -> ConnectorResult<TradeStatus> {
        let mut state = self.lock();
        Self::ensure_connected(&state)?;
        let behaviour = state.fill_behaviour;
        let Some((symbol, quantity, status)) = state.trades.get(&handle.order_id).cloned() else {
            return Err(ConnectorError::NotFound(handle.order_id.clone()));
        };
        if status != TradeStatus::Pending {
            return Ok(status);
        }

        let next = match behaviour {
            FillBehaviour::Immediate => TradeStatus::Filled,
            FillBehaviour::Cancel => TradeStatus::Cancelled,
            FillBehaviour::Never | FillBehaviour::NoHandle | FillBehaviour::Swallow => {
                TradeStatus::Pending
            },
            FillBehaviour::StatusError => {
                return Err(ConnectorError::Other("status unavailable".to_string()))
            }
        };

        if next == TradeStatus::Filled {
            let key = state
                .positions
                .keys()
                .find(|k| bare_symbol(k) == bare_symbol(&symbol))
                .cloned();
            if let Some(key) = key {
                if let Some(pos) = state.positions.get_mut(&key) {
                    pos.quantity += quantity;
                }
            }
        }
        state
            .trades
            .insert(handle.order_id.clone(), (symbol, quantity, next));
        Ok(next)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio_test::{assert_err, assert_ok};
    use chrono::TimeZone;

    fn fine_bar(h: u32, m: u32, close: f64) -> Bar {
        Bar::flat(Utc.with_ymd_and_hms(2024, 3, 4, h, m, 0).unwrap(), close, 1)
    }

    #[tokio::test]
    async fn test_requires_connection() {
        let mut paper = PaperConnector::new();
        assert!(matches!(
            paper.fetch_daily_bars("AAPL", 2).await,
            Err(ConnectorError::NotConnected)
        ));
        paper.connect().await.unwrap();
        assert!(paper.fetch_daily_bars("AAPL", 2).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_fine_window_respects_end_before() {
        let mut paper = PaperConnector::new();
        paper.connect().await.unwrap();
        paper.set_fine_bars(
            "AAPL",
            vec![fine_bar(10, 0, 1.0), fine_bar(10, 30, 2.0), fine_bar(11, 0, 3.0)],
        );

        let bars = paper
            .fetch_fine_bars("AAPL", 1, Some(Utc.with_ymd_and_hms(2024, 3, 4, 11, 0, 0).unwrap()))
            .await
            .unwrap();

        assert_eq!(bars.iter().map(|b| b.close).collect::<Vec<_>>(), vec![1.0, 2.0]);
    }

    #[tokio::test]
    async fn test_scripted_error_consumed_once() {
        let mut paper = PaperConnector::new();
        paper.connect().await.unwrap();
        paper.push_error("AAPL", ConnectorError::Pacing("pacing violation".to_string()));

        assert_err!(paper.fetch_daily_bars("AAPL", 2).await);
        assert_ok!(paper.fetch_daily_bars("AAPL", 2).await);
        assert_eq!(paper.request_count(), 2);
    }

    #[tokio::test]
    async fn test_fill_closes_position() {
        let mut paper = PaperConnector::new();
        paper.connect().await.unwrap();
        paper.set_position("NASDAQ:AAPL", 10.0, Some(100.0));

        let handle = paper
            .place_order("AAPL", -10.0, &OrderType::Market)
            .await
            .unwrap()
            .unwrap();

        assert_eq!(paper.trade_status(&handle).await.unwrap(), TradeStatus::Filled);
        assert_eq!(paper.position("NASDAQ:AAPL").unwrap().quantity, 0.0);
        // Status is stable after fill
        assert_eq!(paper.trade_status(&handle).await.unwrap(), TradeStatus::Filled);
    }

    #[tokio::test]
    async fn test_sticky_order_survives_cancel() {
        let mut paper = PaperConnector::new();
        paper.connect().await.unwrap();
        let id = paper.add_open_order("AAPL", -10.0, OrderType::Stop { stop_price: 90.0 });
        paper.make_sticky(&id);

        paper.cancel_order(&id).await.unwrap();

        assert_eq!(paper.open_orders().await.unwrap().len(), 1);
        assert_eq!(paper.cancelled_orders(), vec![id]);
    }
}
