pub mod actor;
pub mod paper;
pub mod rate_limiter;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::error::ConnectorError;
use crate::models::{Bar, LivePosition, OpenOrder, OrderType, TradeHandle, TradeStatus};

pub use actor::ConnectorHandle;
pub use paper::PaperConnector;
pub use rate_limiter::{AdaptiveRateLimiter, BurstQuota, RateLimiterState};

pub type ConnectorResult<T> = std::result::Result<T, ConnectorError>;

/// Broker / market-data session
///
/// Implementations are owned by a single [`ConnectorHandle`] task, so methods
/// take `&mut self` and never see concurrent calls.
#[async_trait]
pub trait MarketConnector: Send + 'static {
    async fn connect(&mut self) -> ConnectorResult<()>;

    async fn disconnect(&mut self) -> ConnectorResult<()>;

    /// Daily bars covering the last `lookback_days`
    async fn fetch_daily_bars(&mut self, symbol: &str, lookback_days: u32)
        -> ConnectorResult<Vec<Bar>>;

    /// 30-minute bars covering `lookback_days`, ending strictly before `end_before` when given
    async fn fetch_fine_bars(
        &mut self,
        symbol: &str,
        lookback_days: u32,
        end_before: Option<DateTime<Utc>>,
    ) -> ConnectorResult<Vec<Bar>>;

    async fn live_positions(&mut self) -> ConnectorResult<Vec<LivePosition>>;

    async fn open_orders(&mut self) -> ConnectorResult<Vec<OpenOrder>>;

    /// Returns None when the broker accepted the request without a trackable handle
    async fn place_order(
        &mut self,
        symbol: &str,
        quantity: f64,
        order_type: &OrderType,
    ) -> ConnectorResult<Option<TradeHandle>>;

    async fn cancel_order(&mut self, order_id: &str) -> ConnectorResult<()>;

    async fn trade_status(&mut self, handle: &TradeHandle) -> ConnectorResult<TradeStatus>;
}
