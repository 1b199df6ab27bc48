use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

use crate::error::Error;

/// One OHLCV observation for a fixed time bucket
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Bar {
    pub timestamp: DateTime<Utc>,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: u64,
}

impl Bar {
    pub fn new(
        timestamp: DateTime<Utc>,
        open: f64,
        high: f64,
        low: f64,
        close: f64,
        volume: u64,
    ) -> Self {
        Self {
            timestamp,
            open,
            high,
            low,
            close,
            volume,
        }
    }

    /// Flat bar where O=H=L=C
    pub fn flat(timestamp: DateTime<Utc>, price: f64, volume: u64) -> Self {
        Self::new(timestamp, price, price, price, price, volume)
    }
}

/// Bucket width of a bar series
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Granularity {
    /// 30-minute bars straight from the connector
    Fine,
    Hourly,
    Daily,
}

impl Granularity {
    /// Suffix used in cache file names
    pub fn suffix(&self) -> &'static str {
        match self {
            Granularity::Fine => "30m",
            Granularity::Hourly => "1h",
            Granularity::Daily => "1d",
        }
    }

    pub fn bucket_secs(&self) -> i64 {
        match self {
            Granularity::Fine => 1800,
            Granularity::Hourly => 3600,
            Granularity::Daily => 86_400,
        }
    }
}

impl fmt::Display for Granularity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.suffix())
    }
}

/// Identifies one cached bar series
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SeriesKey {
    pub symbol: String,
    pub granularity: Granularity,
}

impl SeriesKey {
    pub fn new(symbol: impl Into<String>, granularity: Granularity) -> Self {
        Self {
            symbol: symbol.into(),
            granularity,
        }
    }

    /// Filesystem-safe stem, e.g. `NASDAQ__AAPL__1h`
    pub fn file_stem(&self) -> String {
        let safe = self.symbol.replace(':', "__").replace('/', "_");
        format!("{}__{}", safe, self.granularity.suffix())
    }
}

impl fmt::Display for SeriesKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.symbol, self.granularity)
    }
}

/// Moving average family
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MaType {
    #[serde(rename = "SMA")]
    Sma,
    #[serde(rename = "EMA")]
    Ema,
}

impl FromStr for MaType {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_uppercase().as_str() {
            "SMA" => Ok(MaType::Sma),
            "EMA" => Ok(MaType::Ema),
            other => Err(Error::InvalidInput(format!("unknown MA type: {}", other))),
        }
    }
}

impl fmt::Display for MaType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MaType::Sma => f.write_str("SMA"),
            MaType::Ema => f.write_str("EMA"),
        }
    }
}

/// Timeframe an assignment is evaluated on
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Timeframe {
    Hourly,
    Daily,
}

impl Timeframe {
    pub fn granularity(&self) -> Granularity {
        match self {
            Timeframe::Hourly => Granularity::Hourly,
            Timeframe::Daily => Granularity::Daily,
        }
    }
}

impl FromStr for Timeframe {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_uppercase().as_str() {
            "1H" | "H" | "HOURLY" => Ok(Timeframe::Hourly),
            "1D" | "D" | "DAILY" => Ok(Timeframe::Daily),
            other => Err(Error::InvalidInput(format!("unknown timeframe: {}", other))),
        }
    }
}

/// Moving average assigned to a ticker (read-only to the core)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Assignment {
    pub ticker: String,
    pub ma_type: MaType,
    pub length: usize,
    pub timeframe: Timeframe,
}

impl Assignment {
    pub fn new(ticker: impl Into<String>, ma_type: MaType, length: usize, timeframe: Timeframe) -> Self {
        Self {
            ticker: ticker.into(),
            ma_type,
            length,
            timeframe,
        }
    }

    /// Display label, e.g. `SMA(20)`
    pub fn label(&self) -> String {
        format!("{}({})", self.ma_type, self.length)
    }
}

/// Position as reported by the broker
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LivePosition {
    pub symbol: String,
    pub quantity: f64,
    pub avg_cost: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum OrderType {
    Market,
    Limit { limit_price: f64 },
    Stop { stop_price: f64 },
}

/// Working order as reported by the broker
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OpenOrder {
    pub order_id: String,
    pub symbol: String,
    pub quantity: f64,
    pub order_type: OrderType,
}

impl OpenOrder {
    /// Whether this order belongs to `symbol` (`EXCHANGE:SYM` or bare `SYM` on either side)
    pub fn matches_symbol(&self, symbol: &str) -> bool {
        bare_symbol(&self.symbol) == bare_symbol(symbol)
    }
}

/// Strip an `EXCHANGE:` prefix
pub fn bare_symbol(symbol: &str) -> &str {
    symbol.rsplit(':').next().unwrap_or(symbol)
}

/// Opaque handle to a placed order
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TradeHandle {
    pub order_id: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TradeStatus {
    Pending,
    Filled,
    Cancelled,
}

/// Outcome of one signal evaluation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Decision {
    SellSignal,
    NoSignal,
    Skip,
}

/// Whether an evaluation may lead to a real order
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExecutionMode {
    Simulate,
    Live,
}

/// Append-only audit row, one per evaluation per ticker
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SignalEntry {
    pub ticker: String,
    pub timestamp: DateTime<Utc>,
    pub close: Option<f64>,
    pub ma_value: Option<f64>,
    pub decision: Decision,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    pub ma_type: MaType,
    pub length: usize,
    pub timeframe: Timeframe,
    pub action: ExecutionMode,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OrderStatus {
    Placed,
    Filled,
    Cancelled,
    Timeout,
    Error,
}

impl OrderStatus {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, OrderStatus::Placed)
    }
}

/// One attempt to close a position. Terminal status is final.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderAttempt {
    pub id: Uuid,
    pub symbol: String,
    pub quantity: f64,
    pub order_type: OrderType,
    pub created_at: DateTime<Utc>,
    status: OrderStatus,
}

impl OrderAttempt {
    pub fn new(symbol: impl Into<String>, quantity: f64, order_type: OrderType) -> Self {
        Self {
            id: Uuid::new_v4(),
            symbol: symbol.into(),
            quantity,
            order_type,
            created_at: Utc::now(),
            status: OrderStatus::Placed,
        }
    }

    pub fn status(&self) -> OrderStatus {
        self.status
    }

    /// Move to `next`. Fails once a terminal state has been reached.
    pub fn transition(&mut self, next: OrderStatus) -> Result<(), Error> {
        if self.status.is_terminal() {
            return Err(Error::InvalidInput(format!(
                "order attempt {} already terminal ({:?})",
                self.id, self.status
            )));
        }
        self.status = next;
        Ok(())
    }
}

/// What a download task fetches
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DownloadKind {
    Fine,
    Daily,
}

impl DownloadKind {
    pub fn granularity(&self) -> Granularity {
        match self {
            DownloadKind::Fine => Granularity::Fine,
            DownloadKind::Daily => Granularity::Daily,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DownloadTask {
    pub symbol: String,
    pub kind: DownloadKind,
    pub enqueued_at: DateTime<Utc>,
}

impl DownloadTask {
    pub fn new(symbol: impl Into<String>, kind: DownloadKind) -> Self {
        Self {
            symbol: symbol.into(),
            kind,
            enqueued_at: Utc::now(),
        }
    }
}

/// Terminal download failure kept for a later retry pass
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FailureRecord {
    pub symbol: String,
    pub kind: DownloadKind,
    pub error: String,
    pub timestamp: DateTime<Utc>,
}
