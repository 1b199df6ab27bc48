use chrono::{Duration, Utc};

use crate::error::{Error, Result};
use crate::models::Bar;

/// Allowed clock skew for bar timestamps ahead of local time
const MAX_FUTURE_SKEW_SECS: i64 = 60;

/// Sanity checks on bars before they reach the cache
pub struct BarValidator;

impl BarValidator {
    pub fn new() -> Self {
        Self
    }

    pub fn validate(&self, bar: &Bar) -> Result<()> {
        self.validate_prices(bar)?;
        self.validate_timestamp(bar)?;
        self.validate_ohlc_relationship(bar)?;
        Ok(())
    }

    /// Split bars into accepted ones and a quarantine count
    pub fn filter_valid(&self, symbol: &str, bars: Vec<Bar>) -> (Vec<Bar>, usize) {
        let mut rejected = 0;
        let accepted = bars
            .into_iter()
            .filter(|bar| match self.validate(bar) {
                Ok(()) => true,
                Err(e) => {
                    tracing::debug!(symbol = %symbol, "Quarantined bar at {}: {}", bar.timestamp, e);
                    rejected += 1;
                    false
                }
            })
            .collect();
        (accepted, rejected)
    }

    fn validate_prices(&self, bar: &Bar) -> Result<()> {
        for (name, value) in [
            ("open", bar.open),
            ("high", bar.high),
            ("low", bar.low),
            ("close", bar.close),
        ] {
            if !value.is_finite() || value <= 0.0 {
                return Err(Error::InvalidInput(format!("Invalid {} price: {}", name, value)));
            }
        }
        Ok(())
    }

    fn validate_timestamp(&self, bar: &Bar) -> Result<()> {
        let limit = Utc::now() + Duration::seconds(MAX_FUTURE_SKEW_SECS);
        if bar.timestamp > limit {
            return Err(Error::InvalidInput(format!(
                "Bar timestamp is in the future: {}",
                bar.timestamp
            )));
        }
        Ok(())
    }

    fn validate_ohlc_relationship(&self, bar: &Bar) -> Result<()> {
        if bar.high < bar.low {
            return Err(Error::InvalidInput(format!(
                "High ({}) is less than low ({})",
                bar.high, bar.low
            )));
        }
        if bar.high < bar.open.max(bar.close) {
            return Err(Error::InvalidInput(format!(
                "High ({}) is below open/close ({} / {})",
                bar.high, bar.open, bar.close
            )));
        }
        if bar.low > bar.open.min(bar.close) {
            return Err(Error::InvalidInput(format!(
                "Low ({}) is above open/close ({} / {})",
                bar.low, bar.open, bar.close
            )));
        }
        Ok(())
    }
}

impl Default for BarValidator {
    fn default() -> Self {
        Self::new()
    }
}
