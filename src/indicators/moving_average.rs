use crate::models::MaType;

/// Simple moving average of the last `period` values
pub fn calculate_sma(prices: &[f64], period: usize) -> Option<f64> {
    if period == 0 || prices.len() < period {
        return None;
    }

    let sum: f64 = prices[prices.len() - period..].iter().sum();
    Some(sum / period as f64)
}

/// Exponential moving average
///
/// Seeded with the SMA of the first `period` values, then
/// `ema = α·price + (1-α)·ema` over the rest with `α = 2/(period+1)`.
pub fn calculate_ema(prices: &[f64], period: usize) -> Option<f64> {
    if period == 0 || prices.len() < period {
        return None;
    }

    let alpha = 2.0 / (period as f64 + 1.0);
    let seed = calculate_sma(&prices[..period], period)?;

    Some(
        prices[period..]
            .iter()
            .fold(seed, |ema, price| alpha * price + (1.0 - alpha) * ema),
    )
}

/// Dispatch on the assignment's MA family
pub fn moving_average(ma_type: MaType, prices: &[f64], period: usize) -> Option<f64> {
    match ma_type {
        MaType::Sma => calculate_sma(prices, period),
        MaType::Ema => calculate_ema(prices, period),
    }
}

/// Percent distance of `close` from `ma`
pub fn distance_pct(close: f64, ma: f64) -> Option<f64> {
    if ma == 0.0 {
        return None;
    }
    Some((close - ma) / ma * 100.0)
}
