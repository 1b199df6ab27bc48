// Moving-average indicators used by the signal engine and snapshots

pub mod moving_average;

pub use moving_average::{calculate_ema, calculate_sma, distance_pct, moving_average};
