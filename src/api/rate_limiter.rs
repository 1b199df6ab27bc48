use governor::{Quota, RateLimiter};
use std::num::NonZeroU32;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use crate::config::RateLimitSettings;
use crate::error::is_pacing_message;

/// Consecutive successes needed before the delay shrinks
const SUCCESS_STREAK_TARGET: u32 = 5;
const SPEEDUP_FACTOR: f64 = 0.8;
const PACING_FACTOR: f64 = 2.0;
const FAILURE_FACTOR: f64 = 1.5;

type DirectLimiter = RateLimiter<
    governor::state::direct::NotKeyed,
    governor::state::InMemoryState,
    governor::clock::DefaultClock,
>;

fn scale(delay: Duration, factor: f64) -> Duration {
    Duration::from_nanos((delay.as_nanos() as f64 * factor).round() as u64)
}

/// Point-in-time view of the limiter
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RateLimiterState {
    pub current_delay: Duration,
    pub floor: Duration,
    pub ceiling: Duration,
    pub success_streak: u32,
}

/// Adaptive pause inserted before every connector request
///
/// Five successes in a row shrink the delay by 20%. A pacing/throttling
/// failure doubles it, any other failure grows it by half. Always clamped to
/// `[floor, ceiling]`. Share one instance behind an `Arc`.
#[derive(Debug)]
pub struct AdaptiveRateLimiter {
    initial: Duration,
    state: Mutex<RateLimiterState>,
}

impl AdaptiveRateLimiter {
    /// # Arguments
    /// * `initial` - Starting delay
    /// * `floor` - Lower clamp
    /// * `ceiling` - Upper clamp
    pub fn new(initial: Duration, floor: Duration, ceiling: Duration) -> Self {
        let initial = initial.clamp(floor, ceiling.max(floor));
        Self {
            initial,
            state: Mutex::new(RateLimiterState {
                current_delay: initial,
                floor,
                ceiling: ceiling.max(floor),
                success_streak: 0,
            }),
        }
    }

    pub fn from_settings(settings: &RateLimitSettings) -> Self {
        Self::new(
            Duration::from_millis(settings.initial_delay_ms),
            Duration::from_millis(settings.floor_ms),
            Duration::from_millis(settings.ceiling_ms),
        )
    }

    fn lock(&self) -> MutexGuard<'_, RateLimiterState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn delay(&self) -> Duration {
        self.lock().current_delay
    }

    pub fn snapshot(&self) -> RateLimiterState {
        *self.lock()
    }

    pub fn on_success(&self) {
        let mut state = self.lock();
        state.success_streak += 1;
        if state.success_streak >= SUCCESS_STREAK_TARGET {
            let next = scale(state.current_delay, SPEEDUP_FACTOR).max(state.floor);
            tracing::debug!(
                "Rate limiter speedup: {:?} -> {:?}",
                state.current_delay,
                next
            );
            state.current_delay = next;
            state.success_streak = 0;
        }
    }

    pub fn on_failure(&self, message: &str) {
        let factor = if is_pacing_message(message) {
            PACING_FACTOR
        } else {
            FAILURE_FACTOR
        };

        let mut state = self.lock();
        let next = scale(state.current_delay, factor).min(state.ceiling);
        tracing::debug!(
            "Rate limiter backoff x{} ({}): {:?} -> {:?}",
            factor,
            message,
            state.current_delay,
            next
        );
        state.current_delay = next;
        state.success_streak = 0;
    }

    /// Back to the initial delay with an empty streak
    pub fn reset(&self) {
        let mut state = self.lock();
        state.current_delay = self.initial;
        state.success_streak = 0;
    }
}

impl Default for AdaptiveRateLimiter {
    fn default() -> Self {
        Self::from_settings(&RateLimitSettings::default())
    }
}

/// Fixed requests-per-minute quota layered on top of the adaptive delay
pub struct BurstQuota {
    limiter: DirectLimiter,
    per_minute: u32,
}

impl BurstQuota {
    /// Returns None for a zero quota
    pub fn per_minute(requests: u32) -> Option<Self> {
        let n = NonZeroU32::new(requests)?;
        Some(Self {
            limiter: RateLimiter::direct(Quota::per_minute(n)),
            per_minute: requests,
        })
    }

    pub fn requests_per_minute(&self) -> u32 {
        self.per_minute
    }

    pub async fn until_ready(&self) {
        self.limiter.until_ready().await;
    }
}

impl std::fmt::Debug for BurstQuota {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BurstQuota")
            .field("per_minute", &self.per_minute)
            .finish()
    }
}
