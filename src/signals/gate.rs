/// Extra condition a sell must pass on top of `close < ma`
pub trait SafetyGate: Send + Sync {
    fn allows(&self, close: f64, ma: f64, avg_cost: Option<f64>) -> bool;

    fn name(&self) -> &str {
        "custom"
    }
}

/// No extra condition
#[derive(Debug, Clone, Copy, Default)]
pub struct AlwaysAllow;

impl SafetyGate for AlwaysAllow {
    fn allows(&self, _close: f64, _ma: f64, _avg_cost: Option<f64>) -> bool {
        true
    }

    fn name(&self) -> &str {
        "always_allow"
    }
}

/// Only sell while both close and MA sit above the position's average cost
///
/// Without a known average cost the gate stays closed.
#[derive(Debug, Clone, Copy, Default)]
pub struct BreakEvenGate;

impl BreakEvenGate {
    pub fn above_break_even(close: f64, ma: f64, avg_cost: Option<f64>) -> bool {
        match avg_cost {
            Some(cost) => close > cost && ma > cost,
            None => false,
        }
    }
}

impl SafetyGate for BreakEvenGate {
    fn allows(&self, close: f64, ma: f64, avg_cost: Option<f64>) -> bool {
        Self::above_break_even(close, ma, avg_cost)
    }

    fn name(&self) -> &str {
        "break_even"
    }
}

impl<F> SafetyGate for F
where
    F: Fn(f64, f64, Option<f64>) -> bool + Send + Sync,
{
    fn allows(&self, close: f64, ma: f64, avg_cost: Option<f64>) -> bool {
        self(close, ma, avg_cost)
    }
}
