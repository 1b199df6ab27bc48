pub mod gate;

use chrono::{DateTime, Utc};
use std::sync::Arc;

use crate::error::Result;
use crate::indicators::moving_average;
use crate::models::{Assignment, Decision, ExecutionMode, MaType, SignalEntry};
use crate::persistence::JsonlLog;
use crate::scheduler::EvaluationWindow;
use crate::snapshot::SnapshotRow;

pub use gate::{AlwaysAllow, BreakEvenGate, SafetyGate};

pub const REASON_INSUFFICIENT_DATA: &str = "insufficient_data";
pub const REASON_CLOSE_BELOW_MA: &str = "close_below_ma";
pub const REASON_GATE_CLOSED: &str = "gate_closed";

/// Result of `decide`
#[derive(Debug, Clone, PartialEq)]
pub struct Evaluation {
    pub decision: Decision,
    pub ma_value: Option<f64>,
    pub reason: Option<String>,
}

impl Evaluation {
    fn skip() -> Self {
        Self {
            decision: Decision::Skip,
            ma_value: None,
            reason: Some(REASON_INSUFFICIENT_DATA.to_string()),
        }
    }
}

/// Compare `close` against the assigned MA of `history`
///
/// `history` is the close series the MA is computed over, oldest first.
/// A sell needs `close < ma` and the gate's consent; equality is no signal.
pub fn decide(
    close: f64,
    ma_type: MaType,
    length: usize,
    history: &[f64],
    avg_cost: Option<f64>,
    gate: &dyn SafetyGate,
) -> Evaluation {
    let Some(ma) = moving_average(ma_type, history, length) else {
        return Evaluation::skip();
    };
    classify(close, ma, avg_cost, gate)
}

fn classify(close: f64, ma: f64, avg_cost: Option<f64>, gate: &dyn SafetyGate) -> Evaluation {
    if close < ma {
        if gate.allows(close, ma, avg_cost) {
            return Evaluation {
                decision: Decision::SellSignal,
                ma_value: Some(ma),
                reason: Some(REASON_CLOSE_BELOW_MA.to_string()),
            };
        }
        return Evaluation {
            decision: Decision::NoSignal,
            ma_value: Some(ma),
            reason: Some(REASON_GATE_CLOSED.to_string()),
        };
    }

    Evaluation {
        decision: Decision::NoSignal,
        ma_value: Some(ma),
        reason: None,
    }
}

/// Decides and writes one audit row per evaluation
pub struct SignalEngine {
    audit: Arc<JsonlLog>,
    gate: Arc<dyn SafetyGate>,
    mode: ExecutionMode,
}

impl SignalEngine {
    pub fn new(audit: Arc<JsonlLog>, gate: Arc<dyn SafetyGate>, mode: ExecutionMode) -> Self {
        Self { audit, gate, mode }
    }

    pub fn mode(&self) -> ExecutionMode {
        self.mode
    }

    pub fn gate_name(&self) -> &str {
        self.gate.name()
    }

    /// Evaluate one assignment from a close history and log the result
    pub async fn evaluate(
        &self,
        assignment: &Assignment,
        close: f64,
        history: &[f64],
        avg_cost: Option<f64>,
        at: DateTime<Utc>,
    ) -> Result<SignalEntry> {
        let eval = decide(
            close,
            assignment.ma_type,
            assignment.length,
            history,
            avg_cost,
            self.gate.as_ref(),
        );
        let entry = self.entry(assignment, at, Some(close), eval);
        self.record(&entry).await?;
        Ok(entry)
    }

    /// Evaluate snapshot rows whose timeframe falls in `window`
    ///
    /// Uses the MA and close already computed for the row. Rows without
    /// either value are logged as skipped.
    pub async fn evaluate_rows(
        &self,
        rows: &[SnapshotRow],
        window: &EvaluationWindow,
    ) -> Result<Vec<SignalEntry>> {
        let mut entries = Vec::new();

        for row in rows.iter().filter(|r| window.includes(r.timeframe)) {
            let assignment = Assignment::new(&row.ticker, row.ma_type, row.length, row.timeframe);
            let eval = match (row.last_close, row.ma_value) {
                (Some(close), Some(ma)) => classify(close, ma, row.avg_cost, self.gate.as_ref()),
                _ => Evaluation::skip(),
            };
            let entry = self.entry(&assignment, row.ts, row.last_close, eval);
            self.record(&entry).await?;
            entries.push(entry);
        }

        let sells = entries
            .iter()
            .filter(|e| e.decision == Decision::SellSignal)
            .count();
        tracing::info!(
            "Evaluated {} rows ({} sell signals, gate {})",
            entries.len(),
            sells,
            self.gate.name()
        );
        Ok(entries)
    }

    fn entry(
        &self,
        assignment: &Assignment,
        at: DateTime<Utc>,
        close: Option<f64>,
        eval: Evaluation,
    ) -> SignalEntry {
        SignalEntry {
            ticker: assignment.ticker.clone(),
            timestamp: at,
            close,
            ma_value: eval.ma_value,
            decision: eval.decision,
            reason: eval.reason,
            ma_type: assignment.ma_type,
            length: assignment.length,
            timeframe: assignment.timeframe,
            action: self.mode,
        }
    }

    async fn record(&self, entry: &SignalEntry) -> Result<()> {
        match entry.decision {
            Decision::SellSignal => tracing::info!(
                ticker = %entry.ticker,
                "🔻 SELL signal: close {:?} < {} {:?}",
                entry.close,
                entry.ma_type,
                entry.ma_value
            ),
            Decision::Skip => tracing::debug!(ticker = %entry.ticker, "Skipped: {:?}", entry.reason),
            Decision::NoSignal => tracing::debug!(ticker = %entry.ticker, "No signal"),
        }
        self.audit.append(entry).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Timeframe;
    use chrono::TimeZone;

    const HISTORY: [f64; 5] = [100.0, 101.0, 102.0, 103.0, 104.0];

    #[test]
    fn test_sma_sell_signal() {
        let eval = decide(102.0, MaType::Sma, 3, &HISTORY, None, &AlwaysAllow);

        assert_eq!(eval.decision, Decision::SellSignal);
        assert_eq!(eval.ma_value, Some(103.0));
        assert_eq!(eval.reason.as_deref(), Some(REASON_CLOSE_BELOW_MA));
    }

    #[test]
    fn test_insufficient_history_skips() {
        let eval = decide(102.0, MaType::Sma, 10, &HISTORY, None, &AlwaysAllow);
        assert_eq!(eval.decision, Decision::Skip);
        assert_eq!(eval.ma_value, None);
        assert_eq!(eval.reason.as_deref(), Some(REASON_INSUFFICIENT_DATA));

        let zero = decide(102.0, MaType::Ema, 0, &HISTORY, None, &AlwaysAllow);
        assert_eq!(zero.decision, Decision::Skip);
    }

    #[test]
    fn test_equality_is_no_signal() {
        let eval = decide(103.0, MaType::Sma, 3, &HISTORY, None, &AlwaysAllow);
        assert_eq!(eval.decision, Decision::NoSignal);
        assert_eq!(eval.ma_value, Some(103.0));
    }

    #[test]
    fn test_gate_blocks_sell() {
        // Break-even gate is closed when avg cost is above the close
        let eval = decide(102.0, MaType::Sma, 3, &HISTORY, Some(110.0), &BreakEvenGate);
        assert_eq!(eval.decision, Decision::NoSignal);
        assert_eq!(eval.reason.as_deref(), Some(REASON_GATE_CLOSED));

        let eval = decide(102.0, MaType::Sma, 3, &HISTORY, Some(90.0), &BreakEvenGate);
        assert_eq!(eval.decision, Decision::SellSignal);
    }

    #[test]
    fn test_decide_is_deterministic() {
        let gate = |close: f64, _ma: f64, _cost: Option<f64>| close > 50.0;
        let first = decide(102.5, MaType::Ema, 4, &HISTORY, None, &gate);
        for _ in 0..10 {
            assert_eq!(decide(102.5, MaType::Ema, 4, &HISTORY, None, &gate), first);
        }
    }

    fn row(ticker: &str, timeframe: Timeframe, close: Option<f64>, ma: Option<f64>) -> SnapshotRow {
        SnapshotRow {
            ts: Utc.with_ymd_and_hms(2024, 3, 4, 15, 0, 0).unwrap(),
            ticker: ticker.to_string(),
            ma_type: MaType::Sma,
            length: 20,
            timeframe,
            ma_value: ma,
            last_close: close,
            last_bar_time: None,
            distance_pct: None,
            avg_cost: None,
            above_break_even: false,
        }
    }

    #[tokio::test]
    async fn test_evaluate_rows_filters_window_and_logs_every_row() {
        let dir = tempfile::tempdir().unwrap();
        let audit = Arc::new(JsonlLog::new(dir.path().join("signals.jsonl")));
        let engine = SignalEngine::new(audit.clone(), Arc::new(AlwaysAllow), ExecutionMode::Simulate);

        let rows = vec![
            row("NASDAQ:AAPL", Timeframe::Hourly, Some(99.0), Some(100.0)),
            row("NASDAQ:MSFT", Timeframe::Hourly, None, None),
            row("NYSE:KO", Timeframe::Daily, Some(50.0), Some(60.0)),
        ];
        let window = EvaluationWindow {
            hourly: true,
            daily: false,
        };

        let entries = engine.evaluate_rows(&rows, &window).await.unwrap();

        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].decision, Decision::SellSignal);
        assert_eq!(entries[1].decision, Decision::Skip);
        assert_eq!(entries[1].reason.as_deref(), Some(REASON_INSUFFICIENT_DATA));

        let logged: Vec<SignalEntry> = audit.read_all().await.unwrap();
        assert_eq!(logged, entries);
        assert_eq!(logged[0].action, ExecutionMode::Simulate);
    }

    #[tokio::test]
    async fn test_evaluate_appends() {
        let dir = tempfile::tempdir().unwrap();
        let audit = Arc::new(JsonlLog::new(dir.path().join("signals.jsonl")));
        let engine = SignalEngine::new(audit.clone(), Arc::new(AlwaysAllow), ExecutionMode::Live);
        let assignment = Assignment::new("NASDAQ:AAPL", MaType::Sma, 3, Timeframe::Daily);

        engine
            .evaluate(&assignment, 102.0, &HISTORY, None, Utc::now())
            .await
            .unwrap();
        engine
            .evaluate(&assignment, 105.0, &HISTORY, None, Utc::now())
            .await
            .unwrap();

        let logged: Vec<SignalEntry> = audit.read_all().await.unwrap();
        assert_eq!(logged.len(), 2);
        assert_eq!(logged[0].decision, Decision::SellSignal);
        assert_eq!(logged[1].decision, Decision::NoSignal);
    }
}
