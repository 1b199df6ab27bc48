use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;

/// Cooperative stop flag shared by loops and workers
#[derive(Debug, Clone)]
pub struct StopSignal {
    tx: Arc<watch::Sender<bool>>,
    rx: watch::Receiver<bool>,
}

impl StopSignal {
    pub fn new() -> Self {
        let (tx, rx) = watch::channel(false);
        Self {
            tx: Arc::new(tx),
            rx,
        }
    }

    pub fn stop(&self) {
        self.tx.send_replace(true);
    }

    pub fn is_stopped(&self) -> bool {
        *self.rx.borrow()
    }

    /// Resolves once `stop` has been called
    pub async fn stopped(&self) {
        let mut rx = self.rx.clone();
        // Err means every sender is gone, which cannot happen while self holds one
        let _ = rx.wait_for(|stopped| *stopped).await;
    }

    /// Sleep for `duration` unless stopped first. Returns true if the full sleep elapsed.
    pub async fn sleep(&self, duration: Duration) -> bool {
        if self.is_stopped() {
            return false;
        }
        tokio::select! {
            _ = tokio::time::sleep(duration) => !self.is_stopped(),
            _ = self.stopped() => false,
        }
    }

    /// Sleep in chunks of at most `max_chunk`, checking the flag between chunks
    pub async fn sleep_chunked(&self, total: Duration, max_chunk: Duration) -> bool {
        let mut remaining = total;
        while !remaining.is_zero() {
            let chunk = remaining.min(max_chunk);
            if !self.sleep(chunk).await {
                return false;
            }
            remaining = remaining.saturating_sub(chunk);
        }
        !self.is_stopped()
    }
}

impl Default for StopSignal {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Instant;

    #[tokio::test]
    async fn test_sleep_completes_when_not_stopped() {
        let stop = StopSignal::new();
        assert!(stop.sleep(Duration::from_millis(10)).await);
    }

    #[tokio::test]
    async fn test_stop_interrupts_sleep() {
        let stop = StopSignal::new();
        let trigger = stop.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            trigger.stop();
        });

        let started = Instant::now();
        let finished = stop
            .sleep_chunked(Duration::from_secs(10), Duration::from_millis(50))
            .await;

        assert!(!finished);
        assert!(started.elapsed() < Duration::from_secs(2));
        assert!(stop.is_stopped());
    }

    #[tokio::test]
    async fn test_already_stopped_returns_immediately() {
        let stop = StopSignal::new();
        stop.stop();
        assert!(!stop.sleep(Duration::from_secs(10)).await);
        stop.stopped().await;
    }
}
