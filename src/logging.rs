//! Rate-limited logging for errors that arrive in bursts.

use std::sync::{Mutex, PoisonError};
use std::time::Duration;
use tokio::time::Instant;

struct Window {
    last_flush: Option<Instant>,
    skipped: u64,
}

/// Emits at most one message per interval and reports how many were dropped.
pub struct ThrottledLogger {
    name: &'static str,
    interval: Duration,
    window: Mutex<Window>,
}

impl ThrottledLogger {
    pub fn new(name: &'static str, interval: Duration) -> Self {
        ThrottledLogger {
            name,
            interval,
            window: Mutex::new(Window {
                last_flush: None,
                skipped: 0,
            }),
        }
    }

    /// Returns false when the message was suppressed.
    pub fn warn(&self, message: &str) -> bool {
        let skipped = {
            let mut w = self.window.lock().unwrap_or_else(PoisonError::into_inner);
            let now = Instant::now();
            match w.last_flush {
                Some(last) if now.duration_since(last) < self.interval => {
                    w.skipped += 1;
                    return false;
                }
                _ => {
                    w.last_flush = Some(now);
                    std::mem::take(&mut w.skipped)
                }
            }
        };
        if skipped > 0 {
            tracing::warn!(logger = self.name, skipped, "suppressed messages since last log");
        }
        tracing::warn!(logger = self.name, "{}", message);
        true
    }

    pub fn skipped(&self) -> u64 {
        self.window
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .skipped
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn suppresses_within_interval() {
        let logger = ThrottledLogger::new("test", Duration::from_secs(1));
        assert!(logger.warn("first"));
        assert!(!logger.warn("second"));
        assert!(!logger.warn("third"));
        assert_eq!(logger.skipped(), 2);

        tokio::time::advance(Duration::from_millis(1100)).await;
        assert!(logger.warn("fourth"));
        assert_eq!(logger.skipped(), 0);
    }
}
