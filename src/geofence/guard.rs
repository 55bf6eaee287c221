use std::sync::Mutex;
use std::time::{Duration, Instant};

// Set to true to enable verbose logging in this module
const ENABLE_LOGS: bool = false;

use crate::log_info;

struct GuardInner {
    in_flight: bool,
    completed_at: Option<Instant>,
}

/// Non-reentrant evaluation guard. While one evaluation runs, and for a short
/// cool-down after it completes, concurrent signals are dropped rather than
/// queued; within that window their outcome would be redundant anyway.
pub struct EvaluationGuard {
    inner: Mutex<GuardInner>,
    cooldown: Duration,
}

impl EvaluationGuard {
    pub fn new(cooldown_ms: u64) -> Self {
        Self {
            inner: Mutex::new(GuardInner {
                in_flight: false,
                completed_at: None,
            }),
            cooldown: Duration::from_millis(cooldown_ms),
        }
    }

    /// Attempt to start an evaluation. Returns false when one is in flight
    /// or the cool-down has not elapsed; the caller drops the signal.
    pub fn try_begin(&self) -> bool {
        let mut inner = self.inner.lock().unwrap_or_else(|p| p.into_inner());
        if inner.in_flight {
            log_info!("evaluation in flight, dropping signal");
            return false;
        }
        if let Some(completed_at) = inner.completed_at {
            if completed_at.elapsed() < self.cooldown {
                log_info!("evaluation cool-down active, dropping signal");
                return false;
            }
        }
        inner.in_flight = true;
        true
    }

    /// Mark the in-flight evaluation complete and start the cool-down.
    pub fn finish(&self) {
        let mut inner = self.inner.lock().unwrap_or_else(|p| p.into_inner());
        inner.in_flight = false;
        inner.completed_at = Some(Instant::now());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn concurrent_begin_is_rejected() {
        let guard = EvaluationGuard::new(0);
        assert!(guard.try_begin());
        assert!(!guard.try_begin());
        guard.finish();
        assert!(guard.try_begin());
    }

    #[test]
    fn cooldown_blocks_immediate_reentry() {
        let guard = EvaluationGuard::new(10_000);
        assert!(guard.try_begin());
        guard.finish();
        assert!(!guard.try_begin());
    }

    #[test]
    fn zero_cooldown_allows_back_to_back_runs() {
        let guard = EvaluationGuard::new(0);
        assert!(guard.try_begin());
        guard.finish();
        assert!(guard.try_begin());
    }
}
