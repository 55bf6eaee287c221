use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Why the heartbeat is running at its current cadence.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub enum IntervalReason {
    Normal,
    PendingEnter,
    PendingExit,
    PendingReturn,
    RecentTransition,
    LowAccuracy,
}

impl IntervalReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            IntervalReason::Normal => "normal",
            IntervalReason::PendingEnter => "pending_enter",
            IntervalReason::PendingExit => "pending_exit",
            IntervalReason::PendingReturn => "pending_return",
            IntervalReason::RecentTransition => "recent_transition",
            IntervalReason::LowAccuracy => "low_accuracy",
        }
    }
}

/// Persisted scheduler state. Survives process restarts so a relaunched
/// monitor resumes at the cadence it was last running at.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HeartbeatState {
    pub interval_secs: u64,
    pub reason: IntervalReason,
    pub last_transition_at: Option<DateTime<Utc>>,
    pub last_low_accuracy_at: Option<DateTime<Utc>>,
    pub last_interval_change_at: Option<DateTime<Utc>>,
}

impl HeartbeatState {
    pub fn new(normal_interval_secs: u64) -> Self {
        Self {
            interval_secs: normal_interval_secs,
            reason: IntervalReason::Normal,
            last_transition_at: None,
            last_low_accuracy_at: None,
            last_interval_change_at: None,
        }
    }
}
