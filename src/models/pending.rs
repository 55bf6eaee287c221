use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub enum PendingKind {
    Enter,
    Exit,
    Return,
}

impl PendingKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            PendingKind::Enter => "enter",
            PendingKind::Exit => "exit",
            PendingKind::Return => "return",
        }
    }
}

/// Position captured when the pending action was created, kept for
/// diagnostics and TTL-resolution audit.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GpsSnapshot {
    pub latitude: f64,
    pub longitude: f64,
    pub accuracy_m: f64,
}

/// A deferred transition decision with a time-to-live. At most one exists at
/// a time; persisting a new one supersedes the old.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PendingAction {
    pub kind: PendingKind,
    pub site_id: String,
    pub site_name: String,
    pub notification_id: Option<i64>,
    pub created_at: DateTime<Utc>,
    pub timeout_ms: u64,
    pub gps_snapshot: Option<GpsSnapshot>,
}

impl PendingAction {
    /// Expiry is a pure function of creation time and timeout.
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        let elapsed_ms = (now - self.created_at).num_milliseconds();
        elapsed_ms >= self.timeout_ms as i64
    }

    pub fn remaining_ms(&self, now: DateTime<Utc>) -> i64 {
        let elapsed_ms = (now - self.created_at).num_milliseconds();
        (self.timeout_ms as i64 - elapsed_ms).max(0)
    }
}
