use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub enum SessionOrigin {
    Automatic,
    Manual,
}

impl SessionOrigin {
    pub fn as_str(&self) -> &'static str {
        match self {
            SessionOrigin::Automatic => "Automatic",
            SessionOrigin::Manual => "Manual",
        }
    }
}

/// One tracked stretch of work at a site. `exited_at` stays `None` while the
/// session is open; at most one open session may exist per user.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkSession {
    pub id: String,
    pub user_id: String,
    pub site_id: String,
    pub site_name: String,
    pub site_color: String,
    pub entered_at: DateTime<Utc>,
    pub exited_at: Option<DateTime<Utc>>,
    pub origin: SessionOrigin,
    pub manually_edited: bool,
    pub edit_reason: Option<String>,
    pub pause_minutes: i64,
    pub device_id: String,
    pub integrity_hash: Option<String>,
}

impl WorkSession {
    pub fn is_open(&self) -> bool {
        self.exited_at.is_none()
    }
}
