use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A single GPS fix as delivered by the platform location layer.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GpsFix {
    pub latitude: f64,
    pub longitude: f64,
    /// Horizontal accuracy radius in meters; larger is worse.
    pub accuracy_m: f64,
    pub timestamp: DateTime<Utc>,
}
