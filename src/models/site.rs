use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub enum SiteStatus {
    Active,
    Deleted,
    PendingDelete,
    Syncing,
}

impl SiteStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SiteStatus::Active => "Active",
            SiteStatus::Deleted => "Deleted",
            SiteStatus::PendingDelete => "PendingDelete",
            SiteStatus::Syncing => "Syncing",
        }
    }
}

/// A circular work-site fence. Active fences must never overlap and the
/// radius is clamped to [`SiteLimits`] at creation time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkSite {
    pub id: String,
    pub name: String,
    pub latitude: f64,
    pub longitude: f64,
    pub radius_m: f64,
    pub color: String,
    pub status: SiteStatus,
}

/// Allowed fence radius range in meters.
#[derive(Debug, Clone, Copy)]
pub struct SiteLimits {
    pub min_radius_m: f64,
    pub max_radius_m: f64,
}

impl Default for SiteLimits {
    fn default() -> Self {
        Self {
            min_radius_m: 25.0,
            max_radius_m: 1000.0,
        }
    }
}
