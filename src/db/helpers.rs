use anyhow::{anyhow, Context, Result};
use chrono::{DateTime, Utc};

use crate::models::{SessionOrigin, SiteStatus};

pub fn parse_datetime(value: &str, field: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(value)
        .map(|dt| dt.with_timezone(&Utc))
        .with_context(|| format!("failed to parse {field}"))
}

pub fn parse_optional_datetime(
    value: Option<String>,
    field: &str,
) -> Result<Option<DateTime<Utc>>> {
    match value {
        Some(raw) => parse_datetime(&raw, field).map(Some),
        None => Ok(None),
    }
}

pub fn parse_origin(value: &str) -> Result<SessionOrigin> {
    match value {
        "Automatic" => Ok(SessionOrigin::Automatic),
        "Manual" => Ok(SessionOrigin::Manual),
        other => Err(anyhow!("unknown session origin {other}")),
    }
}

pub fn parse_site_status(value: &str) -> Result<SiteStatus> {
    match value {
        "Active" => Ok(SiteStatus::Active),
        "Deleted" => Ok(SiteStatus::Deleted),
        "PendingDelete" => Ok(SiteStatus::PendingDelete),
        "Syncing" => Ok(SiteStatus::Syncing),
        other => Err(anyhow!("unknown site status {other}")),
    }
}
