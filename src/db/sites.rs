use anyhow::{bail, Result};
use chrono::Utc;
use rusqlite::{params, Row};

use crate::db::{helpers::parse_site_status, Database};
use crate::geo::fences_overlap;
use crate::models::{SiteLimits, SiteStatus, WorkSite};

const SITE_COLUMNS: &str = "id, name, latitude, longitude, radius_m, color, status";

fn row_to_site(row: &Row) -> Result<WorkSite> {
    let status: String = row.get("status")?;
    Ok(WorkSite {
        id: row.get("id")?,
        name: row.get("name")?,
        latitude: row.get("latitude")?,
        longitude: row.get("longitude")?,
        radius_m: row.get("radius_m")?,
        color: row.get("color")?,
        status: parse_site_status(&status)?,
    })
}

fn load_sites(conn: &rusqlite::Connection, only_active: bool) -> Result<Vec<WorkSite>> {
    let sql = if only_active {
        format!("SELECT {SITE_COLUMNS} FROM sites WHERE status = 'Active' ORDER BY name")
    } else {
        format!("SELECT {SITE_COLUMNS} FROM sites ORDER BY name")
    };
    let mut stmt = conn.prepare(&sql)?;
    let mut rows = stmt.query([])?;
    let mut sites = Vec::new();
    while let Some(row) = rows.next()? {
        sites.push(row_to_site(row)?);
    }
    Ok(sites)
}

impl Database {
    /// Create a site after validating the radius range and the no-overlap
    /// invariant against all currently active fences.
    pub async fn create_site(&self, site: &WorkSite, limits: &SiteLimits) -> Result<()> {
        let site = site.clone();
        let limits = *limits;

        self.execute(move |conn| {
            if site.radius_m < limits.min_radius_m || site.radius_m > limits.max_radius_m {
                bail!(
                    "radius {}m outside allowed range [{}m, {}m]",
                    site.radius_m,
                    limits.min_radius_m,
                    limits.max_radius_m
                );
            }

            for existing in load_sites(conn, true)? {
                if fences_overlap(&site, &existing) {
                    bail!(
                        "fence {} would overlap active fence {}",
                        site.name,
                        existing.name
                    );
                }
            }

            let now = Utc::now().to_rfc3339();
            conn.execute(
                "INSERT INTO sites (id, name, latitude, longitude, radius_m, color, status,
                     created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
                params![
                    site.id,
                    site.name,
                    site.latitude,
                    site.longitude,
                    site.radius_m,
                    site.color,
                    site.status.as_str(),
                    now,
                    now,
                ],
            )?;
            Ok(())
        })
        .await
    }

    pub async fn list_active_sites(&self) -> Result<Vec<WorkSite>> {
        self.execute(|conn| load_sites(conn, true)).await
    }

    pub async fn list_sites(&self) -> Result<Vec<WorkSite>> {
        self.execute(|conn| load_sites(conn, false)).await
    }

    /// Status transition used by the sync layer (Syncing, PendingDelete).
    pub async fn set_site_status(&self, site_id: &str, status: SiteStatus) -> Result<()> {
        let site_id = site_id.to_string();
        self.execute(move |conn| {
            let rows_affected = conn.execute(
                "UPDATE sites SET status = ?1, updated_at = ?2 WHERE id = ?3",
                params![status.as_str(), Utc::now().to_rfc3339(), site_id],
            )?;
            if rows_affected == 0 {
                bail!("site not found");
            }
            Ok(())
        })
        .await
    }

    /// Soft delete only, and never while an open session references the site.
    pub async fn delete_site(&self, site_id: &str) -> Result<()> {
        let site_id = site_id.to_string();
        self.execute(move |conn| {
            let open_sessions: i64 = conn.query_row(
                "SELECT COUNT(*) FROM sessions WHERE site_id = ?1 AND exited_at IS NULL",
                params![site_id],
                |row| row.get(0),
            )?;
            if open_sessions > 0 {
                bail!("cannot delete site {site_id}: an open session references it");
            }

            let rows_affected = conn.execute(
                "UPDATE sites SET status = 'Deleted', updated_at = ?1 WHERE id = ?2",
                params![Utc::now().to_rfc3339(), site_id],
            )?;
            if rows_affected == 0 {
                bail!("site not found");
            }
            Ok(())
        })
        .await
    }
}
