use anyhow::{anyhow, bail, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rusqlite::{params, OptionalExtension, Row};
use uuid::Uuid;

use crate::db::{
    helpers::{parse_datetime, parse_optional_datetime, parse_origin},
    Database,
};
use crate::models::{SessionOrigin, WorkSession, WorkSite};
use crate::ports::SessionRepository;

const SESSION_COLUMNS: &str = "id, user_id, site_id, site_name, site_color, entered_at, \
     exited_at, origin, manually_edited, edit_reason, pause_minutes, device_id, integrity_hash";

fn row_to_session(row: &Row) -> Result<WorkSession> {
    let entered_at: String = row.get("entered_at")?;
    let exited_at: Option<String> = row.get("exited_at")?;
    let origin: String = row.get("origin")?;

    Ok(WorkSession {
        id: row.get("id")?,
        user_id: row.get("user_id")?,
        site_id: row.get("site_id")?,
        site_name: row.get("site_name")?,
        site_color: row.get("site_color")?,
        entered_at: parse_datetime(&entered_at, "entered_at")?,
        exited_at: parse_optional_datetime(exited_at, "exited_at")?,
        origin: parse_origin(&origin)?,
        manually_edited: row.get("manually_edited")?,
        edit_reason: row.get("edit_reason")?,
        pause_minutes: row.get("pause_minutes")?,
        device_id: row.get("device_id")?,
        integrity_hash: row.get("integrity_hash")?,
    })
}

fn find_open_session(
    conn: &rusqlite::Connection,
    user_id: &str,
) -> Result<Option<WorkSession>> {
    let mut stmt = conn.prepare(&format!(
        "SELECT {SESSION_COLUMNS} FROM sessions
         WHERE user_id = ?1 AND exited_at IS NULL
         LIMIT 1",
    ))?;

    let mut rows = stmt.query(params![user_id])?;
    match rows.next()? {
        Some(row) => Ok(Some(row_to_session(row)?)),
        None => Ok(None),
    }
}

#[async_trait]
impl SessionRepository for Database {
    /// Opening while another session is open is a hard error; the partial
    /// unique index backs this up against racing writers.
    async fn open_session(
        &self,
        user_id: &str,
        site: &WorkSite,
        origin: SessionOrigin,
        device_id: &str,
        entered_at: DateTime<Utc>,
    ) -> Result<WorkSession> {
        let user_id = user_id.to_string();
        let site = site.clone();
        let device_id = device_id.to_string();

        self.execute(move |conn| {
            if let Some(open) = find_open_session(conn, &user_id)? {
                bail!(
                    "cannot open session at {}: session {} is still open",
                    site.name,
                    open.id
                );
            }

            let session = WorkSession {
                id: Uuid::new_v4().to_string(),
                user_id,
                site_id: site.id.clone(),
                site_name: site.name.clone(),
                site_color: site.color.clone(),
                entered_at,
                exited_at: None,
                origin,
                manually_edited: false,
                edit_reason: None,
                pause_minutes: 0,
                device_id,
                integrity_hash: None,
            };

            conn.execute(
                "INSERT INTO sessions (id, user_id, site_id, site_name, site_color, entered_at,
                     exited_at, origin, manually_edited, edit_reason, pause_minutes, device_id,
                     integrity_hash)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)",
                params![
                    session.id,
                    session.user_id,
                    session.site_id,
                    session.site_name,
                    session.site_color,
                    session.entered_at.to_rfc3339(),
                    Option::<String>::None,
                    session.origin.as_str(),
                    session.manually_edited,
                    session.edit_reason,
                    session.pause_minutes,
                    session.device_id,
                    session.integrity_hash,
                ],
            )?;

            Ok(session)
        })
        .await
    }

    async fn close_session(
        &self,
        user_id: &str,
        site_id: &str,
        adjustment_minutes: i64,
        exited_at: DateTime<Utc>,
    ) -> Result<()> {
        let user_id = user_id.to_string();
        let site_id = site_id.to_string();

        self.execute(move |conn| {
            let rows_affected = conn.execute(
                "UPDATE sessions
                 SET exited_at = ?1,
                     pause_minutes = pause_minutes + ?2
                 WHERE user_id = ?3 AND site_id = ?4 AND exited_at IS NULL",
                params![exited_at.to_rfc3339(), adjustment_minutes, user_id, site_id],
            )?;

            if rows_affected == 0 {
                bail!("no open session at site {site_id} to close");
            }

            Ok(())
        })
        .await
    }

    async fn get_open_session(&self, user_id: &str) -> Result<Option<WorkSession>> {
        let user_id = user_id.to_string();
        self.execute(move |conn| find_open_session(conn, &user_id)).await
    }
}

impl Database {
    pub async fn get_session(&self, session_id: &str) -> Result<WorkSession> {
        let session_id = session_id.to_string();
        self.execute(move |conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {SESSION_COLUMNS} FROM sessions WHERE id = ?1",
            ))?;

            let row = stmt
                .query_row(params![session_id.clone()], |row| Ok(row_to_session(row)))
                .optional()?;

            match row {
                Some(session) => session,
                None => Err(anyhow!("session {session_id} not found")),
            }
        })
        .await
    }

    /// Manual correction of a closed or open session; records who asked why.
    pub async fn apply_manual_edit(
        &self,
        session_id: &str,
        entered_at: DateTime<Utc>,
        exited_at: Option<DateTime<Utc>>,
        reason: &str,
    ) -> Result<()> {
        let session_id = session_id.to_string();
        let reason = reason.to_string();

        self.execute(move |conn| {
            let rows_affected = conn.execute(
                "UPDATE sessions
                 SET entered_at = ?1,
                     exited_at = ?2,
                     manually_edited = 1,
                     edit_reason = ?3
                 WHERE id = ?4",
                params![
                    entered_at.to_rfc3339(),
                    exited_at.map(|dt| dt.to_rfc3339()),
                    reason,
                    session_id,
                ],
            )?;

            if rows_affected == 0 {
                bail!("session not found");
            }
            Ok(())
        })
        .await
    }

    /// Pause-time reconciliation for an existing session.
    pub async fn add_pause_minutes(&self, session_id: &str, minutes: i64) -> Result<()> {
        let session_id = session_id.to_string();
        self.execute(move |conn| {
            let rows_affected = conn.execute(
                "UPDATE sessions
                 SET pause_minutes = pause_minutes + ?1
                 WHERE id = ?2",
                params![minutes, session_id],
            )?;

            if rows_affected == 0 {
                bail!("session not found");
            }
            Ok(())
        })
        .await
    }

    pub async fn list_recent_sessions(
        &self,
        user_id: &str,
        limit: usize,
    ) -> Result<Vec<WorkSession>> {
        let user_id = user_id.to_string();
        let limit = limit as i64;

        self.execute(move |conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {SESSION_COLUMNS} FROM sessions
                 WHERE user_id = ?1
                 ORDER BY entered_at DESC
                 LIMIT ?2",
            ))?;

            let mut rows = stmt.query(params![user_id, limit])?;
            let mut sessions = Vec::new();
            while let Some(row) = rows.next()? {
                sessions.push(row_to_session(row)?);
            }

            Ok(sessions)
        })
        .await
    }
}
