//! Trait seams toward the platform layer and persistence. The geofence core
//! only ever talks to collaborators through these, so native OS behavior can
//! be replaced by test doubles.

use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::models::{GpsFix, HeartbeatState, PendingAction, SessionOrigin, WorkSession, WorkSite};

/// How a GPS fix should be acquired.
#[derive(Debug, Clone, Copy)]
pub struct FixRequest {
    /// Accept a cached fix no older than this many seconds. `None` forces a
    /// fresh acquisition.
    pub max_age_secs: Option<u64>,
    pub high_accuracy: bool,
}

impl FixRequest {
    pub fn cached(max_age_secs: u64) -> Self {
        Self {
            max_age_secs: Some(max_age_secs),
            high_accuracy: false,
        }
    }

    pub fn fresh() -> Self {
        Self {
            max_age_secs: None,
            high_accuracy: true,
        }
    }
}

/// Platform location services.
#[async_trait]
pub trait LocationProvider: Send + Sync {
    /// Returns `Ok(None)` when no fix satisfying the request is available.
    /// GPS unavailability is a normal outcome, never an error.
    async fn current_fix(&self, request: FixRequest) -> Result<Option<GpsFix>>;

    async fn battery_level(&self) -> Option<f32> {
        None
    }
}

/// One region handed to the native geofencing API.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FenceRegion {
    pub id: String,
    pub latitude: f64,
    pub longitude: f64,
    pub radius_m: f64,
    pub notify_enter: bool,
    pub notify_exit: bool,
}

impl FenceRegion {
    pub fn from_site(site: &WorkSite) -> Self {
        Self {
            id: site.id.clone(),
            latitude: site.latitude,
            longitude: site.longitude,
            radius_m: site.radius_m,
            notify_enter: true,
            notify_exit: true,
        }
    }
}

/// Native OS geofencing registration.
#[async_trait]
pub trait GeofencingPort: Send + Sync {
    async fn start_monitoring(&self, regions: &[FenceRegion]) -> Result<()>;
    async fn stop_monitoring(&self) -> Result<()>;
}

/// OS background task scheduling. Both calls are idempotent; unregistering a
/// task that was never registered succeeds.
#[async_trait]
pub trait TaskSchedulerPort: Send + Sync {
    async fn register_periodic(&self, name: &str, min_interval_secs: u64) -> Result<()>;
    async fn unregister_periodic(&self, name: &str) -> Result<()>;
}

/// Session persistence. The storage layer owns the single-open-session
/// invariant: `open_session` must fail while another session is open.
#[async_trait]
pub trait SessionRepository: Send + Sync {
    async fn open_session(
        &self,
        user_id: &str,
        site: &WorkSite,
        origin: SessionOrigin,
        device_id: &str,
        entered_at: DateTime<Utc>,
    ) -> Result<WorkSession>;

    async fn close_session(
        &self,
        user_id: &str,
        site_id: &str,
        adjustment_minutes: i64,
        exited_at: DateTime<Utc>,
    ) -> Result<()>;

    async fn get_open_session(&self, user_id: &str) -> Result<Option<WorkSession>>;
}

/// Durable key-value slot for the singleton pending action.
#[async_trait]
pub trait PendingActionStorage: Send + Sync {
    async fn save(&self, action: &PendingAction) -> Result<()>;
    async fn load(&self) -> Result<Option<PendingAction>>;
    async fn clear(&self) -> Result<()>;
}

/// Durable slot for the heartbeat scheduler state.
#[async_trait]
pub trait HeartbeatStateStorage: Send + Sync {
    async fn save(&self, state: &HeartbeatState) -> Result<()>;
    async fn load(&self) -> Result<Option<HeartbeatState>>;
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub enum GeofenceEventKind {
    Enter,
    Exit,
}

/// Raw event delivered by the native platform layer.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GeofenceEvent {
    pub kind: GeofenceEventKind,
    pub region_id: String,
}

/// Emitted after every heartbeat run for the UI/telemetry layer.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HeartbeatResult {
    pub inside_fence: bool,
    pub fence_id: Option<String>,
    pub fence_name: Option<String>,
    pub location: Option<GpsFix>,
    pub battery_level: Option<f32>,
    pub timestamp: DateTime<Utc>,
}

pub type HeartbeatCallback = Arc<dyn Fn(HeartbeatResult) + Send + Sync>;
