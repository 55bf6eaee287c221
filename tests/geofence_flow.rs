use std::sync::{Arc, Mutex};

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use tempfile::TempDir;

use geotrack::geofence::pending::Resolution;
use geotrack::models::{GpsFix, IntervalReason, SessionOrigin, SiteStatus, WorkSite};
use geotrack::ports::{FixRequest, LocationProvider, SessionRepository, TaskSchedulerPort};
use geotrack::{
    ControllerSettings, Database, GeofenceConfig, GeofenceController, HeartbeatScheduler,
    TtlOutcome,
};

struct FakeLocation {
    fix: Mutex<Option<GpsFix>>,
}

impl FakeLocation {
    fn new() -> Self {
        Self {
            fix: Mutex::new(None),
        }
    }

    fn set_position(&self, latitude: f64, longitude: f64, accuracy_m: f64) {
        *self.fix.lock().unwrap() = Some(GpsFix {
            latitude,
            longitude,
            accuracy_m,
            timestamp: Utc::now(),
        });
    }
}

#[async_trait]
impl LocationProvider for FakeLocation {
    async fn current_fix(&self, _request: FixRequest) -> Result<Option<GpsFix>> {
        Ok(*self.fix.lock().unwrap())
    }
}

struct NoopTasks;

#[async_trait]
impl TaskSchedulerPort for NoopTasks {
    async fn register_periodic(&self, _name: &str, _min_interval_secs: u64) -> Result<()> {
        Ok(())
    }

    async fn unregister_periodic(&self, _name: &str) -> Result<()> {
        Ok(())
    }
}

// Around latitude 52 one degree of latitude is ~111 195 m.
fn lat_offset_m(meters: f64) -> f64 {
    52.0 + meters / 111_195.0
}

fn yard() -> WorkSite {
    WorkSite {
        id: "yard".into(),
        name: "Yard".into(),
        latitude: 52.0,
        longitude: 13.0,
        radius_m: 100.0,
        color: "#336699".into(),
        status: SiteStatus::Active,
    }
}

struct Rig {
    _dir: TempDir,
    db: Database,
    location: Arc<FakeLocation>,
    controller: Arc<GeofenceController>,
    scheduler: Arc<HeartbeatScheduler>,
}

fn rig() -> Rig {
    geotrack::utils::logging::init();
    let dir = TempDir::new().expect("tempdir");
    let db = Database::new(dir.path().join("geotrack.db")).expect("database");

    let config = Arc::new(GeofenceConfig {
        evaluation_cooldown_ms: 0,
        ..GeofenceConfig::default()
    });
    let location = Arc::new(FakeLocation::new());
    let scheduler = Arc::new(HeartbeatScheduler::new(
        config.clone(),
        Arc::new(db.clone()),
        Arc::new(NoopTasks),
    ));
    let controller = Arc::new(GeofenceController::new(
        config,
        ControllerSettings {
            user_id: "user-1".into(),
            device_id: "device-1".into(),
        },
        Arc::new(db.clone()),
        location.clone(),
        Arc::new(db.clone()),
        scheduler.clone(),
    ));

    Rig {
        _dir: dir,
        db,
        location,
        controller,
        scheduler,
    }
}

/// Full automatic entry-to-exit walk: outside, enter, linger in the
/// hysteresis zone, leave, TTL expiry closes the session.
#[tokio::test]
async fn entry_hysteresis_pending_exit_ttl_close() {
    let rig = rig();
    rig.db
        .create_site(&yard(), &Default::default())
        .await
        .expect("create site");
    rig.controller
        .set_fences(rig.db.list_active_sites().await.unwrap());

    let t0: DateTime<Utc> = Utc::now();

    // 150 m from center: outside, nothing happens
    rig.location.set_position(lat_offset_m(150.0), 13.0, 10.0);
    rig.controller.poll_tick(t0).await.unwrap();
    assert!(rig.db.get_open_session("user-1").await.unwrap().is_none());

    // 80 m: inside, a session opens automatically
    rig.location.set_position(lat_offset_m(80.0), 13.0, 10.0);
    rig.controller.poll_tick(t0).await.unwrap();
    let open = rig.db.get_open_session("user-1").await.unwrap().unwrap();
    assert_eq!(open.site_id, "yard");
    assert_eq!(open.origin, SessionOrigin::Automatic);

    // 120 m: nominal-outside but hysteresis-inside, no pending action
    rig.location.set_position(lat_offset_m(120.0), 13.0, 10.0);
    rig.controller.poll_tick(t0).await.unwrap();
    assert!(rig.controller.pending_action().await.is_none());
    assert!(rig.db.get_open_session("user-1").await.unwrap().is_some());

    // 160 m: beyond the expanded radius, exit is deferred
    rig.location.set_position(lat_offset_m(160.0), 13.0, 10.0);
    rig.controller.poll_tick(t0).await.unwrap();
    let pending = rig.controller.pending_action().await.unwrap();
    assert_eq!(pending.site_id, "yard");
    let state = rig.scheduler.current_state().await;
    assert_eq!(state.interval_secs, 60);
    assert_eq!(state.reason, IntervalReason::PendingExit);

    // 61 s later the TTL check runs with a fresh fix confirming 170 m
    rig.location.set_position(lat_offset_m(170.0), 13.0, 10.0);
    let outcome = rig
        .controller
        .check_pending_ttl(t0 + Duration::seconds(61))
        .await
        .unwrap();
    assert_eq!(outcome, TtlOutcome::Resolved(Resolution::AutoEnd));

    assert!(rig.db.get_open_session("user-1").await.unwrap().is_none());
    assert!(rig.controller.pending_action().await.is_none());

    // Immediately after a resolution the cadence is recent_transition,
    // not yet back to normal.
    let state = rig.scheduler.current_state().await;
    assert_eq!(state.interval_secs, 300);
    assert_eq!(state.reason, IntervalReason::RecentTransition);

    let sessions = rig.db.list_recent_sessions("user-1", 10).await.unwrap();
    assert_eq!(sessions.len(), 1);
    assert!(sessions[0].exited_at.is_some());
}

/// A relaunched controller resumes with the persisted pending action and
/// heartbeat cadence.
#[tokio::test]
async fn restart_restores_pending_action_and_cadence() {
    let rig = rig();
    rig.db
        .create_site(&yard(), &Default::default())
        .await
        .expect("create site");
    rig.controller
        .set_fences(rig.db.list_active_sites().await.unwrap());

    let t0 = Utc::now();
    rig.location.set_position(lat_offset_m(80.0), 13.0, 10.0);
    rig.controller.poll_tick(t0).await.unwrap();
    rig.location.set_position(lat_offset_m(160.0), 13.0, 10.0);
    rig.controller.poll_tick(t0).await.unwrap();
    assert!(rig.controller.pending_action().await.is_some());

    // Second controller over the same database, as after a process restart
    let config = Arc::new(GeofenceConfig {
        evaluation_cooldown_ms: 0,
        ..GeofenceConfig::default()
    });
    let scheduler = Arc::new(HeartbeatScheduler::new(
        config.clone(),
        Arc::new(rig.db.clone()),
        Arc::new(NoopTasks),
    ));
    let controller = GeofenceController::new(
        config,
        ControllerSettings {
            user_id: "user-1".into(),
            device_id: "device-1".into(),
        },
        Arc::new(rig.db.clone()),
        rig.location.clone(),
        Arc::new(rig.db.clone()),
        scheduler.clone(),
    );
    controller.set_fences(rig.db.list_active_sites().await.unwrap());
    controller.restore().await.unwrap();

    let pending = controller.pending_action().await.unwrap();
    assert_eq!(pending.site_id, "yard");
    // Open session marks its site as the active fence again
    assert_eq!(controller.current_fence(), Some("yard".into()));

    let state = scheduler.current_state().await;
    assert_eq!(state.interval_secs, 60);
    assert_eq!(state.reason, IntervalReason::PendingExit);
}
