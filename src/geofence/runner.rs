use std::sync::Arc;

use anyhow::{bail, Context, Result};
use chrono::Utc;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{Duration, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use crate::geofence::config::GeofenceConfig;
use crate::geofence::controller::GeofenceController;
use crate::geofence::scheduler::HeartbeatScheduler;
use crate::ports::{FenceRegion, GeofencingPort, HeartbeatCallback};

// Set to true to enable verbose logging in this module
const ENABLE_LOGS: bool = true;

use crate::{log_error, log_info, log_warn};

const HEARTBEAT_RUN_TIMEOUT_SECS: u64 = 60;
const POLL_RUN_TIMEOUT_SECS: u64 = 30;

/// Owns the background loops: registers the native geofences, runs the
/// fixed-cadence polling loop and the adaptive heartbeat loop, and tears
/// everything down on stop.
pub struct GeofenceMonitor {
    controller: Arc<GeofenceController>,
    scheduler: Arc<HeartbeatScheduler>,
    geofencing: Arc<dyn GeofencingPort>,
    config: Arc<GeofenceConfig>,
    callback: Option<HeartbeatCallback>,
    heartbeat_handle: Option<JoinHandle<()>>,
    polling_handle: Option<JoinHandle<()>>,
    cancel_token: Option<CancellationToken>,
}

impl GeofenceMonitor {
    pub fn new(
        controller: Arc<GeofenceController>,
        scheduler: Arc<HeartbeatScheduler>,
        geofencing: Arc<dyn GeofencingPort>,
        config: Arc<GeofenceConfig>,
        callback: Option<HeartbeatCallback>,
    ) -> Self {
        Self {
            controller,
            scheduler,
            geofencing,
            config,
            callback,
            heartbeat_handle: None,
            polling_handle: None,
            cancel_token: None,
        }
    }

    pub async fn start(&mut self) -> Result<()> {
        if self.heartbeat_handle.is_some() {
            bail!("monitoring already active");
        }

        self.controller.restore().await?;

        let regions: Vec<FenceRegion> = self
            .controller
            .fences()
            .iter()
            .map(FenceRegion::from_site)
            .collect();
        if let Err(err) = self.geofencing.start_monitoring(&regions).await {
            // Degraded but continuing: polling and heartbeat still run.
            log_warn!("native geofencing registration failed: {err:?}");
        }

        let cancel_token = CancellationToken::new();

        let heartbeat = tokio::spawn(heartbeat_loop(
            self.controller.clone(),
            self.scheduler.subscribe(),
            self.callback.clone(),
            cancel_token.clone(),
        ));
        let polling = tokio::spawn(polling_loop(
            self.controller.clone(),
            self.config.polling_interval_secs,
            cancel_token.clone(),
        ));

        self.heartbeat_handle = Some(heartbeat);
        self.polling_handle = Some(polling);
        self.cancel_token = Some(cancel_token);
        Ok(())
    }

    pub async fn stop(&mut self) -> Result<()> {
        if let Some(token) = self.cancel_token.take() {
            token.cancel();
        }

        if let Some(handle) = self.heartbeat_handle.take() {
            handle.await.context("heartbeat loop task failed to join")?;
        }
        if let Some(handle) = self.polling_handle.take() {
            handle.await.context("polling loop task failed to join")?;
        }

        if let Err(err) = self.geofencing.stop_monitoring().await {
            log_warn!("failed to stop native geofencing: {err:?}");
        }
        Ok(())
    }
}

/// Adaptive-cadence heartbeat. The ticker is rebuilt whenever the scheduler
/// publishes a new interval; a rebuilt ticker fires immediately, which is
/// wanted when a pending action just tightened the cadence.
pub async fn heartbeat_loop(
    controller: Arc<GeofenceController>,
    mut interval_rx: watch::Receiver<u64>,
    callback: Option<HeartbeatCallback>,
    cancel_token: CancellationToken,
) {
    let mut interval_secs = *interval_rx.borrow();
    let mut ticker = tokio::time::interval(Duration::from_secs(interval_secs));
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                let now = Utc::now();
                let fut = controller.run_heartbeat(now);

                match tokio::time::timeout(Duration::from_secs(HEARTBEAT_RUN_TIMEOUT_SECS), fut).await {
                    Ok(Ok(Some(result))) => {
                        if let Some(cb) = &callback {
                            cb(result);
                        }
                    }
                    Ok(Ok(None)) => log_info!("heartbeat run dropped by evaluation guard"),
                    Ok(Err(err)) => log_error!("heartbeat run failed: {err:?}"),
                    Err(_) => log_warn!("heartbeat run timeout (> {HEARTBEAT_RUN_TIMEOUT_SECS}s)"),
                }
            }
            changed = interval_rx.changed() => {
                if changed.is_err() {
                    log_info!("heartbeat interval channel closed, shutting down");
                    break;
                }
                let next = *interval_rx.borrow_and_update();
                if next != interval_secs {
                    log_info!("heartbeat cadence now {next}s");
                    interval_secs = next;
                    ticker = tokio::time::interval(Duration::from_secs(interval_secs));
                    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
                }
            }
            _ = cancel_token.cancelled() => {
                log_info!("heartbeat loop shutting down");
                break;
            }
        }
    }
}

/// Fixed-cadence local polling, a first-line signal source alongside the
/// native callbacks.
pub async fn polling_loop(
    controller: Arc<GeofenceController>,
    interval_secs: u64,
    cancel_token: CancellationToken,
) {
    let mut ticker = tokio::time::interval(Duration::from_secs(interval_secs));
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                let now = Utc::now();
                let fut = controller.poll_tick(now);

                match tokio::time::timeout(Duration::from_secs(POLL_RUN_TIMEOUT_SECS), fut).await {
                    Ok(Ok(())) => {}
                    Ok(Err(err)) => log_error!("polling tick failed: {err:?}"),
                    Err(_) => log_warn!("polling tick timeout (> {POLL_RUN_TIMEOUT_SECS}s)"),
                }
            }
            _ = cancel_token.cancelled() => {
                log_info!("polling loop shutting down");
                break;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::Result;
    use async_trait::async_trait;
    use chrono::DateTime;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex as StdMutex;

    use crate::geofence::controller::{ControllerSettings, GeofenceController};
    use crate::models::{
        GpsFix, HeartbeatState, PendingAction, SessionOrigin, SiteStatus, WorkSession, WorkSite,
    };
    use crate::ports::{
        FixRequest, HeartbeatStateStorage, LocationProvider, PendingActionStorage,
        SessionRepository, TaskSchedulerPort,
    };

    struct NoFixLocation;

    #[async_trait]
    impl LocationProvider for NoFixLocation {
        async fn current_fix(&self, _request: FixRequest) -> Result<Option<GpsFix>> {
            Ok(None)
        }
    }

    struct EmptySessions;

    #[async_trait]
    impl SessionRepository for EmptySessions {
        async fn open_session(
            &self,
            _user_id: &str,
            _site: &WorkSite,
            _origin: SessionOrigin,
            _device_id: &str,
            _entered_at: DateTime<Utc>,
        ) -> Result<WorkSession> {
            anyhow::bail!("no session expected in these runs")
        }

        async fn close_session(
            &self,
            _user_id: &str,
            _site_id: &str,
            _adjustment_minutes: i64,
            _exited_at: DateTime<Utc>,
        ) -> Result<()> {
            anyhow::bail!("no session expected in these runs")
        }

        async fn get_open_session(&self, _user_id: &str) -> Result<Option<WorkSession>> {
            Ok(None)
        }
    }

    struct NullPending;

    #[async_trait]
    impl PendingActionStorage for NullPending {
        async fn save(&self, _action: &PendingAction) -> Result<()> {
            Ok(())
        }

        async fn load(&self) -> Result<Option<PendingAction>> {
            Ok(None)
        }

        async fn clear(&self) -> Result<()> {
            Ok(())
        }
    }

    struct NullHeartbeat;

    #[async_trait]
    impl HeartbeatStateStorage for NullHeartbeat {
        async fn save(&self, _state: &HeartbeatState) -> Result<()> {
            Ok(())
        }

        async fn load(&self) -> Result<Option<HeartbeatState>> {
            Ok(None)
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

    #[derive(Default)]
    struct RecordingGeofencing {
        started_with: StdMutex<Vec<usize>>,
        stops: AtomicUsize,
    }

    #[async_trait]
    impl GeofencingPort for RecordingGeofencing {
        async fn start_monitoring(&self, regions: &[FenceRegion]) -> Result<()> {
            self.started_with.lock().unwrap().push(regions.len());
            Ok(())
        }

        async fn stop_monitoring(&self) -> Result<()> {
            self.stops.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
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

    fn rig() -> (Arc<GeofenceConfig>, Arc<HeartbeatScheduler>, Arc<GeofenceController>) {
        let config = Arc::new(GeofenceConfig {
            evaluation_cooldown_ms: 0,
            ..GeofenceConfig::default()
        });
        let scheduler = Arc::new(HeartbeatScheduler::new(
            config.clone(),
            Arc::new(NullHeartbeat),
            Arc::new(NoopTasks),
        ));
        let controller = Arc::new(GeofenceController::new(
            config.clone(),
            ControllerSettings {
                user_id: "user-1".into(),
                device_id: "device-1".into(),
            },
            Arc::new(EmptySessions),
            Arc::new(NoFixLocation),
            Arc::new(NullPending),
            scheduler.clone(),
        ));
        (config, scheduler, controller)
    }

    #[tokio::test(start_paused = true)]
    async fn heartbeat_loop_tracks_interval_updates_and_stops_on_cancel() {
        let (_config, _scheduler, controller) = rig();

        let (interval_tx, interval_rx) = watch::channel(60u64);
        let runs = Arc::new(AtomicUsize::new(0));
        let counter = runs.clone();
        let callback: HeartbeatCallback = Arc::new(move |_result| {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        let cancel = CancellationToken::new();
        let handle = tokio::spawn(heartbeat_loop(
            controller,
            interval_rx,
            Some(callback),
            cancel.clone(),
        ));

        // Ticks at 0s, 60s and 120s of virtual time
        tokio::time::sleep(Duration::from_secs(130)).await;
        let at_slow_cadence = runs.load(Ordering::SeqCst);
        assert!(
            (2..=3).contains(&at_slow_cadence),
            "expected ~3 runs at 60s cadence, got {at_slow_cadence}"
        );

        // Tightened cadence: the rebuilt ticker fires immediately, then
        // every 10s. 35s of virtual time must fit at least three more runs,
        // which the old 60s cadence could not.
        interval_tx.send(10).unwrap();
        tokio::time::sleep(Duration::from_secs(35)).await;
        let at_fast_cadence = runs.load(Ordering::SeqCst);
        assert!(
            at_fast_cadence - at_slow_cadence >= 3,
            "expected the tightened cadence to take effect, got {at_slow_cadence} -> {at_fast_cadence}"
        );

        cancel.cancel();
        handle.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn monitor_start_registers_fences_and_stop_tears_down() {
        let (config, scheduler, controller) = rig();
        controller.set_fences(vec![yard()]);

        let geofencing = Arc::new(RecordingGeofencing::default());
        let mut monitor = GeofenceMonitor::new(
            controller,
            scheduler,
            geofencing.clone(),
            config,
            None,
        );

        monitor.start().await.unwrap();
        assert_eq!(geofencing.started_with.lock().unwrap().as_slice(), &[1]);

        // A second start while active is rejected
        assert!(monitor.start().await.is_err());

        monitor.stop().await.unwrap();
        assert_eq!(geofencing.stops.load(Ordering::SeqCst), 1);
    }
}
