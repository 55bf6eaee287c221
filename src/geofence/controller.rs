use std::sync::{Arc, Mutex, RwLock};

use anyhow::{bail, Context, Result};
use chrono::{DateTime, Utc};

use crate::geofence::config::GeofenceConfig;
use crate::geofence::evaluator::{Containment, GeofenceEvaluator};
use crate::geofence::guard::EvaluationGuard;
use crate::geofence::pending::{resolve_expired, PendingActionManager, Resolution};
use crate::geofence::pingpong::PingPongDetector;
use crate::geofence::scheduler::HeartbeatScheduler;
use crate::models::{
    GpsFix, GpsSnapshot, PendingAction, PendingKind, SessionOrigin, SiteStatus, WorkSite,
};
use crate::ports::{
    FixRequest, GeofenceEvent, GeofenceEventKind, HeartbeatResult, LocationProvider,
    PendingActionStorage, SessionRepository,
};

// Set to true to enable verbose logging in this module
const ENABLE_LOGS: bool = true;

use crate::{log_info, log_warn};

/// Identity the controller acts on behalf of.
#[derive(Debug, Clone)]
pub struct ControllerSettings {
    pub user_id: String,
    pub device_id: String,
}

/// Outcome of a TTL check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TtlOutcome {
    NoPending,
    /// A pending action exists but has not expired yet.
    Waiting { remaining_ms: i64 },
    Resolved(Resolution),
}

/// The orchestrating state machine. Consumes raw enter/exit signals from the
/// native platform layer and the local polling loop, defers ambiguous exits
/// behind a TTL'd pending action, and reconciles everything on the heartbeat.
pub struct GeofenceController {
    config: Arc<GeofenceConfig>,
    settings: ControllerSettings,
    evaluator: GeofenceEvaluator,
    pending: PendingActionManager,
    scheduler: Arc<HeartbeatScheduler>,
    sessions: Arc<dyn SessionRepository>,
    location: Arc<dyn LocationProvider>,
    fences: RwLock<Vec<WorkSite>>,
    /// Fence the user is currently considered inside, if any.
    active_fence: Mutex<Option<String>>,
    guard: EvaluationGuard,
    ping_pong: Mutex<PingPongDetector>,
}

impl GeofenceController {
    pub fn new(
        config: Arc<GeofenceConfig>,
        settings: ControllerSettings,
        sessions: Arc<dyn SessionRepository>,
        location: Arc<dyn LocationProvider>,
        pending_storage: Arc<dyn PendingActionStorage>,
        scheduler: Arc<HeartbeatScheduler>,
    ) -> Self {
        Self {
            evaluator: GeofenceEvaluator::new(&config),
            guard: EvaluationGuard::new(config.evaluation_cooldown_ms),
            ping_pong: Mutex::new(PingPongDetector::new(
                config.ping_pong_window_secs,
                config.ping_pong_threshold,
            )),
            pending: PendingActionManager::new(pending_storage),
            config,
            settings,
            scheduler,
            sessions,
            location,
            fences: RwLock::new(Vec::new()),
            active_fence: Mutex::new(None),
        }
    }

    /// Reload persisted state after a process restart. An open session marks
    /// its site as the active fence again.
    pub async fn restore(&self) -> Result<()> {
        self.pending.restore().await;
        self.scheduler.restore().await;

        match self.sessions.get_open_session(&self.settings.user_id).await {
            Ok(Some(session)) => {
                log_info!("restored open session at site {}", session.site_id);
                self.set_active_fence(Some(session.site_id));
            }
            Ok(None) => {}
            Err(err) => log_warn!("failed to look up open session on restore: {err:?}"),
        }
        Ok(())
    }

    /// Replace the active-fence cache. Pushed by the owning collaborator
    /// whenever sites change; read-only from the core's perspective.
    pub fn set_fences(&self, sites: Vec<WorkSite>) {
        let mut fences = self.fences.write().unwrap_or_else(|p| p.into_inner());
        *fences = sites
            .into_iter()
            .filter(|site| site.status == SiteStatus::Active)
            .collect();
    }

    pub fn fences(&self) -> Vec<WorkSite> {
        self.fences
            .read()
            .unwrap_or_else(|p| p.into_inner())
            .clone()
    }

    /// Id of the fence the user is currently considered inside.
    pub fn current_fence(&self) -> Option<String> {
        self.active_fence
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .clone()
    }

    fn set_active_fence(&self, fence_id: Option<String>) {
        *self
            .active_fence
            .lock()
            .unwrap_or_else(|p| p.into_inner()) = fence_id;
    }

    pub async fn pending_action(&self) -> Option<PendingAction> {
        self.pending.current().await
    }

    /// Defer a transition of any kind behind a TTL'd pending action. The exit
    /// path lands here internally; enter and return deferrals come from the
    /// embedding app (notification flows). The new action supersedes any
    /// existing one and immediately reprioritizes the heartbeat.
    pub async fn request_pending(
        &self,
        kind: PendingKind,
        site_id: &str,
        now: DateTime<Utc>,
    ) -> Result<()> {
        let Some(fence) = self.fences().into_iter().find(|site| site.id == site_id) else {
            bail!("cannot defer {} for unknown site {site_id}", kind.as_str());
        };

        let snapshot = self.acquire_cached_fix().await.map(|fix| GpsSnapshot {
            latitude: fix.latitude,
            longitude: fix.longitude,
            accuracy_m: fix.accuracy_m,
        });
        let action = PendingAction {
            kind,
            site_id: fence.id,
            site_name: fence.name,
            notification_id: None,
            created_at: now,
            timeout_ms: self.config.pending_timeout_ms(kind),
            gps_snapshot: snapshot,
        };
        log_info!(
            "{} for {} deferred behind pending action ({}ms)",
            kind.as_str(),
            action.site_name,
            action.timeout_ms
        );
        self.pending.create(action.clone()).await;
        self.scheduler.recompute(Some(&action), now).await;
        Ok(())
    }

    /// Raw callback from the native geofencing layer.
    pub async fn handle_native_event(&self, event: GeofenceEvent, now: DateTime<Utc>) -> Result<()> {
        if !self.guard.try_begin() {
            log_info!(
                "dropping native {} for {} (evaluation in flight)",
                match event.kind {
                    GeofenceEventKind::Enter => "enter",
                    GeofenceEventKind::Exit => "exit",
                },
                event.region_id
            );
            return Ok(());
        }
        let result = self.process_native_event(&event, now).await;
        self.guard.finish();
        result
    }

    async fn process_native_event(&self, event: &GeofenceEvent, now: DateTime<Utc>) -> Result<()> {
        let Some(fence) = self
            .fences()
            .into_iter()
            .find(|site| site.id == event.region_id)
        else {
            log_warn!("native event for unknown region {}", event.region_id);
            return Ok(());
        };

        self.ping_pong
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .record(event.kind, now);

        match event.kind {
            GeofenceEventKind::Enter => self.handle_enter_signal(&fence, now).await,
            GeofenceEventKind::Exit => self.handle_exit_signal(&fence, now, true).await,
        }
    }

    /// Entry is trusted without TTL deferral: a false entry self-corrects
    /// through the exit hysteresis and TTL path.
    async fn handle_enter_signal(&self, fence: &WorkSite, now: DateTime<Utc>) -> Result<()> {
        let open = self
            .sessions
            .get_open_session(&self.settings.user_id)
            .await
            .context("open-session lookup failed on enter signal")?;

        match open {
            None => {
                let session = self
                    .sessions
                    .open_session(
                        &self.settings.user_id,
                        fence,
                        SessionOrigin::Automatic,
                        &self.settings.device_id,
                        now,
                    )
                    .await
                    .context("failed to open session on enter")?;
                log_info!("entered {}, opened session {}", fence.name, session.id);

                self.set_active_fence(Some(fence.id.clone()));
                self.pending.clear().await;
                self.scheduler.note_transition(now).await;
                self.scheduler.recompute(None, now).await;
            }
            Some(session) if session.site_id == fence.id => {
                self.set_active_fence(Some(fence.id.clone()));
                // Re-entering the session's own fence corroborates a return;
                // a deferred exit is no longer warranted.
                if let Some(action) = self.pending.current().await {
                    if action.kind == PendingKind::Exit && action.site_id == fence.id {
                        log_info!("enter corroborates return to {}, dropping pending exit", fence.name);
                        self.pending.clear().await;
                        self.scheduler.recompute(None, now).await;
                    }
                }
            }
            Some(session) => {
                // A second open session would break the global invariant.
                log_warn!(
                    "enter at {} ignored: session already open at site {}",
                    fence.name,
                    session.site_id
                );
            }
        }
        Ok(())
    }

    /// Exits are never acted on directly; a genuine one becomes a pending
    /// action whose TTL gives a correction window.
    async fn handle_exit_signal(
        &self,
        fence: &WorkSite,
        now: DateTime<Utc>,
        revalidate: bool,
    ) -> Result<()> {
        if revalidate {
            // Native exits can fire right at the nominal boundary. While the
            // position is still within the expanded radius the event is noise.
            if let Some(fix) = self.acquire_fix(now).await {
                if !self.evaluator.confirms_exit(fix.latitude, fix.longitude, fence) {
                    log_info!(
                        "exit for {} discarded: still within hysteresis zone",
                        fence.name
                    );
                    return Ok(());
                }
            }
        }

        let open = self
            .sessions
            .get_open_session(&self.settings.user_id)
            .await
            .context("open-session lookup failed on exit signal")?;

        match open {
            Some(session) if session.site_id == fence.id => {
                if let Some(action) = self.pending.current().await {
                    if action.kind == PendingKind::Exit && action.site_id == fence.id {
                        return Ok(());
                    }
                }

                self.request_pending(PendingKind::Exit, &fence.id, now).await?;
            }
            _ => {
                log_info!("exit from {} with no matching open session", fence.name);
                let current = self.current_fence();
                if current.as_deref() == Some(fence.id.as_str()) {
                    self.set_active_fence(None);
                }
            }
        }
        Ok(())
    }

    /// Local polling tick, the fixed-cadence first-line signal next to
    /// native callbacks. Synthesizes enter/exit signals from containment.
    pub async fn poll_tick(&self, now: DateTime<Utc>) -> Result<()> {
        if !self.guard.try_begin() {
            return Ok(());
        }
        let result = self.poll_tick_inner(now).await;
        self.guard.finish();
        result
    }

    async fn poll_tick_inner(&self, now: DateTime<Utc>) -> Result<()> {
        let fix = self
            .location
            .current_fix(FixRequest {
                max_age_secs: Some(self.config.polling_interval_secs),
                high_accuracy: false,
            })
            .await
            .unwrap_or_else(|err| {
                log_warn!("polling fix failed: {err:?}");
                None
            });

        let Some(fix) = fix else {
            return self.check_pending_ttl(now).await.map(|_| ());
        };

        let fences = self.fences();
        let containment = self.evaluator.evaluate(
            fix.latitude,
            fix.longitude,
            &fences,
            self.current_fence().as_deref(),
        );

        match containment {
            Containment::Inside(fence) => {
                let open = self
                    .sessions
                    .get_open_session(&self.settings.user_id)
                    .await?;
                if open.is_none() {
                    self.ping_pong
                        .lock()
                        .unwrap_or_else(|p| p.into_inner())
                        .record(GeofenceEventKind::Enter, now);
                    self.handle_enter_signal(&fence, now).await?;
                } else {
                    self.set_active_fence(Some(fence.id));
                }
            }
            Containment::Hysteresis(_) => {
                // Boundary jitter; still inside.
            }
            Containment::Outside => {
                let open = self
                    .sessions
                    .get_open_session(&self.settings.user_id)
                    .await?;
                if let Some(session) = open {
                    if let Some(fence) = fences.iter().find(|site| site.id == session.site_id) {
                        self.ping_pong
                            .lock()
                            .unwrap_or_else(|p| p.into_inner())
                            .record(GeofenceEventKind::Exit, now);
                        // Already beyond the expanded radius per the evaluate
                        // above, so skip the re-validation fix.
                        self.handle_exit_signal(fence, now, false).await?;
                    }
                } else if self.current_fence().is_some() {
                    self.set_active_fence(None);
                }
            }
        }

        self.check_pending_ttl(now).await.map(|_| ())
    }

    /// Lazy pull-based TTL check. Callable from any trigger site (heartbeat,
    /// app foreground, explicit poll); an expired pending action is resolved
    /// against a freshly acquired fix, never a stale one.
    pub async fn check_pending_ttl(&self, now: DateTime<Utc>) -> Result<TtlOutcome> {
        let Some(action) = self.pending.current().await else {
            return Ok(TtlOutcome::NoPending);
        };

        if !action.is_expired(now) {
            return Ok(TtlOutcome::Waiting {
                remaining_ms: action.remaining_ms(now),
            });
        }

        let fix = self.acquire_fix(now).await;
        let inside = fix.map(|fix| self.is_inside_target(&fix, &action));

        let resolution = resolve_expired(action.kind, inside);
        log_info!(
            "pending {} for {} expired: gps={:?} -> {:?}",
            action.kind.as_str(),
            action.site_name,
            inside,
            resolution
        );

        self.apply_resolution(resolution, &action, now).await?;

        self.pending.clear().await;
        self.scheduler.note_transition(now).await;
        self.scheduler.recompute(None, now).await;

        Ok(TtlOutcome::Resolved(resolution))
    }

    /// Containment of the pending action's target fence. Fences that were
    /// active when the action was created (exit/return) keep their expanded
    /// radius so a user lingering in the hysteresis zone is not closed out.
    fn is_inside_target(&self, fix: &GpsFix, action: &PendingAction) -> bool {
        let fences = self.fences();
        let Some(target) = fences.iter().find(|site| site.id == action.site_id) else {
            log_warn!("pending target site {} no longer configured", action.site_id);
            return false;
        };

        match action.kind {
            PendingKind::Enter => self
                .evaluator
                .find_containing_fence(fix.latitude, fix.longitude, std::slice::from_ref(target))
                .is_some(),
            PendingKind::Exit | PendingKind::Return => {
                !self.evaluator.is_outside_expanded(fix.latitude, fix.longitude, target)
            }
        }
    }

    async fn apply_resolution(
        &self,
        resolution: Resolution,
        action: &PendingAction,
        now: DateTime<Utc>,
    ) -> Result<()> {
        match resolution {
            Resolution::AutoStart | Resolution::AutoResume => {
                let open = self
                    .sessions
                    .get_open_session(&self.settings.user_id)
                    .await?;
                if open.is_some() {
                    log_warn!(
                        "{} for {} skipped: a session is already open",
                        action.kind.as_str(),
                        action.site_name
                    );
                    return Ok(());
                }
                let fences = self.fences();
                let Some(target) = fences.iter().find(|site| site.id == action.site_id) else {
                    log_warn!("cannot open session: site {} is gone", action.site_id);
                    return Ok(());
                };
                self.sessions
                    .open_session(
                        &self.settings.user_id,
                        target,
                        SessionOrigin::Automatic,
                        &self.settings.device_id,
                        now,
                    )
                    .await
                    .context("failed to open session on TTL resolution")?;
                self.set_active_fence(Some(action.site_id.clone()));
            }
            Resolution::AutoEnd => {
                let open = self
                    .sessions
                    .get_open_session(&self.settings.user_id)
                    .await?;
                match open {
                    Some(session) if session.site_id == action.site_id => {
                        self.sessions
                            .close_session(&self.settings.user_id, &action.site_id, 0, now)
                            .await
                            .context("failed to close session on TTL resolution")?;
                        self.set_active_fence(None);
                    }
                    _ => {
                        log_warn!(
                            "auto_end for {} skipped: no matching open session",
                            action.site_name
                        );
                    }
                }
            }
            Resolution::Drop => {
                if action.kind == PendingKind::Exit {
                    // User came back before the auto-stop fired.
                    self.set_active_fence(Some(action.site_id.clone()));
                }
            }
        }
        Ok(())
    }

    /// One heartbeat run: fresh fix, audit against the open session, TTL
    /// check, ping-pong check, interval recompute. Returns `None` when the
    /// evaluation guard dropped the run.
    pub async fn run_heartbeat(&self, now: DateTime<Utc>) -> Result<Option<HeartbeatResult>> {
        if !self.guard.try_begin() {
            return Ok(None);
        }
        let result = self.run_heartbeat_inner(now).await;
        self.guard.finish();
        result.map(Some)
    }

    async fn run_heartbeat_inner(&self, now: DateTime<Utc>) -> Result<HeartbeatResult> {
        let fix = self.acquire_fix(now).await;

        self.audit_session_against_fix(fix.as_ref(), now).await?;

        self.check_pending_ttl(now).await?;

        if self
            .ping_pong
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .is_ping_ponging(now)
        {
            log_warn!("ping-ponging near a fence boundary detected");
        }

        let pending = self.pending.current().await;
        self.scheduler.recompute(pending.as_ref(), now).await;

        let (inside_fence, fence_id, fence_name) = match fix {
            Some(fix) => {
                let containment = self.evaluator.evaluate(
                    fix.latitude,
                    fix.longitude,
                    &self.fences(),
                    self.current_fence().as_deref(),
                );
                let fence = containment.fence();
                (
                    containment.is_inside(),
                    fence.map(|site| site.id.clone()),
                    fence.map(|site| site.name.clone()),
                )
            }
            None => {
                let current = self.current_fence();
                let name = current.as_ref().and_then(|id| {
                    self.fences()
                        .iter()
                        .find(|site| &site.id == id)
                        .map(|site| site.name.clone())
                });
                (current.is_some(), current, name)
            }
        };

        Ok(HeartbeatResult {
            inside_fence,
            fence_id,
            fence_name,
            location: fix,
            battery_level: self.location.battery_level().await,
            timestamp: now,
        })
    }

    /// Heartbeat audit: the fresh fix is already a delayed safety net, so a
    /// missed exit closes the session directly, without pending-action
    /// deferral. A missed entry only updates the inside indicator; opening
    /// is left to the next first-line enter signal.
    async fn audit_session_against_fix(
        &self,
        fix: Option<&GpsFix>,
        now: DateTime<Utc>,
    ) -> Result<()> {
        let Some(fix) = fix else {
            return Ok(());
        };

        let open = self
            .sessions
            .get_open_session(&self.settings.user_id)
            .await?;
        let fences = self.fences();

        match open {
            Some(session) => {
                let Some(site) = fences.iter().find(|site| site.id == session.site_id) else {
                    return Ok(());
                };
                if self
                    .evaluator
                    .is_outside_expanded(fix.latitude, fix.longitude, site)
                {
                    log_warn!(
                        "missed exit: open session at {} but position is outside, force-closing",
                        site.name
                    );
                    self.sessions
                        .close_session(&self.settings.user_id, &session.site_id, 0, now)
                        .await
                        .context("failed to force-close session on missed exit")?;
                    self.pending.clear().await;
                    self.set_active_fence(None);
                    self.scheduler.note_transition(now).await;
                }
            }
            None => {
                if let Some(site) =
                    self.evaluator
                        .find_containing_fence(fix.latitude, fix.longitude, &fences)
                {
                    if self.current_fence().as_deref() != Some(site.id.as_str()) {
                        log_info!(
                            "possible missed entry at {}; updating indicator only",
                            site.name
                        );
                        self.set_active_fence(Some(site.id.clone()));
                    }
                }
            }
        }
        Ok(())
    }

    /// Fresh fix for decision-making: a cached fix is only trusted when
    /// young and accurate enough, otherwise a new high-accuracy fix is
    /// requested. A poor final fix is recorded as a low-accuracy event.
    async fn acquire_fix(&self, now: DateTime<Utc>) -> Option<GpsFix> {
        let cached = self.acquire_cached_fix().await;
        let usable_cached = cached
            .filter(|fix| fix.accuracy_m <= self.config.gps_accuracy_threshold_m);

        let fix = match usable_cached {
            Some(fix) => Some(fix),
            None => self
                .location
                .current_fix(FixRequest::fresh())
                .await
                .unwrap_or_else(|err| {
                    log_warn!("fresh fix acquisition failed: {err:?}");
                    None
                }),
        };

        if let Some(fix) = &fix {
            if fix.accuracy_m > self.config.gps_accuracy_threshold_m {
                log_info!("low accuracy fix ({}m)", fix.accuracy_m);
                self.scheduler.note_low_accuracy(now).await;
            }
        }
        fix
    }

    async fn acquire_cached_fix(&self) -> Option<GpsFix> {
        self.location
            .current_fix(FixRequest::cached(self.config.gps_cache_max_age_secs))
            .await
            .unwrap_or_else(|err| {
                log_warn!("cached fix acquisition failed: {err:?}");
                None
            })
    }
}
