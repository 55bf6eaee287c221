use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio::sync::{watch, Mutex};

use crate::geofence::config::GeofenceConfig;
use crate::models::{HeartbeatState, IntervalReason, PendingAction, PendingKind};
use crate::ports::{HeartbeatStateStorage, TaskSchedulerPort};

// Set to true to enable verbose logging in this module
const ENABLE_LOGS: bool = true;

use crate::{log_info, log_warn};

pub const HEARTBEAT_TASK_NAME: &str = "geotrack-heartbeat";

/// Pick the interval for the current conditions. Priority: pending action,
/// then a recent transition, then recent low accuracy, then normal.
pub fn select_interval(
    config: &GeofenceConfig,
    pending: Option<PendingKind>,
    last_transition_at: Option<DateTime<Utc>>,
    last_low_accuracy_at: Option<DateTime<Utc>>,
    now: DateTime<Utc>,
) -> (u64, IntervalReason) {
    if let Some(kind) = pending {
        return match kind {
            PendingKind::Enter => (config.interval_pending_enter_secs, IntervalReason::PendingEnter),
            PendingKind::Exit => (config.interval_pending_exit_secs, IntervalReason::PendingExit),
            PendingKind::Return => {
                (config.interval_pending_return_secs, IntervalReason::PendingReturn)
            }
        };
    }

    if let Some(at) = last_transition_at {
        if (now - at).num_seconds() <= config.recent_transition_window_secs as i64 {
            return (
                config.interval_recent_transition_secs,
                IntervalReason::RecentTransition,
            );
        }
    }

    if let Some(at) = last_low_accuracy_at {
        if (now - at).num_seconds() <= config.low_accuracy_window_secs as i64 {
            return (config.interval_low_accuracy_secs, IntervalReason::LowAccuracy);
        }
    }

    (config.interval_normal_secs, IntervalReason::Normal)
}

/// Whether a computed change may be applied now. Pending actions are
/// time-critical and bypass the debounce window; everything else waits out
/// the window to avoid thrashing the OS task scheduler.
pub fn should_apply(
    state: &HeartbeatState,
    candidate_interval: u64,
    candidate_reason: IntervalReason,
    has_pending: bool,
    debounce_secs: u64,
    now: DateTime<Utc>,
) -> bool {
    if state.interval_secs == candidate_interval && state.reason == candidate_reason {
        return false;
    }

    if has_pending {
        return true;
    }

    match state.last_interval_change_at {
        None => true,
        Some(last) => (now - last).num_milliseconds() >= (debounce_secs as i64) * 1000,
    }
}

/// Persisted adaptive heartbeat scheduler. Applying a new interval
/// re-registers the periodic background task and notifies the in-process
/// runner through a watch channel.
pub struct HeartbeatScheduler {
    config: Arc<GeofenceConfig>,
    storage: Arc<dyn HeartbeatStateStorage>,
    tasks: Arc<dyn TaskSchedulerPort>,
    state: Mutex<HeartbeatState>,
    interval_tx: watch::Sender<u64>,
}

impl HeartbeatScheduler {
    pub fn new(
        config: Arc<GeofenceConfig>,
        storage: Arc<dyn HeartbeatStateStorage>,
        tasks: Arc<dyn TaskSchedulerPort>,
    ) -> Self {
        let normal = config.interval_normal_secs;
        let (interval_tx, _) = watch::channel(normal);
        Self {
            config,
            storage,
            tasks,
            state: Mutex::new(HeartbeatState::new(normal)),
            interval_tx,
        }
    }

    /// Interval updates for the runner loop.
    pub fn subscribe(&self) -> watch::Receiver<u64> {
        self.interval_tx.subscribe()
    }

    pub async fn current_state(&self) -> HeartbeatState {
        self.state.lock().await.clone()
    }

    /// Reload persisted state after a process restart so the relaunched
    /// monitor resumes at its previous cadence.
    pub async fn restore(&self) {
        match self.storage.load().await {
            Ok(Some(loaded)) => {
                log_info!(
                    "restored heartbeat state: {}s ({})",
                    loaded.interval_secs,
                    loaded.reason.as_str()
                );
                let _ = self.interval_tx.send(loaded.interval_secs);
                *self.state.lock().await = loaded;
            }
            Ok(None) => {}
            Err(err) => {
                log_warn!("failed to load heartbeat state, using defaults: {err:?}");
            }
        }
    }

    /// Record that a transition just happened (feeds the recent-transition
    /// cadence on the next recompute).
    pub async fn note_transition(&self, now: DateTime<Utc>) {
        let mut state = self.state.lock().await;
        state.last_transition_at = Some(now);
        self.persist(&state).await;
    }

    /// Record a low-accuracy fix (feeds the low-accuracy cadence).
    pub async fn note_low_accuracy(&self, now: DateTime<Utc>) {
        let mut state = self.state.lock().await;
        state.last_low_accuracy_at = Some(now);
        self.persist(&state).await;
    }

    /// Recompute the interval from current conditions and apply it if the
    /// debounce rule allows. Returns the interval in effect afterwards.
    pub async fn recompute(&self, pending: Option<&PendingAction>, now: DateTime<Utc>) -> u64 {
        let candidate_interval = {
            let mut state = self.state.lock().await;
            let (interval, reason) = select_interval(
                &self.config,
                pending.map(|action| action.kind),
                state.last_transition_at,
                state.last_low_accuracy_at,
                now,
            );

            if !should_apply(
                &state,
                interval,
                reason,
                pending.is_some(),
                self.config.interval_debounce_secs,
                now,
            ) {
                return state.interval_secs;
            }

            log_info!(
                "heartbeat interval {}s ({}) -> {}s ({})",
                state.interval_secs,
                state.reason.as_str(),
                interval,
                reason.as_str()
            );

            state.interval_secs = interval;
            state.reason = reason;
            state.last_interval_change_at = Some(now);
            self.persist(&state).await;
            interval
        };

        self.reregister_task(candidate_interval).await;
        let _ = self.interval_tx.send(candidate_interval);

        candidate_interval
    }

    /// Unregister-then-register with the new minimum interval. Failures are
    /// warnings; monitoring continues at the stale cadence until the next
    /// successful recompute.
    async fn reregister_task(&self, interval_secs: u64) {
        if let Err(err) = self.tasks.unregister_periodic(HEARTBEAT_TASK_NAME).await {
            log_warn!("failed to unregister heartbeat task: {err:?}");
        }
        if let Err(err) = self
            .tasks
            .register_periodic(HEARTBEAT_TASK_NAME, interval_secs)
            .await
        {
            log_warn!("failed to register heartbeat task at {interval_secs}s: {err:?}");
        }
    }

    async fn persist(&self, state: &HeartbeatState) {
        if let Err(err) = self.storage.save(state).await {
            log_warn!("failed to persist heartbeat state: {err:?}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::Result;
    use async_trait::async_trait;
    use chrono::Duration;
    use std::sync::Mutex as StdMutex;

    struct MemoryStateStorage {
        slot: StdMutex<Option<HeartbeatState>>,
    }

    #[async_trait]
    impl HeartbeatStateStorage for MemoryStateStorage {
        async fn save(&self, state: &HeartbeatState) -> Result<()> {
            *self.slot.lock().unwrap() = Some(state.clone());
            Ok(())
        }

        async fn load(&self) -> Result<Option<HeartbeatState>> {
            Ok(self.slot.lock().unwrap().clone())
        }
    }

    struct RecordingTasks {
        registrations: StdMutex<Vec<u64>>,
    }

    #[async_trait]
    impl TaskSchedulerPort for RecordingTasks {
        async fn register_periodic(&self, _name: &str, min_interval_secs: u64) -> Result<()> {
            self.registrations.lock().unwrap().push(min_interval_secs);
            Ok(())
        }

        async fn unregister_periodic(&self, _name: &str) -> Result<()> {
            Ok(())
        }
    }

    fn scheduler() -> (HeartbeatScheduler, Arc<RecordingTasks>) {
        let tasks = Arc::new(RecordingTasks {
            registrations: StdMutex::new(Vec::new()),
        });
        let scheduler = HeartbeatScheduler::new(
            Arc::new(GeofenceConfig::default()),
            Arc::new(MemoryStateStorage {
                slot: StdMutex::new(None),
            }),
            tasks.clone(),
        );
        (scheduler, tasks)
    }

    fn pending_exit(now: DateTime<Utc>) -> PendingAction {
        PendingAction {
            kind: PendingKind::Exit,
            site_id: "site".into(),
            site_name: "Site".into(),
            notification_id: None,
            created_at: now,
            timeout_ms: 60_000,
            gps_snapshot: None,
        }
    }

    #[test]
    fn priority_order_pending_then_transition_then_accuracy() {
        let config = GeofenceConfig::default();
        let now = Utc::now();
        let recent = Some(now - Duration::seconds(60));

        // Pending beats everything
        let (interval, reason) =
            select_interval(&config, Some(PendingKind::Exit), recent, recent, now);
        assert_eq!((interval, reason), (60, IntervalReason::PendingExit));

        // Recent transition beats low accuracy
        let (interval, reason) = select_interval(&config, None, recent, recent, now);
        assert_eq!((interval, reason), (300, IntervalReason::RecentTransition));

        // Low accuracy alone
        let (interval, reason) = select_interval(&config, None, None, recent, now);
        assert_eq!((interval, reason), (300, IntervalReason::LowAccuracy));

        // Nothing special
        let (interval, reason) = select_interval(&config, None, None, None, now);
        assert_eq!((interval, reason), (900, IntervalReason::Normal));
    }

    #[test]
    fn stale_conditions_fall_back_to_normal() {
        let config = GeofenceConfig::default();
        let now = Utc::now();
        let old_transition = Some(now - Duration::seconds(601));
        let old_accuracy = Some(now - Duration::seconds(901));

        let (interval, reason) = select_interval(&config, None, old_transition, old_accuracy, now);
        assert_eq!((interval, reason), (900, IntervalReason::Normal));
    }

    #[test]
    fn debounce_blocks_just_inside_the_window_and_allows_after() {
        let t0 = Utc::now();
        let mut state = HeartbeatState::new(900);
        state.last_interval_change_at = Some(t0);

        let blocked = should_apply(
            &state,
            300,
            IntervalReason::RecentTransition,
            false,
            30,
            t0 + Duration::milliseconds(29_999),
        );
        assert!(!blocked);

        let allowed = should_apply(
            &state,
            300,
            IntervalReason::RecentTransition,
            false,
            30,
            t0 + Duration::milliseconds(30_001),
        );
        assert!(allowed);
    }

    #[test]
    fn pending_bypasses_debounce() {
        let t0 = Utc::now();
        let mut state = HeartbeatState::new(900);
        state.last_interval_change_at = Some(t0);

        let allowed = should_apply(
            &state,
            60,
            IntervalReason::PendingExit,
            true,
            30,
            t0 + Duration::milliseconds(1),
        );
        assert!(allowed);
    }

    #[test]
    fn unchanged_pair_is_never_reapplied() {
        let state = HeartbeatState::new(900);
        assert!(!should_apply(
            &state,
            900,
            IntervalReason::Normal,
            true,
            30,
            Utc::now()
        ));
    }

    #[tokio::test]
    async fn recompute_with_pending_applies_and_registers_task() {
        let (scheduler, tasks) = scheduler();
        let now = Utc::now();
        let pending = pending_exit(now);

        let interval = scheduler.recompute(Some(&pending), now).await;
        assert_eq!(interval, 60);
        assert_eq!(tasks.registrations.lock().unwrap().as_slice(), &[60]);

        let state = scheduler.current_state().await;
        assert_eq!(state.reason, IntervalReason::PendingExit);
        assert_eq!(state.last_interval_change_at, Some(now));
    }

    #[tokio::test]
    async fn suppressed_recompute_keeps_previous_interval() {
        let (scheduler, tasks) = scheduler();
        let now = Utc::now();
        let pending = pending_exit(now);

        scheduler.recompute(Some(&pending), now).await;
        scheduler.note_transition(now).await;

        // Pending resolved a moment later; recent-transition cadence is due
        // but the debounce window has not elapsed.
        let interval = scheduler.recompute(None, now + Duration::seconds(5)).await;
        assert_eq!(interval, 60);

        // After the window it applies.
        let interval = scheduler.recompute(None, now + Duration::seconds(31)).await;
        assert_eq!(interval, 300);
        assert_eq!(tasks.registrations.lock().unwrap().as_slice(), &[60, 300]);
    }
}
