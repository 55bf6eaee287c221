use crate::models::PendingKind;

/// Tunable timing and geometry constants for the geofence core. Defaults are
/// field-tuned; keep them adjustable rather than inlined.
#[derive(Debug, Clone)]
pub struct GeofenceConfig {
    /// Exit radius multiplier. A fence is only left once the position is
    /// beyond `radius * hysteresis_factor`.
    pub hysteresis_factor: f64,

    /// Fix accuracy worse than this (meters) counts as a low-accuracy event.
    pub gps_accuracy_threshold_m: f64,

    /// Cached fixes older than this are not trusted for TTL resolution.
    pub gps_cache_max_age_secs: u64,

    /// Heartbeat intervals in seconds, one per reason.
    pub interval_normal_secs: u64,
    pub interval_pending_enter_secs: u64,
    pub interval_pending_exit_secs: u64,
    pub interval_pending_return_secs: u64,
    pub interval_low_accuracy_secs: u64,
    pub interval_recent_transition_secs: u64,

    /// How long after a transition the faster cadence is kept.
    pub recent_transition_window_secs: u64,
    /// How long after a low-accuracy fix the slower retry cadence is kept.
    pub low_accuracy_window_secs: u64,
    /// Minimum gap between applied interval changes (pending actions bypass).
    pub interval_debounce_secs: u64,

    /// Pending action timeouts in milliseconds.
    pub pending_enter_timeout_ms: u64,
    pub pending_exit_timeout_ms: u64,
    pub pending_return_timeout_ms: u64,

    /// Local polling cadence (first-line signal next to native callbacks).
    pub polling_interval_secs: u64,

    /// Evaluation guard cool-down after a completed evaluation.
    pub evaluation_cooldown_ms: u64,

    /// Ping-pong detection: both event kinds over the threshold inside the
    /// window flags oscillation.
    pub ping_pong_window_secs: u64,
    pub ping_pong_threshold: usize,
}

impl GeofenceConfig {
    /// Timeout for a new pending action of the given kind.
    pub fn pending_timeout_ms(&self, kind: PendingKind) -> u64 {
        match kind {
            PendingKind::Enter => self.pending_enter_timeout_ms,
            PendingKind::Exit => self.pending_exit_timeout_ms,
            PendingKind::Return => self.pending_return_timeout_ms,
        }
    }
}

impl Default for GeofenceConfig {
    fn default() -> Self {
        Self {
            hysteresis_factor: 1.5,
            gps_accuracy_threshold_m: 50.0,
            gps_cache_max_age_secs: 5,
            interval_normal_secs: 900,
            interval_pending_enter_secs: 120,
            interval_pending_exit_secs: 60,
            interval_pending_return_secs: 120,
            interval_low_accuracy_secs: 300,
            interval_recent_transition_secs: 300,
            recent_transition_window_secs: 600,
            low_accuracy_window_secs: 900,
            interval_debounce_secs: 30,
            pending_enter_timeout_ms: 120_000,
            pending_exit_timeout_ms: 60_000,
            pending_return_timeout_ms: 120_000,
            polling_interval_secs: 30,
            evaluation_cooldown_ms: 1_000,
            ping_pong_window_secs: 300,
            ping_pong_threshold: 3,
        }
    }
}
