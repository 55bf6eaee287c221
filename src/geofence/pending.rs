use std::sync::Arc;

use tokio::sync::Mutex;

use crate::models::{PendingAction, PendingKind};
use crate::ports::PendingActionStorage;

// Set to true to enable verbose logging in this module
const ENABLE_LOGS: bool = true;

use crate::{log_info, log_warn};

/// What an expired pending action resolves to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Resolution {
    /// Open a session (deferred entry confirmed).
    AutoStart,
    /// Close the open session (deferred exit confirmed).
    AutoEnd,
    /// Reopen/continue the session (deferred return confirmed).
    AutoResume,
    /// Discard the pending action without touching the session.
    Drop,
}

/// Decision table for an expired pending action. `inside` is the fresh-GPS
/// containment of the action's target fence; `None` means no fix was
/// available. The no-GPS column fails open: tracking continuity is worth
/// more than a precise time boundary, except for exits where assuming
/// outside avoids over-counting hours.
pub fn resolve_expired(kind: PendingKind, inside: Option<bool>) -> Resolution {
    match (kind, inside) {
        (PendingKind::Enter, Some(true)) => Resolution::AutoStart,
        (PendingKind::Enter, Some(false)) => Resolution::Drop,
        (PendingKind::Enter, None) => Resolution::AutoStart,

        (PendingKind::Exit, Some(true)) => Resolution::Drop,
        (PendingKind::Exit, Some(false)) => Resolution::AutoEnd,
        (PendingKind::Exit, None) => Resolution::AutoEnd,

        (PendingKind::Return, Some(true)) => Resolution::AutoResume,
        (PendingKind::Return, Some(false)) => Resolution::Drop,
        (PendingKind::Return, None) => Resolution::AutoResume,
    }
}

/// Owns the singleton pending action: an in-memory copy backed by durable
/// key-value storage. Storage failures degrade to the in-memory copy so the
/// monitoring loop never stalls on persistence.
pub struct PendingActionManager {
    storage: Arc<dyn PendingActionStorage>,
    current: Mutex<Option<PendingAction>>,
}

impl PendingActionManager {
    pub fn new(storage: Arc<dyn PendingActionStorage>) -> Self {
        Self {
            storage,
            current: Mutex::new(None),
        }
    }

    /// Reload the persisted action after a process restart.
    pub async fn restore(&self) {
        match self.storage.load().await {
            Ok(loaded) => {
                if let Some(action) = &loaded {
                    log_info!(
                        "restored pending {} for site {} ({}ms timeout)",
                        action.kind.as_str(),
                        action.site_id,
                        action.timeout_ms
                    );
                }
                *self.current.lock().await = loaded;
            }
            Err(err) => {
                log_warn!("failed to load pending action, assuming none: {err:?}");
                *self.current.lock().await = None;
            }
        }
    }

    /// Persist a new pending action, superseding any existing one.
    pub async fn create(&self, action: PendingAction) {
        {
            let mut guard = self.current.lock().await;
            if let Some(previous) = guard.as_ref() {
                log_info!(
                    "pending {} for site {} superseded by {} for site {}",
                    previous.kind.as_str(),
                    previous.site_id,
                    action.kind.as_str(),
                    action.site_id
                );
            }
            *guard = Some(action.clone());
        }

        if let Err(err) = self.storage.save(&action).await {
            log_warn!("failed to persist pending action: {err:?}");
        }
    }

    pub async fn current(&self) -> Option<PendingAction> {
        self.current.lock().await.clone()
    }

    pub async fn clear(&self) {
        *self.current.lock().await = None;
        if let Err(err) = self.storage.clear().await {
            log_warn!("failed to clear persisted pending action: {err:?}");
        }
    }
}
