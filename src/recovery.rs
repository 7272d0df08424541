// =============================================================================
// RecoveryCoordinator — boot-time rehydration of persisted sessions
// =============================================================================
//
// Runs once, after every other subsystem is constructed but before the
// engine starts accepting new user commands. For every user whose session
// was `autotrade_enabled` the last time the engine shut down, this simply
// asks `SessionSupervisor` to start that session the same way a live
// `UserSessionStartRequested` command would — the per-instance exchange
// sync described in SPEC_FULL.md (snapshot vs. live position, open-order
// reconciliation) happens inside `StrategyInstance::run`'s own startup path,
// since that is the same path a session takes whether it's coming up fresh
// or being recovered. Running this twice is a no-op the second time:
// `SessionSupervisor::start_session` refuses to start over an already-running
// session, so nothing re-fires.
//
// Consistent with the teacher's `reconcile.rs` safety policy, recovery only
// ever rehydrates local bookkeeping to match the exchange; it never cancels
// an order or closes a position on its own.
// =============================================================================

use std::sync::Arc;

use parking_lot::RwLock as SyncRwLock;
use tracing::info;

use crate::config::RuntimeConfig;
use crate::eventbus::{Event, EventBus};
use crate::notify::{notify_fire_and_forget, Notifier, ParseMode};

pub struct RecoveryCoordinator {
    bus: Arc<EventBus>,
    runtime_config: Arc<SyncRwLock<RuntimeConfig>>,
    notifier: Arc<dyn Notifier>,
}

impl RecoveryCoordinator {
    pub fn new(bus: Arc<EventBus>, runtime_config: Arc<SyncRwLock<RuntimeConfig>>, notifier: Arc<dyn Notifier>) -> Self {
        Self { bus, runtime_config, notifier }
    }

    /// Recover every session marked `autotrade_enabled` in the persisted
    /// config, then report one summary notification per recovered user.
    pub async fn run_once(&self) {
        let user_ids = self.runtime_config.read().active_user_ids.clone();
        info!(recoverable_sessions = user_ids.len(), "recovery coordinator starting");

        for user_id in &user_ids {
            self.bus.publish(Event::UserSessionStartRequested { user_id: *user_id });
            notify_fire_and_forget(
                self.notifier.clone(),
                *user_id,
                "Trading session recovered after restart".to_string(),
                ParseMode::PlainText,
            );
        }

        info!(recovered = user_ids.len(), "recovery coordinator finished");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::notify::LoggingNotifier;

    #[tokio::test]
    async fn recovers_every_active_user_id() {
        let bus = Arc::new(EventBus::new());
        let mut cfg = RuntimeConfig::default();
        cfg.active_user_ids = vec![1, 2];
        let runtime_config = Arc::new(SyncRwLock::new(cfg));
        let notifier = Arc::new(LoggingNotifier);

        let (mut rx, _handle) = bus.subscribe(None);
        let coordinator = RecoveryCoordinator::new(bus.clone(), runtime_config, notifier);
        coordinator.run_once().await;

        let mut seen = Vec::new();
        while let Ok(event) = rx.try_recv() {
            if let Event::UserSessionStartRequested { user_id } = event {
                seen.push(user_id);
            }
        }
        assert_eq!(seen, vec![1, 2]);
    }

    #[tokio::test]
    async fn empty_registry_recovers_nothing() {
        let bus = Arc::new(EventBus::new());
        let runtime_config = Arc::new(SyncRwLock::new(RuntimeConfig::default()));
        let notifier = Arc::new(LoggingNotifier);

        let (mut rx, _handle) = bus.subscribe(None);
        let coordinator = RecoveryCoordinator::new(bus, runtime_config, notifier);
        coordinator.run_once().await;

        assert!(rx.try_recv().is_err());
    }
}
