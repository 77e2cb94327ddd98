use crate::{
    backend::{BackendError, RoomBackend},
    room::{now_utc_ms, RoomContext, RoomId},
    timeline::{MergeError, SharedView, ViewChange, ViewDelta},
};
use serde::{Deserialize, Serialize};
use std::{
    sync::{Arc, Mutex, MutexGuard},
    time::Duration,
};
use tokio::{
    sync::{watch, Notify},
    task::JoinHandle,
    time::MissedTickBehavior,
};
use tokio_util::sync::CancellationToken;

/// Wakes a running sync loop for an out-of-band fetch.
#[derive(Debug, Clone, Default)]
pub struct SyncTrigger(Arc<Notify>);

impl SyncTrigger {
    pub fn fire(&self) {
        self.0.notify_one();
    }

    async fn fired(&self) {
        self.0.notified().await;
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub enum SyncFaultKind {
    Transport,
    Protocol,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct SyncFault {
    pub kind: SyncFaultKind,
    pub message: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct SyncHealth {
    pub fault: Option<SyncFault>,
    pub consecutive_failures: u32,
    pub last_success_at_utc_ms: Option<u64>,
    pub polls: u64,
}

struct SyncShared {
    backend: Arc<dyn RoomBackend>,
    view: SharedView,
    room_id: RoomId,
    epoch: u64,
    health: watch::Sender<SyncHealth>,
}

impl SyncShared {
    async fn poll_once(&self) -> Result<ViewDelta, SyncFault> {
        let backend = Arc::clone(&self.backend);
        let room_id = self.room_id.clone();
        let fetched = tokio::task::spawn_blocking(move || backend.get_history(&room_id))
            .await
            .unwrap_or_else(|err| {
                Err(BackendError::Transport(format!("history task failed: {err}")))
            });

        let messages = match fetched {
            Ok(messages) => messages,
            Err(err) => {
                let fault = SyncFault {
                    kind: match err {
                        BackendError::Transport(_) => SyncFaultKind::Transport,
                        BackendError::Protocol(_) | BackendError::Rejected(_) => {
                            SyncFaultKind::Protocol
                        }
                    },
                    message: err.to_string(),
                };
                tracing::warn!(
                    room_id = %self.room_id,
                    kind = ?fault.kind,
                    error = %err,
                    "history fetch failed; keeping last snapshot"
                );
                self.health.send_modify(|health| {
                    health.polls += 1;
                    health.consecutive_failures += 1;
                    health.fault = Some(fault.clone());
                });
                return Err(fault);
            }
        };

        let delta = match self.view.apply(ViewChange::History {
            epoch: self.epoch,
            messages,
        }) {
            Ok(delta) => delta,
            Err(err @ MergeError::StaleEpoch { .. }) => {
                tracing::debug!(room_id = %self.room_id, error = %err, "dropping stale history");
                ViewDelta::default()
            }
            Err(err) => {
                return Err(SyncFault {
                    kind: SyncFaultKind::Protocol,
                    message: err.to_string(),
                })
            }
        };
        if delta.changed {
            tracing::debug!(
                room_id = %self.room_id,
                new_remote = delta.new_remote,
                reconciled = delta.reconciled.len(),
                "history merged"
            );
        }
        self.health.send_modify(|health| {
            health.polls += 1;
            health.consecutive_failures = 0;
            health.fault = None;
            health.last_success_at_utc_ms = Some(now_utc_ms());
        });
        Ok(delta)
    }
}

/// Polls one room's history on a fixed interval and merges it into the view.
pub struct RoomSyncLoop {
    shared: Arc<SyncShared>,
    interval: Duration,
    trigger: SyncTrigger,
    running: Mutex<Option<(CancellationToken, JoinHandle<()>)>>,
}

impl RoomSyncLoop {
    pub fn new(
        backend: Arc<dyn RoomBackend>,
        view: SharedView,
        room: &RoomContext,
        interval: Duration,
    ) -> Self {
        let (health, _) = watch::channel(SyncHealth::default());
        Self {
            shared: Arc::new(SyncShared {
                backend,
                view,
                room_id: room.room_id.clone(),
                epoch: room.epoch,
                health,
            }),
            interval,
            trigger: SyncTrigger::default(),
            running: Mutex::new(None),
        }
    }

    pub fn trigger(&self) -> SyncTrigger {
        self.trigger.clone()
    }

    pub fn health(&self) -> SyncHealth {
        self.shared.health.borrow().clone()
    }

    pub fn subscribe_health(&self) -> watch::Receiver<SyncHealth> {
        self.shared.health.subscribe()
    }

    pub fn is_running(&self) -> bool {
        self.lock_running()
            .as_ref()
            .is_some_and(|(token, handle)| !token.is_cancelled() && !handle.is_finished())
    }

    /// One fetch and merge, outside the timer.
    pub async fn poll_once(&self) -> Result<ViewDelta, SyncFault> {
        self.shared.poll_once().await
    }

    pub fn refresh_now(&self) {
        self.trigger.fire();
    }

    /// Fetches immediately, then on every interval tick. No-op when running.
    pub fn start(&self) {
        let mut running = self.lock_running();
        if running
            .as_ref()
            .is_some_and(|(token, _)| !token.is_cancelled())
        {
            return;
        }

        let token = CancellationToken::new();
        let loop_token = token.clone();
        let shared = Arc::clone(&self.shared);
        let trigger = self.trigger.clone();
        let interval = self.interval;
        tracing::info!(
            room_id = %shared.room_id,
            interval_ms = interval.as_millis() as u64,
            "room sync started"
        );
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = loop_token.cancelled() => break,
                    _ = ticker.tick() => {}
                    _ = trigger.fired() => ticker.reset(),
                }
                tokio::select! {
                    _ = loop_token.cancelled() => break,
                    _ = shared.poll_once() => {}
                }
            }
        });
        *running = Some((token, handle));
    }

    /// Cancels the timer and any in-flight fetch. Safe to call repeatedly.
    pub fn stop(&self) {
        if let Some((token, handle)) = self.lock_running().take() {
            token.cancel();
            handle.abort();
            tracing::info!(room_id = %self.shared.room_id, "room sync stopped");
        }
    }

    fn lock_running(&self) -> MutexGuard<'_, Option<(CancellationToken, JoinHandle<()>)>> {
        self.running
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl Drop for RoomSyncLoop {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        backend::ScriptedBackend,
        timeline::{ReconcilePolicy, RoomView},
    };
    use serde_json::json;

    fn fixture(backend: Arc<ScriptedBackend>) -> (RoomSyncLoop, SharedView, RoomContext) {
        let room = RoomContext::enter(
            RoomId::parse("sync").expect("room id should parse"),
            "Ana",
            false,
        );
        let view = SharedView::new(RoomView::new(room.epoch, ReconcilePolicy::default()));
        let sync = RoomSyncLoop::new(backend, view.clone(), &room, Duration::from_secs(3));
        (sync, view, room)
    }

    #[tokio::test]
    async fn protocol_error_keeps_last_good_snapshot() {
        let backend = Arc::new(ScriptedBackend::silent());
        let (sync, view, room) = fixture(Arc::clone(&backend));
        backend.append_human(&room.room_id, "Bo", "first");
        sync.poll_once().await.expect("first poll should succeed");
        assert_eq!(view.entries().len(), 1);

        backend.push_history_payload(json!({"error": "database locked"}));
        let fault = sync.poll_once().await.expect_err("error payload is a fault");
        assert_eq!(fault.kind, SyncFaultKind::Protocol);
        assert_eq!(view.entries().len(), 1);
        assert_eq!(sync.health().consecutive_failures, 1);
        assert!(sync.health().fault.is_some());

        sync.poll_once().await.expect("next poll recovers");
        let health = sync.health();
        assert_eq!(health.fault, None);
        assert_eq!(health.consecutive_failures, 0);
        assert_eq!(health.polls, 3);
    }

    #[tokio::test]
    async fn transport_error_is_classified_separately() {
        let backend = Arc::new(ScriptedBackend::silent());
        backend.push_history_error(BackendError::Transport("connection reset".to_string()));
        let (sync, view, _) = fixture(backend);
        let fault = sync.poll_once().await.expect_err("transport errors are faults");
        assert_eq!(fault.kind, SyncFaultKind::Transport);
        assert!(view.entries().is_empty());
    }

    #[tokio::test]
    async fn stop_is_idempotent() {
        let (sync, _, _) = fixture(Arc::new(ScriptedBackend::silent()));
        sync.start();
        assert!(sync.is_running());
        sync.stop();
        sync.stop();
        assert!(!sync.is_running());
    }
}
