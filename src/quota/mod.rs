use crate::room::now_utc_ms;
use serde::{Deserialize, Serialize};
use tokio::sync::watch;

/// Usage signal the backend returns alongside a send response.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct QuotaSignal {
    pub locked: bool,
    pub used: Option<u64>,
    pub limit: Option<u64>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum QuotaStatus {
    Open,
    Locked,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct QuotaSnapshot {
    pub status: QuotaStatus,
    pub locked: bool,
    pub used_count: Option<u64>,
    pub limit: Option<u64>,
    pub locked_at_utc_ms: Option<u64>,
    pub message: Option<String>,
}

impl Default for QuotaSnapshot {
    fn default() -> Self {
        Self {
            status: QuotaStatus::Open,
            locked: false,
            used_count: None,
            limit: None,
            locked_at_utc_ms: None,
            message: None,
        }
    }
}

/// Where an unlock came from. The core never unlocks itself.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub enum UnlockEvent {
    PurchaseConfirmed,
    QuotaReset,
    OperatorOverride,
}

/// Mirror of the backend's usage limit. Locking is sticky until an external
/// `unlock`; observers subscribe to the watch channel.
#[derive(Debug)]
pub struct QuotaGate {
    snapshot: watch::Sender<QuotaSnapshot>,
}

impl Default for QuotaGate {
    fn default() -> Self {
        Self::new()
    }
}

impl QuotaGate {
    pub fn new() -> Self {
        let (snapshot, _) = watch::channel(QuotaSnapshot::default());
        Self { snapshot }
    }

    pub fn snapshot(&self) -> QuotaSnapshot {
        self.snapshot.borrow().clone()
    }

    pub fn is_locked(&self) -> bool {
        self.snapshot.borrow().locked
    }

    pub fn subscribe(&self) -> watch::Receiver<QuotaSnapshot> {
        self.snapshot.subscribe()
    }

    /// Returns `true` when this signal moved the gate from open to locked.
    pub fn observe(&self, signal: &QuotaSignal) -> bool {
        let mut transitioned = false;
        self.snapshot.send_if_modified(|current| {
            let mut modified = false;
            if signal.used.is_some() && signal.used != current.used_count {
                current.used_count = signal.used;
                modified = true;
            }
            if signal.limit.is_some() && signal.limit != current.limit {
                current.limit = signal.limit;
                modified = true;
            }
            if signal.locked && !current.locked {
                current.locked = true;
                current.status = QuotaStatus::Locked;
                current.locked_at_utc_ms = Some(now_utc_ms());
                current.message = Some(lock_message(current.used_count, current.limit));
                transitioned = true;
                modified = true;
            }
            modified
        });
        if transitioned {
            tracing::info!(
                used = ?signal.used,
                limit = ?signal.limit,
                "quota gate locked by backend signal"
            );
        }
        transitioned
    }

    pub fn unlock(&self, event: UnlockEvent) -> QuotaSnapshot {
        self.snapshot.send_modify(|current| {
            current.locked = false;
            current.status = QuotaStatus::Open;
            current.locked_at_utc_ms = None;
            current.message = Some(match event {
                UnlockEvent::PurchaseConfirmed => "Plan upgraded. Sending is available again.",
                UnlockEvent::QuotaReset => "Usage limit reset. Sending is available again.",
                UnlockEvent::OperatorOverride => "Limit lifted by an operator.",
            }
            .to_string());
        });
        tracing::info!(?event, "quota gate unlocked");
        self.snapshot()
    }
}

fn lock_message(used: Option<u64>, limit: Option<u64>) -> String {
    match (used, limit) {
        (Some(used), Some(limit)) => {
            format!("Usage limit reached ({used}/{limit}). Upgrade to keep sending.")
        }
        _ => "Usage limit reached. Upgrade to keep sending.".to_string(),
    }
}
