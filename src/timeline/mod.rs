use crate::room::Message;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::{
    collections::{HashSet, VecDeque},
    sync::{Arc, Mutex, MutexGuard},
};
use tokio::sync::broadcast;

const UPDATE_CHANNEL_CAPACITY: usize = 64;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "state", rename_all = "camelCase")]
pub enum PendingState {
    /// Waiting on its attachment, or the send request is in flight.
    Queued,
    /// Acknowledged by the store; waiting for the echo in history.
    Sent,
    /// No echo after the allowed number of poll cycles.
    Unconfirmed,
    Failed { reason: String },
}

impl PendingState {
    pub fn label(&self) -> &'static str {
        match self {
            Self::Queued => "queued",
            Self::Sent => "sent",
            Self::Unconfirmed => "unconfirmed",
            Self::Failed { .. } => "failed",
        }
    }

    pub fn can_resend(&self) -> bool {
        matches!(self, Self::Unconfirmed | Self::Failed { .. })
    }
}

/// Local echo of a submit, shown at the tail until history confirms it.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct PendingMessage {
    pub correlation_id: u64,
    pub sender: String,
    pub body: String,
    pub attachment_ref: Option<String>,
    pub created_at: DateTime<Utc>,
    pub state: PendingState,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "kind", rename_all = "camelCase")]
pub enum TimelineEntry {
    Confirmed { message: Message },
    Pending { message: PendingMessage },
}

impl TimelineEntry {
    pub fn sender(&self) -> &str {
        match self {
            Self::Confirmed { message } => &message.sender,
            Self::Pending { message } => &message.sender,
        }
    }

    pub fn body(&self) -> &str {
        match self {
            Self::Confirmed { message } => &message.body,
            Self::Pending { message } => &message.body,
        }
    }

    pub fn is_pending(&self) -> bool {
        matches!(self, Self::Pending { .. })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReconcilePolicy {
    pub max_cycles: u32,
    pub window_ms: u64,
}

impl Default for ReconcilePolicy {
    fn default() -> Self {
        Self {
            max_cycles: 3,
            window_ms: 5 * 60 * 1000,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Settlement {
    Sent,
    Failed(String),
}

/// Every write to the rendered list is one of these.
#[derive(Debug, Clone, PartialEq)]
pub enum ViewChange {
    History { epoch: u64, messages: Vec<Message> },
    Submitted(PendingMessage),
    SendSettled { correlation_id: u64, settlement: Settlement },
    Resend { correlation_id: u64 },
    Abandon { correlation_id: u64 },
    Cleared,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ViewDelta {
    /// The rendered list was rebuilt.
    pub changed: bool,
    /// Authoritative messages that arrived and did not replace a local echo.
    pub new_remote: usize,
    /// Pending messages appended by a submit.
    pub new_local: usize,
    pub reconciled: Vec<u64>,
    pub unconfirmed: Vec<u64>,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum MergeError {
    #[error("history for epoch {got} ignored; view is at epoch {expected}")]
    StaleEpoch { expected: u64, got: u64 },
    #[error("no pending message with correlation id {0}")]
    UnknownPending(u64),
    #[error("pending message {0} is not failed or unconfirmed")]
    NotResendable(u64),
}

#[derive(Debug, Clone)]
struct PendingSlot {
    message: PendingMessage,
    /// History length when the message was (re)submitted. Echoes can only
    /// appear at or after this index.
    baseline: usize,
    cycles_sent: u32,
}

/// Authoritative history plus the optimistic overlay, merged in one place.
#[derive(Debug)]
pub struct RoomView {
    epoch: u64,
    policy: ReconcilePolicy,
    history: Vec<Message>,
    pending: VecDeque<PendingSlot>,
    claimed: HashSet<u64>,
    rendered: Arc<Vec<TimelineEntry>>,
    /// Bumped on every rebuild of `rendered`.
    revision: u64,
}

impl RoomView {
    pub fn new(epoch: u64, policy: ReconcilePolicy) -> Self {
        Self {
            epoch,
            policy,
            history: Vec::new(),
            pending: VecDeque::new(),
            claimed: HashSet::new(),
            rendered: Arc::new(Vec::new()),
            revision: 0,
        }
    }

    pub fn epoch(&self) -> u64 {
        self.epoch
    }

    pub fn revision(&self) -> u64 {
        self.revision
    }

    pub fn entries(&self) -> Arc<Vec<TimelineEntry>> {
        Arc::clone(&self.rendered)
    }

    pub fn history(&self) -> &[Message] {
        &self.history
    }

    pub fn pending(&self) -> impl Iterator<Item = &PendingMessage> {
        self.pending.iter().map(|slot| &slot.message)
    }

    pub fn pending_by_id(&self, correlation_id: u64) -> Option<&PendingMessage> {
        self.pending().find(|p| p.correlation_id == correlation_id)
    }

    pub fn merge(&mut self, change: ViewChange) -> Result<ViewDelta, MergeError> {
        let mut delta = ViewDelta::default();
        match change {
            ViewChange::History { epoch, messages } => {
                if epoch != self.epoch {
                    return Err(MergeError::StaleEpoch {
                        expected: self.epoch,
                        got: epoch,
                    });
                }
                self.merge_history(messages, &mut delta);
            }
            ViewChange::Submitted(message) => {
                self.pending.push_back(PendingSlot {
                    message,
                    baseline: self.history.len(),
                    cycles_sent: 0,
                });
                delta.new_local = 1;
                delta.changed = true;
            }
            ViewChange::SendSettled {
                correlation_id,
                settlement,
            } => {
                // The echo may already have reconciled the pending away.
                if let Some(slot) = self.slot_mut(correlation_id) {
                    if slot.message.state == PendingState::Queued {
                        slot.message.state = match settlement {
                            Settlement::Sent => PendingState::Sent,
                            Settlement::Failed(reason) => PendingState::Failed { reason },
                        };
                        slot.cycles_sent = 0;
                        delta.changed = true;
                    }
                }
            }
            ViewChange::Resend { correlation_id } => {
                let history_len = self.history.len();
                let slot = self
                    .slot_mut(correlation_id)
                    .ok_or(MergeError::UnknownPending(correlation_id))?;
                if !slot.message.state.can_resend() {
                    return Err(MergeError::NotResendable(correlation_id));
                }
                slot.message.state = PendingState::Queued;
                slot.baseline = history_len;
                slot.cycles_sent = 0;
                delta.changed = true;
            }
            ViewChange::Abandon { correlation_id } => {
                let index = self
                    .pending
                    .iter()
                    .position(|slot| slot.message.correlation_id == correlation_id)
                    .ok_or(MergeError::UnknownPending(correlation_id))?;
                if !self.pending[index].message.state.can_resend() {
                    return Err(MergeError::NotResendable(correlation_id));
                }
                self.pending.remove(index);
                delta.changed = true;
            }
            ViewChange::Cleared => {
                delta.changed = !self.history.is_empty() || !self.pending.is_empty();
                self.history.clear();
                self.pending.clear();
                self.claimed.clear();
            }
        }

        if delta.changed {
            self.rebuild();
        }
        Ok(delta)
    }

    fn merge_history(&mut self, messages: Vec<Message>, delta: &mut ViewDelta) {
        let history_changed = messages.len() != self.history.len() || messages != self.history;
        let mut arrived = HashSet::new();
        if history_changed {
            let known = self
                .history
                .iter()
                .map(|m| m.sequence)
                .collect::<HashSet<_>>();
            arrived = messages
                .iter()
                .map(|m| m.sequence)
                .filter(|sequence| !known.contains(sequence))
                .collect();
            if messages.len() < self.history.len() {
                // Only a clear shrinks the store; old claims and baselines no
                // longer apply.
                self.claimed.clear();
                for slot in &mut self.pending {
                    slot.baseline = 0;
                }
            }
            self.history = messages;
            delta.changed = true;
        }

        for sequence in self.reconcile(delta) {
            arrived.remove(&sequence);
        }
        delta.new_remote = arrived.len();

        let max_cycles = self.policy.max_cycles;
        for slot in &mut self.pending {
            if slot.message.state != PendingState::Sent {
                continue;
            }
            slot.cycles_sent += 1;
            if slot.cycles_sent >= max_cycles {
                slot.message.state = PendingState::Unconfirmed;
                delta.unconfirmed.push(slot.message.correlation_id);
                delta.changed = true;
                tracing::debug!(
                    correlation_id = slot.message.correlation_id,
                    cycles = slot.cycles_sent,
                    "pending message unconfirmed"
                );
            }
        }
    }

    /// Oldest pending first; each claims the earliest eligible echo. Server
    /// timestamps only break ties between several eligible echoes, since the
    /// store's clock need not agree with ours. Returns the sequences claimed
    /// in this pass.
    fn reconcile(&mut self, delta: &mut ViewDelta) -> Vec<u64> {
        let mut claimed_now = Vec::new();
        let window_ms = i64::try_from(self.policy.window_ms).unwrap_or(i64::MAX);
        let mut remaining = VecDeque::with_capacity(self.pending.len());
        while let Some(slot) = self.pending.pop_front() {
            let start = slot.baseline.min(self.history.len());
            let eligible = self.history[start..]
                .iter()
                .filter(|candidate| {
                    !self.claimed.contains(&candidate.sequence)
                        && candidate.is_from(&slot.message.sender)
                        && candidate.body == slot.message.body
                })
                .collect::<Vec<_>>();
            let matched = match eligible.as_slice() {
                [] => None,
                [only] => Some(*only),
                [first, ..] => eligible
                    .iter()
                    .find(|candidate| {
                        candidate.created_at.map_or(true, |at| {
                            (at - slot.message.created_at).num_milliseconds().abs() <= window_ms
                        })
                    })
                    .copied()
                    .or(Some(*first)),
            };
            match matched {
                Some(candidate) => {
                    self.claimed.insert(candidate.sequence);
                    claimed_now.push(candidate.sequence);
                    delta.reconciled.push(slot.message.correlation_id);
                    delta.changed = true;
                    tracing::debug!(
                        correlation_id = slot.message.correlation_id,
                        sequence = candidate.sequence,
                        "pending message reconciled"
                    );
                }
                None => remaining.push_back(slot),
            }
        }
        self.pending = remaining;
        claimed_now
    }

    fn slot_mut(&mut self, correlation_id: u64) -> Option<&mut PendingSlot> {
        self.pending
            .iter_mut()
            .find(|slot| slot.message.correlation_id == correlation_id)
    }

    fn rebuild(&mut self) {
        let mut entries = Vec::with_capacity(self.history.len() + self.pending.len());
        entries.extend(self.history.iter().map(|message| TimelineEntry::Confirmed {
            message: message.clone(),
        }));
        entries.extend(self.pending.iter().map(|slot| TimelineEntry::Pending {
            message: slot.message.clone(),
        }));
        self.rendered = Arc::new(entries);
        self.revision += 1;
    }
}

#[derive(Debug, Clone)]
pub struct ViewUpdate {
    pub epoch: u64,
    /// Strictly increasing per view; subscribers see updates in this order.
    pub revision: u64,
    pub entries: Arc<Vec<TimelineEntry>>,
    pub delta: ViewDelta,
}

/// Shared handle to one room's view. Both writers (sync loop and outbox)
/// go through `apply`.
#[derive(Debug, Clone)]
pub struct SharedView {
    inner: Arc<Mutex<RoomView>>,
    updates: broadcast::Sender<ViewUpdate>,
}

impl SharedView {
    pub fn new(view: RoomView) -> Self {
        let (updates, _) = broadcast::channel(UPDATE_CHANNEL_CAPACITY);
        Self {
            inner: Arc::new(Mutex::new(view)),
            updates,
        }
    }

    /// Merges and publishes under the same lock, so concurrent writers
    /// broadcast in merge order.
    pub fn apply(&self, change: ViewChange) -> Result<ViewDelta, MergeError> {
        let mut view = self.lock();
        let delta = view.merge(change)?;
        if delta.changed {
            let _ = self.updates.send(ViewUpdate {
                epoch: view.epoch(),
                revision: view.revision(),
                entries: view.entries(),
                delta: delta.clone(),
            });
        }
        Ok(delta)
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ViewUpdate> {
        self.updates.subscribe()
    }

    pub fn epoch(&self) -> u64 {
        self.lock().epoch()
    }

    pub fn entries(&self) -> Arc<Vec<TimelineEntry>> {
        self.lock().entries()
    }

    pub fn history(&self) -> Vec<Message> {
        self.lock().history().to_vec()
    }

    pub fn pending(&self) -> Vec<PendingMessage> {
        self.lock().pending().cloned().collect()
    }

    pub fn pending_by_id(&self, correlation_id: u64) -> Option<PendingMessage> {
        self.lock().pending_by_id(correlation_id).cloned()
    }

    fn lock(&self) -> MutexGuard<'_, RoomView> {
        self.inner
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}
