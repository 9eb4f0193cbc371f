// Queue state module
//
// This module provides the QueueStateManager which owns the items of a batch run
// behind Arc<RwLock<T>> and emits change events for observers. Every status change
// and its aggregate counter update happen under the same write lock.

use crate::models::{BatchStats, ItemId, ItemMetadata, ItemStatus, NewQueueItem, QueueItem};
use indexmap::IndexMap;
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};
use thiserror::Error;
use tokio::sync::broadcast;

/// Events emitted when the queue changes
#[derive(Clone, Debug, PartialEq)]
pub enum QueueEvent {
    ItemsAdded {
        ids: Vec<ItemId>,
    },

    /// An item moved along the state machine (or was reset to pending)
    StatusChanged {
        id: ItemId,
        from: ItemStatus,
        to: ItemStatus,
    },

    ProgressUpdated {
        id: ItemId,
        progress: u8,
        message: String,
    },

    ItemRemoved {
        id: ItemId,
    },

    QueueCleared,
}

/// Rejected state machine operations. The queue is left untouched.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransitionError {
    #[error("item {0} is not in the queue")]
    UnknownItem(ItemId),

    #[error("item {id} cannot move from {from} to {to}")]
    InvalidTransition {
        id: ItemId,
        from: ItemStatus,
        to: ItemStatus,
    },

    #[error("item {id} is {status}, progress can only change while processing")]
    NotProcessing { id: ItemId, status: ItemStatus },

    #[error("item {0} is being processed and cannot be removed")]
    ItemBusy(ItemId),
}

/// Items of a run in insertion order plus their aggregate counters
#[derive(Debug, Clone, Default)]
pub struct QueueState {
    pub items: IndexMap<ItemId, QueueItem>,
    pub stats: BatchStats,
    next_id: u64,
}

impl QueueState {
    pub fn count(&self, status: ItemStatus) -> usize {
        self.items.values().filter(|i| i.status == status).count()
    }
}

impl BatchStats {
    fn enter(&mut self, status: ItemStatus, metadata: &ItemMetadata) {
        match status {
            ItemStatus::Completed => {
                self.completed += 1;
                self.total_cost_usd += metadata.cost_usd;
                self.total_cost_rmb += metadata.cost_rmb;
            }
            ItemStatus::Failed => self.failed += 1,
            ItemStatus::Skipped => self.skipped += 1,
            ItemStatus::Pending | ItemStatus::Processing => {}
        }
    }

    fn leave(&mut self, status: ItemStatus, metadata: &ItemMetadata) {
        match status {
            ItemStatus::Completed => {
                self.completed -= 1;
                self.total_cost_usd -= metadata.cost_usd;
                self.total_cost_rmb -= metadata.cost_rmb;
            }
            ItemStatus::Failed => self.failed -= 1,
            ItemStatus::Skipped => self.skipped -= 1,
            ItemStatus::Pending | ItemStatus::Processing => {}
        }
    }
}

/// Thread-safe queue state machine with event emission
///
/// - Items are only mutated through the transition methods below
/// - A transition checks the current status, applies the change and
///   adjusts [`BatchStats`] inside one write lock, so no reader ever sees a
///   status without its matching counter
/// - Events are broadcast while the lock is held, so subscribers see them
///   in the same order the state changed
///
/// `claim` is the only way into `Processing`; when two workers race for the
/// same item exactly one of them gets it.
pub struct QueueStateManager {
    state: Arc<RwLock<QueueState>>,
    events_tx: broadcast::Sender<QueueEvent>,
}

impl QueueStateManager {
    /// Create an empty queue with a broadcast buffer of 256 events
    pub fn new() -> Self {
        let (events_tx, _) = broadcast::channel(256);
        Self {
            state: Arc::new(RwLock::new(QueueState::default())),
            events_tx,
        }
    }

    fn read_guard(&self) -> RwLockReadGuard<'_, QueueState> {
        self.state.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write_guard(&self) -> RwLockWriteGuard<'_, QueueState> {
        self.state.write().unwrap_or_else(|e| e.into_inner())
    }

    fn emit(&self, event: QueueEvent) {
        // Nobody listening is fine
        let _ = self.events_tx.send(event);
    }

    /// Clone of the whole queue
    pub fn snapshot(&self) -> QueueState {
        self.read_guard().clone()
    }

    /// Run a closure with read access to the queue
    pub fn read<F, R>(&self, f: F) -> R
    where
        F: FnOnce(&QueueState) -> R,
    {
        let state = self.read_guard();
        f(&state)
    }

    pub fn item(&self, id: ItemId) -> Option<QueueItem> {
        self.read_guard().items.get(&id).cloned()
    }

    /// Clones of the given items, in the order of `ids`; unknown ids are ignored
    pub fn items(&self, ids: &[ItemId]) -> Vec<QueueItem> {
        let state = self.read_guard();
        ids.iter()
            .filter_map(|id| state.items.get(id).cloned())
            .collect()
    }

    pub fn stats(&self) -> BatchStats {
        self.read_guard().stats.clone()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<QueueEvent> {
        self.events_tx.subscribe()
    }

    /// Append items as pending and return their ids in the same order
    pub fn add_items(&self, items: Vec<NewQueueItem>) -> Vec<ItemId> {
        let mut state = self.write_guard();
        let mut ids = Vec::with_capacity(items.len());

        for item in items {
            state.next_id += 1;
            let id = ItemId(state.next_id);
            state.items.insert(id, QueueItem::from_new(id, item));
            ids.push(id);
        }
        state.stats.total += ids.len();

        tracing::debug!("Queued {} items (total {})", ids.len(), state.stats.total);
        self.emit(QueueEvent::ItemsAdded { ids: ids.clone() });
        ids
    }

    /// Move an item along a forward edge of the state machine
    fn transition<F>(&self, id: ItemId, to: ItemStatus, apply: F) -> Result<QueueItem, TransitionError>
    where
        F: FnOnce(&mut QueueItem),
    {
        let mut guard = self.write_guard();
        let QueueState { items, stats, .. } = &mut *guard;

        let item = items.get_mut(&id).ok_or(TransitionError::UnknownItem(id))?;
        let from = item.status;
        if !from.can_transition_to(to) {
            return Err(TransitionError::InvalidTransition { id, from, to });
        }

        item.status = to;
        apply(item);
        stats.enter(to, &item.metadata);

        let updated = item.clone();
        self.emit(QueueEvent::StatusChanged { id, from, to });
        Ok(updated)
    }

    /// Pending -> Processing. Fails for any item that is not pending.
    pub fn claim(&self, id: ItemId) -> Result<QueueItem, TransitionError> {
        self.transition(id, ItemStatus::Processing, |item| {
            item.progress = 0;
            item.error = None;
        })
    }

    /// Processing -> Completed, attaching the final metadata
    pub fn complete(&self, id: ItemId, metadata: ItemMetadata) -> Result<QueueItem, TransitionError> {
        self.transition(id, ItemStatus::Completed, |item| {
            item.progress = 100;
            item.metadata = metadata;
        })
    }

    /// Processing -> Failed
    pub fn fail(&self, id: ItemId, error: impl Into<String>) -> Result<QueueItem, TransitionError> {
        let error = error.into();
        self.transition(id, ItemStatus::Failed, |item| {
            item.error = Some(error);
        })
    }

    /// Pending or Processing -> Skipped
    pub fn skip(&self, id: ItemId, reason: impl Into<String>) -> Result<QueueItem, TransitionError> {
        let reason = reason.into();
        self.transition(id, ItemStatus::Skipped, |item| {
            item.skip_reason = Some(reason);
        })
    }

    /// Record progress for a processing item. Progress never moves backwards.
    pub fn update_progress(
        &self,
        id: ItemId,
        percent: u8,
        message: impl Into<String>,
    ) -> Result<u8, TransitionError> {
        let mut state = self.write_guard();
        let item = state
            .items
            .get_mut(&id)
            .ok_or(TransitionError::UnknownItem(id))?;

        if item.status != ItemStatus::Processing {
            return Err(TransitionError::NotProcessing {
                id,
                status: item.status,
            });
        }

        let progress = item.progress.max(percent.min(100));
        item.progress = progress;

        self.emit(QueueEvent::ProgressUpdated {
            id,
            progress,
            message: message.into(),
        });
        Ok(progress)
    }

    /// Put an item back to pending, reversing its counters and cost.
    ///
    /// Resetting a pending item is a no-op.
    pub fn reset(&self, id: ItemId) -> Result<QueueItem, TransitionError> {
        let mut guard = self.write_guard();
        let QueueState { items, stats, .. } = &mut *guard;

        let item = items.get_mut(&id).ok_or(TransitionError::UnknownItem(id))?;
        let from = item.status;
        if from == ItemStatus::Pending {
            return Ok(item.clone());
        }

        stats.leave(from, &item.metadata);
        item.status = ItemStatus::Pending;
        item.progress = 0;
        item.error = None;
        item.skip_reason = None;
        item.metadata = ItemMetadata::default();

        let updated = item.clone();
        self.emit(QueueEvent::StatusChanged {
            id,
            from,
            to: ItemStatus::Pending,
        });
        Ok(updated)
    }

    /// Drop an item from the queue. Processing items cannot be removed.
    pub fn remove(&self, id: ItemId) -> Result<QueueItem, TransitionError> {
        let mut guard = self.write_guard();
        let QueueState { items, stats, .. } = &mut *guard;

        let status = items
            .get(&id)
            .map(|i| i.status)
            .ok_or(TransitionError::UnknownItem(id))?;
        if status == ItemStatus::Processing {
            return Err(TransitionError::ItemBusy(id));
        }

        let removed = items
            .shift_remove(&id)
            .ok_or(TransitionError::UnknownItem(id))?;
        stats.leave(removed.status, &removed.metadata);
        stats.total -= 1;

        self.emit(QueueEvent::ItemRemoved { id });
        Ok(removed)
    }

    /// Remove every item and reset the counters
    pub fn clear(&self) {
        let mut state = self.write_guard();
        state.items.clear();
        state.stats = BatchStats::default();
        self.emit(QueueEvent::QueueCleared);
    }
}

impl Default for QueueStateManager {
    fn default() -> Self {
        Self::new()
    }
}

impl Clone for QueueStateManager {
    fn clone(&self) -> Self {
        Self {
            state: Arc::clone(&self.state),
            events_tx: self.events_tx.clone(),
        }
    }
}
