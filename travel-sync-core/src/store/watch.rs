//! Change notification for the tree store.
//!
//! A watcher attached to a node sees every put and delete at that node or
//! below it. Mutations are recorded per watcher while a batch is open and
//! dispatched when the batch ends: only the last value per key survives,
//! keys keep the order in which they were first touched, and a single
//! [`WatchEvent::BatchEnd`] follows the ops of each watcher that saw any.

use indexmap::{IndexMap, IndexSet};
use std::collections::HashMap;
use std::sync::{Mutex, Weak};
use tokio::sync::mpsc;

use super::tree::NodeId;
use super::StoreInner;
use crate::key::Key;

pub type WatcherId = u64;

/// A change delivered to a watcher.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WatchEvent {
    /// `continued` is true when more ops follow in the same batch.
    Put {
        key: Key,
        value: String,
        continued: bool,
    },
    Delete {
        key: Key,
        continued: bool,
    },
    /// The batch is settled; no more ops until the next one.
    BatchEnd,
}

impl WatchEvent {
    pub fn key(&self) -> Option<&Key> {
        match self {
            WatchEvent::Put { key, .. } | WatchEvent::Delete { key, .. } => Some(key),
            WatchEvent::BatchEnd => None,
        }
    }
}

struct WatcherSlot {
    node: NodeId,
    sender: mpsc::UnboundedSender<WatchEvent>,
    pending: IndexMap<Key, Option<String>>,
}

#[derive(Default)]
pub(crate) struct Watchers {
    next_id: WatcherId,
    slots: HashMap<WatcherId, WatcherSlot>,
    dirty: IndexSet<WatcherId>,
}

impl Watchers {
    pub fn register(&mut self, node: NodeId, sender: mpsc::UnboundedSender<WatchEvent>) -> WatcherId {
        let id = self.next_id;
        self.next_id += 1;
        self.slots.insert(
            id,
            WatcherSlot {
                node,
                sender,
                pending: IndexMap::new(),
            },
        );
        id
    }

    /// Drops a watcher, returning the node it was attached to.
    pub fn remove(&mut self, id: WatcherId) -> Option<NodeId> {
        self.dirty.shift_remove(&id);
        self.slots.remove(&id).map(|slot| slot.node)
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    /// Records an op for every listed watcher. `None` is a delete.
    pub fn record(&mut self, watchers: &[WatcherId], key: &[String], value: Option<&str>) {
        for id in watchers {
            if let Some(slot) = self.slots.get_mut(id) {
                slot.pending
                    .insert(key.to_vec(), value.map(str::to_string));
                self.dirty.insert(*id);
            }
        }
    }

    /// Dispatches pending ops and batch-end markers.
    ///
    /// Returns watchers whose receiver is gone so the caller can detach
    /// them from the tree.
    pub fn flush(&mut self) -> Vec<(WatcherId, NodeId)> {
        let dirty: Vec<WatcherId> = self.dirty.drain(..).collect();
        let mut closed = Vec::new();

        for id in dirty {
            let Some(slot) = self.slots.get_mut(&id) else {
                continue;
            };
            let ops = std::mem::take(&mut slot.pending);
            let count = ops.len();
            let mut delivered = true;

            for (i, (key, value)) in ops.into_iter().enumerate() {
                let continued = i + 1 < count;
                let event = match value {
                    Some(value) => WatchEvent::Put {
                        key,
                        value,
                        continued,
                    },
                    None => WatchEvent::Delete { key, continued },
                };
                if slot.sender.send(event).is_err() {
                    delivered = false;
                    break;
                }
            }

            if !delivered || slot.sender.send(WatchEvent::BatchEnd).is_err() {
                closed.push((id, slot.node));
            }
        }

        for (id, _) in &closed {
            self.slots.remove(id);
        }
        closed
    }
}

/// A live subscription to a subtree.
///
/// Values present when the watch was registered are available through
/// [`Watch::take_initial`]; later changes arrive as [`WatchEvent`]s.
/// Dropping the handle unsubscribes.
pub struct Watch {
    id: WatcherId,
    prefix: Key,
    initial: Vec<(Key, String)>,
    events: mpsc::UnboundedReceiver<WatchEvent>,
    store: Weak<Mutex<StoreInner>>,
}

impl Watch {
    pub(super) fn new(
        id: WatcherId,
        prefix: Key,
        initial: Vec<(Key, String)>,
        events: mpsc::UnboundedReceiver<WatchEvent>,
        store: Weak<Mutex<StoreInner>>,
    ) -> Self {
        Self {
            id,
            prefix,
            initial,
            events,
            store,
        }
    }

    pub fn id(&self) -> WatcherId {
        self.id
    }

    pub fn prefix(&self) -> &[String] {
        &self.prefix
    }

    /// Takes the values that existed under the prefix at registration.
    pub fn take_initial(&mut self) -> Vec<(Key, String)> {
        std::mem::take(&mut self.initial)
    }

    /// Waits for the next event. Returns `None` once the store is gone.
    pub async fn next(&mut self) -> Option<WatchEvent> {
        self.events.recv().await
    }

    /// Returns the next event if one is already queued.
    pub fn try_next(&mut self) -> Option<WatchEvent> {
        self.events.try_recv().ok()
    }

    /// Returns every queued event.
    pub fn drain(&mut self) -> Vec<WatchEvent> {
        let mut events = Vec::new();
        while let Some(event) = self.try_next() {
            events.push(event);
        }
        events
    }

    pub fn unsubscribe(self) {}
}

impl Drop for Watch {
    fn drop(&mut self) {
        if let Some(inner) = self.store.upgrade() {
            let mut guard = match inner.lock() {
                Ok(guard) => guard,
                Err(poisoned) => poisoned.into_inner(),
            };
            guard.unwatch(self.id);
        }
    }
}

impl std::fmt::Debug for Watch {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Watch")
            .field("id", &self.id)
            .field("prefix", &self.prefix)
            .finish()
    }
}
