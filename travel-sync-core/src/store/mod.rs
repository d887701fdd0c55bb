//! In-memory versioned tree store.
//!
//! Every node carries an optional value and a version that advances on each
//! local set or delete at that node. Writes notify watchers on the written
//! path; notifications are buffered per batch and flushed when the batch
//! ends, which happens after every external write and every merge pass.
//!
//! # Example
//!
//! ```
//! use travel_sync_core::{key, Store};
//!
//! let store = Store::new();
//! store.put(&key(&["trips", "t1", "owner"]), "alice").unwrap();
//! assert_eq!(store.get(&key(&["trips", "t1", "owner"])).unwrap().as_deref(), Some("alice"));
//! assert_eq!(store.version(&key(&["trips", "t1", "owner"])).unwrap(), Some(0));
//! ```

mod tree;
mod watch;

use serde_json::{Map, Value};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::mpsc;

use crate::error::SyncError;
use crate::key::{validate_key, Key};
use crate::transport::{Batch, BatchOp};

pub(crate) use tree::{NodeId, Tree};
pub use watch::{Watch, WatchEvent, WatcherId};
pub(crate) use watch::Watchers;

/// Process-unique identifier of a store instance.
pub type StoreId = u64;

static NEXT_STORE_ID: AtomicU64 = AtomicU64::new(1);

pub(crate) struct StoreInner {
    pub(crate) tree: Tree,
    pub(crate) watchers: Watchers,
}

impl StoreInner {
    fn new() -> Self {
        Self {
            tree: Tree::new(),
            watchers: Watchers::default(),
        }
    }

    fn set(&mut self, key: &[String], value: String) {
        let (id, mut watchers) = self.tree.resolve_or_create(key);
        let node = self.tree.node_mut(id);
        node.value = Some(value);
        node.advance_version();
        watchers.extend_from_slice(&node.watchers);

        let value = self.tree.node(id).value.clone();
        self.watchers.record(&watchers, key, value.as_deref());
    }

    fn delete(&mut self, key: &[String]) {
        let Some(id) = self.tree.resolve(key) else {
            return;
        };
        let inherited = self.tree.ancestor_watchers(key);
        let mut key = key.to_vec();
        self.recursive_delete(id, &mut key, &inherited);
    }

    fn recursive_delete(&mut self, id: NodeId, key: &mut Key, inherited: &[WatcherId]) {
        let mut watchers = inherited.to_vec();
        let node = self.tree.node_mut(id);
        watchers.extend_from_slice(&node.watchers);

        let had_value = node.value.take().is_some();
        node.advance_version();
        if had_value {
            self.watchers.record(&watchers, key, None);
        }

        let children: Vec<(String, NodeId)> = self
            .tree
            .node(id)
            .children
            .iter()
            .map(|(segment, &child)| (segment.clone(), child))
            .collect();
        for (segment, child) in children {
            key.push(segment);
            self.recursive_delete(child, key, &watchers);
            key.pop();
        }
    }

    pub(crate) fn apply(&mut self, op: BatchOp) {
        match op {
            BatchOp::Put { key, value } => self.set(&key, value),
            BatchOp::Delete { key } => self.delete(&key),
        }
    }

    /// Flushes buffered notifications to watchers.
    pub(crate) fn end_batch(&mut self) {
        for (id, node) in self.watchers.flush() {
            self.tree.node_mut(node).watchers.retain(|w| *w != id);
        }
    }

    pub(crate) fn unwatch(&mut self, id: WatcherId) {
        if let Some(node) = self.watchers.remove(id) {
            self.tree.node_mut(node).watchers.retain(|w| *w != id);
        }
    }
}

/// Handle to an in-memory replicated store.
///
/// Clones share the same tree.
#[derive(Clone)]
pub struct Store {
    id: StoreId,
    inner: Arc<Mutex<StoreInner>>,
}

impl Store {
    pub fn new() -> Self {
        Self {
            id: NEXT_STORE_ID.fetch_add(1, Ordering::Relaxed),
            inner: Arc::new(Mutex::new(StoreInner::new())),
        }
    }

    pub fn id(&self) -> StoreId {
        self.id
    }

    pub(crate) fn lock(&self) -> Result<MutexGuard<'_, StoreInner>, SyncError> {
        self.inner
            .lock()
            .map_err(|_| SyncError::Transport(format!("store {} lock poisoned", self.id)))
    }

    /// Sets the value at `key`, creating intermediate nodes.
    pub fn put(&self, key: &[String], value: impl Into<String>) -> Result<(), SyncError> {
        validate_key(key)?;
        let mut inner = self.lock()?;
        inner.set(key, value.into());
        inner.end_batch();
        Ok(())
    }

    /// Deletes the value at `key` and everything below it.
    ///
    /// An empty key wipes the whole store. Nodes stay behind as tombstones
    /// with advanced versions.
    pub fn delete(&self, key: &[String]) -> Result<(), SyncError> {
        validate_key(key)?;
        let mut inner = self.lock()?;
        inner.delete(key);
        inner.end_batch();
        Ok(())
    }

    /// Applies all ops, then flushes notifications once.
    ///
    /// Nothing is applied if any op has an invalid key.
    pub fn batch(&self, batch: Batch) -> Result<(), SyncError> {
        for op in batch.ops() {
            validate_key(op.key())?;
        }
        let mut inner = self.lock()?;
        for op in batch.into_ops() {
            inner.apply(op);
        }
        inner.end_batch();
        Ok(())
    }

    pub fn get(&self, key: &[String]) -> Result<Option<String>, SyncError> {
        let inner = self.lock()?;
        Ok(inner
            .tree
            .resolve(key)
            .and_then(|id| inner.tree.node(id).value.clone()))
    }

    /// Version of the node at `key`; `None` if it was never written.
    pub fn version(&self, key: &[String]) -> Result<Option<u64>, SyncError> {
        let inner = self.lock()?;
        Ok(inner
            .tree
            .resolve(key)
            .and_then(|id| inner.tree.node(id).version))
    }

    /// Snapshot of the whole store; an empty object when nothing is set.
    pub fn get_data(&self) -> Result<Value, SyncError> {
        let inner = self.lock()?;
        Ok(inner
            .tree
            .extract(tree::ROOT)
            .unwrap_or_else(|| Value::Object(Map::new())))
    }

    /// Snapshot of the subtree at `prefix`.
    pub fn get_data_at(&self, prefix: &[String]) -> Result<Option<Value>, SyncError> {
        let inner = self.lock()?;
        Ok(inner.tree.resolve(prefix).and_then(|id| inner.tree.extract(id)))
    }

    /// Subscribes to changes at or below `prefix`.
    pub fn watch(&self, prefix: &[String]) -> Result<Watch, SyncError> {
        validate_key(prefix)?;
        let mut inner = self.lock()?;
        let (node, _) = inner.tree.resolve_or_create(prefix);
        let initial = inner.tree.entries(node, prefix);

        let (sender, receiver) = mpsc::unbounded_channel();
        let id = inner.watchers.register(node, sender);
        inner.tree.node_mut(node).watchers.push(id);

        Ok(Watch::new(
            id,
            prefix.to_vec(),
            initial,
            receiver,
            Arc::downgrade(&self.inner),
        ))
    }

    /// Number of live watchers.
    pub fn watcher_count(&self) -> Result<usize, SyncError> {
        Ok(self.lock()?.watchers.len())
    }
}

impl Default for Store {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for Store {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Store").field("id", &self.id).finish()
    }
}
