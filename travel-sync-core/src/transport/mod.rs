//! The store contract consumed by synchronizers.
//!
//! Synchronizers never talk to a [`Store`] directly; they go through
//! [`Syncbase`], whose operations return futures so that a remote-backed
//! implementation can slot in. The in-memory store completes every
//! operation before returning its future.

mod deferred;

use futures::future::{self, BoxFuture, FutureExt};
use serde_json::Value;

use crate::error::SyncError;
use crate::key::Key;
use crate::store::{Store, Watch};

pub use deferred::DeferredSyncbase;

/// A pending write. Completes when the store has accepted the write.
pub type WriteFuture = BoxFuture<'static, Result<(), SyncError>>;

/// A single write inside a [`Batch`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BatchOp {
    Put { key: Key, value: String },
    Delete { key: Key },
}

impl BatchOp {
    pub fn key(&self) -> &Key {
        match self {
            BatchOp::Put { key, .. } | BatchOp::Delete { key } => key,
        }
    }
}

/// Writes applied together, with one notification flush at the end.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Batch {
    ops: Vec<BatchOp>,
}

impl Batch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn put(&mut self, key: Key, value: impl Into<String>) -> &mut Self {
        self.ops.push(BatchOp::Put {
            key,
            value: value.into(),
        });
        self
    }

    pub fn delete(&mut self, key: Key) -> &mut Self {
        self.ops.push(BatchOp::Delete { key });
        self
    }

    pub fn extend(&mut self, other: Batch) -> &mut Self {
        self.ops.extend(other.ops);
        self
    }

    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }

    pub fn len(&self) -> usize {
        self.ops.len()
    }

    pub fn ops(&self) -> &[BatchOp] {
        &self.ops
    }

    /// Keys touched by this batch, in op order.
    pub fn keys(&self) -> Vec<Key> {
        self.ops.iter().map(|op| op.key().clone()).collect()
    }

    pub fn into_ops(self) -> Vec<BatchOp> {
        self.ops
    }
}

/// Replicated key-value store operations.
pub trait Syncbase: Send + Sync {
    fn put(&self, key: Key, value: String) -> WriteFuture;

    fn delete(&self, key: Key) -> WriteFuture;

    fn batch(&self, batch: Batch) -> WriteFuture;

    /// Full snapshot of the store as nested JSON.
    fn get_data(&self) -> BoxFuture<'static, Result<Value, SyncError>>;

    /// Subscribes to changes below `prefix`.
    fn watch(&self, prefix: Key) -> BoxFuture<'static, Result<Watch, SyncError>>;
}

impl Syncbase for Store {
    fn put(&self, key: Key, value: String) -> WriteFuture {
        future::ready(Store::put(self, &key, value)).boxed()
    }

    fn delete(&self, key: Key) -> WriteFuture {
        future::ready(Store::delete(self, &key)).boxed()
    }

    fn batch(&self, batch: Batch) -> WriteFuture {
        future::ready(Store::batch(self, batch)).boxed()
    }

    fn get_data(&self) -> BoxFuture<'static, Result<Value, SyncError>> {
        future::ready(Store::get_data(self)).boxed()
    }

    fn watch(&self, prefix: Key) -> BoxFuture<'static, Result<Watch, SyncError>> {
        future::ready(Store::watch(self, &prefix)).boxed()
    }
}

/// A write future that has already succeeded.
pub fn no_write() -> WriteFuture {
    future::ready(Ok(())).boxed()
}

/// A write future that has already failed with `error`.
pub fn failed_write(error: SyncError) -> WriteFuture {
    future::ready(Err(error)).boxed()
}

/// Runs all writes, failing with the first error.
pub fn join_writes(writes: Vec<WriteFuture>) -> WriteFuture {
    future::try_join_all(writes).map(|r| r.map(|_| ())).boxed()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::key::key;
    use std::sync::Arc;

    #[test]
    fn test_batch_builder() {
        let mut batch = Batch::new();
        batch.put(key(&["a"]), "1").delete(key(&["b"]));
        assert_eq!(batch.len(), 2);
        assert_eq!(batch.keys(), vec![key(&["a"]), key(&["b"])]);

        let mut other = Batch::new();
        other.put(key(&["c"]), "3");
        batch.extend(other);
        assert_eq!(batch.len(), 3);
    }

    #[tokio::test]
    async fn test_store_through_trait_object() {
        let store = Store::new();
        let sb: Arc<dyn Syncbase> = Arc::new(store.clone());

        sb.put(key(&["a"]), "1".to_string()).await.unwrap();
        let mut batch = Batch::new();
        batch.put(key(&["b"]), "2").delete(key(&["a"]));
        sb.batch(batch).await.unwrap();

        assert_eq!(store.get(&key(&["a"])).unwrap(), None);
        assert_eq!(store.get(&key(&["b"])).unwrap().as_deref(), Some("2"));
        let data = sb.get_data().await.unwrap();
        assert_eq!(data["b"], "2");
    }

    #[tokio::test]
    async fn test_store_writes_apply_before_await() {
        let store = Store::new();
        let write = Syncbase::put(&store, key(&["eager"]), "yes".to_string());
        assert_eq!(store.get(&key(&["eager"])).unwrap().as_deref(), Some("yes"));
        write.await.unwrap();
    }

    #[tokio::test]
    async fn test_join_writes_reports_first_error() {
        let failing: WriteFuture = future::ready(Err(SyncError::Transport("down".into()))).boxed();
        let result = join_writes(vec![no_write(), failing]).await;
        assert_eq!(result, Err(SyncError::Transport("down".into())));
        assert!(join_writes(Vec::new()).await.is_ok());
    }
}
