//! A store handle usable before the backing store exists.
//!
//! Writes issued before [`DeferredSyncbase::resolve`] wait for the backend
//! and then run. Every write is tracked while in flight, and failures are
//! both returned to the caller and broadcast on an error channel so a
//! fire-and-forget caller still surfaces them.

use futures::future::{BoxFuture, FutureExt};
use serde_json::Value;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::{broadcast, watch};

use super::{Batch, Syncbase, WriteFuture};
use crate::error::SyncError;
use crate::key::Key;
use crate::store::Watch;

const ERROR_CHANNEL_CAPACITY: usize = 64;

type Backend = Option<Arc<dyn Syncbase>>;

/// Decrements the in-flight count when the write finishes, panics included.
struct InFlight(Arc<AtomicUsize>);

impl InFlight {
    fn start(counter: &Arc<AtomicUsize>) -> Self {
        counter.fetch_add(1, Ordering::SeqCst);
        Self(counter.clone())
    }
}

impl Drop for InFlight {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

#[derive(Clone)]
pub struct DeferredSyncbase {
    backend: watch::Receiver<Backend>,
    resolver: Arc<watch::Sender<Backend>>,
    writes: Arc<AtomicUsize>,
    errors: broadcast::Sender<SyncError>,
}

impl DeferredSyncbase {
    pub fn new() -> Self {
        let (resolver, backend) = watch::channel(None);
        let (errors, _) = broadcast::channel(ERROR_CHANNEL_CAPACITY);
        Self {
            backend,
            resolver: Arc::new(resolver),
            writes: Arc::new(AtomicUsize::new(0)),
            errors,
        }
    }

    /// Supplies the backing store, releasing any queued writes.
    pub fn resolve(&self, backend: Arc<dyn Syncbase>) {
        self.resolver.send_replace(Some(backend));
    }

    pub fn is_ready(&self) -> bool {
        self.backend.borrow().is_some()
    }

    /// Number of writes issued but not yet completed.
    pub fn writes_in_flight(&self) -> usize {
        self.writes.load(Ordering::SeqCst)
    }

    /// Receives every write failure.
    pub fn subscribe_errors(&self) -> broadcast::Receiver<SyncError> {
        self.errors.subscribe()
    }

    /// Passes a snapshot through unless local writes are still in flight.
    ///
    /// While the backend is still starting up, an early snapshot would
    /// overwrite local edits queued for writing, so it is dropped.
    pub fn process_update(&self, snapshot: Value) -> Option<Value> {
        if self.writes_in_flight() == 0 {
            Some(snapshot)
        } else {
            None
        }
    }

    fn backend(&self) -> BoxFuture<'static, Result<Arc<dyn Syncbase>, SyncError>> {
        let mut backend = self.backend.clone();
        async move {
            let ready = backend
                .wait_for(Option::is_some)
                .await
                .map_err(|_| SyncError::Closed)?;
            let resolved = ready.as_ref().cloned();
            drop(ready);
            resolved.ok_or(SyncError::Closed)
        }
        .boxed()
    }

    /// Runs `op` against the backend on a spawned task.
    ///
    /// Must be called from within a Tokio runtime.
    fn manage_write<F>(&self, op: F) -> WriteFuture
    where
        F: FnOnce(Arc<dyn Syncbase>) -> WriteFuture + Send + 'static,
    {
        let backend = self.backend();
        let errors = self.errors.clone();
        let in_flight = InFlight::start(&self.writes);

        let task = tokio::spawn(async move {
            let result = match backend.await {
                Ok(backend) => op(backend).await,
                Err(e) => Err(e),
            };
            drop(in_flight);
            if let Err(e) = &result {
                tracing::warn!("Deferred write failed: {}", e);
                // Nobody listening is fine; the caller still gets the error.
                let _ = errors.send(e.clone());
            }
            result
        });

        async move {
            task.await
                .map_err(|e| SyncError::Transport(format!("write task failed: {}", e)))?
        }
        .boxed()
    }
}

impl Default for DeferredSyncbase {
    fn default() -> Self {
        Self::new()
    }
}

impl Syncbase for DeferredSyncbase {
    fn put(&self, key: Key, value: String) -> WriteFuture {
        self.manage_write(move |backend| backend.put(key, value))
    }

    fn delete(&self, key: Key) -> WriteFuture {
        self.manage_write(move |backend| backend.delete(key))
    }

    fn batch(&self, batch: Batch) -> WriteFuture {
        self.manage_write(move |backend| backend.batch(batch))
    }

    fn get_data(&self) -> BoxFuture<'static, Result<Value, SyncError>> {
        let backend = self.backend();
        async move { backend.await?.get_data().await }.boxed()
    }

    fn watch(&self, prefix: Key) -> BoxFuture<'static, Result<Watch, SyncError>> {
        let backend = self.backend();
        async move { backend.await?.watch(prefix).await }.boxed()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::key::key;
    use crate::store::Store;
    use futures::future;
    use serde_json::json;

    struct FailingStore;

    impl Syncbase for FailingStore {
        fn put(&self, _key: Key, _value: String) -> WriteFuture {
            future::ready(Err(SyncError::Transport("offline".into()))).boxed()
        }

        fn delete(&self, _key: Key) -> WriteFuture {
            future::ready(Err(SyncError::Transport("offline".into()))).boxed()
        }

        fn batch(&self, _batch: Batch) -> WriteFuture {
            future::ready(Err(SyncError::Transport("offline".into()))).boxed()
        }

        fn get_data(&self) -> BoxFuture<'static, Result<Value, SyncError>> {
            future::ready(Ok(json!({}))).boxed()
        }

        fn watch(&self, _prefix: Key) -> BoxFuture<'static, Result<Watch, SyncError>> {
            future::ready(Err(SyncError::Transport("offline".into()))).boxed()
        }
    }

    #[tokio::test]
    async fn test_writes_wait_for_backend() {
        let deferred = DeferredSyncbase::new();
        let write = deferred.put(key(&["a"]), "1".to_string());
        tokio::task::yield_now().await;

        assert!(!deferred.is_ready());
        assert_eq!(deferred.writes_in_flight(), 1);
        assert!(deferred.process_update(json!({})).is_none());

        let store = Store::new();
        deferred.resolve(Arc::new(store.clone()));
        write.await.unwrap();

        assert_eq!(store.get(&key(&["a"])).unwrap().as_deref(), Some("1"));
        assert_eq!(deferred.writes_in_flight(), 0);
        assert_eq!(deferred.process_update(json!({"a": "1"})), Some(json!({"a": "1"})));
    }

    #[tokio::test]
    async fn test_failures_reach_error_channel() {
        let deferred = DeferredSyncbase::new();
        let mut errors = deferred.subscribe_errors();
        deferred.resolve(Arc::new(FailingStore));

        let result = deferred.delete(key(&["a"])).await;
        assert_eq!(result, Err(SyncError::Transport("offline".into())));
        assert_eq!(
            errors.recv().await.unwrap(),
            SyncError::Transport("offline".into())
        );
        assert_eq!(deferred.writes_in_flight(), 0);
    }

    #[tokio::test]
    async fn test_unawaited_write_still_runs() {
        let deferred = DeferredSyncbase::new();
        let store = Store::new();
        deferred.resolve(Arc::new(store.clone()));

        drop(deferred.put(key(&["fire"]), "forget".to_string()));
        while deferred.writes_in_flight() > 0 {
            tokio::task::yield_now().await;
        }
        assert_eq!(store.get(&key(&["fire"])).unwrap().as_deref(), Some("forget"));
    }

    #[tokio::test]
    async fn test_reads_go_to_backend() {
        let deferred = DeferredSyncbase::new();
        let store = Store::new();
        store.put(&key(&["x"]), "1").unwrap();
        deferred.resolve(Arc::new(store));

        assert_eq!(deferred.get_data().await.unwrap(), json!({"x": "1"}));
        let mut watch = deferred.watch(key(&["x"])).await.unwrap();
        assert_eq!(watch.take_initial().len(), 1);
    }
}
