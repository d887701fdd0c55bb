//! Per-field tracking of local writes that have not completed yet.
//!
//! A record synchronizer registers every local write here before issuing
//! it. While the write is in flight its fields are [`FieldState::PendingWrite`],
//! and remote values for those fields are ignored so a stale echo cannot
//! clobber the local edit. Fields with no outstanding write accept remote
//! values as usual.

use futures::future::FutureExt;
use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard};

use crate::key::Key;
use crate::transport::WriteFuture;

pub type WriteToken = u64;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldState {
    /// Never written locally.
    Idle,
    /// At least one local write is outstanding; holds the most recent token.
    PendingWrite(WriteToken),
    /// Every local write has completed.
    Settled,
}

#[derive(Default)]
struct PendingInner {
    next_token: WriteToken,
    pending: HashMap<Key, BTreeSet<WriteToken>>,
    tokens: HashMap<WriteToken, Vec<Key>>,
    settled: HashSet<Key>,
}

/// Shared table of in-flight writes, keyed by field.
#[derive(Clone, Default)]
pub struct PendingWrites {
    inner: Arc<Mutex<PendingInner>>,
}

impl PendingWrites {
    pub fn new() -> Self {
        Self::default()
    }

    // The table only holds bookkeeping, so a poisoned lock is still usable.
    fn lock(&self) -> MutexGuard<'_, PendingInner> {
        match self.inner.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Marks `keys` as pending and returns the token that settles them.
    pub fn begin(&self, keys: Vec<Key>) -> WriteToken {
        let mut inner = self.lock();
        let token = inner.next_token;
        inner.next_token += 1;
        for key in &keys {
            inner.pending.entry(key.clone()).or_default().insert(token);
        }
        inner.tokens.insert(token, keys);
        token
    }

    /// Completes the write identified by `token`. Unknown tokens are ignored.
    pub fn settle(&self, token: WriteToken) {
        let mut inner = self.lock();
        let Some(keys) = inner.tokens.remove(&token) else {
            return;
        };
        for key in keys {
            let now_empty = match inner.pending.get_mut(&key) {
                Some(tokens) => {
                    tokens.remove(&token);
                    tokens.is_empty()
                }
                None => false,
            };
            if now_empty {
                inner.pending.remove(&key);
                inner.settled.insert(key);
            }
        }
    }

    pub fn state(&self, key: &[String]) -> FieldState {
        let inner = self.lock();
        if let Some(latest) = inner.pending.get(key).and_then(|t| t.last()) {
            FieldState::PendingWrite(*latest)
        } else if inner.settled.contains(key) {
            FieldState::Settled
        } else {
            FieldState::Idle
        }
    }

    /// True if a write to exactly `key` is outstanding.
    pub fn is_pending(&self, key: &[String]) -> bool {
        self.lock().pending.contains_key(key)
    }

    /// True if a write to `prefix` or anything below it is outstanding.
    pub fn is_pending_under(&self, prefix: &[String]) -> bool {
        self.lock()
            .pending
            .keys()
            .any(|pending| pending.starts_with(prefix))
    }

    pub fn any_pending(&self) -> bool {
        !self.lock().pending.is_empty()
    }

    /// Wraps a write so its fields stay pending until it resolves.
    ///
    /// The fields settle when the returned future completes or is dropped,
    /// whichever comes first.
    pub fn track(&self, keys: Vec<Key>, write: WriteFuture) -> WriteFuture {
        let guard = PendingGuard {
            writes: self.clone(),
            token: self.begin(keys),
        };
        async move {
            let result = write.await;
            drop(guard);
            result
        }
        .boxed()
    }
}

impl std::fmt::Debug for PendingWrites {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PendingWrites")
            .field("pending", &self.lock().pending.len())
            .finish()
    }
}

struct PendingGuard {
    writes: PendingWrites,
    token: WriteToken,
}

impl Drop for PendingGuard {
    fn drop(&mut self) {
        self.writes.settle(self.token);
    }
}
