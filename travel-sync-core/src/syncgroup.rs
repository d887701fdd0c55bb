//! Registry of syncgroups and the per-store handle used to create or join
//! them.
//!
//! A syncgroup is identified by its admin and name, and lists the key
//! prefixes its members replicate. The first caller defines the prefixes;
//! later joiners accept them as they are.

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::{debug, info};

use crate::error::SyncError;
use crate::key::Key;
use crate::store::{Store, StoreId};

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SyncgroupKey {
    pub admin: String,
    pub name: String,
}

impl SyncgroupKey {
    pub fn new(admin: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            admin: admin.into(),
            name: name.into(),
        }
    }

    fn not_found(&self) -> SyncError {
        SyncError::not_found(self.admin.clone(), self.name.clone())
    }
}

impl fmt::Display for SyncgroupKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}${}", self.admin, self.name)
    }
}

/// The replication contract of a syncgroup.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncgroupSpec {
    pub prefixes: Vec<Key>,
}

impl SyncgroupSpec {
    pub fn new(prefixes: Vec<Key>) -> Self {
        Self { prefixes }
    }
}

struct Syncgroup {
    spec: SyncgroupSpec,
    /// Kept in join order; the sync loop chains members in this order.
    members: Vec<Store>,
}

impl Syncgroup {
    fn add_member(&mut self, store: &Store) -> bool {
        if self.members.iter().any(|m| m.id() == store.id()) {
            return false;
        }
        self.members.push(store.clone());
        true
    }
}

/// A syncgroup's prefixes and members at one point in time.
#[derive(Debug, Clone)]
pub(crate) struct GroupSnapshot {
    pub key: SyncgroupKey,
    pub prefixes: Vec<Key>,
    pub members: Vec<Store>,
}

/// Table of syncgroups shared by every store that takes part in replication.
///
/// Construct one per process or test and pass clones around; clones share
/// the table.
#[derive(Clone, Default)]
pub struct SyncgroupRegistry {
    groups: Arc<Mutex<IndexMap<SyncgroupKey, Syncgroup>>>,
}

impl SyncgroupRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> Result<MutexGuard<'_, IndexMap<SyncgroupKey, Syncgroup>>, SyncError> {
        self.groups
            .lock()
            .map_err(|_| SyncError::Transport("syncgroup registry lock poisoned".to_string()))
    }

    /// Creates the syncgroup with `spec` if it is unknown, then adds `store`.
    ///
    /// Returns `true` if this call created the group. When the group
    /// already exists its prefixes are kept and `spec` is ignored.
    pub fn create_or_join(
        &self,
        key: &SyncgroupKey,
        spec: SyncgroupSpec,
        store: &Store,
    ) -> Result<bool, SyncError> {
        let mut groups = self.lock()?;
        let created = !groups.contains_key(key);
        let group = groups.entry(key.clone()).or_insert_with(|| Syncgroup {
            spec,
            members: Vec::new(),
        });
        let added = group.add_member(store);

        if created {
            info!("Created syncgroup {}", key);
        } else if added {
            debug!("Store {} joined syncgroup {}", store.id(), key);
        }
        Ok(created)
    }

    /// Adds `store` to an existing syncgroup. Joining twice is a no-op.
    pub fn join(&self, key: &SyncgroupKey, store: &Store) -> Result<(), SyncError> {
        let mut groups = self.lock()?;
        let group = groups.get_mut(key).ok_or_else(|| key.not_found())?;
        if group.add_member(store) {
            debug!("Store {} joined syncgroup {}", store.id(), key);
        }
        Ok(())
    }

    /// Replaces the prefixes of an existing syncgroup.
    pub fn change_spec(&self, key: &SyncgroupKey, spec: SyncgroupSpec) -> Result<(), SyncError> {
        let mut groups = self.lock()?;
        let group = groups.get_mut(key).ok_or_else(|| key.not_found())?;
        group.spec = spec;
        Ok(())
    }

    /// Removes the syncgroup. Returns `false` if it did not exist.
    pub fn destroy(&self, key: &SyncgroupKey) -> Result<bool, SyncError> {
        let removed = self.lock()?.shift_remove(key).is_some();
        if removed {
            info!("Destroyed syncgroup {}", key);
        }
        Ok(removed)
    }

    pub fn exists(&self, key: &SyncgroupKey) -> Result<bool, SyncError> {
        Ok(self.lock()?.contains_key(key))
    }

    pub fn spec(&self, key: &SyncgroupKey) -> Result<Option<SyncgroupSpec>, SyncError> {
        Ok(self.lock()?.get(key).map(|g| g.spec.clone()))
    }

    pub fn prefixes(&self, key: &SyncgroupKey) -> Result<Option<Vec<Key>>, SyncError> {
        Ok(self.spec(key)?.map(|spec| spec.prefixes))
    }

    /// Ids of the member stores, in join order.
    pub fn members(&self, key: &SyncgroupKey) -> Result<Vec<StoreId>, SyncError> {
        let groups = self.lock()?;
        let group = groups.get(key).ok_or_else(|| key.not_found())?;
        Ok(group.members.iter().map(Store::id).collect())
    }

    pub fn len(&self) -> Result<usize, SyncError> {
        Ok(self.lock()?.len())
    }

    pub fn is_empty(&self) -> Result<bool, SyncError> {
        Ok(self.lock()?.is_empty())
    }

    pub(crate) fn snapshot(&self) -> Result<Vec<GroupSnapshot>, SyncError> {
        Ok(self
            .lock()?
            .iter()
            .map(|(key, group)| GroupSnapshot {
                key: key.clone(),
                prefixes: group.spec.prefixes.clone(),
                members: group.members.clone(),
            })
            .collect())
    }
}

impl fmt::Debug for SyncgroupRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut list = f.debug_list();
        if let Ok(groups) = self.groups.lock() {
            list.entries(groups.keys().map(ToString::to_string));
        }
        list.finish()
    }
}

/// One store's view of a named syncgroup.
///
/// Operations are async so callers treat the in-process registry like a
/// remote syncgroup service.
#[derive(Debug, Clone)]
pub struct SyncgroupHandle {
    registry: SyncgroupRegistry,
    store: Store,
    key: SyncgroupKey,
}

impl SyncgroupHandle {
    pub fn new(registry: &SyncgroupRegistry, store: &Store, key: SyncgroupKey) -> Self {
        Self {
            registry: registry.clone(),
            store: store.clone(),
            key,
        }
    }

    pub fn key(&self) -> &SyncgroupKey {
        &self.key
    }

    pub fn build_spec(&self, prefixes: Vec<Key>) -> SyncgroupSpec {
        SyncgroupSpec::new(prefixes)
    }

    /// Returns `true` if this call created the group.
    pub async fn create_or_join(&self, spec: SyncgroupSpec) -> Result<bool, SyncError> {
        self.registry.create_or_join(&self.key, spec, &self.store)
    }

    /// Same as [`SyncgroupHandle::create_or_join`].
    pub async fn join_or_create(&self, spec: SyncgroupSpec) -> Result<bool, SyncError> {
        self.create_or_join(spec).await
    }

    pub async fn join(&self) -> Result<(), SyncError> {
        self.registry.join(&self.key, &self.store)
    }

    pub async fn change_spec(&self, spec: SyncgroupSpec) -> Result<(), SyncError> {
        self.registry.change_spec(&self.key, spec)
    }

    pub async fn destroy(&self) -> Result<bool, SyncError> {
        self.registry.destroy(&self.key)
    }
}
