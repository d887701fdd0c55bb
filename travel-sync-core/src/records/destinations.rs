//! Mirrors the ordered destination list of the upstream trip.
//!
//! The trip's `destinations` node holds the ordered id list as its value,
//! and each destination stores its fields under its id:
//!
//! ```text
//! trips.<trip>.destinations      = ["d1", "d2"]
//! trips.<trip>.destinations.d1.place = {"placeId": "..."}
//! ```
//!
//! Reordering rewrites only the id list. Local edits are applied to the
//! local list immediately and written in one batch; remote values for a
//! field are ignored while a local write to that field is in flight.

use futures::future::{self, BoxFuture, FutureExt};
use serde_json::Value;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::SyncError;
use crate::key::Key;
use crate::marshalling::{marshal, read_value};
use crate::models::{Place, PlaceData};
use crate::pending::PendingWrites;
use crate::transport::{failed_write, join_writes, no_write, Batch, Syncbase, WriteFuture};
use crate::trip::TripManager;

const PLACE: &str = "place";

/// Cooperative cancellation flag for an asynchronous place lookup.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    fn same(&self, other: &CancelToken) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }
}

/// A destination as the local user sees it.
#[derive(Debug, Clone, Default)]
pub struct Destination {
    /// `None` until the destination is backed by a replicated record.
    id: Option<String>,
    place_data: Option<PlaceData>,
    place: Option<Place>,
    cancel: CancelToken,
}

impl Destination {
    fn new_local(place: Option<Place>) -> Self {
        Self {
            id: Some(Uuid::new_v4().to_string()),
            place_data: place.as_ref().map(Place::to_data),
            place,
            cancel: CancelToken::new(),
        }
    }

    pub fn id(&self) -> Option<&str> {
        self.id.as_deref()
    }

    pub fn place(&self) -> Option<&Place> {
        self.place.as_ref()
    }

    pub fn place_data(&self) -> Option<&PlaceData> {
        self.place_data.as_ref()
    }

    pub fn is_valid(&self) -> bool {
        self.id.is_some()
    }

    /// Returns false if `data` is what the record already holds. A change
    /// cancels any lookup started for the old data.
    fn set_place_data(&mut self, data: Option<PlaceData>) -> bool {
        if self.place_data == data {
            return false;
        }
        self.place_data = data;
        self.cancel.cancel();
        self.cancel = CancelToken::new();
        true
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DestinationEvent {
    Added(usize),
    Removed(usize),
    PlaceChanged(usize),
}

/// A remote place that still has to be resolved into a [`Place`].
#[derive(Debug, Clone)]
pub struct PlaceLookup {
    pub index: usize,
    pub id: String,
    pub data: PlaceData,
    cancel: CancelToken,
}

impl PlaceLookup {
    /// True once the destination's place changed again or it was removed.
    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }
}

/// Resolves persisted place data through a mapping service.
pub trait PlaceResolver: Send + Sync {
    fn resolve(&self, data: &PlaceData) -> BoxFuture<'static, Result<Place, SyncError>>;
}

/// Builds places from the persisted data alone.
#[derive(Debug, Clone, Copy, Default)]
pub struct OfflinePlaceResolver;

impl PlaceResolver for OfflinePlaceResolver {
    fn resolve(&self, data: &PlaceData) -> BoxFuture<'static, Result<Place, SyncError>> {
        let result = if data.place_id.is_some() || data.location.is_some() {
            Ok(Place::new(data.clone()))
        } else {
            Err(SyncError::Corruption(format!(
                "place has neither id nor location: {:?}",
                data
            )))
        };
        future::ready(result).boxed()
    }
}

/// What processing a remote update produced.
pub struct DestinationUpdate {
    pub events: Vec<DestinationEvent>,
    pub lookups: Vec<PlaceLookup>,
    pub errors: Vec<SyncError>,
    /// Writes issued in response, such as overwriting a corrupt field.
    pub writes: WriteFuture,
}

impl Default for DestinationUpdate {
    fn default() -> Self {
        Self {
            events: Vec::new(),
            lookups: Vec::new(),
            errors: Vec::new(),
            writes: no_write(),
        }
    }
}

impl std::fmt::Debug for DestinationUpdate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DestinationUpdate")
            .field("events", &self.events)
            .field("lookups", &self.lookups)
            .field("errors", &self.errors)
            .finish()
    }
}

#[derive(Default)]
struct Staged {
    batch: Batch,
    keys: Vec<Key>,
}

impl Staged {
    fn put(&mut self, key: Key, value: String) {
        self.keys.push(key.clone());
        self.batch.put(key, value);
    }

    fn delete(&mut self, key: Key) {
        self.keys.push(key.clone());
        self.batch.delete(key);
    }
}

pub struct DestinationSync {
    syncbase: Arc<dyn Syncbase>,
    pending: PendingWrites,
    destinations: Vec<Destination>,
}

impl DestinationSync {
    pub fn new(syncbase: Arc<dyn Syncbase>) -> Self {
        Self {
            syncbase,
            pending: PendingWrites::new(),
            destinations: Vec::new(),
        }
    }

    pub fn pending(&self) -> &PendingWrites {
        &self.pending
    }

    pub fn destinations(&self) -> &[Destination] {
        &self.destinations
    }

    pub fn len(&self) -> usize {
        self.destinations.len()
    }

    pub fn is_empty(&self) -> bool {
        self.destinations.is_empty()
    }

    /// Ids of the destinations backed by records, in order.
    pub fn ids(&self) -> Vec<String> {
        self.destinations
            .iter()
            .filter_map(|d| d.id.clone())
            .collect()
    }

    /// Inserts a destination at `index` (clamped to the list length).
    pub fn add(&mut self, trips: &TripManager, index: usize, place: Option<Place>) -> WriteFuture {
        let index = index.min(self.destinations.len());
        let destination = Destination::new_local(place);
        debug!(
            "Adding destination {}:{}",
            index,
            destination.id().unwrap_or_default()
        );
        self.destinations.insert(index, destination);

        if !trips.has_valid_upstream() {
            return no_write();
        }
        let staged = self.stage(trips, &[&self.destinations[index]], None, true);
        self.commit(staged)
    }

    /// Removes the destination at `index` and deletes its record.
    pub fn remove(&mut self, trips: &TripManager, index: usize) -> WriteFuture {
        if index >= self.destinations.len() {
            warn!("No destination at index {}", index);
            return no_write();
        }
        let removed = self.destinations.remove(index);
        removed.cancel.cancel();

        match removed.id.as_deref() {
            Some(id) if trips.has_valid_upstream() => {
                debug!("Removing destination {}:{}", index, id);
                let staged = self.stage(trips, &[], Some(id), true);
                self.commit(staged)
            }
            _ => no_write(),
        }
    }

    /// Changes the place of the destination at `index`.
    pub fn set_place(&mut self, trips: &TripManager, index: usize, place: Option<Place>) -> WriteFuture {
        let Some(destination) = self.destinations.get_mut(index) else {
            return no_write();
        };
        let data = place.as_ref().map(Place::to_data);
        destination.place = place;
        if !destination.is_valid() || !destination.set_place_data(data) {
            return no_write();
        }
        if !trips.has_valid_upstream() {
            return no_write();
        }

        debug!(
            "Updating destination {}:{}.place = {:?}",
            index,
            destination.id().unwrap_or_default(),
            destination.place_data
        );
        let staged = self.stage(trips, &[&self.destinations[index]], None, false);
        self.commit(staged)
    }

    /// Moves a destination. Only the id list is rewritten.
    pub fn reorder(&mut self, trips: &TripManager, from: usize, to: usize) -> WriteFuture {
        if from >= self.destinations.len() || to >= self.destinations.len() {
            warn!("Cannot move destination {} to {}", from, to);
            return no_write();
        }
        let moved = self.destinations.remove(from);
        self.destinations.insert(to, moved);

        if !trips.has_valid_upstream() {
            return no_write();
        }
        let staged = self.stage(trips, &[], None, true);
        self.commit(staged)
    }

    /// Writes the whole local list as the authority for the active trip.
    ///
    /// Without an active trip this does nothing unless `force` is set, in
    /// which case a new trip id is made active first.
    pub fn push_destinations(&mut self, trips: &mut TripManager, force: bool) -> WriteFuture {
        let mut writes = Vec::new();
        if trips.active_trip_id().is_none() {
            if !force {
                return no_write();
            }
            writes.push(trips.set_active_trip_id(Uuid::new_v4().to_string()));
        }
        trips.set_upstream();

        let records: Vec<&Destination> = self.destinations.iter().collect();
        let staged = self.stage(trips, &records, None, true);
        writes.push(self.commit(staged));
        join_writes(writes)
    }

    /// Reconciles the local list with the active trip's `destinations`
    /// subtree.
    pub fn process_destinations(
        &mut self,
        trips: &mut TripManager,
        data: Option<&Value>,
    ) -> DestinationUpdate {
        let mut update = DestinationUpdate::default();

        let Some(data) = data else {
            if trips.has_valid_upstream() {
                if !self.list_pending(trips) {
                    update.events = self.truncate(0);
                }
            } else {
                // First push with no remote data: local state is the authority.
                update.writes = self.push_destinations(trips, false);
            }
            return update;
        };

        let ids = match read_value::<Vec<String>>(Some(data)) {
            Ok(Some(ids)) => ids,
            Ok(None) => {
                return self.overwrite_corrupt(
                    trips,
                    update,
                    SyncError::Corruption("missing destination ids".to_string()),
                )
            }
            Err(e) => return self.overwrite_corrupt(trips, update, e.into()),
        };

        let mut writes = Vec::new();
        if self.list_pending(trips) {
            debug!("Keeping local destination order; write in flight");
            for index in 0..self.destinations.len() {
                if let Some(id) = self.destinations[index].id.clone() {
                    self.pull_place(trips, index, &id, data, &mut update, &mut writes);
                }
            }
        } else {
            for (index, id) in ids.iter().enumerate() {
                if index >= self.destinations.len() {
                    self.destinations.push(Destination::default());
                    update.events.push(DestinationEvent::Added(index));
                }
                let destination = &mut self.destinations[index];
                if destination.id.as_deref() != Some(id.as_str()) {
                    destination.id = Some(id.clone());
                    debug!("Pulling destination {}:{}", index, id);
                }
                self.pull_place(trips, index, id, data, &mut update, &mut writes);
            }
            if self.destinations.len() > ids.len() {
                let removed = self.truncate(ids.len());
                update.events.extend(removed);
            }
        }

        update.writes = join_writes(writes);
        update
    }

    /// Applies the outcome of a place lookup.
    ///
    /// A cancelled lookup is dropped. A failed lookup means the remote
    /// place is unusable, so the local place is written back over it.
    pub fn apply_lookup(
        &mut self,
        trips: &TripManager,
        lookup: PlaceLookup,
        result: Result<Place, SyncError>,
    ) -> DestinationUpdate {
        let mut update = DestinationUpdate::default();
        if lookup.is_cancelled() {
            return update;
        }
        let Some(index) = self
            .destinations
            .iter()
            .position(|d| d.cancel.same(&lookup.cancel))
        else {
            return update;
        };

        match result {
            Ok(place) => {
                self.destinations[index].place = Some(place);
                update.events.push(DestinationEvent::PlaceChanged(index));
            }
            Err(e) => {
                warn!("Could not resolve place for destination {}: {}", lookup.id, e);
                let destination = &mut self.destinations[index];
                let local = destination.place.as_ref().map(Place::to_data);
                if destination.set_place_data(local) && trips.has_valid_upstream() {
                    let staged = self.stage(trips, &[&self.destinations[index]], None, false);
                    update.writes = self.commit(staged);
                }
                update.errors.push(e);
            }
        }
        update
    }

    /// Resolves lookups one after another and applies each result.
    pub async fn resolve_lookups(
        &mut self,
        trips: &TripManager,
        lookups: Vec<PlaceLookup>,
        resolver: &dyn PlaceResolver,
    ) -> DestinationUpdate {
        let mut merged = DestinationUpdate::default();
        let mut writes = Vec::new();
        for lookup in lookups {
            if lookup.is_cancelled() {
                continue;
            }
            let result = resolver.resolve(&lookup.data).await;
            let update = self.apply_lookup(trips, lookup, result);
            merged.events.extend(update.events);
            merged.errors.extend(update.errors);
            writes.push(update.writes);
        }
        merged.writes = join_writes(writes);
        merged
    }

    fn list_pending(&self, trips: &TripManager) -> bool {
        trips
            .destinations_key::<&str>(&[])
            .is_some_and(|key| self.pending.is_pending(&key))
    }

    fn overwrite_corrupt(
        &mut self,
        trips: &mut TripManager,
        mut update: DestinationUpdate,
        error: SyncError,
    ) -> DestinationUpdate {
        warn!("Overwriting corrupt destination list: {}", error);
        update.errors.push(error);
        update.writes = self.push_destinations(trips, true);
        update
    }

    fn pull_place(
        &mut self,
        trips: &TripManager,
        index: usize,
        id: &str,
        data: &Value,
        update: &mut DestinationUpdate,
        writes: &mut Vec<WriteFuture>,
    ) {
        let guarded = [trips.destinations_key(&[id, PLACE]), trips.destinations_key(&[id])];
        if guarded
            .iter()
            .flatten()
            .any(|key| self.pending.is_pending(key))
        {
            return;
        }

        let remote = match data.get(id) {
            None => Ok(None),
            Some(record) => read_value::<PlaceData>(record.get(PLACE)),
        };
        let remote = match remote {
            Ok(remote) => remote,
            Err(e) => {
                warn!("Overwriting corrupt place of destination {}: {}", id, e);
                update.errors.push(e.into());
                let staged = self.stage(trips, &[&self.destinations[index]], None, false);
                writes.push(self.commit(staged));
                return;
            }
        };

        let destination = &mut self.destinations[index];
        if !destination.set_place_data(remote.clone()) {
            return;
        }
        debug!(
            "Pulled update for destination {}:{}.place = {:?}",
            index, id, remote
        );
        match remote {
            Some(data) => update.lookups.push(PlaceLookup {
                index,
                id: id.to_string(),
                data,
                cancel: destination.cancel.clone(),
            }),
            None => {
                destination.place = None;
                update.events.push(DestinationEvent::PlaceChanged(index));
            }
        }
    }

    fn truncate(&mut self, target: usize) -> Vec<DestinationEvent> {
        if self.destinations.len() > target {
            info!("Truncating destinations to {}", target);
        }
        let mut events = Vec::new();
        while self.destinations.len() > target {
            let last = self.destinations.len() - 1;
            if let Some(removed) = self.destinations.pop() {
                removed.cancel.cancel();
            }
            events.push(DestinationEvent::Removed(last));
        }
        events
    }

    /// Stages the id list (if `ids`), the place field of each record, and
    /// the deletion of the `removed` record.
    fn stage(
        &self,
        trips: &TripManager,
        records: &[&Destination],
        removed: Option<&str>,
        ids: bool,
    ) -> Result<Staged, SyncError> {
        let mut staged = Staged::default();
        for record in records {
            let Some(id) = record.id.as_deref() else {
                continue;
            };
            let Some(key) = trips.destinations_key(&[id, PLACE]) else {
                continue;
            };
            match &record.place_data {
                Some(data) => staged.put(key, marshal(data)?),
                None => staged.delete(key),
            }
        }
        if let Some(key) = removed.and_then(|id| trips.destinations_key(&[id])) {
            staged.delete(key);
        }
        if ids {
            if let Some(key) = trips.destinations_key::<&str>(&[]) {
                staged.put(key, marshal(&self.ids())?);
            }
        }
        Ok(staged)
    }

    fn commit(&self, staged: Result<Staged, SyncError>) -> WriteFuture {
        match staged {
            Ok(staged) if staged.batch.is_empty() => no_write(),
            Ok(staged) => self
                .pending
                .track(staged.keys, self.syncbase.batch(staged.batch)),
            Err(e) => failed_write(e),
        }
    }
}

impl std::fmt::Debug for DestinationSync {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DestinationSync")
            .field("destinations", &self.destinations)
            .field("pending", &self.pending)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::fixed_clock;
    use crate::key::key;
    use crate::models::LatLng;
    use crate::store::{Store, WatchEvent};
    use crate::transport::DeferredSyncbase;

    fn destinations_key() -> Key {
        key(&["trips", "t1", "destinations"])
    }

    fn upstream_manager(syncbase: Arc<dyn Syncbase>) -> TripManager {
        let mut trips = TripManager::new(syncbase, "alice").with_clock(fixed_clock(1));
        drop(trips.set_active_trip_id("t1"));
        trips.set_upstream();
        trips
    }

    fn place(id: &str) -> Place {
        Place::new(PlaceData::from_place_id(id))
    }

    fn seed(store: &Store, ids: &[&str]) {
        store.put(&destinations_key(), marshal(&ids).unwrap()).unwrap();
        for id in ids {
            let data = marshal(&PlaceData::from_place_id(format!("p-{}", id))).unwrap();
            store.put(&key(&["trips", "t1", "destinations", id, "place"]), data).unwrap();
        }
    }

    fn remote(store: &Store) -> Option<Value> {
        store.get_data_at(&destinations_key()).unwrap()
    }

    #[tokio::test]
    async fn test_pull_then_remove_first() {
        let store = Store::new();
        seed(&store, &["d1", "d2"]);
        let mut trips = upstream_manager(Arc::new(store.clone()));
        let mut sync = DestinationSync::new(Arc::new(store.clone()));

        let update = sync.process_destinations(&mut trips, remote(&store).as_ref());
        assert_eq!(
            update.events,
            vec![DestinationEvent::Added(0), DestinationEvent::Added(1)]
        );
        assert_eq!(update.lookups.len(), 2);
        assert_eq!(sync.ids(), vec!["d1", "d2"]);

        let mut watch = store.watch(&destinations_key()).unwrap();
        sync.remove(&trips, 0).await.unwrap();

        assert_eq!(store.get(&destinations_key()).unwrap().as_deref(), Some(r#"["d2"]"#));
        assert_eq!(
            store.get(&key(&["trips", "t1", "destinations", "d1", "place"])).unwrap(),
            None
        );
        assert_eq!(
            watch.drain(),
            vec![
                WatchEvent::Delete {
                    key: key(&["trips", "t1", "destinations", "d1", "place"]),
                    continued: true,
                },
                WatchEvent::Put {
                    key: destinations_key(),
                    value: r#"["d2"]"#.to_string(),
                    continued: false,
                },
                WatchEvent::BatchEnd,
            ]
        );
    }

    #[tokio::test]
    async fn test_add_writes_list_and_place_in_one_batch() {
        let store = Store::new();
        let trips = upstream_manager(Arc::new(store.clone()));
        let mut sync = DestinationSync::new(Arc::new(store.clone()));

        sync.add(&trips, 0, Some(place("p1"))).await.unwrap();
        sync.add(&trips, 0, None).await.unwrap();

        let ids = sync.ids();
        assert_eq!(store.get(&destinations_key()).unwrap(), Some(marshal(&ids).unwrap()));
        let first_place = key(&["trips", "t1", "destinations", ids[1].as_str(), "place"]);
        assert_eq!(
            store.get(&first_place).unwrap(),
            Some(marshal(&PlaceData::from_place_id("p1")).unwrap())
        );
        assert!(!sync.pending().any_pending());
    }

    #[tokio::test]
    async fn test_stale_remote_list_does_not_clobber_pending_add() {
        let deferred = DeferredSyncbase::new();
        let syncbase: Arc<dyn Syncbase> = Arc::new(deferred.clone());
        let mut trips = upstream_manager(syncbase.clone());
        let mut sync = DestinationSync::new(syncbase);

        let write = sync.add(&trips, 0, Some(place("p1")));
        let stale = serde_json::json!({ "_": "[]" });
        let update = sync.process_destinations(&mut trips, Some(&stale));
        assert!(update.events.is_empty());
        assert_eq!(sync.len(), 1);

        let store = Store::new();
        deferred.resolve(Arc::new(store.clone()));
        write.await.unwrap();
        assert!(!sync.pending().any_pending());

        let update = sync.process_destinations(&mut trips, remote(&store).as_ref());
        assert!(update.events.is_empty());
        assert!(update.lookups.is_empty());
        assert_eq!(sync.len(), 1);
    }

    #[tokio::test]
    async fn test_corrupt_list_is_overwritten() {
        let store = Store::new();
        let mut trips = upstream_manager(Arc::new(store.clone()));
        let mut sync = DestinationSync::new(Arc::new(store.clone()));
        sync.add(&trips, 0, Some(place("p1"))).await.unwrap();
        store.put(&destinations_key(), "{not json").unwrap();

        let update = sync.process_destinations(&mut trips, remote(&store).as_ref());

        assert_eq!(update.errors.len(), 1);
        assert!(update.errors[0].is_corruption());
        update.writes.await.unwrap();
        assert_eq!(store.get(&destinations_key()).unwrap(), Some(marshal(&sync.ids()).unwrap()));
    }

    #[tokio::test]
    async fn test_remote_truncation() {
        let store = Store::new();
        seed(&store, &["d1", "d2", "d3"]);
        let mut trips = upstream_manager(Arc::new(store.clone()));
        let mut sync = DestinationSync::new(Arc::new(store.clone()));
        sync.process_destinations(&mut trips, remote(&store).as_ref());

        store.put(&destinations_key(), r#"["d1"]"#).unwrap();
        let update = sync.process_destinations(&mut trips, remote(&store).as_ref());

        assert_eq!(
            update.events,
            vec![DestinationEvent::Removed(2), DestinationEvent::Removed(1)]
        );
        assert_eq!(sync.ids(), vec!["d1"]);

        let update = sync.process_destinations(&mut trips, None);
        assert_eq!(update.events, vec![DestinationEvent::Removed(0)]);
    }

    #[tokio::test]
    async fn test_first_push_without_remote_data() {
        let store = Store::new();
        let mut trips = TripManager::new(Arc::new(store.clone()), "alice");
        drop(trips.set_active_trip_id("t1"));
        let mut sync = DestinationSync::new(Arc::new(store.clone()));
        assert!(sync.add(&trips, 0, Some(place("p1"))).now_or_never().is_some());
        assert_eq!(store.get(&destinations_key()).unwrap(), None);

        let update = sync.process_destinations(&mut trips, None);
        update.writes.await.unwrap();

        assert!(trips.has_valid_upstream());
        assert_eq!(store.get(&destinations_key()).unwrap(), Some(marshal(&sync.ids()).unwrap()));
    }

    #[tokio::test]
    async fn test_lookup_applies_place() {
        let store = Store::new();
        seed(&store, &["d1"]);
        let mut trips = upstream_manager(Arc::new(store.clone()));
        let mut sync = DestinationSync::new(Arc::new(store.clone()));

        let update = sync.process_destinations(&mut trips, remote(&store).as_ref());
        let resolved = sync
            .resolve_lookups(&trips, update.lookups, &OfflinePlaceResolver)
            .await;

        assert_eq!(resolved.events, vec![DestinationEvent::PlaceChanged(0)]);
        assert_eq!(
            sync.destinations()[0].place().map(|p| p.data.clone()),
            Some(PlaceData::from_place_id("p-d1"))
        );
    }

    #[tokio::test]
    async fn test_superseded_lookup_is_cancelled() {
        let store = Store::new();
        seed(&store, &["d1"]);
        let mut trips = upstream_manager(Arc::new(store.clone()));
        let mut sync = DestinationSync::new(Arc::new(store.clone()));

        let first = sync.process_destinations(&mut trips, remote(&store).as_ref());
        let moved = PlaceData::from_location(LatLng { lat: 1.0, lng: 2.0 }, Some("cafe".into()));
        store
            .put(&key(&["trips", "t1", "destinations", "d1", "place"]), marshal(&moved).unwrap())
            .unwrap();
        let second = sync.process_destinations(&mut trips, remote(&store).as_ref());

        let stale = first.lookups.into_iter().next().unwrap();
        assert!(stale.is_cancelled());
        let applied = sync.apply_lookup(&trips, stale, Ok(place("p-d1")));
        assert!(applied.events.is_empty());
        assert!(sync.destinations()[0].place().is_none());

        let fresh = second.lookups.into_iter().next().unwrap();
        let applied = sync.apply_lookup(&trips, fresh, Ok(Place::new(moved.clone())));
        assert_eq!(applied.events, vec![DestinationEvent::PlaceChanged(0)]);
    }

    #[tokio::test]
    async fn test_unresolvable_place_is_overwritten_with_local() {
        let store = Store::new();
        seed(&store, &["d1"]);
        let mut trips = upstream_manager(Arc::new(store.clone()));
        let mut sync = DestinationSync::new(Arc::new(store.clone()));
        let update = sync.process_destinations(&mut trips, remote(&store).as_ref());
        sync.resolve_lookups(&trips, update.lookups, &OfflinePlaceResolver).await;

        let place_key = key(&["trips", "t1", "destinations", "d1", "place"]);
        store.put(&place_key, "{}").unwrap();
        let update = sync.process_destinations(&mut trips, remote(&store).as_ref());
        let resolved = sync
            .resolve_lookups(&trips, update.lookups, &OfflinePlaceResolver)
            .await;

        assert_eq!(resolved.errors.len(), 1);
        resolved.writes.await.unwrap();
        assert_eq!(
            store.get(&place_key).unwrap(),
            Some(marshal(&PlaceData::from_place_id("p-d1")).unwrap())
        );
    }

    #[tokio::test]
    async fn test_reorder_rewrites_only_list() {
        let store = Store::new();
        seed(&store, &["d1", "d2"]);
        let mut trips = upstream_manager(Arc::new(store.clone()));
        let mut sync = DestinationSync::new(Arc::new(store.clone()));
        sync.process_destinations(&mut trips, remote(&store).as_ref());

        let mut watch = store.watch(&destinations_key()).unwrap();
        sync.reorder(&trips, 0, 1).await.unwrap();

        assert_eq!(sync.ids(), vec!["d2", "d1"]);
        let events = watch.drain();
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].key(), Some(&destinations_key()));
    }

    #[tokio::test]
    async fn test_set_place_writes_field() {
        let store = Store::new();
        let trips = upstream_manager(Arc::new(store.clone()));
        let mut sync = DestinationSync::new(Arc::new(store.clone()));
        sync.add(&trips, 0, None).await.unwrap();
        let id = sync.ids()[0].clone();

        sync.set_place(&trips, 0, Some(place("p9"))).await.unwrap();
        assert_eq!(
            store
                .get(&key(&["trips", "t1", "destinations", id.as_str(), "place"]))
                .unwrap(),
            Some(marshal(&PlaceData::from_place_id("p9")).unwrap())
        );

        assert!(sync.set_place(&trips, 0, Some(place("p9"))).now_or_never().is_some());
        assert!(sync.set_place(&trips, 5, None).now_or_never().is_some());
    }
}
