//! One device's view of the travel planner state.
//!
//! A session owns the trip manager and the record synchronizers of one
//! device and feeds them full snapshots of its store. Writes go through a
//! [`DeferredSyncbase`], so a session can be used before its store exists.

use serde_json::Value;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::debug;

use crate::clock::Clock;
use crate::error::SyncError;
use crate::models::{DeviceIdentity, Message, Place};
use crate::records::{
    DestinationEvent, DestinationSync, DeviceSync, InvitationEvent, InvitationSync, MessageBatch,
    MessageSync, PlaceResolver,
};
use crate::transport::{join_writes, no_write, DeferredSyncbase, Syncbase, WriteFuture};
use crate::trip::TripManager;

/// What one processed snapshot changed.
pub struct SessionUpdate {
    pub destination_events: Vec<DestinationEvent>,
    pub messages: Vec<Message>,
    pub invitation_events: Vec<InvitationEvent>,
    pub possible_nearby_devices: bool,
    pub errors: Vec<SyncError>,
    /// Writes issued while reconciling.
    pub writes: WriteFuture,
}

impl std::fmt::Debug for SessionUpdate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionUpdate")
            .field("destination_events", &self.destination_events)
            .field("messages", &self.messages)
            .field("invitation_events", &self.invitation_events)
            .field("possible_nearby_devices", &self.possible_nearby_devices)
            .field("errors", &self.errors)
            .finish()
    }
}

pub struct TravelSession {
    syncbase: DeferredSyncbase,
    identity: DeviceIdentity,
    trips: TripManager,
    destinations: DestinationSync,
    messages: MessageSync,
    devices: DeviceSync,
    invitations: Option<InvitationSync>,
    resolver: Box<dyn PlaceResolver>,
    trip_changes: watch::Receiver<Option<String>>,
    coarse_gating: bool,
}

impl TravelSession {
    pub fn new(
        syncbase: DeferredSyncbase,
        identity: DeviceIdentity,
        resolver: Box<dyn PlaceResolver>,
        clock: Clock,
    ) -> Self {
        let shared: Arc<dyn Syncbase> = Arc::new(syncbase.clone());
        let trips =
            TripManager::new(shared.clone(), identity.username.clone()).with_clock(clock.clone());
        let trip_changes = trips.subscribe_trip_changes();
        Self {
            destinations: DestinationSync::new(shared.clone()),
            messages: MessageSync::new(shared.clone()).with_clock(clock.clone()),
            devices: DeviceSync::new(shared, identity.clone()).with_clock(clock),
            syncbase,
            identity,
            trips,
            resolver,
            trip_changes,
            invitations: None,
            coarse_gating: false,
        }
    }

    /// Drops whole snapshots while any write is in flight, instead of only
    /// skipping the fields being written.
    pub fn with_coarse_gating(mut self, enabled: bool) -> Self {
        self.coarse_gating = enabled;
        self
    }

    /// Tracks invitations found under `invitations` in each snapshot.
    pub fn with_invitations(mut self, invitations: InvitationSync) -> Self {
        self.invitations = Some(invitations);
        self
    }

    pub fn identity(&self) -> &DeviceIdentity {
        &self.identity
    }

    pub fn syncbase(&self) -> &DeferredSyncbase {
        &self.syncbase
    }

    pub fn trips(&self) -> &TripManager {
        &self.trips
    }

    pub fn trips_mut(&mut self) -> &mut TripManager {
        &mut self.trips
    }

    pub fn destinations(&self) -> &DestinationSync {
        &self.destinations
    }

    pub fn devices(&self) -> &DeviceSync {
        &self.devices
    }

    pub fn devices_mut(&mut self) -> &mut DeviceSync {
        &mut self.devices
    }

    pub fn invitations_mut(&mut self) -> Option<&mut InvitationSync> {
        self.invitations.as_mut()
    }

    pub fn add_destination(&mut self, index: usize, place: Option<Place>) -> WriteFuture {
        self.destinations.add(&self.trips, index, place)
    }

    pub fn remove_destination(&mut self, index: usize) -> WriteFuture {
        self.destinations.remove(&self.trips, index)
    }

    pub fn set_destination_place(&mut self, index: usize, place: Option<Place>) -> WriteFuture {
        self.destinations.set_place(&self.trips, index, place)
    }

    pub fn move_destination(&mut self, from: usize, to: usize) -> WriteFuture {
        self.destinations.reorder(&self.trips, from, to)
    }

    pub fn send_message(&self, text: impl Into<String>) -> WriteFuture {
        self.messages
            .send(&self.trips, self.identity.username.clone(), text)
    }

    /// Reconciles every synchronizer with a full store snapshot.
    pub async fn process_snapshot(&mut self, snapshot: Value) -> SessionUpdate {
        let mut update = SessionUpdate {
            destination_events: Vec::new(),
            messages: Vec::new(),
            invitation_events: Vec::new(),
            possible_nearby_devices: false,
            errors: Vec::new(),
            writes: no_write(),
        };

        let snapshot = if self.coarse_gating {
            match self.syncbase.process_update(snapshot) {
                Some(snapshot) => snapshot,
                None => {
                    debug!("Skipping snapshot; writes in flight");
                    return update;
                }
            }
        } else {
            snapshot
        };

        let mut writes = Vec::new();
        let metadata = snapshot.get("user").and_then(|u| u.get("tripMetadata"));
        writes.push(self.trips.process_trips(metadata, snapshot.get("trips")));

        let destination_data = self.trips.destination_data().cloned();
        let pulled = destination_data.is_some();
        let destinations = self
            .destinations
            .process_destinations(&mut self.trips, destination_data.as_ref());
        if pulled {
            self.trips.set_upstream();
        }
        update.destination_events.extend(destinations.events);
        update.errors.extend(destinations.errors);
        writes.push(destinations.writes);

        let resolved = self
            .destinations
            .resolve_lookups(&self.trips, destinations.lookups, self.resolver.as_ref())
            .await;
        update.destination_events.extend(resolved.events);
        update.errors.extend(resolved.errors);
        writes.push(resolved.writes);

        if self.trip_changes.has_changed().unwrap_or(false) {
            let _ = self.trip_changes.borrow_and_update();
            match self.messages.refresh(&self.trips).await {
                Ok(batch) => collect_messages(&mut update, batch),
                Err(e) => update.errors.push(e),
            }
        }
        for batch in self.messages.drain_batches() {
            collect_messages(&mut update, batch);
        }

        let devices = self.devices.process_devices(snapshot.get("devices"));
        update.possible_nearby_devices = devices.possible_nearby_devices;
        update.errors.extend(devices.errors);
        writes.push(devices.writes);

        if let Some(invitations) = &mut self.invitations {
            let invitations = invitations.process_invitations(snapshot.get("invitations"));
            update.invitation_events.extend(invitations.events);
            update.errors.extend(invitations.errors);
        }

        update.writes = join_writes(writes);
        update
    }
}

fn collect_messages(update: &mut SessionUpdate, batch: MessageBatch) {
    update.messages.extend(batch.messages);
    update.errors.extend(batch.errors);
}

impl std::fmt::Debug for TravelSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TravelSession")
            .field("identity", &self.identity)
            .field("trips", &self.trips)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::fixed_clock;
    use crate::models::PlaceData;
    use crate::records::OfflinePlaceResolver;
    use crate::store::Store;

    fn session(name: &str) -> (TravelSession, Store) {
        let store = Store::new();
        let deferred = DeferredSyncbase::new();
        deferred.resolve(Arc::new(store.clone()));
        let session = TravelSession::new(
            deferred,
            DeviceIdentity::new("alice", name),
            Box::new(OfflinePlaceResolver),
            fixed_clock(1_000),
        );
        (session, store)
    }

    #[tokio::test]
    async fn test_first_snapshot_creates_trip_and_pushes() {
        let (mut session, store) = session("laptop");
        session.process_snapshot(store.get_data().unwrap()).await.writes.await.unwrap();
        let trip = session.trips().active_trip_id().unwrap().to_string();

        session
            .add_destination(0, Some(Place::new(PlaceData::from_place_id("p1"))))
            .await
            .unwrap();
        let update = session.process_snapshot(store.get_data().unwrap()).await;
        update.writes.await.unwrap();

        assert!(session.trips().has_valid_upstream());
        assert_eq!(session.trips().active_trip_id(), Some(trip.as_str()));
        assert_eq!(session.destinations().len(), 1);
    }

    #[tokio::test]
    async fn test_messages_delivered_after_trip_change() {
        let (mut session, store) = session("laptop");
        session.process_snapshot(store.get_data().unwrap()).await.writes.await.unwrap();
        session.process_snapshot(store.get_data().unwrap()).await.writes.await.unwrap();

        session.send_message("hello").await.unwrap();
        let update = session.process_snapshot(store.get_data().unwrap()).await;

        assert_eq!(update.messages.len(), 1);
        assert_eq!(update.messages[0].text, "hello");
        assert_eq!(update.messages[0].sender, "alice");
    }

    #[tokio::test]
    async fn test_coarse_gating_skips_snapshots_during_writes() {
        let deferred = DeferredSyncbase::new();
        let mut session = TravelSession::new(
            deferred.clone(),
            DeviceIdentity::new("alice", "laptop"),
            Box::new(OfflinePlaceResolver),
            fixed_clock(0),
        )
        .with_coarse_gating(true);

        let pending = session.devices().heartbeat().beat();
        tokio::task::yield_now().await;
        assert_eq!(deferred.writes_in_flight(), 1);
        session.process_snapshot(serde_json::json!({})).await;
        assert!(session.trips().active_trip_id().is_none());

        deferred.resolve(Arc::new(Store::new()));
        pending.await.unwrap();
        session.process_snapshot(serde_json::json!({})).await;
        assert!(session.trips().active_trip_id().is_some());
    }

    #[tokio::test]
    async fn test_invitations_reported_with_snapshot() {
        use crate::records::{invitation_key, Invitation};
        use crate::syncgroup::SyncgroupRegistry;

        let (session, store) = session("laptop");
        let registry = SyncgroupRegistry::new();
        let invitations = InvitationSync::new(Arc::new(store.clone()), &registry, &store, "alice");
        let mut session = session.with_invitations(invitations);

        store.put(&invitation_key("bob", "alice"), "\"bob\"").unwrap();
        let update = session.process_snapshot(store.get_data().unwrap()).await;

        assert_eq!(
            update.invitation_events,
            vec![InvitationEvent::Invited(Invitation {
                owner: "bob".to_string(),
                recipient: "alice".to_string(),
                sender: "bob".to_string(),
            })]
        );
        let received = session.invitations_mut().map(|i| i.received().len());
        assert_eq!(received, Some(1));
    }
}
