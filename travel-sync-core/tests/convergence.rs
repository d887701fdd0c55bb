//! Multi-store replication scenarios driven through the public API.

use std::sync::Arc;

use travel_sync_core::{
    fixed_clock, key, sync_stores, DeferredSyncbase, DeviceIdentity, OfflinePlaceResolver, Place,
    PlaceData, Store, SyncLoop, SyncgroupHandle, SyncgroupKey, SyncgroupRegistry, TieBreak,
    TravelSession,
};

fn shared_prefixes() -> Vec<Vec<String>> {
    vec![key(&["trips"]), key(&["user"]), key(&["devices"])]
}

fn session(store: &Store, device: &str) -> TravelSession {
    let deferred = DeferredSyncbase::new();
    deferred.resolve(Arc::new(store.clone()));
    TravelSession::new(
        deferred,
        DeviceIdentity::new("alice", device),
        Box::new(OfflinePlaceResolver),
        fixed_clock(1_000),
    )
}

#[test]
fn test_put_then_sync_copies_value_and_version() {
    let a = Store::new();
    let b = Store::new();
    let owner = key(&["trips", "t1", "owner"]);
    a.put(&owner, "\"alice\"").unwrap();

    sync_stores(&a, &b, &[key(&["trips"])], TieBreak::FirstObserved).unwrap();

    assert_eq!(b.get(&owner).unwrap().as_deref(), Some("\"alice\""));
    assert_eq!(b.version(&owner).unwrap(), a.version(&owner).unwrap());
}

#[test]
fn test_concurrent_writes_settle_on_first_observed() {
    let a = Store::new();
    let b = Store::new();
    let field = key(&["trips", "t1", "name"]);
    a.put(&field, "x").unwrap();
    b.put(&field, "y").unwrap();

    sync_stores(&a, &b, &[key(&["trips"])], TieBreak::FirstObserved).unwrap();

    assert_eq!(a.get(&field).unwrap().as_deref(), Some("x"));
    assert_eq!(b.get(&field).unwrap().as_deref(), Some("x"));
}

#[tokio::test]
async fn test_sync_loop_converges_chain_of_group_members() {
    let registry = SyncgroupRegistry::new();
    let group = SyncgroupKey::new("alice", "travel");
    let stores: Vec<Store> = (0..4).map(|_| Store::new()).collect();
    for store in &stores {
        let handle = SyncgroupHandle::new(&registry, store, group.clone());
        handle
            .join_or_create(handle.build_spec(shared_prefixes()))
            .await
            .unwrap();
    }
    assert_eq!(registry.members(&group).unwrap().len(), 4);

    let sync = SyncLoop::new(registry, TieBreak::FirstObserved);
    let field = key(&["user", "tripMetadata", "t1", "latestSwitch"]);
    stores[3].put(&field, "\"5\"").unwrap();
    for _ in 0..stores.len() {
        sync.tick().unwrap();
    }

    for store in &stores {
        assert_eq!(store.get(&field).unwrap().as_deref(), Some("\"5\""));
    }
}

#[tokio::test]
async fn test_destination_edits_reach_other_device() {
    let registry = SyncgroupRegistry::new();
    let group = SyncgroupKey::new("alice", "travel");
    let laptop_store = Store::new();
    let phone_store = Store::new();
    for store in [&laptop_store, &phone_store] {
        let handle = SyncgroupHandle::new(&registry, store, group.clone());
        handle
            .join_or_create(handle.build_spec(shared_prefixes()))
            .await
            .unwrap();
    }
    let sync = SyncLoop::new(registry, TieBreak::FirstObserved);

    let mut laptop = session(&laptop_store, "laptop");
    let mut phone = session(&phone_store, "phone");

    laptop
        .process_snapshot(laptop_store.get_data().unwrap())
        .await
        .writes
        .await
        .unwrap();
    let trip = laptop.trips().active_trip_id().unwrap().to_string();
    sync.tick().unwrap();

    phone
        .process_snapshot(phone_store.get_data().unwrap())
        .await
        .writes
        .await
        .unwrap();
    assert_eq!(phone.trips().active_trip_id(), Some(trip.as_str()));

    laptop
        .add_destination(0, Some(Place::new(PlaceData::from_place_id("p1"))))
        .await
        .unwrap();
    sync.tick().unwrap();
    let update = phone.process_snapshot(phone_store.get_data().unwrap()).await;
    update.writes.await.unwrap();
    assert_eq!(phone.destinations().ids(), laptop.destinations().ids());

    phone.remove_destination(0).await.unwrap();
    sync.tick().unwrap();
    let update = laptop
        .process_snapshot(laptop_store.get_data().unwrap())
        .await;
    update.writes.await.unwrap();
    assert!(laptop.destinations().is_empty());
}

#[tokio::test]
async fn test_message_sent_before_join_is_delivered() {
    let registry = SyncgroupRegistry::new();
    let group = SyncgroupKey::new("alice", "travel");
    let laptop_store = Store::new();
    let phone_store = Store::new();
    for store in [&laptop_store, &phone_store] {
        registry
            .create_or_join(
                &group,
                travel_sync_core::SyncgroupSpec::new(shared_prefixes()),
                store,
            )
            .unwrap();
    }
    let sync = SyncLoop::new(registry, TieBreak::FirstObserved);

    let mut laptop = session(&laptop_store, "laptop");
    laptop
        .process_snapshot(laptop_store.get_data().unwrap())
        .await
        .writes
        .await
        .unwrap();
    laptop.send_message("meet at the station").await.unwrap();
    sync.tick().unwrap();

    let mut phone = session(&phone_store, "phone");
    let update = phone.process_snapshot(phone_store.get_data().unwrap()).await;

    assert_eq!(update.messages.len(), 1);
    assert_eq!(update.messages[0].text, "meet at the station");
}
