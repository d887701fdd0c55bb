//! Tracks which trip is active for this user and where its records live.
//!
//! The active trip is chosen from the replicated `trips` subtree using
//! [`compare_trips`]. The upstream trip is the trip local edits are pushed
//! to; it only moves when a synchronizer calls [`TripManager::set_upstream`],
//! which also announces the change to subscribers.

use serde_json::{Map, Value};
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{debug, info};
use uuid::Uuid;

use super::comparator::{compare_trips, get_trip_length, ComparableTrip};
use crate::clock::{system_clock, Clock};
use crate::key::{key, Key};
use crate::marshalling::{marshal, read_value};
use crate::transport::{failed_write, join_writes, Batch, Syncbase, WriteFuture};

const TRIPS: &str = "trips";
const LATEST_SWITCH: &str = "latestSwitch";

/// Picks the trip a user most likely cares about.
///
/// `user_trip_metadata` maps trip ids to `{ latestSwitch }` entries.
pub fn get_default_trip(
    user_trip_metadata: Option<&Value>,
    trips: &Map<String, Value>,
) -> Option<String> {
    let mut best: Option<ComparableTrip<'_>> = None;
    for (id, trip) in trips {
        let latest_switch = user_trip_metadata
            .and_then(|md| md.get(id))
            .and_then(|md| read_value::<i64>(md.get(LATEST_SWITCH)).ok().flatten());
        let candidate = ComparableTrip::new(trip, id.clone(), latest_switch);
        if compare_trips(best.as_ref(), Some(&candidate)).is_gt() {
            best = Some(candidate);
        }
    }
    best.map(|b| b.id().to_string())
}

fn is_nascent(trip: &Value) -> bool {
    get_trip_length(trip) <= 1
}

pub struct TripManager {
    syncbase: Arc<dyn Syncbase>,
    username: String,
    clock: Clock,
    active_trip_id: Option<String>,
    active_trip: Option<Value>,
    upstream_trip_id: Option<String>,
    awaited_trip_id: Option<String>,
    trip_changes: watch::Sender<Option<String>>,
}

impl TripManager {
    pub fn new(syncbase: Arc<dyn Syncbase>, username: impl Into<String>) -> Self {
        let (trip_changes, _) = watch::channel(None);
        Self {
            syncbase,
            username: username.into(),
            clock: system_clock(),
            active_trip_id: None,
            active_trip: None,
            upstream_trip_id: None,
            awaited_trip_id: None,
            trip_changes,
        }
    }

    pub fn with_clock(mut self, clock: Clock) -> Self {
        self.clock = clock;
        self
    }

    pub fn username(&self) -> &str {
        &self.username
    }

    /// Makes `trip_id` active once it shows up in a processed snapshot.
    pub fn watch_for_trip(&mut self, trip_id: impl Into<String>) {
        self.awaited_trip_id = Some(trip_id.into());
    }

    pub fn active_trip_id(&self) -> Option<&str> {
        self.active_trip_id.as_deref()
    }

    pub fn active_trip(&self) -> Option<&Value> {
        self.active_trip.as_ref()
    }

    /// The `destinations` subtree of the active trip.
    pub fn destination_data(&self) -> Option<&Value> {
        self.active_trip.as_ref().and_then(|trip| trip.get("destinations"))
    }

    pub fn active_trip_owner(&self) -> Option<String> {
        let trip = self.active_trip.as_ref()?;
        read_value(trip.get("owner")).ok().flatten()
    }

    /// Switches to `trip_id` and records the switch time for this user.
    pub fn set_active_trip_id(&mut self, trip_id: impl Into<String>) -> WriteFuture {
        let trip_id = trip_id.into();
        let now = (self.clock)();
        if self.active_trip_id.as_deref() != Some(trip_id.as_str()) {
            self.active_trip = None;
        }
        let metadata_key = key(&["user", "tripMetadata", trip_id.as_str(), LATEST_SWITCH]);
        self.active_trip_id = Some(trip_id);
        self.syncbase.put(metadata_key, now.to_string())
    }

    pub fn upstream_trip_id(&self) -> Option<&str> {
        self.upstream_trip_id.as_deref()
    }

    /// True if local edits can be pushed to the active trip.
    pub fn has_valid_upstream(&self) -> bool {
        self.upstream_trip_id.is_some() && self.upstream_trip_id == self.active_trip_id
    }

    /// Marks the active trip as ready to receive local edits.
    ///
    /// Call after refreshing from remote or before pushing local state.
    pub fn set_upstream(&mut self) {
        if self.upstream_trip_id != self.active_trip_id {
            self.upstream_trip_id = self.active_trip_id.clone();
            debug!("Upstream trip is now {:?}", self.upstream_trip_id);
            self.trip_changes.send_replace(self.upstream_trip_id.clone());
        }
    }

    /// Receives the upstream trip id every time it changes.
    pub fn subscribe_trip_changes(&self) -> watch::Receiver<Option<String>> {
        self.trip_changes.subscribe()
    }

    /// Key under the upstream trip, or `None` if there is no upstream yet.
    pub fn trip_key<S: AsRef<str>>(&self, rest: &[S]) -> Option<Key> {
        let trip_id = self.upstream_trip_id.as_ref()?;
        let mut trip_key = key(&[TRIPS, trip_id.as_str()]);
        trip_key.extend(rest.iter().map(|s| s.as_ref().to_string()));
        Some(trip_key)
    }

    pub fn destinations_key<S: AsRef<str>>(&self, rest: &[S]) -> Option<Key> {
        self.nested_key("destinations", rest)
    }

    pub fn messages_key<S: AsRef<str>>(&self, rest: &[S]) -> Option<Key> {
        self.nested_key("messages", rest)
    }

    fn nested_key<S: AsRef<str>>(&self, section: &str, rest: &[S]) -> Option<Key> {
        let mut nested = self.trip_key(&[section])?;
        nested.extend(rest.iter().map(|s| s.as_ref().to_string()));
        Some(nested)
    }

    /// Updates the active trip from a snapshot.
    ///
    /// `user_trip_metadata` is the `user.tripMetadata` subtree and `trips`
    /// the `trips` subtree. Returns the writes this caused: a switch-time
    /// record, the deletion of a replaced nascent trip, or the owner of a
    /// newly created trip.
    pub fn process_trips(
        &mut self,
        user_trip_metadata: Option<&Value>,
        trips: Option<&Value>,
    ) -> WriteFuture {
        let mut writes = Vec::new();
        let mut metadata = user_trip_metadata.cloned();
        let trips = trips.and_then(Value::as_object);

        if let Some(awaited) = self.awaited_trip_id.take() {
            writes.push(self.set_active_trip_id(awaited.clone()));
            // The switch write has not replicated yet; apply it to this frame.
            let now = (self.clock)();
            let mut all = match metadata.take() {
                Some(Value::Object(map)) => map,
                _ => Map::new(),
            };
            let entry = all
                .entry(awaited)
                .or_insert_with(|| Value::Object(Map::new()));
            if !entry.is_object() {
                *entry = Value::Object(Map::new());
            }
            if let Value::Object(md) = entry {
                md.insert(LATEST_SWITCH.to_string(), Value::from(now));
            }
            metadata = Some(Value::Object(all));
        }

        let mut trip = None;
        if let Some(active) = self.active_trip_id.clone() {
            match trips.and_then(|t| t.get(&active)) {
                None => debug!("Last active trip {} is no longer present", active),
                Some(current) => {
                    trip = Some(current.clone());
                    if let Some(all) = trips {
                        if let Some(default_id) = get_default_trip(metadata.as_ref(), all) {
                            if default_id != active {
                                if let Some(default_trip) = all.get(&default_id) {
                                    if is_nascent(current) {
                                        writes.push(self.delete_trip(&active));
                                        info!(
                                            "Replacing nascent trip {} with established trip {}",
                                            active, default_id
                                        );
                                    } else {
                                        info!(
                                            "Replacing active trip {} with most recent selection {}",
                                            active, default_id
                                        );
                                    }
                                    trip = Some(default_trip.clone());
                                    self.active_trip_id = Some(default_id);
                                }
                            }
                        }
                    }
                }
            }
        }

        if trip.is_none() {
            match trips {
                Some(all) => {
                    self.active_trip_id = get_default_trip(metadata.as_ref(), all);
                    info!("Setting active trip {:?}", self.active_trip_id);
                    trip = self
                        .active_trip_id
                        .as_ref()
                        .and_then(|id| all.get(id))
                        .cloned();
                }
                None => {
                    let trip_id = Uuid::new_v4().to_string();
                    info!("Creating new trip {}", trip_id);
                    writes.push(self.create_trip(&trip_id));
                    self.active_trip_id = Some(trip_id);
                    trip = Some(Value::Object(Map::new()));
                }
            }
        }

        self.active_trip = trip;
        join_writes(writes)
    }

    fn create_trip(&self, trip_id: &str) -> WriteFuture {
        match marshal(&self.username) {
            Ok(owner) => self.syncbase.put(key(&[TRIPS, trip_id, "owner"]), owner),
            Err(e) => failed_write(e.into()),
        }
    }

    fn delete_trip(&self, trip_id: &str) -> WriteFuture {
        let mut batch = Batch::new();
        batch
            .delete(key(&["user", "tripMetadata", trip_id]))
            .delete(key(&[TRIPS, trip_id]));
        self.syncbase.batch(batch)
    }
}

impl std::fmt::Debug for TripManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TripManager")
            .field("username", &self.username)
            .field("active_trip_id", &self.active_trip_id)
            .field("upstream_trip_id", &self.upstream_trip_id)
            .finish()
    }
}
