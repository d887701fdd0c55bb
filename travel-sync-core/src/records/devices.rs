//! Device liveness, location and relative positions.
//!
//! Every device writes a `lastSeen` heartbeat and its latest geolocation
//! under `devices.<owner>.<device>`. Relative positions between two
//! devices are written in both directions under
//! `devices.<owner>.<device>.connections.<owner>.<device>`. Owner and
//! device segments are escaped.

use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::MissedTickBehavior;
use tracing::{debug, warn};

use crate::clock::{system_clock, Clock};
use crate::config::DEFAULT_DEVICE_SEEN_RECENTLY_MS;
use crate::error::SyncError;
use crate::key::{escape_key_element, unescape_key_element, Key};
use crate::marshalling::{marshal, read_value};
use crate::models::{Axis, DeviceIdentity, Direction, Geolocation, RelativePosition};
use crate::transport::{failed_write, join_writes, no_write, Batch, Syncbase, WriteFuture};

const DEVICES: &str = "devices";
const CONNECTIONS: &str = "connections";
const LAST_SEEN: &str = "lastSeen";
const LOCATION: &str = "location";

/// Extra distance in metres tolerated on top of both accuracies.
const NEARBY_SLACK: f64 = 50.0;

/// Owner to device names.
pub type DeviceSet = BTreeMap<String, BTreeSet<String>>;

fn insert(set: &mut DeviceSet, owner: &str, device: &str) {
    set.entry(owner.to_string())
        .or_default()
        .insert(device.to_string());
}

fn remove(set: &mut DeviceSet, owner: &str, device: &str) -> bool {
    let Some(devices) = set.get_mut(owner) else {
        return false;
    };
    let removed = devices.remove(device);
    if devices.is_empty() {
        set.remove(owner);
    }
    removed
}

fn contains(set: &DeviceSet, owner: &str, device: &str) -> bool {
    set.get(owner).is_some_and(|devices| devices.contains(device))
}

/// Key of a device record, with owner and device escaped.
pub fn device_key<S: AsRef<str>>(owner: &str, device: &str, rest: &[S]) -> Key {
    let mut key = vec![
        DEVICES.to_string(),
        escape_key_element(owner),
        escape_key_element(device),
    ];
    key.extend(rest.iter().map(|s| s.as_ref().to_string()));
    key
}

/// Key of the relative position of `to` as seen from `from`.
pub fn connection_key(from: &DeviceIdentity, to_owner: &str, to_device: &str) -> Key {
    device_key(
        &from.username,
        &from.device_name,
        &[
            CONNECTIONS.to_string(),
            escape_key_element(to_owner),
            escape_key_element(to_device),
        ],
    )
}

/// A relation whose direction is a free vector rather than an axis.
#[derive(Debug, Clone, PartialEq)]
pub struct VectorRelation {
    pub owner: String,
    pub device: String,
    pub position: RelativePosition,
}

/// Outcome of processing the `devices` subtree.
pub struct DeviceUpdate {
    /// Set when cast targets appeared where there were none before.
    pub possible_nearby_devices: bool,
    pub errors: Vec<SyncError>,
    /// Rewrites of this device's own fields found corrupt.
    pub writes: WriteFuture,
}

impl Default for DeviceUpdate {
    fn default() -> Self {
        Self {
            possible_nearby_devices: false,
            errors: Vec::new(),
            writes: no_write(),
        }
    }
}

impl std::fmt::Debug for DeviceUpdate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeviceUpdate")
            .field("possible_nearby_devices", &self.possible_nearby_devices)
            .field("errors", &self.errors)
            .finish()
    }
}

/// Periodically refreshes this device's `lastSeen`.
#[derive(Clone)]
pub struct Heartbeat {
    syncbase: Arc<dyn Syncbase>,
    key: Key,
    clock: Clock,
}

impl Heartbeat {
    pub fn beat(&self) -> WriteFuture {
        self.syncbase
            .put(self.key.clone(), (self.clock)().to_string())
    }

    /// Beats every `period` until `shutdown` turns true or its sender drops.
    pub async fn run(&self, period: Duration, mut shutdown: watch::Receiver<bool>) {
        let mut interval = tokio::time::interval(period);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = interval.tick() => {
                    if let Err(e) = self.beat().await {
                        warn!("Heartbeat failed: {}", e);
                    }
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
    }
}

pub struct DeviceSync {
    syncbase: Arc<dyn Syncbase>,
    identity: DeviceIdentity,
    clock: Clock,
    seen_recently_ms: i64,
    geolocation: Option<Geolocation>,
    /// Positions this device has published, keyed by (owner, device).
    connections: BTreeMap<(String, String), RelativePosition>,
    has_cast_targets: bool,
    possible_cast_targets: DeviceSet,
    unconnected_cast_targets: DeviceSet,
    related_devices: BTreeMap<Axis, DeviceSet>,
    vector_relations: Vec<VectorRelation>,
}

impl DeviceSync {
    pub fn new(syncbase: Arc<dyn Syncbase>, identity: DeviceIdentity) -> Self {
        Self {
            syncbase,
            identity,
            clock: system_clock(),
            seen_recently_ms: DEFAULT_DEVICE_SEEN_RECENTLY_MS as i64,
            geolocation: None,
            connections: BTreeMap::new(),
            has_cast_targets: false,
            possible_cast_targets: DeviceSet::new(),
            unconnected_cast_targets: DeviceSet::new(),
            related_devices: BTreeMap::new(),
            vector_relations: Vec::new(),
        }
    }

    pub fn with_clock(mut self, clock: Clock) -> Self {
        self.clock = clock;
        self
    }

    pub fn with_seen_recently(mut self, window: Duration) -> Self {
        self.seen_recently_ms = i64::try_from(window.as_millis()).unwrap_or(i64::MAX);
        self
    }

    pub fn identity(&self) -> &DeviceIdentity {
        &self.identity
    }

    pub fn heartbeat(&self) -> Heartbeat {
        Heartbeat {
            syncbase: self.syncbase.clone(),
            key: device_key(&self.identity.username, &self.identity.device_name, &[LAST_SEEN]),
            clock: self.clock.clone(),
        }
    }

    /// Records and publishes this device's location.
    pub fn update_geolocation(&mut self, geolocation: Geolocation) -> WriteFuture {
        self.geolocation = Some(geolocation);
        self.write_location()
    }

    fn write_location(&self) -> WriteFuture {
        let key = device_key(&self.identity.username, &self.identity.device_name, &[LOCATION]);
        match &self.geolocation {
            Some(geolocation) => match marshal(geolocation) {
                Ok(value) => self.syncbase.put(key, value),
                Err(e) => failed_write(e.into()),
            },
            None => self.syncbase.delete(key),
        }
    }

    /// Writes the locally known position of a remote device, or removes
    /// the entry if this device never published one.
    fn write_connection(&self, owner: &str, device: &str) -> WriteFuture {
        let key = connection_key(&self.identity, owner, device);
        match self.connections.get(&(owner.to_string(), device.to_string())) {
            Some(position) => match marshal(position) {
                Ok(value) => self.syncbase.put(key, value),
                Err(e) => failed_write(e.into()),
            },
            None => self.syncbase.delete(key),
        }
    }

    /// Overwrites corrupt `lastSeen` or `location` fields of this device.
    fn heal_own_record(
        &self,
        record: &Value,
        update: &mut DeviceUpdate,
        writes: &mut Vec<WriteFuture>,
    ) {
        if let Err(e) = read_value::<i64>(record.get(LAST_SEEN)) {
            warn!("Rewriting corrupt lastSeen of {}: {}", self.identity, e);
            update.errors.push(e.into());
            writes.push(self.heartbeat().beat());
        }
        if let Err(e) = read_value::<Geolocation>(record.get(LOCATION)) {
            warn!("Rewriting corrupt location of {}: {}", self.identity, e);
            update.errors.push(e.into());
            writes.push(self.write_location());
        }
    }

    /// Writes `position` of the remote device relative to this one, and
    /// the negated position in the other direction, in one batch.
    pub fn relate(
        &mut self,
        remote_owner: &str,
        remote_device: &str,
        position: RelativePosition,
    ) -> WriteFuture {
        let remote = DeviceIdentity::new(remote_owner, remote_device);
        let forward = marshal(&position);
        let backward = marshal(&position.negate());
        let (forward, backward) = match (forward, backward) {
            (Ok(f), Ok(b)) => (f, b),
            (Err(e), _) | (_, Err(e)) => return failed_write(e.into()),
        };

        self.connections
            .insert((remote_owner.to_string(), remote_device.to_string()), position);
        let mut batch = Batch::new();
        batch
            .put(connection_key(&self.identity, remote_owner, remote_device), forward)
            .put(
                connection_key(&remote, &self.identity.username, &self.identity.device_name),
                backward,
            );
        self.syncbase.batch(batch)
    }

    /// Whether a device at `other` is close enough to be a cast target.
    ///
    /// Returns `None` when either position is too incomplete to tell.
    pub fn is_nearby(&self, other: Option<&Geolocation>) -> Option<bool> {
        let a = self.geolocation.map(|g| g.coords).unwrap_or_default();
        let b = other.map(|g| g.coords).unwrap_or_default();

        if let (Some(alt_a), Some(alt_b), Some(acc_a), Some(acc_b)) =
            (a.altitude, b.altitude, a.altitude_accuracy, b.altitude_accuracy)
        {
            if (alt_a - alt_b).abs() > acc_a + acc_b + NEARBY_SLACK {
                return Some(false);
            }
        }

        let (va, vb) = (a.cartesian()?, b.cartesian()?);
        let tolerance = a.accuracy? + b.accuracy? + NEARBY_SLACK;
        Some(va.sub(vb).norm_squared() <= tolerance * tolerance)
    }

    /// Recomputes cast targets and relations from the `devices` subtree.
    pub fn process_devices(&mut self, data: Option<&Value>) -> DeviceUpdate {
        let now = (self.clock)();
        let mut update = DeviceUpdate::default();
        let mut writes = Vec::new();
        let mut possible = DeviceSet::new();
        let mut unconnected = DeviceSet::new();
        let mut connections = None;
        let mut has_cast_targets = false;

        let owners = data.and_then(Value::as_object).into_iter().flatten();
        for (owner, devices) in owners {
            let owner = unescape_key_element(owner);
            let Some(devices) = devices.as_object() else {
                continue;
            };
            for (device, record) in devices {
                let device = unescape_key_element(device);
                if owner == self.identity.username && device == self.identity.device_name {
                    connections = record.get(CONNECTIONS);
                    self.heal_own_record(record, &mut update, &mut writes);
                    continue;
                }

                let last_seen = match read_value::<i64>(record.get(LAST_SEEN)) {
                    Ok(Some(last_seen)) => last_seen,
                    Ok(None) => continue,
                    Err(e) => {
                        update.errors.push(e.into());
                        continue;
                    }
                };
                if now - last_seen > self.seen_recently_ms {
                    continue;
                }

                let location = match read_value::<Geolocation>(record.get(LOCATION)) {
                    Ok(location) => location,
                    Err(e) => {
                        update.errors.push(e.into());
                        None
                    }
                };
                if self.is_nearby(location.as_ref()) != Some(false) {
                    has_cast_targets = true;
                    insert(&mut possible, &owner, &device);
                    insert(&mut unconnected, &owner, &device);
                }
            }
        }

        let mut related: BTreeMap<Axis, DeviceSet> = BTreeMap::new();
        let mut vectors = Vec::new();
        let connected = connections.and_then(Value::as_object).into_iter().flatten();
        for (owner, devices) in connected {
            let owner = unescape_key_element(owner);
            let Some(devices) = devices.as_object() else {
                continue;
            };
            for (device, entry) in devices {
                let device = unescape_key_element(device);
                let position = match read_value::<RelativePosition>(Some(entry)) {
                    Ok(Some(position)) => position,
                    Ok(None) => continue,
                    Err(e) => {
                        warn!("Rewriting corrupt connection {}/{}: {}", owner, device, e);
                        update.errors.push(e.into());
                        writes.push(self.write_connection(&owner, &device));
                        continue;
                    }
                };
                if !contains(&unconnected, &owner, &device) {
                    continue;
                }
                match position.direction {
                    Direction::Axis(axis) => {
                        insert(related.entry(axis).or_default(), &owner, &device)
                    }
                    Direction::Vector { .. } => vectors.push(VectorRelation {
                        owner: owner.clone(),
                        device: device.clone(),
                        position,
                    }),
                }
                remove(&mut unconnected, &owner, &device);
            }
        }

        if has_cast_targets && !self.has_cast_targets {
            debug!("Possible nearby devices appeared");
            update.possible_nearby_devices = true;
        }
        self.has_cast_targets = has_cast_targets;
        self.possible_cast_targets = possible;
        self.unconnected_cast_targets = unconnected;
        self.related_devices = related;
        self.vector_relations = vectors;
        update.writes = join_writes(writes);
        update
    }

    pub fn possible_cast_targets(&self) -> &DeviceSet {
        &self.possible_cast_targets
    }

    /// Cast targets with no known relative position.
    pub fn unconnected_cast_targets(&self) -> &DeviceSet {
        &self.unconnected_cast_targets
    }

    pub fn related_devices(&self, axis: Axis) -> DeviceSet {
        self.related_devices.get(&axis).cloned().unwrap_or_default()
    }

    pub fn vector_relations(&self) -> &[VectorRelation] {
        &self.vector_relations
    }
}

impl std::fmt::Debug for DeviceSync {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeviceSync")
            .field("identity", &self.identity)
            .field("possible_cast_targets", &self.possible_cast_targets)
            .finish()
    }
}
