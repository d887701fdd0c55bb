//! Ranking of candidate trips when deciding which one a user sees.

use serde_json::Value;
use std::cell::OnceCell;
use std::cmp::Ordering;

use crate::marshalling::read_value;

/// Number of destinations in a trip snapshot.
///
/// The destination id list is stored as the value of the trip's
/// `destinations` node. A missing list counts as zero, and so does a
/// corrupt one.
pub fn get_trip_length(trip: &Value) -> usize {
    match read_value::<Vec<String>>(trip.get("destinations")) {
        Ok(ids) => ids.map_or(0, |ids| ids.len()),
        Err(e) => {
            tracing::warn!("Unreadable destination list: {}", e);
            0
        }
    }
}

/// A trip together with the metadata used to rank it.
#[derive(Debug, Clone)]
pub struct ComparableTrip<'a> {
    trip: &'a Value,
    id: String,
    latest_switch: Option<i64>,
    length: OnceCell<usize>,
}

impl<'a> ComparableTrip<'a> {
    pub fn new(trip: &'a Value, id: impl Into<String>, latest_switch: Option<i64>) -> Self {
        Self {
            trip,
            id: id.into(),
            latest_switch,
            length: OnceCell::new(),
        }
    }

    pub fn trip(&self) -> &'a Value {
        self.trip
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn latest_switch(&self) -> Option<i64> {
        self.latest_switch
    }

    /// Destination count, computed on first use.
    pub fn length(&self) -> usize {
        *self.length.get_or_init(|| get_trip_length(self.trip))
    }
}

/// Orders trips so the one a user most likely wants comes first.
///
/// `Less` means `a` ranks ahead of `b`. Missing trips rank last. Between
/// two trips the later switch wins (any switch beats none), then the
/// longer trip, then the smaller id.
pub fn compare_trips(a: Option<&ComparableTrip<'_>>, b: Option<&ComparableTrip<'_>>) -> Ordering {
    match (a, b) {
        (Some(a), Some(b)) => b
            .latest_switch
            .cmp(&a.latest_switch)
            .then_with(|| b.length().cmp(&a.length()))
            .then_with(|| a.id.cmp(&b.id)),
        (Some(_), None) => Ordering::Less,
        (None, Some(_)) => Ordering::Greater,
        (None, None) => Ordering::Equal,
    }
}
