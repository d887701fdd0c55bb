//! Active trip selection.

mod comparator;
mod manager;

pub use comparator::{compare_trips, get_trip_length, ComparableTrip};
pub use manager::{get_default_trip, TripManager};
