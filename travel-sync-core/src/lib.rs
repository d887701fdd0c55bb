//! Travel Sync Core Library
//!
//! Local-first replication for the travel planner: a versioned tree store
//! with watchers, last-writer-wins replication between stores sharing a
//! syncgroup, active trip selection, and synchronizers for destinations,
//! messages and devices.

pub mod clock;
pub mod config;
pub mod error;
pub mod key;
pub mod marshalling;
pub mod models;
pub mod pending;
pub mod records;
pub mod replication;
pub mod session;
pub mod store;
pub mod sync_loop;
pub mod syncgroup;
pub mod transport;
pub mod trip;

pub use clock::{fixed_clock, system_clock, Clock};
pub use config::EngineConfig;
pub use error::SyncError;
pub use key::{escape_key_element, key, unescape_key_element, Key};
pub use marshalling::{marshal, read_value, unmarshal, MarshalError};
pub use models::{
    Axis, Coords, DeviceIdentity, Direction, Geolocation, LatLng, Magnitude, Message, Place,
    PlaceData, RelativePosition, Vector3,
};
pub use pending::{FieldState, PendingWrites, WriteToken};
pub use records::{
    DestinationEvent, DestinationSync, DeviceSync, Invitation, InvitationEvent, InvitationSync,
    MessageSync, OfflinePlaceResolver, PlaceResolver,
};
pub use replication::{sync_stores, TieBreak};
pub use session::{SessionUpdate, TravelSession};
pub use store::{Store, StoreId, Watch, WatchEvent};
pub use sync_loop::{convergence_bound, SyncLoop, TickReport, SYNC_SLA};
pub use syncgroup::{SyncgroupHandle, SyncgroupKey, SyncgroupRegistry, SyncgroupSpec};
pub use transport::{Batch, BatchOp, DeferredSyncbase, Syncbase, WriteFuture};
pub use trip::{compare_trips, ComparableTrip, TripManager};

pub fn version() -> &'static str {
    env!("CARGO_PKG_VERSION")
}
