//! Synchronizers between domain records and the replicated tree.

mod destinations;
mod devices;
mod invitations;
mod messages;

pub use destinations::{
    CancelToken, Destination, DestinationEvent, DestinationSync, DestinationUpdate,
    OfflinePlaceResolver, PlaceLookup, PlaceResolver,
};
pub use devices::{
    connection_key, device_key, DeviceSet, DeviceSync, DeviceUpdate, Heartbeat, VectorRelation,
};
pub use invitations::{
    invitation_key, Invitation, InvitationEvent, InvitationSync, InvitationUpdate, INVITATIONS,
};
pub use messages::{MessageBatch, MessageSync};
