mod device;
mod identity;
mod message;
mod place;

pub use device::{Axis, Coords, Direction, Geolocation, Magnitude, RelativePosition, Vector3};
pub use identity::DeviceIdentity;
pub use message::Message;
pub use place::{LatLng, Place, PlaceData};
