use serde::{Deserialize, Serialize};

/// Mean earth radius in metres.
const EARTH_RADIUS: f64 = 6.371e6;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Vector3 {
    pub x: f64,
    pub y: f64,
    pub z: f64,
}

impl Vector3 {
    pub fn negate(self) -> Self {
        Self {
            x: -self.x,
            y: -self.y,
            z: -self.z,
        }
    }

    pub fn sub(self, other: Self) -> Self {
        Self {
            x: self.x - other.x,
            y: self.y - other.y,
            z: self.z - other.z,
        }
    }

    pub fn norm_squared(self) -> f64 {
        self.x * self.x + self.y * self.y + self.z * self.z
    }
}

/// Axis-aligned direction from one device to another.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Axis {
    Left,
    Right,
    Up,
    Down,
    Forwards,
    Backwards,
}

impl Axis {
    pub fn negate(self) -> Self {
        match self {
            Axis::Left => Axis::Right,
            Axis::Right => Axis::Left,
            Axis::Up => Axis::Down,
            Axis::Down => Axis::Up,
            Axis::Forwards => Axis::Backwards,
            Axis::Backwards => Axis::Forwards,
        }
    }
}

/// Either an axis bucket or a free vector with an error margin.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Direction {
    Axis(Axis),
    Vector { mean: Vector3, margin: f64 },
}

impl Direction {
    pub fn negate(self) -> Self {
        match self {
            Direction::Axis(axis) => Direction::Axis(axis.negate()),
            Direction::Vector { mean, margin } => Direction::Vector {
                mean: mean.negate(),
                margin,
            },
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Magnitude {
    Near,
    Far,
}

/// Where a remote device sits relative to this one.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RelativePosition {
    pub direction: Direction,
    pub magnitude: Magnitude,
}

impl RelativePosition {
    pub fn new(direction: Direction, magnitude: Magnitude) -> Self {
        Self {
            direction,
            magnitude,
        }
    }

    /// The same relation seen from the other device.
    pub fn negate(self) -> Self {
        Self {
            direction: self.direction.negate(),
            magnitude: self.magnitude,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Coords {
    pub accuracy: Option<f64>,
    pub altitude: Option<f64>,
    pub altitude_accuracy: Option<f64>,
    pub heading: Option<f64>,
    pub latitude: Option<f64>,
    pub longitude: Option<f64>,
    pub speed: Option<f64>,
}

impl Coords {
    pub fn at(latitude: f64, longitude: f64, accuracy: f64) -> Self {
        Self {
            accuracy: Some(accuracy),
            latitude: Some(latitude),
            longitude: Some(longitude),
            ..Default::default()
        }
    }

    /// Earth-centred cartesian position, ignoring altitude.
    pub fn cartesian(&self) -> Option<Vector3> {
        let lat = self.latitude?.to_radians();
        let lng = self.longitude?.to_radians();
        let plane = lat.cos();
        Some(Vector3 {
            x: EARTH_RADIUS * lng.cos() * plane,
            y: EARTH_RADIUS * lng.sin() * plane,
            z: EARTH_RADIUS * lat.sin(),
        })
    }
}

/// A geolocation fix as reported by the device.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct Geolocation {
    pub coords: Coords,
    pub timestamp: i64,
}

impl Geolocation {
    pub fn new(coords: Coords, timestamp: i64) -> Self {
        Self { coords, timestamp }
    }
}
