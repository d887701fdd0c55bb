use serde::{Deserialize, Serialize};
use std::fmt;

/// The user and device a store instance belongs to.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DeviceIdentity {
    pub username: String,
    pub device_name: String,
}

impl DeviceIdentity {
    pub fn new(username: impl Into<String>, device_name: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            device_name: device_name.into(),
        }
    }
}

impl fmt::Display for DeviceIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.username, self.device_name)
    }
}
