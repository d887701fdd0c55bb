use serde::{Deserialize, Serialize};

/// A chat message attached to a trip.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub sender: String,
    pub text: String,
    /// Milliseconds since the Unix epoch, stamped when the message is sent.
    pub timestamp: i64,
}

impl Message {
    pub fn new(sender: impl Into<String>, text: impl Into<String>, timestamp: i64) -> Self {
        Self {
            sender: sender.into(),
            text: text.into(),
            timestamp,
        }
    }
}
