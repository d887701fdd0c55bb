//! Error types for the sync core.

use thiserror::Error;

/// Errors surfaced by stores, syncgroups and record synchronizers.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SyncError {
    /// Join or spec change targeting a syncgroup nobody created.
    #[error("Syncgroup does not exist: {admin}${name}")]
    NotFound { admin: String, name: String },

    /// A persisted value failed to deserialize or had the wrong shape.
    #[error("Corrupt persisted value: {0}")]
    Corruption(String),

    /// The underlying store failed.
    #[error("Transport error: {0}")]
    Transport(String),

    /// The store or wrapper behind a handle is gone.
    #[error("Store closed")]
    Closed,

    /// A key segment is empty or is the reserved snapshot key.
    #[error("Invalid key: {0:?}")]
    InvalidKey(String),

    /// A trip-scoped write was issued before any trip was upstream.
    #[error("No upstream trip")]
    NoUpstreamTrip,
}

impl SyncError {
    pub fn not_found(admin: impl Into<String>, name: impl Into<String>) -> Self {
        SyncError::NotFound {
            admin: admin.into(),
            name: name.into(),
        }
    }

    /// Returns true for errors a synchronizer recovers from by overwriting
    /// the remote field with its local state.
    pub fn is_corruption(&self) -> bool {
        matches!(self, SyncError::Corruption(_))
    }
}

impl From<crate::marshalling::MarshalError> for SyncError {
    fn from(e: crate::marshalling::MarshalError) -> Self {
        SyncError::Corruption(e.to_string())
    }
}
