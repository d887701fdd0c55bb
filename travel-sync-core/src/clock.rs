//! Millisecond wall clock, injectable for tests and simulations.

use std::sync::Arc;

/// Returns milliseconds since the Unix epoch.
pub type Clock = Arc<dyn Fn() -> i64 + Send + Sync>;

pub fn system_clock() -> Clock {
    Arc::new(|| chrono::Utc::now().timestamp_millis())
}

/// A clock stuck at `millis`.
pub fn fixed_clock(millis: i64) -> Clock {
    Arc::new(move || millis)
}
