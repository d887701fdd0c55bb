//! Trip chat messages.
//!
//! Each message is one leaf under `trips.<trip>.messages.<uuid>`. The
//! synchronizer watches that prefix and hands out each batch of unseen
//! messages sorted by timestamp once the batch ends.

use std::collections::HashSet;
use std::sync::Arc;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::clock::{system_clock, Clock};
use crate::error::SyncError;
use crate::key::Key;
use crate::marshalling::{marshal, unmarshal};
use crate::models::Message;
use crate::store::{Watch, WatchEvent};
use crate::transport::{failed_write, Syncbase, WriteFuture};
use crate::trip::TripManager;

/// Messages that arrived in one batch.
#[derive(Debug, Default)]
pub struct MessageBatch {
    /// Sorted by timestamp.
    pub messages: Vec<Message>,
    /// Leaves that could not be read.
    pub errors: Vec<SyncError>,
}

impl MessageBatch {
    pub fn is_empty(&self) -> bool {
        self.messages.is_empty() && self.errors.is_empty()
    }
}

pub struct MessageSync {
    syncbase: Arc<dyn Syncbase>,
    clock: Clock,
    /// Trip whose messages `seen` refers to.
    trip: Option<String>,
    seen: HashSet<String>,
    batch: MessageBatch,
    watch: Option<Watch>,
}

impl MessageSync {
    pub fn new(syncbase: Arc<dyn Syncbase>) -> Self {
        Self {
            syncbase,
            clock: system_clock(),
            trip: None,
            seen: HashSet::new(),
            batch: MessageBatch::default(),
            watch: None,
        }
    }

    pub fn with_clock(mut self, clock: Clock) -> Self {
        self.clock = clock;
        self
    }

    /// Posts a message to the upstream trip.
    pub fn send(
        &self,
        trips: &TripManager,
        sender: impl Into<String>,
        text: impl Into<String>,
    ) -> WriteFuture {
        let id = Uuid::new_v4().to_string();
        let Some(key) = trips.messages_key(&[id.as_str()]) else {
            return failed_write(SyncError::NoUpstreamTrip);
        };
        let message = Message::new(sender, text, (self.clock)());
        match marshal(&message) {
            Ok(value) => self.syncbase.put(key, value),
            Err(e) => failed_write(e.into()),
        }
    }

    /// Re-subscribes to the messages of the current upstream trip.
    ///
    /// Returns the messages already present there. Call whenever the
    /// upstream trip changes.
    pub async fn refresh(&mut self, trips: &TripManager) -> Result<MessageBatch, SyncError> {
        self.watch = None;
        let upstream = trips.upstream_trip_id().map(str::to_string);
        if upstream != self.trip {
            self.seen.clear();
            self.batch = MessageBatch::default();
            self.trip = upstream;
        }
        let Some(prefix) = trips.messages_key::<&str>(&[]) else {
            return Ok(MessageBatch::default());
        };
        debug!("Watching messages under {:?}", prefix);

        let mut watch = self.syncbase.watch(prefix).await?;
        for (key, value) in watch.take_initial() {
            self.process_message(&key, &value);
        }
        self.watch = Some(watch);
        Ok(self.end_batch())
    }

    /// Waits for the next batch of new messages.
    ///
    /// Returns `None` if nothing is being watched or the store is gone.
    pub async fn next_batch(&mut self) -> Option<MessageBatch> {
        loop {
            let event = self.watch.as_mut()?.next().await?;
            if let Some(batch) = self.handle(event) {
                return Some(batch);
            }
        }
    }

    /// Collects every batch that has already been delivered.
    pub fn drain_batches(&mut self) -> Vec<MessageBatch> {
        let events = match self.watch.as_mut() {
            Some(watch) => watch.drain(),
            None => return Vec::new(),
        };
        events
            .into_iter()
            .filter_map(|event| self.handle(event))
            .filter(|batch| !batch.is_empty())
            .collect()
    }

    fn handle(&mut self, event: WatchEvent) -> Option<MessageBatch> {
        match event {
            WatchEvent::Put { key, value, .. } => {
                self.process_message(&key, &value);
                None
            }
            WatchEvent::Delete { .. } => None,
            WatchEvent::BatchEnd => Some(self.end_batch()),
        }
    }

    fn process_message(&mut self, key: &Key, value: &str) {
        let Some(id) = key.last() else {
            return;
        };
        if self.seen.contains(id) {
            return;
        }
        match unmarshal::<Message>(value) {
            Ok(message) => {
                self.seen.insert(id.clone());
                self.batch.messages.push(message);
            }
            Err(e) => {
                warn!("Unreadable message {}: {}", id, e);
                self.batch.errors.push(e.into());
            }
        }
    }

    fn end_batch(&mut self) -> MessageBatch {
        let mut batch = std::mem::take(&mut self.batch);
        batch.messages.sort_by_key(|m| m.timestamp);
        batch
    }
}

impl std::fmt::Debug for MessageSync {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MessageSync")
            .field("trip", &self.trip)
            .field("seen", &self.seen.len())
            .field("watch", &self.watch)
            .finish()
    }
}
