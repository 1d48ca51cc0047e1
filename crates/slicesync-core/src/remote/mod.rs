//! Remote store adapters
//!
//! A remote store holds one document per `(session, slice)`. Each document
//! is a JSON object with a `value` field (the slice value) and an
//! `updatedAt` field maintained by the store.
//!
//! ## Contract
//!
//! - `subscribe` pushes [`RemoteEvent`]s into the sink it is given: the
//!   current snapshot first, then every change, including echoes of this
//!   client's own writes. Implementations only send into the sink; they never
//!   call back into the subscriber synchronously.
//! - `write_merge` sets the fields it carries and leaves every other field of
//!   the document alone.
//! - Dropping a [`Subscription`] unsubscribes.
//!
//! ## Adapters
//!
//! - [`MemoryRemote`]: in-process store with fan-out, for tests and demos
//! - [`OfflineRemote`]: always unavailable, for sessions without sync
//! - [`WsRemote`]: WebSocket client for the [`DocumentServer`]

pub mod client;
pub mod documents;
pub mod error;
pub mod memory;
pub mod message;
pub mod server;

use chrono::Utc;
use futures_util::future::{self, BoxFuture, FutureExt};
use serde_json::{Map, Value};
use tokio::sync::mpsc;

use crate::keys::{SessionId, SliceKey};

pub use client::{WsRemote, WsRemoteConfig};
pub use documents::DocumentStore;
pub use error::RemoteError;
pub use memory::{MemoryRemote, WriteRecord};
pub use server::DocumentServer;

/// Document field holding the slice value
pub const VALUE_FIELD: &str = "value";

/// Document field holding the last write time (ms since epoch)
pub const UPDATED_AT_FIELD: &str = "updatedAt";

/// Address of one remote document
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DocumentKey {
    pub session: SessionId,
    pub slice: SliceKey,
}

impl DocumentKey {
    pub fn new(session: &SessionId, slice: &SliceKey) -> Self {
        Self {
            session: session.clone(),
            slice: slice.clone(),
        }
    }
}

impl std::fmt::Display for DocumentKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.session, self.slice)
    }
}

/// Push delivered to a subscriber
#[derive(Debug, Clone, PartialEq)]
pub enum RemoteEvent {
    /// Current `value` of the document, or `None` when it does not exist
    Snapshot(Option<Value>),
    /// Subscription failure; the adapter keeps retrying underneath
    Error(RemoteError),
}

/// Channel a subscriber receives its events on
pub type EventSink = mpsc::UnboundedSender<RemoteEvent>;

/// Completion of a remote write or delete
pub type RemoteFuture = BoxFuture<'static, Result<(), RemoteError>>;

/// A per-user, per-slice document store
pub trait RemoteStore: Send + Sync {
    /// Subscribe to a document; events go to `sink` until the returned
    /// subscription is dropped
    fn subscribe(&self, session: &SessionId, slice: &SliceKey, sink: EventSink) -> Subscription;

    /// Upsert the document's `value` field without touching its siblings
    fn write_merge(&self, session: &SessionId, slice: &SliceKey, value: Value) -> RemoteFuture;

    /// Delete the document
    fn delete(&self, session: &SessionId, slice: &SliceKey) -> RemoteFuture;
}

/// Handle for an open subscription
///
/// Unsubscribes on drop.
pub struct Subscription {
    cancel: Option<Box<dyn FnOnce() + Send>>,
}

impl Subscription {
    pub fn new(cancel: impl FnOnce() + Send + 'static) -> Self {
        Self {
            cancel: Some(Box::new(cancel)),
        }
    }

    /// Subscription with nothing to release
    pub fn detached() -> Self {
        Self { cancel: None }
    }

    /// Unsubscribe now
    pub fn cancel(mut self) {
        if let Some(cancel) = self.cancel.take() {
            cancel();
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(cancel) = self.cancel.take() {
            cancel();
        }
    }
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription")
            .field("active", &self.cancel.is_some())
            .finish()
    }
}

/// Fields written by a write-merge of `value`
pub fn write_payload(value: Value) -> Map<String, Value> {
    let mut fields = Map::new();
    fields.insert(VALUE_FIELD.to_string(), value);
    fields.insert(
        UPDATED_AT_FIELD.to_string(),
        Value::from(Utc::now().timestamp_millis()),
    );
    fields
}

/// Merge `fields` into `document`, keeping every field not being written
pub fn merge_fields(document: &mut Map<String, Value>, fields: Map<String, Value>) {
    for (name, value) in fields {
        document.insert(name, value);
    }
}

/// The `value` field of a document
pub fn document_value(document: &Map<String, Value>) -> Option<Value> {
    document.get(VALUE_FIELD).cloned()
}

/// Remote used when a session exists but sync is disabled
///
/// Every subscription reports `Unavailable` once, which moves sync units to
/// their degraded synced state; every write fails the same way.
#[derive(Debug, Clone, Copy, Default)]
pub struct OfflineRemote;

impl RemoteStore for OfflineRemote {
    fn subscribe(&self, _session: &SessionId, _slice: &SliceKey, sink: EventSink) -> Subscription {
        let _ = sink.send(RemoteEvent::Error(RemoteError::unavailable(
            "remote sync is disabled",
        )));
        Subscription::detached()
    }

    fn write_merge(&self, _session: &SessionId, _slice: &SliceKey, _value: Value) -> RemoteFuture {
        future::ready(Err(RemoteError::unavailable("remote sync is disabled"))).boxed()
    }

    fn delete(&self, _session: &SessionId, _slice: &SliceKey) -> RemoteFuture {
        future::ready(Err(RemoteError::unavailable("remote sync is disabled"))).boxed()
    }
}
