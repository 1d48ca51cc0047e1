//! In-process remote store
//!
//! Holds documents in a map and fans every change out to subscribers,
//! including the writer's own subscription. Records every write-merge
//! attempt so callers can assert on what was sent.
//!
//! Two switches simulate the failure classes sync units must absorb:
//! `set_offline` (unavailable; subscribers are re-sent snapshots when the
//! store comes back) and `deny` (permission denied for a session).

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use futures_util::future::{self, FutureExt};
use serde_json::{Map, Value};

use super::{
    document_value, merge_fields, write_payload, DocumentKey, EventSink, RemoteError,
    RemoteEvent, RemoteFuture, RemoteStore, Subscription,
};
use crate::keys::{SessionId, SliceKey};

/// One write-merge attempt seen by a [`MemoryRemote`]
#[derive(Debug, Clone, PartialEq)]
pub struct WriteRecord {
    pub session: SessionId,
    pub slice: SliceKey,
    pub value: Value,
}

#[derive(Default)]
struct Inner {
    documents: HashMap<DocumentKey, Map<String, Value>>,
    subscribers: HashMap<DocumentKey, Vec<(u64, EventSink)>>,
    next_subscriber: u64,
    writes: Vec<WriteRecord>,
    denied: HashSet<SessionId>,
    offline: bool,
}

impl Inner {
    fn snapshot(&self, key: &DocumentKey) -> RemoteEvent {
        RemoteEvent::Snapshot(self.documents.get(key).and_then(document_value))
    }

    fn check_access(&self, session: &SessionId) -> Result<(), RemoteError> {
        if self.denied.contains(session) {
            return Err(RemoteError::PermissionDenied(format!(
                "session '{}' is not authorized",
                session
            )));
        }
        if self.offline {
            return Err(RemoteError::unavailable("memory remote is offline"));
        }
        Ok(())
    }

    /// Send the current snapshot of `key` to its subscribers, pruning
    /// subscribers whose receiver is gone
    fn broadcast(&mut self, key: &DocumentKey) {
        let event = self.snapshot(key);
        if let Some(subscribers) = self.subscribers.get_mut(key) {
            subscribers.retain(|(_, sink)| sink.send(event.clone()).is_ok());
        }
    }
}

/// In-process [`RemoteStore`]
///
/// Cheap to clone; clones share the same documents.
#[derive(Clone, Default)]
pub struct MemoryRemote {
    inner: Arc<Mutex<Inner>>,
}

impl MemoryRemote {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Full document, including sibling fields
    pub fn document(&self, session: &SessionId, slice: &SliceKey) -> Option<Map<String, Value>> {
        self.lock()
            .documents
            .get(&DocumentKey::new(session, slice))
            .cloned()
    }

    /// Replace a document as another device would, notifying subscribers
    pub fn put_document(
        &self,
        session: &SessionId,
        slice: &SliceKey,
        document: Map<String, Value>,
    ) {
        let key = DocumentKey::new(session, slice);
        let mut inner = self.lock();
        inner.documents.insert(key.clone(), document);
        inner.broadcast(&key);
    }

    /// Write-merge as another device would, bypassing the write log
    pub fn merge_from_peer(&self, session: &SessionId, slice: &SliceKey, value: Value) {
        let key = DocumentKey::new(session, slice);
        let mut inner = self.lock();
        let document = inner.documents.entry(key.clone()).or_default();
        merge_fields(document, write_payload(value));
        inner.broadcast(&key);
    }

    /// Every write-merge attempt so far, in order
    pub fn writes(&self) -> Vec<WriteRecord> {
        self.lock().writes.clone()
    }

    pub fn write_count(&self) -> usize {
        self.lock().writes.len()
    }

    /// Number of open subscriptions on a document
    pub fn subscriber_count(&self, session: &SessionId, slice: &SliceKey) -> usize {
        self.lock()
            .subscribers
            .get(&DocumentKey::new(session, slice))
            .map_or(0, Vec::len)
    }

    /// Reject all reads and writes for `session`
    pub fn deny(&self, session: &SessionId) {
        self.lock().denied.insert(session.clone());
    }

    /// Take the store offline or bring it back
    ///
    /// Going offline pushes `Unavailable` to every subscriber; coming back
    /// re-sends the current snapshot of every subscribed document.
    pub fn set_offline(&self, offline: bool) {
        let mut inner = self.lock();
        if inner.offline == offline {
            return;
        }
        inner.offline = offline;

        let keys: Vec<DocumentKey> = inner.subscribers.keys().cloned().collect();
        for key in keys {
            if offline {
                let event =
                    RemoteEvent::Error(RemoteError::unavailable("memory remote is offline"));
                if let Some(subscribers) = inner.subscribers.get_mut(&key) {
                    subscribers.retain(|(_, sink)| sink.send(event.clone()).is_ok());
                }
            } else {
                inner.broadcast(&key);
            }
        }
    }
}

impl RemoteStore for MemoryRemote {
    fn subscribe(&self, session: &SessionId, slice: &SliceKey, sink: EventSink) -> Subscription {
        let key = DocumentKey::new(session, slice);
        let mut inner = self.lock();

        if let Err(e) = inner.check_access(session) {
            let denied = e.is_permission_denied();
            let _ = sink.send(RemoteEvent::Error(e));
            if denied {
                return Subscription::detached();
            }
        } else {
            let _ = sink.send(inner.snapshot(&key));
        }

        inner.next_subscriber += 1;
        let id = inner.next_subscriber;
        inner
            .subscribers
            .entry(key.clone())
            .or_default()
            .push((id, sink));

        let remote = Arc::downgrade(&self.inner);
        Subscription::new(move || {
            let Some(inner) = remote.upgrade() else {
                return;
            };
            let mut inner = inner.lock().unwrap_or_else(PoisonError::into_inner);
            if let Some(subscribers) = inner.subscribers.get_mut(&key) {
                subscribers.retain(|(sub_id, _)| *sub_id != id);
                if subscribers.is_empty() {
                    inner.subscribers.remove(&key);
                }
            }
        })
    }

    fn write_merge(&self, session: &SessionId, slice: &SliceKey, value: Value) -> RemoteFuture {
        let key = DocumentKey::new(session, slice);
        let mut inner = self.lock();
        inner.writes.push(WriteRecord {
            session: session.clone(),
            slice: slice.clone(),
            value: value.clone(),
        });

        let result = inner.check_access(session).map(|()| {
            let document = inner.documents.entry(key.clone()).or_default();
            merge_fields(document, write_payload(value));
            inner.broadcast(&key);
        });

        future::ready(result).boxed()
    }

    fn delete(&self, session: &SessionId, slice: &SliceKey) -> RemoteFuture {
        let key = DocumentKey::new(session, slice);
        let mut inner = self.lock();

        let result = inner.check_access(session).map(|()| {
            if inner.documents.remove(&key).is_some() {
                inner.broadcast(&key);
            }
        });

        future::ready(result).boxed()
    }
}
