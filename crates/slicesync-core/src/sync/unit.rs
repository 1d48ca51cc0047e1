//! Sync unit runtime
//!
//! Wraps a [`SyncMachine`] with its side effects: the local cache, the
//! remote subscription, the pump task that feeds remote events into the
//! machine, and the debounce timer that sends write-merges.
//!
//! ## Tasks
//!
//! - Pump: one per binding. Drains the subscription channel and applies each
//!   event under the unit lock.
//! - Debounce timer: at most one. Every write aborts it and starts a new one,
//!   so only the latest value in a window is sent. When it fires it hands the
//!   write-merge to a separate task, which teardown never aborts.
//!
//! Each binding has a generation number. Events and write results carrying
//! an older generation are dropped.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;

use serde_json::Value;
use tokio::runtime::Handle;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::machine::{Phase, SliceValue, SnapshotOutcome, SyncMachine, WriteOutcome};
use super::SyncError;
use crate::cache::LocalCache;
use crate::config::Config;
use crate::keys::{namespace, SessionId, SliceKey};
use crate::remote::{RemoteError, RemoteEvent, RemoteStore, Subscription};
use crate::session::SessionBound;

/// Tunables for a sync unit
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnitOptions {
    /// Quiet period before a write-merge is sent
    pub debounce: Duration,
}

impl Default for UnitOptions {
    fn default() -> Self {
        Self {
            debounce: Duration::from_millis(1000),
        }
    }
}

impl From<&Config> for UnitOptions {
    fn from(config: &Config) -> Self {
        Self {
            debounce: config.debounce(),
        }
    }
}

struct UnitState<T> {
    machine: SyncMachine<T>,
    session: Option<SessionId>,
    generation: u64,
    runtime: Option<Handle>,
    subscription: Option<Subscription>,
    pump: Option<JoinHandle<()>>,
    timer: Option<JoinHandle<()>>,
    /// Identifies the live timer among ones already aborted
    timer_seq: u64,
    /// Value the next write-merge will carry
    pending: Option<Value>,
}

impl<T> UnitState<T> {
    fn cancel_timer(&mut self) {
        if let Some(timer) = self.timer.take() {
            timer.abort();
        }
    }
}

/// A write-merge taken out of the unit, ready to send
struct Outgoing {
    session: SessionId,
    value: Value,
    generation: u64,
}

struct Shared<T> {
    me: Weak<Shared<T>>,
    slice: SliceKey,
    default: T,
    cache: LocalCache,
    remote: Arc<dyn RemoteStore>,
    options: UnitOptions,
    state: Mutex<UnitState<T>>,
    revision: watch::Sender<u64>,
    phase: watch::Sender<Phase>,
}

impl<T: SliceValue> Shared<T> {
    fn lock(&self) -> MutexGuard<'_, UnitState<T>> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn bump_revision(&self) {
        self.revision.send_modify(|revision| *revision += 1);
    }

    fn publish_phase(&self, phase: Phase) {
        self.phase.send_if_modified(|current| {
            if *current == phase {
                return false;
            }
            *current = phase;
            true
        });
    }

    fn teardown(&self, state: &mut UnitState<T>) {
        state.generation += 1;
        state.subscription = None;
        if let Some(pump) = state.pump.take() {
            pump.abort();
        }
        state.cancel_timer();
        if state.pending.take().is_some() {
            debug!("Dropped pending write-merge for '{}'", self.slice);
        }
        state.machine.reset();
    }

    fn bind(&self, session: Option<SessionId>) -> Result<(), SyncError> {
        let runtime = match session {
            Some(_) => Some(Handle::try_current().map_err(|_| SyncError::NoRuntime)?),
            None => None,
        };

        let mut state = self.lock();
        self.teardown(&mut state);

        let seeded = self
            .cache
            .get(session.as_ref(), &self.slice)
            .unwrap_or_else(|| self.default.clone());
        state.machine.reseed(seeded);
        state.session = session.clone();
        state.runtime = runtime.clone();

        if let (Some(session), Some(runtime)) = (session, runtime) {
            let (sink, events) = mpsc::unbounded_channel();
            state.machine.begin_sync();
            state.subscription = Some(self.remote.subscribe(&session, &self.slice, sink));
            state.pump = Some(runtime.spawn(pump(self.me.clone(), state.generation, events)));
            info!("Sync unit '{}' bound to session '{}'", self.slice, session);
        } else {
            debug!("Sync unit '{}' bound to the guest namespace", self.slice);
        }

        let phase = state.machine.phase();
        drop(state);

        self.publish_phase(phase);
        self.bump_revision();
        Ok(())
    }

    fn unbind(&self) {
        let mut state = self.lock();
        self.teardown(&mut state);
        debug!(
            "Sync unit '{}' unbound, writes stay in '{}'",
            self.slice,
            namespace(state.session.as_ref())
        );
        drop(state);
        self.publish_phase(Phase::LocalOnly);
    }

    fn apply(&self, mutate: impl FnOnce(&mut SyncMachine<T>) -> WriteOutcome) {
        let mut state = self.lock();
        let outcome = mutate(&mut state.machine);
        self.cache
            .set(state.session.as_ref(), &self.slice, state.machine.value());

        match outcome {
            WriteOutcome::LocalOnly => {}
            WriteOutcome::Suppressed => debug!(
                "Write-merge for '{}' withheld until the first remote snapshot",
                self.slice
            ),
            WriteOutcome::Schedule(value) => self.schedule(&mut state, value),
            WriteOutcome::Unserializable(e) => warn!(
                "Value for '{}' cannot be serialized and will not sync: {}",
                self.slice, e
            ),
        }
        drop(state);

        self.bump_revision();
    }

    /// Replace the pending write-merge and restart the debounce timer
    fn schedule(&self, state: &mut UnitState<T>, value: Value) {
        state.pending = Some(value);
        state.cancel_timer();

        let Some(runtime) = state.runtime.clone() else {
            return;
        };
        state.timer_seq += 1;
        let seq = state.timer_seq;
        let generation = state.generation;
        let debounce = self.options.debounce;
        let shared = self.me.clone();

        state.timer = Some(runtime.spawn(async move {
            tokio::time::sleep(debounce).await;
            if let Some(shared) = shared.upgrade() {
                shared.fire(generation, seq);
            }
        }));
    }

    /// Debounce window elapsed: send the pending write-merge
    fn fire(&self, generation: u64, seq: u64) {
        let (outgoing, runtime) = {
            let mut state = self.lock();
            if state.generation != generation || state.timer_seq != seq {
                return;
            }
            state.timer = None;
            (self.take_pending(&mut state), state.runtime.clone())
        };
        let (Some(outgoing), Some(runtime)) = (outgoing, runtime) else {
            return;
        };

        let write = self
            .remote
            .write_merge(&outgoing.session, &self.slice, outgoing.value);
        let shared = self.me.clone();
        runtime.spawn(async move {
            let result = write.await;
            if let Some(shared) = shared.upgrade() {
                shared.finish_write(outgoing.generation, &result);
            }
        });
    }

    fn take_pending(&self, state: &mut UnitState<T>) -> Option<Outgoing> {
        let value = state.pending.take()?;
        let session = state.session.clone()?;
        Some(Outgoing {
            session,
            value,
            generation: state.generation,
        })
    }

    fn finish_write(&self, generation: u64, result: &Result<(), RemoteError>) {
        let current = self.lock().generation == generation;
        match result {
            Ok(()) => debug!("Write-merge for '{}' completed", self.slice),
            Err(e) if !current => debug!(
                "Ignoring write-merge result for '{}' from a previous binding: {}",
                self.slice, e
            ),
            Err(e) if e.is_permission_denied() => {
                debug!("Write-merge for '{}' not permitted: {}", self.slice, e)
            }
            Err(e) => warn!("Write-merge for '{}' failed: {}", self.slice, e),
        }
    }

    fn handle_event(&self, generation: u64, event: RemoteEvent) {
        let mut state = self.lock();
        if state.generation != generation {
            return;
        }
        let before = state.machine.phase();
        let mut adopted = false;

        match event {
            RemoteEvent::Snapshot(snapshot) => match state.machine.on_snapshot(snapshot) {
                SnapshotOutcome::Adopted => {
                    self.cache
                        .set(state.session.as_ref(), &self.slice, state.machine.value());
                    adopted = true;
                    debug!("Adopted remote snapshot for '{}'", self.slice);
                }
                SnapshotOutcome::Unchanged => {
                    debug!("Remote snapshot for '{}' matches local state", self.slice)
                }
                SnapshotOutcome::NoDocument => {
                    debug!("No remote document for '{}' yet", self.slice)
                }
                SnapshotOutcome::Undecodable(e) => warn!(
                    "Ignoring undecodable remote snapshot for '{}': {}",
                    self.slice, e
                ),
                SnapshotOutcome::Ignored => {}
            },
            RemoteEvent::Error(error) => {
                state.machine.on_error(&error);
                if error.is_permission_denied() {
                    debug!("Subscription for '{}' not permitted: {}", self.slice, error);
                } else {
                    warn!("Subscription error for '{}': {}", self.slice, error);
                }
            }
        }

        let phase = state.machine.phase();
        drop(state);

        if phase != before {
            info!("Sync unit '{}' is {}", self.slice, phase);
            self.publish_phase(phase);
        }
        if adopted {
            self.bump_revision();
        }
    }
}

impl<T> Drop for Shared<T> {
    fn drop(&mut self) {
        let state = self.state.get_mut().unwrap_or_else(PoisonError::into_inner);
        if let Some(pump) = state.pump.take() {
            pump.abort();
        }
        if let Some(timer) = state.timer.take() {
            timer.abort();
        }
    }
}

impl<T: SliceValue> SessionBound for Shared<T> {
    fn slice_key(&self) -> &SliceKey {
        &self.slice
    }

    fn bind_session(&self, session: Option<SessionId>) -> Result<(), SyncError> {
        self.bind(session)
    }

    fn unbind_session(&self) {
        self.unbind();
    }
}

/// Drain one binding's subscription into the unit
async fn pump<T: SliceValue>(
    shared: Weak<Shared<T>>,
    generation: u64,
    mut events: mpsc::UnboundedReceiver<RemoteEvent>,
) {
    while let Some(event) = events.recv().await {
        let Some(shared) = shared.upgrade() else {
            break;
        };
        shared.handle_event(generation, event);
    }
}

/// One slice of state, cached locally and mirrored to the remote
///
/// Cheap to clone; clones share the same unit. The unit is torn down when
/// the last clone is dropped.
pub struct SyncUnit<T> {
    shared: Arc<Shared<T>>,
}

impl<T> Clone for SyncUnit<T> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl<T: SliceValue> SyncUnit<T> {
    /// Create an unbound unit seeded from the guest namespace of `cache`
    pub fn new(
        slice: SliceKey,
        default: T,
        cache: LocalCache,
        remote: Arc<dyn RemoteStore>,
        options: UnitOptions,
    ) -> Self {
        let seeded = cache
            .get(None, &slice)
            .unwrap_or_else(|| default.clone());
        let (revision, _) = watch::channel(0);
        let (phase, _) = watch::channel(Phase::LocalOnly);

        let shared = Arc::new_cyclic(|me| Shared {
            me: me.clone(),
            slice,
            default,
            cache,
            remote,
            options,
            state: Mutex::new(UnitState {
                machine: SyncMachine::new(seeded),
                session: None,
                generation: 0,
                runtime: None,
                subscription: None,
                pump: None,
                timer: None,
                timer_seq: 0,
                pending: None,
            }),
            revision,
            phase,
        });

        Self { shared }
    }

    pub fn slice_key(&self) -> &SliceKey {
        &self.shared.slice
    }

    /// Current value
    pub fn read(&self) -> T {
        self.shared.lock().machine.value().clone()
    }

    /// Borrow the current value without cloning it
    pub fn with_value<R>(&self, f: impl FnOnce(&T) -> R) -> R {
        f(self.shared.lock().machine.value())
    }

    /// Replace the value
    pub fn write(&self, value: T) {
        self.shared.apply(|machine| machine.write(value));
    }

    /// Mutate the value in place
    pub fn update(&self, f: impl FnOnce(&mut T)) {
        self.shared.apply(|machine| machine.update(f));
    }

    /// Rebind to `session`, or to the guest namespace with `None`
    ///
    /// Tears down the current binding, reseeds from the cache namespace of
    /// the new session and, for a real session, opens the subscription.
    pub fn bind(&self, session: Option<SessionId>) -> Result<(), SyncError> {
        self.shared.bind(session)
    }

    /// Tear down the subscription and drop any pending write-merge
    pub fn unbind(&self) {
        self.shared.unbind();
    }

    pub fn phase(&self) -> Phase {
        self.shared.lock().machine.phase()
    }

    pub fn session(&self) -> Option<SessionId> {
        self.shared.lock().session.clone()
    }

    /// Counter bumped on every write and every adopted snapshot
    pub fn revision(&self) -> u64 {
        *self.shared.revision.borrow()
    }

    /// Receiver notified whenever [`revision`](Self::revision) changes
    pub fn changes(&self) -> watch::Receiver<u64> {
        self.shared.revision.subscribe()
    }

    /// Resolve once the remote has answered the current binding
    pub async fn wait_until_synced(&self, timeout: Duration) -> Result<(), SyncError> {
        let mut phases = self.shared.phase.subscribe();
        let settled = tokio::time::timeout(timeout, async {
            phases
                .wait_for(|phase| *phase != Phase::AwaitingInitialSnapshot)
                .await
                .map(|phase| *phase)
        })
        .await;

        match settled {
            Err(_) => Err(SyncError::Timeout(timeout)),
            Ok(Ok(Phase::Synced)) => Ok(()),
            Ok(_) => Err(SyncError::NotBound),
        }
    }

    /// Send the pending write-merge now instead of waiting for the timer
    pub async fn flush(&self) -> Result<(), SyncError> {
        let outgoing = {
            let mut state = self.shared.lock();
            state.cancel_timer();
            self.shared.take_pending(&mut state)
        };
        let Some(outgoing) = outgoing else {
            return Ok(());
        };

        let result = self
            .shared
            .remote
            .write_merge(&outgoing.session, &self.shared.slice, outgoing.value)
            .await;
        self.shared.finish_write(outgoing.generation, &result);
        result.map_err(SyncError::from)
    }

    /// Whether a debounced write-merge is waiting to be sent
    pub fn has_pending_write(&self) -> bool {
        self.shared.lock().pending.is_some()
    }

    /// Type-erased handle for a session registry
    pub fn session_bound(&self) -> Weak<dyn SessionBound> {
        let weak: Weak<Shared<T>> = Arc::downgrade(&self.shared);
        weak
    }
}

impl<T: SliceValue + std::fmt::Debug> std::fmt::Debug for SyncUnit<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.shared.lock();
        f.debug_struct("SyncUnit")
            .field("slice", &self.shared.slice)
            .field("session", &state.session)
            .field("phase", &state.machine.phase())
            .field("value", state.machine.value())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::remote::{EventSink, MemoryRemote, RemoteFuture};
    use crate::slices::DashboardConfig;
    use futures_util::future::{self, FutureExt};
    use serde_json::json;

    const DEBOUNCE: Duration = Duration::from_millis(1000);

    /// Remote that only delivers what the test pushes
    #[derive(Default)]
    struct ManualRemote {
        sinks: Mutex<Vec<EventSink>>,
        writes: Mutex<Vec<Value>>,
    }

    impl ManualRemote {
        fn push(&self, event: RemoteEvent) {
            for sink in self.sinks.lock().unwrap().iter() {
                let _ = sink.send(event.clone());
            }
        }

        fn writes(&self) -> Vec<Value> {
            self.writes.lock().unwrap().clone()
        }
    }

    impl RemoteStore for ManualRemote {
        fn subscribe(
            &self,
            _session: &SessionId,
            _slice: &SliceKey,
            sink: EventSink,
        ) -> Subscription {
            self.sinks.lock().unwrap().push(sink);
            Subscription::detached()
        }

        fn write_merge(
            &self,
            _session: &SessionId,
            _slice: &SliceKey,
            value: Value,
        ) -> RemoteFuture {
            self.writes.lock().unwrap().push(value);
            future::ready(Ok(())).boxed()
        }

        fn delete(&self, _session: &SessionId, _slice: &SliceKey) -> RemoteFuture {
            future::ready(Ok(())).boxed()
        }
    }

    /// Remote whose write-merges fail only after `delay`
    struct SlowFailingRemote {
        inner: ManualRemote,
        delay: Duration,
    }

    impl RemoteStore for SlowFailingRemote {
        fn subscribe(
            &self,
            session: &SessionId,
            slice: &SliceKey,
            sink: EventSink,
        ) -> Subscription {
            self.inner.subscribe(session, slice, sink)
        }

        fn write_merge(&self, session: &SessionId, slice: &SliceKey, value: Value) -> RemoteFuture {
            let _ = self.inner.write_merge(session, slice, value);
            let delay = self.delay;
            async move {
                tokio::time::sleep(delay).await;
                Err(RemoteError::unavailable("connection dropped"))
            }
            .boxed()
        }

        fn delete(&self, session: &SessionId, slice: &SliceKey) -> RemoteFuture {
            self.inner.delete(session, slice)
        }
    }

    fn session() -> SessionId {
        SessionId::new("u1").unwrap()
    }

    fn slice() -> SliceKey {
        SliceKey::new("dashboard-config").unwrap()
    }

    fn unit_with(remote: Arc<dyn RemoteStore>, cache: LocalCache) -> SyncUnit<DashboardConfig> {
        SyncUnit::new(
            slice(),
            DashboardConfig::default(),
            cache,
            remote,
            UnitOptions { debounce: DEBOUNCE },
        )
    }

    /// Let spawned tasks run without moving past any debounce window
    async fn settle() {
        tokio::time::sleep(Duration::from_millis(1)).await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_round_trip_sends_once_and_absorbs_echo() {
        let remote = MemoryRemote::new();
        let unit = unit_with(Arc::new(remote.clone()), LocalCache::in_memory());
        unit.bind(Some(session())).unwrap();
        unit.wait_until_synced(Duration::from_secs(1)).await.unwrap();

        unit.update(|config| config.low_threshold = 65);
        tokio::time::sleep(DEBOUNCE + Duration::from_millis(50)).await;

        let writes = remote.writes();
        assert_eq!(writes.len(), 1);
        assert_eq!(writes[0].value, json!({"lowThreshold": 65, "highThreshold": 180}));

        // The echo has been delivered by now; give it several windows anyway
        tokio::time::sleep(DEBOUNCE * 3).await;
        assert_eq!(unit.read().low_threshold, 65);
        assert_eq!(remote.write_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_no_remote_writes_before_first_snapshot() {
        let remote = Arc::new(ManualRemote::default());
        let unit = unit_with(remote.clone(), LocalCache::in_memory());
        unit.bind(Some(session())).unwrap();
        settle().await;
        assert_eq!(unit.phase(), Phase::AwaitingInitialSnapshot);

        unit.update(|config| config.low_threshold = 60);
        unit.update(|config| config.high_threshold = 200);
        tokio::time::sleep(DEBOUNCE * 3).await;
        assert!(remote.writes().is_empty());
        assert!(!unit.has_pending_write());

        remote.push(RemoteEvent::Snapshot(None));
        settle().await;
        assert_eq!(unit.phase(), Phase::Synced);
        assert_eq!(unit.read(), DashboardConfig { low_threshold: 60, high_threshold: 200 });
        assert!(remote.writes().is_empty());

        unit.update(|config| config.low_threshold = 61);
        tokio::time::sleep(DEBOUNCE + Duration::from_millis(50)).await;
        assert_eq!(
            remote.writes(),
            vec![json!({"lowThreshold": 61, "highThreshold": 200})]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_debounce_sends_only_latest_value() {
        let remote = MemoryRemote::new();
        let unit = unit_with(Arc::new(remote.clone()), LocalCache::in_memory());
        unit.bind(Some(session())).unwrap();
        unit.wait_until_synced(Duration::from_secs(1)).await.unwrap();

        for low in [60, 62, 64] {
            unit.update(|config| config.low_threshold = low);
            tokio::time::sleep(Duration::from_millis(300)).await;
        }
        tokio::time::sleep(DEBOUNCE).await;

        let writes = remote.writes();
        assert_eq!(writes.len(), 1);
        assert_eq!(writes[0].value["lowThreshold"], json!(64));
    }

    #[tokio::test(start_paused = true)]
    async fn test_guest_unit_stays_local() {
        let remote = MemoryRemote::new();
        let cache = LocalCache::in_memory();
        let unit = unit_with(Arc::new(remote.clone()), cache.clone());

        unit.update(|config| config.high_threshold = 170);
        tokio::time::sleep(DEBOUNCE * 2).await;

        assert_eq!(unit.phase(), Phase::LocalOnly);
        assert_eq!(remote.write_count(), 0);
        assert_eq!(remote.subscriber_count(&session(), &slice()), 0);

        let reopened = unit_with(Arc::new(remote), cache);
        assert_eq!(reopened.read().high_threshold, 170);
    }

    #[tokio::test(start_paused = true)]
    async fn test_unbind_cancels_pending_write() {
        let remote = MemoryRemote::new();
        let unit = unit_with(Arc::new(remote.clone()), LocalCache::in_memory());
        unit.bind(Some(session())).unwrap();
        unit.wait_until_synced(Duration::from_secs(1)).await.unwrap();

        unit.update(|config| config.low_threshold = 50);
        assert!(unit.has_pending_write());
        unit.unbind();
        tokio::time::sleep(DEBOUNCE * 2).await;

        assert_eq!(remote.write_count(), 0);
        assert_eq!(unit.phase(), Phase::LocalOnly);
        assert_eq!(remote.subscriber_count(&session(), &slice()), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_equal_snapshot_changes_nothing() {
        let remote = Arc::new(ManualRemote::default());
        let cache = LocalCache::in_memory();
        let unit = unit_with(remote.clone(), cache.clone());
        unit.bind(Some(session())).unwrap();
        let revision = unit.revision();

        remote.push(RemoteEvent::Snapshot(Some(json!({
            "highThreshold": 180,
            "lowThreshold": 70
        }))));
        settle().await;

        assert_eq!(unit.phase(), Phase::Synced);
        assert_eq!(unit.revision(), revision);
        assert!(cache.raw(Some(&session()), &slice()).unwrap().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_different_snapshot_is_adopted_and_persisted() {
        let remote = Arc::new(ManualRemote::default());
        let cache = LocalCache::in_memory();
        let unit = unit_with(remote.clone(), cache.clone());
        unit.bind(Some(session())).unwrap();
        let mut changes = unit.changes();
        changes.borrow_and_update();

        remote.push(RemoteEvent::Snapshot(Some(json!({
            "lowThreshold": 80,
            "highThreshold": 160
        }))));
        settle().await;

        assert!(changes.has_changed().unwrap());
        let expected = DashboardConfig {
            low_threshold: 80,
            high_threshold: 160,
        };
        assert_eq!(unit.read(), expected);
        assert_eq!(
            cache.get::<DashboardConfig>(Some(&session()), &slice()),
            Some(expected)
        );
        assert!(remote.writes().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_permission_denied_write_is_not_retried() {
        let remote = MemoryRemote::new();
        remote.deny(&session());
        let unit = unit_with(Arc::new(remote.clone()), LocalCache::in_memory());
        unit.bind(Some(session())).unwrap();
        unit.wait_until_synced(Duration::from_secs(1)).await.unwrap();

        unit.update(|config| config.low_threshold = 55);
        tokio::time::sleep(DEBOUNCE * 5).await;

        assert_eq!(remote.write_count(), 1);
        assert_eq!(unit.read().low_threshold, 55);
        assert!(!unit.has_pending_write());
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_write_waits_for_next_caller_write() {
        let remote = MemoryRemote::new();
        let unit = unit_with(Arc::new(remote.clone()), LocalCache::in_memory());
        unit.bind(Some(session())).unwrap();
        unit.wait_until_synced(Duration::from_secs(1)).await.unwrap();

        remote.set_offline(true);
        unit.update(|config| config.low_threshold = 66);
        tokio::time::sleep(DEBOUNCE * 5).await;

        // One failed attempt, no retry timer
        assert_eq!(remote.write_count(), 1);
        assert!(!unit.has_pending_write());
        assert_eq!(unit.phase(), Phase::Synced);
        assert_eq!(unit.read().low_threshold, 66);

        remote.set_offline(false);
        settle().await;
        unit.update(|config| config.high_threshold = 210);
        tokio::time::sleep(DEBOUNCE + Duration::from_millis(50)).await;

        let writes = remote.writes();
        assert_eq!(writes.len(), 2);
        assert_eq!(
            writes[1].value,
            json!({"lowThreshold": 66, "highThreshold": 210})
        );
        assert_eq!(
            remote.document(&session(), &slice()).unwrap()["value"],
            writes[1].value
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_write_result_after_teardown_is_ignored() {
        let remote = Arc::new(SlowFailingRemote {
            inner: ManualRemote::default(),
            delay: DEBOUNCE / 2,
        });
        let unit = unit_with(remote.clone(), LocalCache::in_memory());
        unit.bind(Some(session())).unwrap();
        remote.inner.push(RemoteEvent::Snapshot(None));
        settle().await;

        unit.update(|config| config.low_threshold = 58);
        tokio::time::sleep(DEBOUNCE + Duration::from_millis(50)).await;
        assert_eq!(remote.inner.writes().len(), 1);

        // Rebind while the first write-merge is still in flight
        unit.bind(Some(session())).unwrap();
        remote.inner.push(RemoteEvent::Snapshot(None));
        settle().await;
        unit.update(|config| config.high_threshold = 190);
        assert!(unit.has_pending_write());

        // The stale failure lands inside the new debounce window
        tokio::time::sleep(DEBOUNCE * 6 / 10).await;
        assert!(unit.has_pending_write());
        assert_eq!(unit.phase(), Phase::Synced);
        assert_eq!(unit.read().high_threshold, 190);
        assert_eq!(remote.inner.writes().len(), 1);

        tokio::time::sleep(DEBOUNCE).await;
        assert_eq!(remote.inner.writes().len(), 2);
        assert_eq!(
            remote.inner.writes()[1],
            json!({"lowThreshold": 58, "highThreshold": 190})
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_flush_sends_immediately() {
        let remote = MemoryRemote::new();
        let unit = unit_with(Arc::new(remote.clone()), LocalCache::in_memory());
        unit.bind(Some(session())).unwrap();
        unit.wait_until_synced(Duration::from_secs(1)).await.unwrap();

        unit.update(|config| config.low_threshold = 75);
        unit.flush().await.unwrap();
        assert_eq!(remote.write_count(), 1);

        tokio::time::sleep(DEBOUNCE * 2).await;
        assert_eq!(remote.write_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_bind_reseeds_from_session_namespace() {
        let cache = LocalCache::in_memory();
        let stored = DashboardConfig {
            low_threshold: 90,
            high_threshold: 190,
        };
        cache.set(Some(&session()), &slice(), &stored);

        let unit = unit_with(Arc::new(ManualRemote::default()), cache);
        assert_eq!(unit.read(), DashboardConfig::default());

        unit.bind(Some(session())).unwrap();
        assert_eq!(unit.read(), stored);
        assert_eq!(unit.session(), Some(session()));

        unit.bind(None).unwrap();
        assert_eq!(unit.read(), DashboardConfig::default());
        assert_eq!(unit.phase(), Phase::LocalOnly);
    }

    #[tokio::test(start_paused = true)]
    async fn test_wait_until_synced_times_out() {
        let unit = unit_with(Arc::new(ManualRemote::default()), LocalCache::in_memory());
        unit.bind(Some(session())).unwrap();

        let result = unit.wait_until_synced(Duration::from_secs(2)).await;
        assert_eq!(result, Err(SyncError::Timeout(Duration::from_secs(2))));
    }

    #[test]
    fn test_bind_without_runtime_fails() {
        let unit = unit_with(Arc::new(ManualRemote::default()), LocalCache::in_memory());
        assert_eq!(unit.bind(Some(session())), Err(SyncError::NoRuntime));
        assert_eq!(unit.bind(None), Ok(()));
    }
}
