//! Session scope
//!
//! Owns the current session and every live sync unit created under it.
//! Login, logout and account deletion rebind all units together so no unit
//! keeps writing into a session that is gone.
//!
//! The registry holds units weakly; dropping the last handle to a unit
//! removes it.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

use anyhow::{Context, Result};
use tracing::{debug, info, warn};

use crate::cache::LocalCache;
use crate::config::Config;
use crate::keys::{SessionId, SliceKey};
use crate::remote::{OfflineRemote, RemoteError, RemoteStore, WsRemote, WsRemoteConfig};
use crate::sync::{SliceValue, SyncError, SyncUnit, UnitOptions};

/// A unit the session scope can rebind, independent of its value type
pub trait SessionBound: Send + Sync {
    fn slice_key(&self) -> &SliceKey;

    /// Tear down and rebind to `session` (`None` is guest)
    fn bind_session(&self, session: Option<SessionId>) -> Result<(), SyncError>;

    /// Tear down without changing the cache namespace
    fn unbind_session(&self);
}

/// Outcome of [`SessionScope::delete_account`]
#[derive(Debug, Clone, Default)]
pub struct DeletionReport {
    /// Session whose documents were deleted, if one was logged in
    pub session: Option<SessionId>,
    /// Slices whose remote documents were deleted
    pub deleted: Vec<SliceKey>,
    /// Slices whose remote deletion failed
    pub failed: Vec<(SliceKey, RemoteError)>,
}

impl DeletionReport {
    /// Every remote deletion succeeded
    pub fn is_complete(&self) -> bool {
        self.failed.is_empty()
    }
}

struct ScopeState {
    session: Option<SessionId>,
    units: Vec<Weak<dyn SessionBound>>,
}

impl ScopeState {
    /// Live units, pruning dropped ones
    fn live_units(&mut self) -> Vec<Arc<dyn SessionBound>> {
        self.units.retain(|unit| unit.strong_count() > 0);
        self.units.iter().filter_map(Weak::upgrade).collect()
    }
}

/// The current session and the sync units bound to it
pub struct SessionScope {
    cache: LocalCache,
    remote: Arc<dyn RemoteStore>,
    options: UnitOptions,
    state: Mutex<ScopeState>,
}

impl SessionScope {
    /// Create a scope in guest mode
    pub fn new(cache: LocalCache, remote: Arc<dyn RemoteStore>, options: UnitOptions) -> Self {
        Self {
            cache,
            remote,
            options,
            state: Mutex::new(ScopeState {
                session: None,
                units: Vec::new(),
            }),
        }
    }

    /// Create a scope with the cache and remote described by `config`
    ///
    /// Uses the WebSocket remote when sync is enabled and a URL is set, and
    /// an always-unavailable remote otherwise.
    pub fn from_config(config: &Config) -> Result<Self> {
        let cache = LocalCache::open(config).context("Failed to open local cache")?;
        let remote: Arc<dyn RemoteStore> = match config.active_remote_url() {
            Some(url) => {
                debug!("Using document server at {}", url);
                Arc::new(WsRemote::new(WsRemoteConfig::from(config)))
            }
            None => {
                debug!("Remote sync disabled");
                Arc::new(OfflineRemote)
            }
        };
        Ok(Self::new(cache, remote, UnitOptions::from(config)))
    }

    fn lock(&self) -> MutexGuard<'_, ScopeState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn session(&self) -> Option<SessionId> {
        self.lock().session.clone()
    }

    pub fn cache(&self) -> &LocalCache {
        &self.cache
    }

    pub fn remote(&self) -> &Arc<dyn RemoteStore> {
        &self.remote
    }

    /// Number of live registered units
    pub fn unit_count(&self) -> usize {
        self.lock().live_units().len()
    }

    /// Create a unit, register it and bind it to the current session
    pub fn unit<T: SliceValue>(
        &self,
        slice: SliceKey,
        default: T,
    ) -> Result<SyncUnit<T>, SyncError> {
        let unit = SyncUnit::new(
            slice,
            default,
            self.cache.clone(),
            Arc::clone(&self.remote),
            self.options.clone(),
        );

        let mut state = self.lock();
        if state.session.is_some() {
            unit.bind(state.session.clone())?;
        }
        state.units.push(unit.session_bound());
        Ok(unit)
    }

    /// Switch to `session`, rebinding every unit
    ///
    /// Each unit is reseeded from the new session's cache namespace and
    /// subscribes to its remote document.
    pub fn login(&self, session: SessionId) -> Result<(), SyncError> {
        let mut state = self.lock();
        state.session = Some(session.clone());
        let units = state.live_units();
        info!("Logging in as '{}' ({} units)", session, units.len());

        let mut first_error = None;
        for unit in units {
            if let Err(e) = unit.bind_session(Some(session.clone())) {
                warn!("Failed to bind '{}' to '{}': {}", unit.slice_key(), session, e);
                first_error.get_or_insert(e);
            }
        }
        first_error.map_or(Ok(()), Err)
    }

    /// Return to guest mode
    ///
    /// Unsubscribes every unit, drops pending write-merges and rebinds every
    /// unit to the guest namespace.
    pub fn logout(&self) {
        let mut state = self.lock();
        let Some(previous) = state.session.take() else {
            debug!("Logout requested while already in guest mode");
            return;
        };
        info!("Logging out of '{}'", previous);
        for unit in state.live_units() {
            bind_guest(unit.as_ref());
        }
    }

    /// Delete the account's remote documents and every local trace of it
    ///
    /// Tears down all units first, deletes the remote documents for `slices`
    /// (failures are logged and reported), then clears the whole local cache
    /// and leaves every unit in guest mode. A login that lands while the
    /// deletion is in flight keeps its binding.
    pub async fn delete_account(&self, slices: &[SliceKey]) -> DeletionReport {
        let (session, units) = {
            let mut state = self.lock();
            (state.session.take(), state.live_units())
        };
        for unit in &units {
            unit.unbind_session();
        }

        let mut report = DeletionReport {
            session: session.clone(),
            ..DeletionReport::default()
        };

        match &session {
            Some(session) => {
                for slice in slices {
                    match self.remote.delete(session, slice).await {
                        Ok(()) => {
                            debug!("Deleted remote document '{}/{}'", session, slice);
                            report.deleted.push(slice.clone());
                        }
                        Err(e) => {
                            warn!(
                                "Failed to delete remote document '{}/{}': {}",
                                session, slice, e
                            );
                            report.failed.push((slice.clone(), e));
                        }
                    }
                }
            }
            None => debug!("No session; skipping remote deletion"),
        }

        self.cache.clear_all();

        // A login during the deletion already rebound every unit
        {
            let mut state = self.lock();
            if let Some(current) = state.session.clone() {
                debug!(
                    "Session '{}' started during account deletion; keeping its binding",
                    current
                );
            } else {
                for unit in state.live_units() {
                    bind_guest(unit.as_ref());
                }
            }
        }

        info!(
            "Account deletion finished: {} deleted, {} failed",
            report.deleted.len(),
            report.failed.len()
        );
        report
    }
}

fn bind_guest(unit: &dyn SessionBound) {
    // Guest binding never needs a runtime
    if let Err(e) = unit.bind_session(None) {
        warn!("Failed to rebind '{}' to guest: {}", unit.slice_key(), e);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::remote::{EventSink, MemoryRemote, RemoteFuture, Subscription};
    use crate::slices::{known_slices, DashboardConfig, DASHBOARD_CONFIG, PROFILE};
    use crate::sync::Phase;
    use futures_util::FutureExt;
    use serde_json::{json, Value};
    use std::time::Duration;

    const DEBOUNCE: Duration = Duration::from_millis(1000);

    fn session() -> SessionId {
        SessionId::new("u1").unwrap()
    }

    fn slice(name: &str) -> SliceKey {
        SliceKey::new(name).unwrap()
    }

    fn scope_with(remote: Arc<dyn RemoteStore>, cache: LocalCache) -> SessionScope {
        SessionScope::new(cache, remote, UnitOptions { debounce: DEBOUNCE })
    }

    /// Remote whose deletes take `delay` to complete
    struct SlowDeleteRemote {
        inner: MemoryRemote,
        delay: Duration,
    }

    impl RemoteStore for SlowDeleteRemote {
        fn subscribe(
            &self,
            session: &SessionId,
            slice: &SliceKey,
            sink: EventSink,
        ) -> Subscription {
            self.inner.subscribe(session, slice, sink)
        }

        fn write_merge(&self, session: &SessionId, slice: &SliceKey, value: Value) -> RemoteFuture {
            self.inner.write_merge(session, slice, value)
        }

        fn delete(&self, session: &SessionId, slice: &SliceKey) -> RemoteFuture {
            let delete = self.inner.delete(session, slice);
            let delay = self.delay;
            async move {
                tokio::time::sleep(delay).await;
                delete.await
            }
            .boxed()
        }
    }

    /// Records how many cache entries existed when each delete was issued
    struct OrderingRemote {
        inner: MemoryRemote,
        cache: LocalCache,
        cache_sizes: Mutex<Vec<usize>>,
    }

    impl RemoteStore for OrderingRemote {
        fn subscribe(
            &self,
            session: &SessionId,
            slice: &SliceKey,
            sink: EventSink,
        ) -> Subscription {
            self.inner.subscribe(session, slice, sink)
        }

        fn write_merge(&self, session: &SessionId, slice: &SliceKey, value: Value) -> RemoteFuture {
            self.inner.write_merge(session, slice, value)
        }

        fn delete(&self, session: &SessionId, slice: &SliceKey) -> RemoteFuture {
            let size = self.cache.keys().unwrap().len();
            self.cache_sizes.lock().unwrap().push(size);
            self.inner.delete(session, slice)
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_guest_units_never_subscribe() {
        let remote = MemoryRemote::new();
        let scope = scope_with(Arc::new(remote.clone()), LocalCache::in_memory());

        let unit = scope
            .unit(slice(DASHBOARD_CONFIG), DashboardConfig::default())
            .unwrap();
        unit.update(|config| config.low_threshold = 60);
        tokio::time::sleep(DEBOUNCE * 2).await;

        assert_eq!(unit.phase(), Phase::LocalOnly);
        assert_eq!(remote.write_count(), 0);

        let again = scope
            .unit(slice(DASHBOARD_CONFIG), DashboardConfig::default())
            .unwrap();
        assert_eq!(again.read().low_threshold, 60);
    }

    #[tokio::test(start_paused = true)]
    async fn test_login_binds_and_logout_unbinds() {
        let remote = MemoryRemote::new();
        let scope = scope_with(Arc::new(remote.clone()), LocalCache::in_memory());
        let unit = scope
            .unit(slice(DASHBOARD_CONFIG), DashboardConfig::default())
            .unwrap();

        scope.login(session()).unwrap();
        unit.wait_until_synced(Duration::from_secs(1)).await.unwrap();
        assert_eq!(remote.subscriber_count(&session(), &slice(DASHBOARD_CONFIG)), 1);

        // Units created after login bind immediately
        let profile = scope.unit(slice(PROFILE), json!({})).unwrap();
        assert_eq!(profile.session(), Some(session()));

        scope.logout();
        assert_eq!(scope.session(), None);
        assert_eq!(unit.phase(), Phase::LocalOnly);
        assert_eq!(unit.session(), None);
        assert_eq!(remote.subscriber_count(&session(), &slice(DASHBOARD_CONFIG)), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_logout_cancels_pending_writes() {
        let remote = MemoryRemote::new();
        let scope = scope_with(Arc::new(remote.clone()), LocalCache::in_memory());
        let unit = scope
            .unit(slice(DASHBOARD_CONFIG), DashboardConfig::default())
            .unwrap();
        scope.login(session()).unwrap();
        unit.wait_until_synced(Duration::from_secs(1)).await.unwrap();

        unit.update(|config| config.high_threshold = 250);
        tokio::time::sleep(DEBOUNCE / 2).await;
        scope.logout();
        tokio::time::sleep(DEBOUNCE * 2).await;

        assert_eq!(remote.write_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_login_reseeds_from_session_namespace() {
        let cache = LocalCache::in_memory();
        let stored = DashboardConfig {
            low_threshold: 85,
            high_threshold: 200,
        };
        cache.set(Some(&session()), &slice(DASHBOARD_CONFIG), &stored);

        let scope = scope_with(Arc::new(MemoryRemote::new()), cache);
        let unit = scope
            .unit(slice(DASHBOARD_CONFIG), DashboardConfig::default())
            .unwrap();
        assert_eq!(unit.read(), DashboardConfig::default());

        scope.login(session()).unwrap();
        assert_eq!(unit.read(), stored);
    }

    #[tokio::test(start_paused = true)]
    async fn test_delete_account_deletes_remote_before_clearing_cache() {
        let cache = LocalCache::in_memory();
        let remote = Arc::new(OrderingRemote {
            inner: MemoryRemote::new(),
            cache: cache.clone(),
            cache_sizes: Mutex::new(Vec::new()),
        });
        for slice in known_slices() {
            remote.inner.merge_from_peer(&session(), &slice, json!([1]));
        }

        let scope = scope_with(remote.clone(), cache.clone());
        let unit = scope
            .unit(slice(DASHBOARD_CONFIG), DashboardConfig::default())
            .unwrap();
        scope.login(session()).unwrap();
        unit.wait_until_synced(Duration::from_secs(1)).await.unwrap();
        unit.write(DashboardConfig {
            low_threshold: 65,
            high_threshold: 180,
        });

        let report = scope.delete_account(&known_slices()).await;

        assert!(report.is_complete());
        assert_eq!(report.session, Some(session()));
        assert_eq!(report.deleted.len(), known_slices().len());
        for slice in known_slices() {
            assert!(remote.inner.document(&session(), &slice).is_none());
        }

        let sizes = remote.cache_sizes.lock().unwrap().clone();
        assert_eq!(sizes.len(), known_slices().len());
        assert!(sizes.iter().all(|size| *size > 0));

        // Guest rebinding may persist nothing until the next write
        assert!(cache.slices(Some(&session())).unwrap().is_empty());
        assert_eq!(unit.phase(), Phase::LocalOnly);
        assert_eq!(unit.read(), DashboardConfig::default());
        assert_eq!(scope.session(), None);

        tokio::time::sleep(DEBOUNCE * 2).await;
        assert_eq!(remote.inner.write_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_delete_account_reports_failures() {
        let remote = MemoryRemote::new();
        let scope = scope_with(Arc::new(remote.clone()), LocalCache::in_memory());
        scope.login(session()).unwrap();
        remote.set_offline(true);

        let report = scope.delete_account(&known_slices()).await;

        assert!(!report.is_complete());
        assert_eq!(report.failed.len(), known_slices().len());
        assert!(report.deleted.is_empty());
    }

    #[tokio::test]
    async fn test_dropped_units_are_pruned() {
        let scope = scope_with(Arc::new(MemoryRemote::new()), LocalCache::in_memory());
        let unit = scope.unit(slice(PROFILE), json!({})).unwrap();
        assert_eq!(scope.unit_count(), 1);

        drop(unit);
        assert_eq!(scope.unit_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_login_during_account_deletion_keeps_new_session() {
        let remote = MemoryRemote::new();
        let scope = Arc::new(scope_with(
            Arc::new(SlowDeleteRemote {
                inner: remote.clone(),
                delay: Duration::from_secs(1),
            }),
            LocalCache::in_memory(),
        ));
        let unit = scope
            .unit(slice(DASHBOARD_CONFIG), DashboardConfig::default())
            .unwrap();
        scope.login(session()).unwrap();

        let deleting = tokio::spawn({
            let scope = Arc::clone(&scope);
            async move { scope.delete_account(&[slice(DASHBOARD_CONFIG)]).await }
        });
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(unit.phase(), Phase::LocalOnly);

        let next = SessionId::new("u2").unwrap();
        scope.login(next.clone()).unwrap();
        let report = deleting.await.unwrap();

        assert_eq!(report.session, Some(session()));
        assert_eq!(scope.session(), Some(next.clone()));
        assert_eq!(unit.session(), Some(next.clone()));
        assert_ne!(unit.phase(), Phase::LocalOnly);
        assert_eq!(remote.subscriber_count(&next, &slice(DASHBOARD_CONFIG)), 1);
    }
}
