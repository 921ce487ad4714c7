// In-Memory Build Store
// Process-local implementation of the build store with leased tracking locks

use super::{
    AbortNotifier, BuildId, BuildRecord, BuildStatus, BuildStore, StoreError, TrackingLock,
    TrackingLockGuard,
};
use crate::signals;

use async_trait::async_trait;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use uuid::Uuid;

/// A lease on a build's tracking lock
#[derive(Debug, Clone)]
struct Lease {
    token: Uuid,
    expires_at: DateTime<Utc>,
}

#[derive(Default)]
struct State {
    next_id: i64,
    builds: HashMap<BuildId, BuildRecord>,
    leases: HashMap<BuildId, Lease>,
    aborts: HashMap<BuildId, watch::Sender<bool>>,
}

impl State {
    fn abort_channel(&mut self, id: BuildId) -> &watch::Sender<bool> {
        self.aborts
            .entry(id)
            .or_insert_with(|| watch::channel(false).0)
    }
}

#[derive(Default)]
struct Inner {
    state: Mutex<State>,
}

impl Inner {
    fn state(&self) -> MutexGuard<'_, State> {
        // a poisoned map is still structurally valid
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// Build store keeping rows, leases and abort channels in memory
#[derive(Clone, Default)]
pub struct InMemoryBuildStore {
    inner: Arc<Inner>,
}

impl InMemoryBuildStore {
    /// Create an empty store
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a pending build, as the scheduler would
    pub fn create_build(&self, pipeline_name: Option<&str>, job_name: Option<&str>) -> BuildRecord {
        let mut state = self.inner.state();
        state.next_id += 1;
        let id = BuildId(state.next_id);

        let mut build = BuildRecord::new(id, id.to_string());
        build.pipeline_name = pipeline_name.map(str::to_string);
        build.job_name = job_name.map(str::to_string);

        state.builds.insert(id, build.clone());
        build
    }

    /// Insert or replace a build row verbatim
    pub fn insert_build(&self, build: BuildRecord) {
        let mut state = self.inner.state();
        state.next_id = state.next_id.max(build.id.0);
        state.builds.insert(build.id, build);
    }

    /// Delete a build row along with its abort channel
    pub fn remove_build(&self, id: BuildId) -> Option<BuildRecord> {
        let mut state = self.inner.state();
        state.aborts.remove(&id);
        state.builds.remove(&id)
    }

    /// Whether an unexpired lease is currently held for the build
    pub fn is_tracked(&self, id: BuildId) -> bool {
        self.inner
            .state()
            .leases
            .get(&id)
            .map(|lease| lease.expires_at > Utc::now())
            .unwrap_or(false)
    }
}

#[async_trait]
impl BuildStore for InMemoryBuildStore {
    async fn reload(&self, id: BuildId) -> Result<Option<BuildRecord>, StoreError> {
        Ok(self.inner.state().builds.get(&id).cloned())
    }

    async fn start_build(
        &self,
        id: BuildId,
        engine: &str,
        metadata: &str,
    ) -> Result<bool, StoreError> {
        let mut state = self.inner.state();
        let Some(build) = state.builds.get_mut(&id) else {
            return Ok(false);
        };

        if build.status != BuildStatus::Pending {
            return Ok(false);
        }

        build.status = BuildStatus::Started;
        build.engine = engine.to_string();
        build.engine_metadata = metadata.to_string();
        build.start_time = Some(Utc::now());
        Ok(true)
    }

    async fn finish_build(&self, id: BuildId, status: BuildStatus) -> Result<(), StoreError> {
        let mut state = self.inner.state();
        let Some(build) = state.builds.get_mut(&id) else {
            return Ok(());
        };

        if build.completed {
            return Ok(());
        }

        build.status = status;
        build.completed = true;
        build.end_time = Some(Utc::now());

        // notifiers on a dropped channel never fire
        state.aborts.remove(&id);
        Ok(())
    }

    async fn abort_build(&self, id: BuildId) -> Result<(), StoreError> {
        let mut state = self.inner.state();
        let transitioned = match state.builds.get_mut(&id) {
            Some(build) if !build.status.is_terminal() => {
                build.status = BuildStatus::Aborted;
                true
            }
            _ => false,
        };

        if transitioned {
            state.abort_channel(id).send_replace(true);
        }
        Ok(())
    }

    async fn acquire_tracking_lock(
        &self,
        id: BuildId,
        lease: Duration,
    ) -> Result<Option<TrackingLockGuard>, StoreError> {
        if lease.is_zero() {
            return Err(StoreError::Backend(
                "tracking lock lease must be greater than zero".to_string(),
            ));
        }
        let ttl = ChronoDuration::from_std(lease).map_err(|e| StoreError::Backend(e.to_string()))?;
        let token = Uuid::new_v4();

        {
            let mut state = self.inner.state();
            let now = Utc::now();
            if let Some(held) = state.leases.get(&id) {
                if held.expires_at > now {
                    return Ok(None);
                }
            }
            state.leases.insert(
                id,
                Lease {
                    token,
                    expires_at: now + ttl,
                },
            );
        }

        let renewal = tokio::spawn(renew_lease(Arc::downgrade(&self.inner), id, token, lease));

        Ok(Some(TrackingLockGuard::new(Box::new(MemoryLock {
            inner: Arc::downgrade(&self.inner),
            id,
            token,
            renewal,
        }))))
    }

    async fn abort_notifier(&self, id: BuildId) -> Result<Box<dyn AbortNotifier>, StoreError> {
        let mut state = self.inner.state();
        let (aborted, live) = state
            .builds
            .get(&id)
            .map(|build| (build.status == BuildStatus::Aborted, !build.completed))
            .unwrap_or((false, false));

        if !live {
            // finished or missing builds get a detached channel frozen at their abort state
            let (_, receiver) = watch::channel(aborted);
            return Ok(Box::new(MemoryAbortNotifier {
                receiver: Some(receiver),
            }));
        }

        let channel = state.abort_channel(id);
        if aborted {
            channel.send_replace(true);
        }

        Ok(Box::new(MemoryAbortNotifier {
            receiver: Some(channel.subscribe()),
        }))
    }
}

/// Keep extending a lease while its holder is alive
async fn renew_lease(inner: Weak<Inner>, id: BuildId, token: Uuid, lease: Duration) {
    let period = (lease / 2).max(Duration::from_millis(10));
    let Ok(ttl) = ChronoDuration::from_std(lease) else {
        return;
    };

    let mut interval = tokio::time::interval(period);
    interval.tick().await;

    loop {
        interval.tick().await;

        let Some(inner) = inner.upgrade() else {
            return;
        };
        let mut state = inner.state();
        match state.leases.get_mut(&id) {
            Some(held) if held.token == token => {
                held.expires_at = Utc::now() + ttl;
            }
            _ => return,
        }
    }
}

struct MemoryLock {
    inner: Weak<Inner>,
    id: BuildId,
    token: Uuid,
    renewal: JoinHandle<()>,
}

impl TrackingLock for MemoryLock {
    fn release(&self) {
        self.renewal.abort();

        let Some(inner) = self.inner.upgrade() else {
            return;
        };
        let mut state = inner.state();
        if state.leases.get(&self.id).map(|held| held.token) == Some(self.token) {
            state.leases.remove(&self.id);
        }
    }
}

struct MemoryAbortNotifier {
    receiver: Option<watch::Receiver<bool>>,
}

#[async_trait]
impl AbortNotifier for MemoryAbortNotifier {
    async fn notified(&mut self) {
        match self.receiver.as_mut() {
            Some(receiver) => signals::cancelled(receiver).await,
            None => std::future::pending::<()>().await,
        }
    }

    fn close(&mut self) {
        self.receiver = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const LEASE: Duration = Duration::from_secs(60);

    #[tokio::test]
    async fn test_start_is_compare_and_set() {
        let store = InMemoryBuildStore::new();
        let build = store.create_build(Some("main"), Some("unit"));

        assert!(store.start_build(build.id, "exec", "{}").await.unwrap());
        assert!(!store.start_build(build.id, "exec", "{}").await.unwrap());

        let reloaded = store.reload(build.id).await.unwrap().unwrap();
        assert_eq!(reloaded.status, BuildStatus::Started);
        assert_eq!(reloaded.engine, "exec");
        assert!(reloaded.start_time.is_some());
    }

    #[tokio::test]
    async fn test_start_fails_after_abort() {
        let store = InMemoryBuildStore::new();
        let build = store.create_build(None, None);

        store.abort_build(build.id).await.unwrap();

        assert!(!store.start_build(build.id, "exec", "{}").await.unwrap());
        let reloaded = store.reload(build.id).await.unwrap().unwrap();
        assert_eq!(reloaded.status, BuildStatus::Aborted);
        assert!(reloaded.engine.is_empty());
    }

    #[tokio::test]
    async fn test_finish_records_status_once() {
        let store = InMemoryBuildStore::new();
        let build = store.create_build(None, None);

        store.finish_build(build.id, BuildStatus::Aborted).await.unwrap();
        store.finish_build(build.id, BuildStatus::Errored).await.unwrap();

        let reloaded = store.reload(build.id).await.unwrap().unwrap();
        assert_eq!(reloaded.status, BuildStatus::Aborted);
        assert!(reloaded.completed);
        assert!(reloaded.end_time.is_some());
    }

    #[tokio::test]
    async fn test_abort_leaves_terminal_builds_alone() {
        let store = InMemoryBuildStore::new();
        let build = store.create_build(None, None);
        store.finish_build(build.id, BuildStatus::Succeeded).await.unwrap();

        store.abort_build(build.id).await.unwrap();

        let reloaded = store.reload(build.id).await.unwrap().unwrap();
        assert_eq!(reloaded.status, BuildStatus::Succeeded);
    }

    #[tokio::test]
    async fn test_tracking_lock_is_exclusive_until_released() {
        let store = InMemoryBuildStore::new();
        let build = store.create_build(None, None);

        let guard = store
            .acquire_tracking_lock(build.id, LEASE)
            .await
            .unwrap()
            .expect("first acquire");
        assert!(store.is_tracked(build.id));
        assert!(store
            .acquire_tracking_lock(build.id, LEASE)
            .await
            .unwrap()
            .is_none());

        drop(guard);

        assert!(!store.is_tracked(build.id));
        assert!(store
            .acquire_tracking_lock(build.id, LEASE)
            .await
            .unwrap()
            .is_some());
    }

    #[tokio::test]
    async fn test_expired_lease_can_be_taken_over() {
        let store = InMemoryBuildStore::new();
        let id = BuildId(9);
        store.inner.state().leases.insert(
            id,
            Lease {
                token: Uuid::new_v4(),
                expires_at: Utc::now() - ChronoDuration::seconds(1),
            },
        );

        assert!(store
            .acquire_tracking_lock(id, LEASE)
            .await
            .unwrap()
            .is_some());
    }

    #[tokio::test]
    async fn test_held_lease_is_renewed() {
        let store = InMemoryBuildStore::new();
        let build = store.create_build(None, None);
        let lease = Duration::from_millis(100);

        let _guard = store
            .acquire_tracking_lock(build.id, lease)
            .await
            .unwrap()
            .expect("acquired");

        tokio::time::sleep(Duration::from_millis(250)).await;

        assert!(store.is_tracked(build.id));
        assert!(store
            .acquire_tracking_lock(build.id, lease)
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn test_abort_notifier_is_level_triggered() {
        let store = InMemoryBuildStore::new();
        let build = store.create_build(None, None);

        store.abort_build(build.id).await.unwrap();

        let mut notifier = store.abort_notifier(build.id).await.unwrap();
        tokio::time::timeout(Duration::from_millis(100), notifier.notified())
            .await
            .expect("late subscriber still sees the abort");
    }

    #[tokio::test]
    async fn test_abort_notifier_fires_for_running_subscriber() {
        let store = InMemoryBuildStore::new();
        let build = store.create_build(None, None);
        store.start_build(build.id, "exec", "{}").await.unwrap();

        let mut notifier = store.abort_notifier(build.id).await.unwrap();
        let waiter = tokio::spawn(async move { notifier.notified().await });

        store.abort_build(build.id).await.unwrap();

        tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .expect("notified")
            .unwrap();
    }

    #[tokio::test]
    async fn test_closed_notifier_never_fires() {
        let store = InMemoryBuildStore::new();
        let build = store.create_build(None, None);

        let mut notifier = store.abort_notifier(build.id).await.unwrap();
        notifier.close();
        store.abort_build(build.id).await.unwrap();

        let result = tokio::time::timeout(Duration::from_millis(50), notifier.notified()).await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn test_zero_lease_is_refused() {
        let store = InMemoryBuildStore::new();
        let build = store.create_build(None, None);

        let result = store.acquire_tracking_lock(build.id, Duration::ZERO).await;

        assert!(matches!(result, Err(StoreError::Backend(_))));
        assert!(!store.is_tracked(build.id));
    }

    #[tokio::test]
    async fn test_abort_channels_are_dropped_with_the_build() {
        let store = InMemoryBuildStore::new();
        let finished = store.create_build(None, None);
        let removed = store.create_build(None, None);

        let _first = store.abort_notifier(finished.id).await.unwrap();
        let _second = store.abort_notifier(removed.id).await.unwrap();
        assert_eq!(store.inner.state().aborts.len(), 2);

        store.finish_build(finished.id, BuildStatus::Succeeded).await.unwrap();
        store.remove_build(removed.id);
        assert!(store.inner.state().aborts.is_empty());

        // late subscribers don't bring the channels back
        let _late = store.abort_notifier(finished.id).await.unwrap();
        let _gone = store.abort_notifier(removed.id).await.unwrap();
        assert!(store.inner.state().aborts.is_empty());
    }

    #[tokio::test]
    async fn test_finished_aborted_build_still_notifies() {
        let store = InMemoryBuildStore::new();
        let build = store.create_build(None, None);
        store.abort_build(build.id).await.unwrap();
        store.finish_build(build.id, BuildStatus::Aborted).await.unwrap();

        let mut notifier = store.abort_notifier(build.id).await.unwrap();
        tokio::time::timeout(Duration::from_secs(1), notifier.notified())
            .await
            .expect("aborted build notifies at once");
    }

    #[tokio::test]
    async fn test_removed_build_reloads_as_missing() {
        let store = InMemoryBuildStore::new();
        let build = store.create_build(None, None);
        store.remove_build(build.id);

        assert!(store.reload(build.id).await.unwrap().is_none());
        assert!(!store.start_build(build.id, "exec", "").await.unwrap());
        store.finish_build(build.id, BuildStatus::Aborted).await.unwrap();
        store.abort_build(build.id).await.unwrap();
    }
}
