// Build Persistence
// Build records and the storage/locking contract the lifecycle engine depends on

pub mod memory;

pub use memory::InMemoryBuildStore;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;
use thiserror::Error;

/// Opaque build identity
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct BuildId(pub i64);

impl fmt::Display for BuildId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Persisted build status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BuildStatus {
    Pending,
    Started,
    Succeeded,
    Failed,
    Errored,
    Aborted,
}

impl BuildStatus {
    /// Whether the build can no longer make progress
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            BuildStatus::Succeeded | BuildStatus::Failed | BuildStatus::Errored | BuildStatus::Aborted
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            BuildStatus::Pending => "pending",
            BuildStatus::Started => "started",
            BuildStatus::Succeeded => "succeeded",
            BuildStatus::Failed => "failed",
            BuildStatus::Errored => "errored",
            BuildStatus::Aborted => "aborted",
        }
    }
}

impl fmt::Display for BuildStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Snapshot of a persisted build row
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BuildRecord {
    pub id: BuildId,
    pub name: String,
    pub pipeline_name: Option<String>,
    pub job_name: Option<String>,
    pub status: BuildStatus,
    /// Name of the engine responsible for the build; empty until started
    pub engine: String,
    /// Engine-specific metadata, opaque to the lifecycle engine
    pub engine_metadata: String,
    pub start_time: Option<DateTime<Utc>>,
    pub end_time: Option<DateTime<Utc>>,
    /// Set once the final status has been recorded
    pub completed: bool,
}

impl BuildRecord {
    /// A fresh pending build
    pub fn new(id: BuildId, name: impl Into<String>) -> Self {
        Self {
            id,
            name: name.into(),
            pipeline_name: None,
            job_name: None,
            status: BuildStatus::Pending,
            engine: String::new(),
            engine_metadata: String::new(),
            start_time: None,
            end_time: None,
            completed: false,
        }
    }

    /// Whether the build is still pending or started
    pub fn is_running(&self) -> bool {
        !self.status.is_terminal()
    }

    pub fn has_engine(&self) -> bool {
        !self.engine.is_empty()
    }

    /// Wall-clock run time, available once both timestamps are recorded
    pub fn duration(&self) -> Option<Duration> {
        match (self.start_time, self.end_time) {
            (Some(start), Some(end)) => (end - start).to_std().ok(),
            _ => None,
        }
    }
}

/// Errors raised by a build store
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Build not found: {0}")]
    BuildNotFound(BuildId),

    #[error("Store backend error: {0}")]
    Backend(String),
}

/// A held tracking lock. Releasing it twice is harmless.
pub trait TrackingLock: Send + Sync {
    fn release(&self);
}

/// Releases the wrapped lock exactly once, when dropped or explicitly released
pub struct TrackingLockGuard {
    lock: Option<Box<dyn TrackingLock>>,
}

impl TrackingLockGuard {
    pub fn new(lock: Box<dyn TrackingLock>) -> Self {
        Self { lock: Some(lock) }
    }

    /// Release now instead of at end of scope
    pub fn release(mut self) {
        if let Some(lock) = self.lock.take() {
            lock.release();
        }
    }
}

impl Drop for TrackingLockGuard {
    fn drop(&mut self) {
        if let Some(lock) = self.lock.take() {
            lock.release();
        }
    }
}

impl fmt::Debug for TrackingLockGuard {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TrackingLockGuard")
            .field("held", &self.lock.is_some())
            .finish()
    }
}

/// Subscription to a build's abort channel
#[async_trait]
pub trait AbortNotifier: Send {
    /// Resolve once an abort has been requested, including one requested before subscribing
    async fn notified(&mut self);

    /// Stop listening
    fn close(&mut self);
}

/// Persistence and locking collaborator of the lifecycle engine
#[async_trait]
pub trait BuildStore: Send + Sync {
    /// Load the current state of a build; `None` once it has been deleted
    async fn reload(&self, id: BuildId) -> Result<Option<BuildRecord>, StoreError>;

    /// Compare-and-set transition from `pending` to `started`, recording the engine and
    /// its metadata. Returns `false` when the build was no longer pending (e.g. aborted).
    async fn start_build(
        &self,
        id: BuildId,
        engine: &str,
        metadata: &str,
    ) -> Result<bool, StoreError>;

    /// Record the final status of a build. Later calls for a completed build are no-ops.
    async fn finish_build(&self, id: BuildId, status: BuildStatus) -> Result<(), StoreError>;

    /// Persist an abort request and notify subscribers
    async fn abort_build(&self, id: BuildId) -> Result<(), StoreError>;

    /// Try to take the tracking lock without waiting. `None` means someone else holds it.
    async fn acquire_tracking_lock(
        &self,
        id: BuildId,
        lease: Duration,
    ) -> Result<Option<TrackingLockGuard>, StoreError>;

    /// Subscribe to abort requests for a build
    async fn abort_notifier(&self, id: BuildId) -> Result<Box<dyn AbortNotifier>, StoreError>;
}
