// DB Engine
// Tracks persisted builds: at most one active tracker per build, race-free abort

use super::{EngineBuild, EngineError, Engines, UnknownEngineError};
use crate::db::{AbortNotifier, BuildId, BuildRecord, BuildStatus, BuildStore, StoreError};
use crate::events::{BuildEvent, EventSender, ProgressSender};
use crate::plan::{Plan, PublicPlan};

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::oneshot;
use tracing::{debug, error, info, info_span, Instrument};

/// Default lease on a build's tracking lock
pub const TRACK_LEASE_DURATION: Duration = Duration::from_secs(60);

/// Lifecycle engine wrapping persisted builds around the registered engines
#[derive(Clone)]
pub struct DbEngine {
    engines: Engines,
    store: Arc<dyn BuildStore>,
    event_tx: Option<ProgressSender>,
    track_lease: Duration,
}

impl DbEngine {
    /// Create a lifecycle engine over a registry and a build store
    pub fn new(engines: Engines, store: Arc<dyn BuildStore>) -> Self {
        Self {
            engines,
            store,
            event_tx: None,
            track_lease: TRACK_LEASE_DURATION,
        }
    }

    /// Set progress event sender
    pub fn with_progress(mut self, tx: ProgressSender) -> Self {
        self.event_tx = Some(tx);
        self
    }

    /// Override the tracking lock lease
    pub fn with_track_lease(mut self, lease: Duration) -> Self {
        self.track_lease = lease;
        self
    }

    pub fn name(&self) -> &str {
        "db"
    }

    /// Create the engine-specific build and try to mark the persisted build as started.
    ///
    /// If the build was aborted in the meantime the start fails and the freshly created
    /// engine build is aborted straight away. Either way the caller gets a handle.
    pub async fn create_build(&self, build: BuildRecord, plan: &Plan) -> Result<DbBuild, EngineError> {
        let span = info_span!("create-build", build_id = %build.id);
        async {
            let engine = self.engines.first().ok_or(EngineError::NoEngines)?;

            let created = engine.create_build(&build, plan).await.map_err(|err| {
                error!(error = %err, "failed to create build in engine");
                err
            })?;

            let started = self
                .store
                .start_build(build.id, engine.name(), &created.metadata())
                .await
                .map_err(|err| {
                    error!(error = %err, "failed to mark build as started");
                    err
                })?;

            if !started {
                info!("build was aborted before starting; aborting immediately");
                self.event_tx.send_event(BuildEvent::info(
                    "build was aborted before it started",
                    Some(build.id),
                ));
                if let Err(err) = created.abort().await {
                    error!(error = %err, "failed to abort build that never started");
                }
            }

            Ok(self.handle(build))
        }
        .instrument(span)
        .await
    }

    /// Wrap an existing persisted build
    pub async fn lookup_build(&self, build: BuildRecord) -> Result<DbBuild, EngineError> {
        if build.has_engine() && self.engines.lookup(&build.engine).is_none() {
            error!(build_id = %build.id, engine = %build.engine, "unknown build engine");
            return Err(UnknownEngineError {
                engine: build.engine,
            }
            .into());
        }

        Ok(self.handle(build))
    }

    fn handle(&self, build: BuildRecord) -> DbBuild {
        DbBuild {
            engines: self.engines.clone(),
            store: self.store.clone(),
            event_tx: self.event_tx.clone(),
            track_lease: self.track_lease,
            build,
        }
    }
}

/// Lifecycle-managed handle on a persisted build
#[derive(Clone)]
pub struct DbBuild {
    engines: Engines,
    store: Arc<dyn BuildStore>,
    event_tx: Option<ProgressSender>,
    track_lease: Duration,
    build: BuildRecord,
}

impl DbBuild {
    pub fn id(&self) -> BuildId {
        self.build.id
    }

    /// The build row as it was when this handle was made
    pub fn build(&self) -> &BuildRecord {
        &self.build
    }

    pub fn metadata(&self) -> String {
        self.build.id.to_string()
    }

    /// Public plan of the build, as reported by the engine running it
    pub async fn public_plan(&self) -> Result<PublicPlan, EngineError> {
        let build = self
            .store
            .reload(self.build.id)
            .await?
            .ok_or(StoreError::BuildNotFound(self.build.id))?;

        let Some(engine) = self.engines.lookup(&build.engine) else {
            error!(build_id = %build.id, engine = %build.engine, "unknown build engine");
            return Err(UnknownEngineError {
                engine: build.engine,
            }
            .into());
        };

        let engine_build = engine.lookup_build(&build).await?;
        engine_build.public_plan().await
    }

    /// Abort the build.
    ///
    /// When another process tracks the build only the abort request is persisted; that
    /// tracker hears about it and aborts the engine build itself.
    pub async fn abort(&self) -> Result<(), EngineError> {
        let span = info_span!("abort", build_id = %self.build.id);
        self.abort_build().instrument(span).await
    }

    async fn abort_build(&self) -> Result<(), EngineError> {
        let id = self.build.id;

        // the order below avoids racing with create_build

        let lock = self
            .store
            .acquire_tracking_lock(id, self.track_lease)
            .await
            .map_err(|err| {
                error!(error = %err, "failed to get lock");
                err
            })?;

        let Some(_lock) = lock else {
            info!("notifying other tracker");
            return Ok(self.store.abort_build(id).await?);
        };

        // nobody is tracking the build; persist the status first so a concurrent
        // start sees the conflict and aborts its own engine build
        self.store.abort_build(id).await.map_err(|err| {
            error!(error = %err, "failed to abort in database");
            err
        })?;

        // reload *after* saving the status to see whether it had already started
        let build = match self.store.reload(id).await {
            Ok(Some(build)) => build,
            Ok(None) => {
                info!("build not found");
                return Ok(());
            }
            Err(err) => {
                error!(error = %err, "failed to get build from database");
                return Err(err.into());
            }
        };

        if !build.has_engine() {
            // create_build has not started it yet and will see the conflict; finish
            // here so the abort is recorded even though nothing ran
            info!("finishing build with no engine");
            return Ok(self.store.finish_build(id, BuildStatus::Aborted).await?);
        }

        let Some(engine) = self.engines.lookup(&build.engine) else {
            error!(engine = %build.engine, "unknown build engine");
            return Err(UnknownEngineError {
                engine: build.engine,
            }
            .into());
        };

        let engine_build = engine.lookup_build(&build).await.map_err(|err| {
            error!(error = %err, "failed to lookup build in engine");
            err
        })?;

        engine_build.abort().await
    }

    /// Take over tracking of the build and run it to completion.
    ///
    /// Never fails: problems are logged and the build is left for a later attempt, or
    /// marked errored when its engine cannot be resolved.
    pub async fn resume(&self) {
        let span = info_span!("resume", build_id = %self.build.id);
        self.track().instrument(span).await
    }

    async fn track(&self) {
        let id = self.build.id;

        let lock = match self.store.acquire_tracking_lock(id, self.track_lease).await {
            Ok(lock) => lock,
            Err(err) => {
                error!(error = %err, "failed to get lock");
                return;
            }
        };

        let Some(_lock) = lock else {
            debug!("build already tracked");
            return;
        };

        let build = match self.store.reload(id).await {
            Ok(Some(build)) => build,
            Ok(None) => {
                info!("build not found");
                return;
            }
            Err(err) => {
                error!(error = %err, "failed to load build from database");
                return;
            }
        };

        if !build.has_engine() {
            info!("build has no engine");
            return;
        }

        if !build.is_running() {
            info!(status = %build.status, "build already finished");
            return;
        }

        let Some(engine) = self.engines.lookup(&build.engine) else {
            error!(engine = %build.engine, "unknown build engine");
            self.finish_with_error(id, &format!("unknown engine '{}'", build.engine))
                .await;
            return;
        };

        let engine_build = match engine.lookup_build(&build).await {
            Ok(engine_build) => engine_build,
            Err(err) => {
                error!(error = %err, "failed to lookup build from engine");
                self.finish_with_error(id, &err.to_string()).await;
                return;
            }
        };

        let notifier = match self.store.abort_notifier(id).await {
            Ok(notifier) => notifier,
            Err(err) => {
                error!(error = %err, "failed to listen for aborts");
                return;
            }
        };

        let (done_tx, done_rx) = oneshot::channel();
        let watcher = tokio::spawn(
            watch_aborts(notifier, engine_build.clone(), done_rx, self.event_tx.clone(), id)
                .instrument(info_span!("watch-aborts", build_id = %id)),
        );

        self.event_tx.send_event(BuildEvent::build_started(&build));

        info!(
            pipeline = build.pipeline_name.as_deref().unwrap_or_default(),
            job = build.job_name.as_deref().unwrap_or_default(),
            "running"
        );
        engine_build.resume().await;

        let _ = done_tx.send(());
        if let Err(err) = watcher.await {
            error!(error = %err, "abort watcher failed");
        }

        match self.store.reload(id).await {
            Ok(Some(finished)) => {
                info!(status = %finished.status, "finished");
                self.event_tx.send_event(BuildEvent::build_finished(&finished));
            }
            Ok(None) => info!("build removed"),
            Err(err) => error!(error = %err, "failed to load build from database"),
        }
    }

    async fn finish_with_error(&self, id: BuildId, reason: &str) {
        self.event_tx
            .send_event(BuildEvent::error(format!("build errored: {}", reason), Some(id)));
        if let Err(err) = self.store.finish_build(id, BuildStatus::Errored).await {
            error!(error = %err, "failed to mark build as errored");
        }
    }
}

/// Forward the first abort notification to the engine build, until told the run is done
async fn watch_aborts(
    mut notifier: Box<dyn AbortNotifier>,
    build: Arc<dyn EngineBuild>,
    done: oneshot::Receiver<()>,
    event_tx: Option<ProgressSender>,
    id: BuildId,
) {
    tokio::select! {
        _ = notifier.notified() => {
            info!("aborting");
            event_tx.send_event(BuildEvent::warning("abort requested, stopping build", Some(id)));
            if let Err(err) = build.abort().await {
                error!(error = %err, "failed to abort");
                event_tx.send_event(BuildEvent::error(format!("failed to abort: {}", err), Some(id)));
            }
        }
        _ = done => {}
    }

    notifier.close();
}
