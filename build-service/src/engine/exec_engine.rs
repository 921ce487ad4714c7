// Exec Engine
// Runs a build's plan as a tree of steps in this process

use super::{Engine, EngineBuild, EngineError};
use crate::db::{BuildRecord, BuildStatus, BuildStore};
use crate::events::ProgressSender;
use crate::exec::{ReleasePolicy, SourceRepository, StepBuilder};
use crate::plan::{Plan, PublicPlan};
use crate::resource::Tracker;
use crate::signals::{self, CancelHandle};

use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{error, info};

/// Engine evaluating plans locally; its metadata is the JSON plan
pub struct ExecEngine {
    store: Arc<dyn BuildStore>,
    tracker: Arc<dyn Tracker>,
    event_tx: Option<ProgressSender>,
    release_policy: ReleasePolicy,
}

impl ExecEngine {
    pub fn new(store: Arc<dyn BuildStore>, tracker: Arc<dyn Tracker>) -> Self {
        Self {
            store,
            tracker,
            event_tx: None,
            release_policy: ReleasePolicy::default(),
        }
    }

    /// Set progress event sender
    pub fn with_progress(mut self, tx: ProgressSender) -> Self {
        self.event_tx = Some(tx);
        self
    }

    pub fn with_release_policy(mut self, policy: ReleasePolicy) -> Self {
        self.release_policy = policy;
        self
    }

    fn exec_build(&self, build: &BuildRecord, plan: Plan, metadata: String) -> Arc<ExecBuild> {
        Arc::new(ExecBuild {
            build: build.clone(),
            plan,
            metadata,
            store: self.store.clone(),
            steps: StepBuilder::new(build.clone(), self.tracker.clone())
                .with_progress(self.event_tx.clone())
                .with_release_policy(self.release_policy),
            cancel: signals::cancel_channel().0,
            running: AtomicBool::new(false),
        })
    }
}

#[async_trait]
impl Engine for ExecEngine {
    fn name(&self) -> &str {
        "exec"
    }

    async fn create_build(
        &self,
        build: &BuildRecord,
        plan: &Plan,
    ) -> Result<Arc<dyn EngineBuild>, EngineError> {
        plan.validate()?;
        let metadata = serde_json::to_string(plan)?;
        Ok(self.exec_build(build, plan.clone(), metadata))
    }

    async fn lookup_build(&self, build: &BuildRecord) -> Result<Arc<dyn EngineBuild>, EngineError> {
        let plan: Plan = serde_json::from_str(&build.engine_metadata)?;
        Ok(self.exec_build(build, plan, build.engine_metadata.clone()))
    }
}

/// A build of the exec engine
pub struct ExecBuild {
    build: BuildRecord,
    plan: Plan,
    metadata: String,
    store: Arc<dyn BuildStore>,
    steps: StepBuilder,
    cancel: CancelHandle,
    running: AtomicBool,
}

impl ExecBuild {
    fn is_cancelled(&self) -> bool {
        *self.cancel.borrow()
    }

    async fn finish(&self, status: BuildStatus) {
        info!(build_id = %self.build.id, status = %status, "finishing build");
        if let Err(e) = self.store.finish_build(self.build.id, status).await {
            error!(build_id = %self.build.id, error = %e, "failed to finish build");
        }
    }
}

#[async_trait]
impl EngineBuild for ExecBuild {
    fn metadata(&self) -> String {
        self.metadata.clone()
    }

    async fn abort(&self) -> Result<(), EngineError> {
        self.cancel.send_replace(true);

        if !self.running.load(Ordering::SeqCst) {
            self.store
                .finish_build(self.build.id, BuildStatus::Aborted)
                .await?;
        }
        Ok(())
    }

    async fn resume(&self) {
        if self.running.swap(true, Ordering::SeqCst) {
            return;
        }

        if self.is_cancelled() {
            self.finish(BuildStatus::Aborted).await;
            return;
        }

        let repository = Arc::new(SourceRepository::new());
        let mut step = self.steps.build_step(&self.plan).using(repository);

        let (ready, _) = signals::ready_channel();
        let result = step.run(self.cancel.subscribe(), ready).await;
        step.release();

        let status = match result {
            _ if self.is_cancelled() => BuildStatus::Aborted,
            Ok(()) if step.succeeded() => BuildStatus::Succeeded,
            Ok(()) => BuildStatus::Failed,
            Err(e) => {
                error!(build_id = %self.build.id, error = %e, "build errored");
                BuildStatus::Errored
            }
        };

        self.finish(status).await;
        self.running.store(false, Ordering::SeqCst);
    }

    async fn public_plan(&self) -> Result<PublicPlan, EngineError> {
        Ok(PublicPlan {
            schema: "exec".to_string(),
            plan: self.plan.public(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::{BuildId, InMemoryBuildStore};
    use crate::engine::{DbEngine, Engines};
    use crate::events::{progress_channel, BuildEvent};
    use crate::plan::PutPlan;
    use crate::resource::{ContainerTracker, LocalConfig, LocalProvider};
    use std::collections::HashMap;
    use std::os::unix::fs::PermissionsExt;
    use std::path::Path;
    use std::time::Duration;
    use tempfile::TempDir;

    fn script(types: &Path, name: &str, body: &str) -> (String, std::path::PathBuf) {
        let dir = types.join(name);
        std::fs::create_dir_all(&dir).unwrap();
        let out = dir.join("out");
        std::fs::write(&out, format!("#!/bin/sh\ncat >/dev/null\n{}\n", body)).unwrap();
        std::fs::set_permissions(&out, std::fs::Permissions::from_mode(0o755)).unwrap();
        (name.to_string(), dir)
    }

    struct Harness {
        _temp: TempDir,
        store: InMemoryBuildStore,
        db: DbEngine,
    }

    fn harness(event_tx: Option<ProgressSender>) -> Harness {
        let temp = TempDir::new().unwrap();
        let types = temp.path().join("types");
        let resource_types: HashMap<_, _> = [
            script(&types, "echo", r#"echo "publishing $BUILD_ID" >&2; echo '{"version":{"ref":"abc"}}'"#),
            script(&types, "check-input", r#"test -d "$1/image" || exit 4; echo '{}'"#),
            script(&types, "fail", "exit 3"),
            script(&types, "slow", "sleep 30"),
        ]
        .into_iter()
        .collect();

        let provider = LocalProvider::with_config(LocalConfig {
            work_dir: temp.path().join("work"),
            resource_types,
            tags: Vec::new(),
        });
        let store = InMemoryBuildStore::new();
        let exec = ExecEngine::new(
            Arc::new(store.clone()),
            Arc::new(ContainerTracker::new(Arc::new(provider))),
        )
        .with_release_policy(ReleasePolicy {
            successful: Duration::ZERO,
            failed: Duration::ZERO,
        });
        let exec = match &event_tx {
            Some(tx) => exec.with_progress(tx.clone()),
            None => exec,
        };

        let db = DbEngine::new(
            Engines::default().with_engine(Arc::new(exec)),
            Arc::new(store.clone()),
        );
        let db = match event_tx {
            Some(tx) => db.with_progress(tx),
            None => db,
        };

        Harness {
            _temp: temp,
            store,
            db,
        }
    }

    async fn run_plan(harness: &Harness, plan: Plan) -> BuildRecord {
        let build = harness.store.create_build(Some("main"), Some("publish"));
        let handle = harness.db.create_build(build.clone(), &plan).await.unwrap();
        handle.resume().await;
        harness.store.reload(build.id).await.unwrap().unwrap()
    }

    fn put(name: &str, resource_type: &str) -> Plan {
        Plan::Put(PutPlan::new(name, resource_type))
    }

    #[tokio::test]
    async fn test_successful_build() {
        let (tx, mut rx) = progress_channel();
        let harness = harness(Some(tx));

        let build = run_plan(&harness, put("image", "echo")).await;

        assert_eq!(build.status, BuildStatus::Succeeded);
        assert!(build.completed);
        assert_eq!(build.engine, "exec");

        let mut events = Vec::new();
        while let Ok(event) = rx.try_recv() {
            events.push(event);
        }
        assert!(matches!(events.first(), Some(BuildEvent::BuildStarted { .. })));
        assert!(events.iter().any(|e| matches!(
            e,
            BuildEvent::StepOutput { output, is_error: true, .. } if output == &format!("publishing {}", build.id)
        )));
        assert!(events.iter().any(|e| matches!(
            e,
            BuildEvent::StepCompleted { version: Some(info), .. } if info.version["ref"] == "abc"
        )));
        assert!(matches!(
            events.last(),
            Some(BuildEvent::BuildFinished {
                status: BuildStatus::Succeeded,
                ..
            })
        ));
    }

    #[tokio::test]
    async fn test_outputs_feed_later_steps() {
        let harness = harness(None);
        let plan = Plan::OnSuccess {
            step: Box::new(put("image", "echo")),
            next: Box::new(put("check", "check-input")),
        };

        let build = run_plan(&harness, plan).await;

        assert_eq!(build.status, BuildStatus::Succeeded);
    }

    #[tokio::test]
    async fn test_script_failure_fails_build() {
        let harness = harness(None);
        let build = run_plan(&harness, put("image", "fail")).await;
        assert_eq!(build.status, BuildStatus::Failed);
    }

    #[tokio::test]
    async fn test_unknown_resource_type_errors_build() {
        let harness = harness(None);
        let build = run_plan(&harness, put("image", "nonexistent")).await;
        assert_eq!(build.status, BuildStatus::Errored);
    }

    #[tokio::test]
    async fn test_abort_running_build() {
        let harness = harness(None);
        let build = harness.store.create_build(None, None);
        let handle = harness.db.create_build(build.clone(), &put("image", "slow")).await.unwrap();

        let tracker = {
            let handle = handle.clone();
            tokio::spawn(async move { handle.resume().await })
        };
        tokio::time::sleep(Duration::from_millis(200)).await;

        handle.abort().await.unwrap();
        tokio::time::timeout(Duration::from_secs(5), tracker)
            .await
            .expect("build stops after abort")
            .unwrap();

        let build = harness.store.reload(build.id).await.unwrap().unwrap();
        assert_eq!(build.status, BuildStatus::Aborted);
        assert!(build.completed);
    }

    #[tokio::test]
    async fn test_abort_untracked_started_build() {
        let harness = harness(None);
        let build = harness.store.create_build(None, None);
        harness.db.create_build(build.clone(), &put("image", "echo")).await.unwrap();

        let started = harness.store.reload(build.id).await.unwrap().unwrap();
        harness.db.lookup_build(started).await.unwrap().abort().await.unwrap();

        let build = harness.store.reload(build.id).await.unwrap().unwrap();
        assert_eq!(build.status, BuildStatus::Aborted);
        assert!(build.completed);
    }

    #[tokio::test]
    async fn test_metadata_roundtrip_and_public_plan() {
        let harness = harness(None);
        let mut put_plan = PutPlan::new("image", "echo");
        put_plan
            .source
            .insert("password".to_string(), serde_json::json!("hunter2"));
        let plan = Plan::Put(put_plan);

        let build = harness.store.create_build(None, None);
        let handle = harness.db.create_build(build, &plan).await.unwrap();

        let public = handle.public_plan().await.unwrap();
        assert_eq!(public.schema, "exec");
        assert!(!public.plan.to_string().contains("hunter2"));

        let started = harness.store.reload(handle.id()).await.unwrap().unwrap();
        let restored: Plan = serde_json::from_str(&started.engine_metadata).unwrap();
        assert_eq!(restored, plan);
    }

    #[tokio::test]
    async fn test_invalid_plans_and_metadata_are_rejected() {
        let store = Arc::new(InMemoryBuildStore::new());
        let engine = ExecEngine::new(
            store.clone(),
            Arc::new(ContainerTracker::new(Arc::new(LocalProvider::new()))),
        );

        let mut build = BuildRecord::new(BuildId(1), "1");
        let duplicate = Plan::Aggregate(vec![put("a", "echo"), put("a", "echo")]);
        assert!(matches!(
            engine.create_build(&build, &duplicate).await,
            Err(EngineError::Plan(_))
        ));

        build.engine_metadata = "not json".to_string();
        assert!(matches!(
            engine.lookup_build(&build).await,
            Err(EngineError::InvalidMetadata(_))
        ));
    }
}
