// Put Step
// Publishes through a resource's `out` script in a tracked container

use super::{
    ExecError, ExitStatus, FailureReporter, PutDelegate, ReleasePolicy, ResultKind, SourceName,
    SourceRepository, Step, StepFactory, StepResult, VersionInfo,
};
use crate::plan::PutPlan;
use crate::resource::{
    IoConfig, Resource, ResourceError, Session, StepMetadata, Tracker, VersionedArtifact,
};
use crate::signals::{CancelSignal, ReadySignal};

use async_trait::async_trait;
use std::sync::Arc;
use tracing::{debug, info_span, Instrument};

/// A put step bound to its configuration; attach it to a repository with `using`
#[derive(Clone)]
pub struct PutStep {
    plan: PutPlan,
    metadata: StepMetadata,
    session: Session,
    tracker: Arc<dyn Tracker>,
    delegate: Arc<dyn PutDelegate>,
    release_policy: ReleasePolicy,

    repository: Option<Arc<SourceRepository>>,
    resource: Option<Arc<dyn Resource>>,
    exit_status: Option<ExitStatus>,
    version_info: Option<VersionInfo>,
}

impl PutStep {
    pub fn new(
        plan: PutPlan,
        metadata: StepMetadata,
        session: Session,
        tracker: Arc<dyn Tracker>,
        delegate: Arc<dyn PutDelegate>,
    ) -> Self {
        Self {
            plan,
            metadata,
            session,
            tracker,
            delegate,
            release_policy: ReleasePolicy::default(),
            repository: None,
            resource: None,
            exit_status: None,
            version_info: None,
        }
    }

    pub fn with_release_policy(mut self, policy: ReleasePolicy) -> Self {
        self.release_policy = policy;
        self
    }

    async fn put(&mut self, cancel: CancelSignal, ready: ReadySignal) -> Result<(), ExecError> {
        let repository = self.repository.clone().unwrap_or_default();

        self.delegate.initializing();

        let (resource, missing) = self
            .tracker
            .init_with_sources(
                &self.metadata,
                &self.session,
                &self.plan.resource_type,
                &self.plan.tags,
                repository.as_map(),
            )
            .await?;
        let resource: Arc<dyn Resource> = Arc::from(resource);
        self.resource = Some(resource.clone());

        let missing_sources = match repository.subset(&missing) {
            Ok(subset) => subset,
            Err(name) => panic!(
                "tracker reported source '{}' as missing but it is not in the repository",
                name
            ),
        };
        debug!(missing = ?missing, "streaming sources the container could not mount");

        let io = IoConfig {
            stdout: self.delegate.stdout(),
            stderr: self.delegate.stderr(),
        };
        let versioned = resource.put(
            io,
            self.plan.source.clone(),
            self.plan.params.clone(),
            Arc::new(missing_sources),
        )?;

        match versioned.run(cancel, ready).await {
            Ok(()) => {}
            Err(ResourceError::ScriptFailed { exit_status, .. }) => {
                let status = ExitStatus(exit_status);
                self.exit_status = Some(status);
                self.delegate.completed(status, None);
                return Ok(());
            }
            Err(err) => return Err(err.into()),
        }

        let info = VersionInfo {
            version: versioned.version(),
            metadata: versioned.metadata(),
        };
        self.exit_status = Some(ExitStatus(0));
        self.version_info = Some(info.clone());

        repository.register_source(
            SourceName::from(self.plan.name.as_str()),
            Arc::new(VersionedArtifact(versioned)),
        );

        self.delegate.completed(ExitStatus(0), Some(&info));
        Ok(())
    }
}

impl StepFactory for PutStep {
    fn using(&self, repository: Arc<SourceRepository>) -> Box<dyn Step> {
        let mut step = self.clone();
        step.repository = Some(repository);

        let delegate = self.delegate.clone();
        Box::new(FailureReporter::new(
            Box::new(step),
            Box::new(move |err: &ExecError| delegate.failed(err)),
        ))
    }
}

#[async_trait]
impl Step for PutStep {
    async fn run(&mut self, cancel: CancelSignal, ready: ReadySignal) -> Result<(), ExecError> {
        let span = info_span!("put", build_id = %self.metadata.build_id, step = %self.plan.name);
        self.put(cancel, ready).instrument(span).await
    }

    fn release(&mut self) {
        let Some(resource) = self.resource.take() else {
            return;
        };
        resource.release(self.release_policy.ttl_for(self.exit_status));
    }

    fn result(&self, kind: ResultKind) -> Option<StepResult> {
        match kind {
            ResultKind::Success => Some(StepResult::Success(self.exit_status == Some(ExitStatus(0)))),
            ResultKind::ExitStatus => self.exit_status.map(StepResult::ExitStatus),
            ResultKind::VersionInfo => self.version_info.clone().map(StepResult::VersionInfo),
        }
    }
}
