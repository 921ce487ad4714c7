// Step Execution
// Step contract, typed step results and the steps that make up a build

pub mod composite;
pub mod delegate;
pub mod factory;
pub mod failure_reporter;
pub mod put_step;
pub mod source_repository;

pub use composite::{Aggregate, AggregateFactory, OnSuccess, OnSuccessFactory};
pub use delegate::{EventDelegate, PutDelegate};
pub use factory::StepBuilder;
pub use failure_reporter::FailureReporter;
pub use put_step::PutStep;
pub use source_repository::{SourceName, SourceRepository};

pub use crate::resource::{MetadataField, Version};

use crate::resource::ResourceError;
use crate::signals::{CancelSignal, ReadySignal};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

/// Errors that stop a step from completing
#[derive(Debug, Error)]
pub enum ExecError {
    #[error(transparent)]
    Resource(#[from] ResourceError),

    #[error("Step was interrupted")]
    Interrupted,

    #[error("{}", join_errors(.0))]
    Multiple(Vec<ExecError>),
}

fn join_errors(errors: &[ExecError]) -> String {
    let messages: Vec<String> = errors.iter().map(|e| e.to_string()).collect();
    format!("{} errors occurred: {}", errors.len(), messages.join("; "))
}

impl ExecError {
    /// Collapse a list of errors; `None` when empty
    pub fn from_errors(mut errors: Vec<ExecError>) -> Option<ExecError> {
        match errors.len() {
            0 => None,
            1 => errors.pop(),
            _ => Some(ExecError::Multiple(errors)),
        }
    }
}

/// Exit status of a step's script
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ExitStatus(pub i32);

impl ExitStatus {
    pub fn success(&self) -> bool {
        self.0 == 0
    }
}

impl fmt::Display for ExitStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Version and display metadata of a produced artifact
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct VersionInfo {
    pub version: Version,
    pub metadata: Vec<MetadataField>,
}

/// Shape of result a caller asks a step for
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResultKind {
    Success,
    ExitStatus,
    VersionInfo,
}

/// A step result of the requested shape
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StepResult {
    Success(bool),
    ExitStatus(ExitStatus),
    VersionInfo(VersionInfo),
}

/// Container retention after a step is released
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReleasePolicy {
    pub successful: Duration,
    pub failed: Duration,
}

impl Default for ReleasePolicy {
    fn default() -> Self {
        Self {
            successful: Duration::from_secs(60 * 60),
            failed: Duration::from_secs(5 * 60),
        }
    }
}

impl ReleasePolicy {
    /// Retention for a step that ended with `status`, or never got one
    pub fn ttl_for(&self, status: Option<ExitStatus>) -> Duration {
        match status {
            Some(status) if status.success() => self.successful,
            _ => self.failed,
        }
    }
}

/// One unit of work in a build
#[async_trait]
pub trait Step: Send + Sync {
    /// Run to completion. A script exiting non-zero is a completed step, not an error.
    async fn run(&mut self, cancel: CancelSignal, ready: ReadySignal) -> Result<(), ExecError>;

    /// Hand back anything acquired by `run`. Always called after `run`.
    fn release(&mut self);

    /// The result of the requested shape, if the step has one
    fn result(&self, kind: ResultKind) -> Option<StepResult>;

    fn succeeded(&self) -> bool {
        matches!(self.result(ResultKind::Success), Some(StepResult::Success(true)))
    }
}

/// A step configuration that can be attached to a build's source repository
pub trait StepFactory: Send + Sync {
    fn using(&self, repository: Arc<SourceRepository>) -> Box<dyn Step>;
}
