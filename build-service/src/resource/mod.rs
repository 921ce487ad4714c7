// Resources
// Resource, tracker and versioned-source contracts plus the container backends behind them

pub mod container;
pub mod local;
pub mod resource_out;
pub mod script;
pub mod tracker;

pub use container::{DockerConfig, DockerProvider, ImagePullPolicy};
pub use local::{LocalConfig, LocalProvider};
pub use resource_out::{resources_dir, PutSource, RESOURCE_SCRIPT_DIR};
pub use tracker::{Container, ContainerProvider, ContainerSpec, ContainerTracker, Mount};

use crate::db::BuildRecord;
use crate::signals::{CancelSignal, ReadySignal};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::{BTreeMap, HashMap};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

/// Resource configuration as declared in the plan
pub type Source = Map<String, Value>;

/// Step parameters as declared in the plan
pub type Params = Map<String, Value>;

/// Worker tags a step requires
pub type Tags = Vec<String>;

/// Version identity reported by a resource script
pub type Version = BTreeMap<String, String>;

/// Receives one line of script output
pub type OutputSink = Arc<dyn Fn(&str) + Send + Sync>;

/// Errors that can occur while running resources
#[derive(Debug, Error)]
pub enum ResourceError {
    #[error("Resource script exited with status {exit_status}")]
    ScriptFailed { exit_status: i32, stderr: String },

    #[error("Resource script was interrupted")]
    Interrupted,

    #[error("Failed to spawn resource script: {0}")]
    Spawn(std::io::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid resource script response: {0}")]
    InvalidResponse(#[from] serde_json::Error),

    #[error("Docker is not available: {0}")]
    DockerNotAvailable(String),

    #[error("Container error: {0}")]
    Container(String),

    #[error("No worker can run resource type '{resource_type}' with tags {tags:?}")]
    NoCompatibleWorker { resource_type: String, tags: Tags },

    #[error("Unknown resource type: {0}")]
    UnknownResourceType(String),
}

/// Display metadata line reported by a resource script
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MetadataField {
    pub name: String,
    pub value: String,
}

/// Identifies the container a step runs in, so retries can reuse it
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Session {
    pub id: String,
}

impl Session {
    pub fn new(id: impl Into<String>) -> Self {
        Self { id: id.into() }
    }

    /// Session for a named step of a build
    pub fn for_step(build_id: impl std::fmt::Display, kind: &str, step_name: &str) -> Self {
        Self::new(format!("build-{}-{}-{}", build_id, kind, step_name))
    }
}

/// Build labels exported to resource scripts
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StepMetadata {
    pub build_id: String,
    pub build_name: String,
    pub pipeline_name: Option<String>,
    pub job_name: Option<String>,
}

impl StepMetadata {
    /// Environment variables for the script process
    pub fn env(&self) -> Vec<(String, String)> {
        let mut env = vec![
            ("BUILD_ID".to_string(), self.build_id.clone()),
            ("BUILD_NAME".to_string(), self.build_name.clone()),
        ];
        if let Some(pipeline) = &self.pipeline_name {
            env.push(("BUILD_PIPELINE_NAME".to_string(), pipeline.clone()));
        }
        if let Some(job) = &self.job_name {
            env.push(("BUILD_JOB_NAME".to_string(), job.clone()));
        }
        env
    }
}

impl From<&BuildRecord> for StepMetadata {
    fn from(build: &BuildRecord) -> Self {
        Self {
            build_id: build.id.to_string(),
            build_name: build.name.clone(),
            pipeline_name: build.pipeline_name.clone(),
            job_name: build.job_name.clone(),
        }
    }
}

/// Where a script's output lines go
#[derive(Clone, Default)]
pub struct IoConfig {
    pub stdout: Option<OutputSink>,
    pub stderr: Option<OutputSink>,
}

impl std::fmt::Debug for IoConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IoConfig")
            .field("stdout", &self.stdout.is_some())
            .field("stderr", &self.stderr.is_some())
            .finish()
    }
}

/// Somewhere artifacts can be written to
#[async_trait]
pub trait ArtifactDestination: Send + Sync {
    /// Extract a tar archive into `path`, relative to the destination root
    async fn stream_in(&self, path: &str, archive: Vec<u8>) -> Result<(), ResourceError>;
}

/// Something that can stream its contents to a destination
#[async_trait]
pub trait ArtifactSource: Send + Sync {
    async fn stream_to(&self, dest: &dyn ArtifactDestination) -> Result<(), ResourceError>;

    /// Directory on this host holding the artifact, when it can be mounted directly
    fn host_path(&self) -> Option<PathBuf> {
        None
    }
}

/// A started resource operation; the artifact it produced once run
#[async_trait]
pub trait VersionedSource: ArtifactSource {
    /// Run the script to completion. `ready` fires as soon as the process is spawned.
    async fn run(&self, cancel: CancelSignal, ready: ReadySignal) -> Result<(), ResourceError>;

    fn version(&self) -> Version;

    fn metadata(&self) -> Vec<MetadataField>;
}

/// Exposes a versioned source wherever a plain artifact source is expected
pub struct VersionedArtifact(pub Arc<dyn VersionedSource>);

#[async_trait]
impl ArtifactSource for VersionedArtifact {
    async fn stream_to(&self, dest: &dyn ArtifactDestination) -> Result<(), ResourceError> {
        self.0.stream_to(dest).await
    }

    fn host_path(&self) -> Option<PathBuf> {
        self.0.host_path()
    }
}

/// A resource bound to a container
#[async_trait]
pub trait Resource: Send + Sync {
    /// Prepare the `out` script; nothing runs until the returned source is run
    fn put(
        &self,
        io: IoConfig,
        source: Source,
        params: Params,
        artifacts: Arc<dyn ArtifactSource>,
    ) -> Result<Arc<dyn VersionedSource>, ResourceError>;

    /// Hand the container back, keeping it around for `ttl` in case it is reused
    fn release(&self, ttl: Duration);
}

/// Allocates (or reuses) containers for resources
#[async_trait]
pub trait Tracker: Send + Sync {
    /// Returns the bound resource and the source names that could not be mounted and
    /// must be streamed in instead
    async fn init_with_sources(
        &self,
        metadata: &StepMetadata,
        session: &Session,
        resource_type: &str,
        tags: &[String],
        sources: HashMap<String, Arc<dyn ArtifactSource>>,
    ) -> Result<(Box<dyn Resource>, Vec<String>), ResourceError>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::BuildId;

    #[test]
    fn test_step_metadata_env() {
        let mut build = BuildRecord::new(BuildId(12), "12");
        build.pipeline_name = Some("main".to_string());

        let env = StepMetadata::from(&build).env();

        assert!(env.contains(&("BUILD_ID".to_string(), "12".to_string())));
        assert!(env.contains(&("BUILD_NAME".to_string(), "12".to_string())));
        assert!(env.contains(&("BUILD_PIPELINE_NAME".to_string(), "main".to_string())));
        assert!(!env.iter().any(|(key, _)| key == "BUILD_JOB_NAME"));
    }

    #[test]
    fn test_session_for_step() {
        let session = Session::for_step(BuildId(3), "put", "image");
        assert_eq!(session.id, "build-3-put-image");
    }

    #[test]
    fn test_script_failure_message() {
        let err = ResourceError::ScriptFailed {
            exit_status: 3,
            stderr: "boom".to_string(),
        };
        assert_eq!(err.to_string(), "Resource script exited with status 3");
    }
}
