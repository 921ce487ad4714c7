// Resource Out
// Runs a resource's `out` script inside its container

use super::script::{self, ScriptRequest, ScriptResponse};
use super::tracker::Container;
use super::{
    ArtifactDestination, ArtifactSource, IoConfig, MetadataField, ResourceError, Version,
    VersionedSource,
};
use crate::signals::{CancelSignal, ReadySignal};

use async_trait::async_trait;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

/// Where resource scripts live inside a resource container
pub const RESOURCE_SCRIPT_DIR: &str = "/opt/resource";

/// Working directory handed to a resource script of the given kind
pub fn resources_dir(kind: &str) -> String {
    format!("/tmp/build/{}", kind)
}

/// Writes artifacts below a directory of a container
struct ContainerDestination<'a> {
    container: &'a dyn Container,
    dir: &'a str,
}

#[async_trait]
impl ArtifactDestination for ContainerDestination<'_> {
    async fn stream_in(&self, path: &str, archive: Vec<u8>) -> Result<(), ResourceError> {
        let target = match path.trim_matches('/') {
            "" | "." => self.dir.to_string(),
            relative => format!("{}/{}", self.dir, relative),
        };
        self.container.stream_in(&target, archive).await
    }
}

/// The `out` script of a resource; once run, the artifact it published
pub struct PutSource {
    container: Arc<dyn Container>,
    io: IoConfig,
    request: ScriptRequest,
    artifacts: Arc<dyn ArtifactSource>,
    response: Mutex<Option<ScriptResponse>>,
}

impl PutSource {
    pub fn new(
        container: Arc<dyn Container>,
        io: IoConfig,
        request: ScriptRequest,
        artifacts: Arc<dyn ArtifactSource>,
    ) -> Self {
        Self {
            container,
            io,
            request,
            artifacts,
            response: Mutex::new(None),
        }
    }

    fn response(&self) -> Option<ScriptResponse> {
        self.response
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }
}

#[async_trait]
impl ArtifactSource for PutSource {
    async fn stream_to(&self, dest: &dyn ArtifactDestination) -> Result<(), ResourceError> {
        let archive = self.container.stream_out(&resources_dir("put")).await?;
        dest.stream_in(".", archive).await
    }

    fn host_path(&self) -> Option<PathBuf> {
        self.container.host_path(&resources_dir("put"))
    }
}

#[async_trait]
impl VersionedSource for PutSource {
    async fn run(&self, cancel: CancelSignal, ready: ReadySignal) -> Result<(), ResourceError> {
        let dir = resources_dir("put");
        self.container.create_dir(&dir).await?;

        let dest = ContainerDestination {
            container: self.container.as_ref(),
            dir: &dir,
        };
        self.artifacts.stream_to(&dest).await?;

        let cmd = self
            .container
            .command(&format!("{}/out", RESOURCE_SCRIPT_DIR), &[dir.clone()]);
        let response = script::run_script(cmd, &self.request, &self.io, cancel, ready).await?;

        *self.response.lock().unwrap_or_else(|e| e.into_inner()) = Some(response);
        Ok(())
    }

    fn version(&self) -> Version {
        self.response().map(|r| r.version).unwrap_or_default()
    }

    fn metadata(&self) -> Vec<MetadataField> {
        self.response().map(|r| r.metadata).unwrap_or_default()
    }
}
