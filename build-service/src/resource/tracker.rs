// Container Tracker
// Allocates or reuses a container per session and binds resources to it

use super::resource_out::{resources_dir, PutSource};
use super::script::ScriptRequest;
use super::{
    ArtifactSource, IoConfig, Params, Resource, ResourceError, Session, Source, StepMetadata,
    Tracker, VersionedSource,
};

use async_trait::async_trait;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::process::Command;
use tracing::{debug, info, warn};

/// Host directory mounted into a container
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Mount {
    pub host_path: PathBuf,
    pub container_path: String,
}

/// What a provider needs to create a container
#[derive(Debug, Clone, Default)]
pub struct ContainerSpec {
    pub handle: String,
    pub resource_type: String,
    pub env: Vec<(String, String)>,
    pub mounts: Vec<Mount>,
}

/// A container resource scripts can run in
#[async_trait]
pub trait Container: Send + Sync {
    fn handle(&self) -> &str;

    /// Command running `path` inside the container
    fn command(&self, path: &str, args: &[String]) -> Command;

    async fn create_dir(&self, path: &str) -> Result<(), ResourceError>;

    /// Extract a tar archive into `path`
    async fn stream_in(&self, path: &str, archive: Vec<u8>) -> Result<(), ResourceError>;

    /// Tar up the contents of `path`
    async fn stream_out(&self, path: &str) -> Result<Vec<u8>, ResourceError>;

    async fn destroy(&self) -> Result<(), ResourceError>;

    /// Host location of a container path, if the container's filesystem is on this host
    fn host_path(&self, _path: &str) -> Option<PathBuf> {
        None
    }
}

/// Backend able to create containers
#[async_trait]
pub trait ContainerProvider: Send + Sync {
    /// Tags this backend satisfies
    fn tags(&self) -> &[String];

    async fn create(&self, spec: &ContainerSpec) -> Result<Arc<dyn Container>, ResourceError>;
}

struct Entry {
    container: Arc<dyn Container>,
    /// Bumped on every acquisition so stale releases don't destroy a reused container
    generation: u64,
}

#[derive(Default)]
struct Sessions {
    entries: Mutex<HashMap<Session, Entry>>,
}

impl Sessions {
    fn entries(&self) -> MutexGuard<'_, HashMap<Session, Entry>> {
        self.entries.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// Tracker handing out one container per session
#[derive(Clone)]
pub struct ContainerTracker {
    provider: Arc<dyn ContainerProvider>,
    sessions: Arc<Sessions>,
}

impl ContainerTracker {
    pub fn new(provider: Arc<dyn ContainerProvider>) -> Self {
        Self {
            provider,
            sessions: Arc::new(Sessions::default()),
        }
    }

    /// Number of containers currently kept for sessions
    pub fn active_containers(&self) -> usize {
        self.sessions.entries().len()
    }

    /// Destroy every tracked container regardless of retention
    pub async fn destroy_all(&self) {
        let containers: Vec<_> = self
            .sessions
            .entries()
            .drain()
            .map(|(_, entry)| entry.container)
            .collect();

        for container in containers {
            if let Err(e) = container.destroy().await {
                warn!(handle = container.handle(), error = %e, "failed to destroy container");
            }
        }
    }

    fn check_tags(&self, resource_type: &str, tags: &[String]) -> Result<(), ResourceError> {
        let available = self.provider.tags();
        if tags.iter().all(|tag| available.contains(tag)) {
            Ok(())
        } else {
            Err(ResourceError::NoCompatibleWorker {
                resource_type: resource_type.to_string(),
                tags: tags.to_vec(),
            })
        }
    }

    fn reuse(&self, session: &Session) -> Option<(Arc<dyn Container>, u64)> {
        let mut entries = self.sessions.entries();
        let entry = entries.get_mut(session)?;
        entry.generation += 1;
        Some((entry.container.clone(), entry.generation))
    }

    fn bind(&self, session: &Session, container: Arc<dyn Container>, generation: u64) -> Box<dyn Resource> {
        Box::new(ContainerResource {
            container,
            release: SessionRelease {
                sessions: self.sessions.clone(),
                session: session.clone(),
                generation,
            },
        })
    }
}

#[async_trait]
impl Tracker for ContainerTracker {
    async fn init_with_sources(
        &self,
        metadata: &StepMetadata,
        session: &Session,
        resource_type: &str,
        tags: &[String],
        sources: HashMap<String, Arc<dyn ArtifactSource>>,
    ) -> Result<(Box<dyn Resource>, Vec<String>), ResourceError> {
        self.check_tags(resource_type, tags)?;

        if let Some((container, generation)) = self.reuse(session) {
            debug!(session = %session.id, handle = container.handle(), "reusing container");

            // mounts can't be added to a running container
            let mut missing: Vec<String> = sources.into_keys().collect();
            missing.sort();
            return Ok((self.bind(session, container, generation), missing));
        }

        let mut names: Vec<String> = sources.keys().cloned().collect();
        names.sort();

        let dir = resources_dir("put");
        let mut mounts = Vec::new();
        let mut missing = Vec::new();
        for (name, source) in sources {
            match source.host_path() {
                Some(host_path) => mounts.push(Mount {
                    host_path,
                    container_path: format!("{}/{}", dir, name),
                }),
                None => missing.push(name),
            }
        }
        missing.sort();
        mounts.sort_by(|a, b| a.container_path.cmp(&b.container_path));

        let spec = ContainerSpec {
            handle: session.id.clone(),
            resource_type: resource_type.to_string(),
            env: metadata.env(),
            mounts,
        };
        let container = self.provider.create(&spec).await?;
        info!(session = %session.id, handle = container.handle(), "created container");

        let (bound, generation) = {
            let mut entries = self.sessions.entries();
            let entry = entries.entry(session.clone()).or_insert(Entry {
                container: container.clone(),
                generation: 0,
            });
            entry.generation += 1;
            (entry.container.clone(), entry.generation)
        };

        if !Arc::ptr_eq(&bound, &container) {
            // another step created the session's container first
            debug!(session = %session.id, handle = bound.handle(), "discarding duplicate container");
            if let Err(e) = container.destroy().await {
                warn!(session = %session.id, error = %e, "failed to destroy container");
            }
            return Ok((self.bind(session, bound, generation), names));
        }

        Ok((self.bind(session, container, generation), missing))
    }
}

/// Releases a session's container after its retention period
struct SessionRelease {
    sessions: Arc<Sessions>,
    session: Session,
    generation: u64,
}

impl SessionRelease {
    fn release(&self, ttl: Duration) {
        let sessions = self.sessions.clone();
        let session = self.session.clone();
        let generation = self.generation;

        tokio::spawn(async move {
            tokio::time::sleep(ttl).await;

            let container = {
                let mut entries = sessions.entries();
                match entries.get(&session) {
                    Some(entry) if entry.generation == generation => {
                        entries.remove(&session).map(|entry| entry.container)
                    }
                    _ => None,
                }
            };

            if let Some(container) = container {
                debug!(session = %session.id, "container retention expired");
                if let Err(e) = container.destroy().await {
                    warn!(session = %session.id, error = %e, "failed to destroy container");
                }
            }
        });
    }
}

/// A resource running its scripts in a tracked container
struct ContainerResource {
    container: Arc<dyn Container>,
    release: SessionRelease,
}

#[async_trait]
impl Resource for ContainerResource {
    fn put(
        &self,
        io: IoConfig,
        source: Source,
        params: Params,
        artifacts: Arc<dyn ArtifactSource>,
    ) -> Result<Arc<dyn VersionedSource>, ResourceError> {
        Ok(Arc::new(PutSource::new(
            self.container.clone(),
            io,
            ScriptRequest { source, params },
            artifacts,
        )))
    }

    fn release(&self, ttl: Duration) {
        self.release.release(ttl);
    }
}
