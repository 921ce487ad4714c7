// Source Repository
// Named artifacts produced by earlier steps of a build

use crate::resource::{ArtifactDestination, ArtifactSource, ResourceError};

use async_trait::async_trait;
use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};

/// Name an artifact is registered under
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SourceName(pub String);

impl From<&str> for SourceName {
    fn from(name: &str) -> Self {
        SourceName(name.to_string())
    }
}

impl From<String> for SourceName {
    fn from(name: String) -> Self {
        SourceName(name)
    }
}

impl fmt::Display for SourceName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Artifacts available to later steps. Sibling steps may register disjoint names concurrently.
#[derive(Default)]
pub struct SourceRepository {
    sources: RwLock<HashMap<SourceName, Arc<dyn ArtifactSource>>>,
}

impl SourceRepository {
    pub fn new() -> Self {
        Self::default()
    }

    fn read(&self) -> RwLockReadGuard<'_, HashMap<SourceName, Arc<dyn ArtifactSource>>> {
        self.sources.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, HashMap<SourceName, Arc<dyn ArtifactSource>>> {
        self.sources.write().unwrap_or_else(|e| e.into_inner())
    }

    pub fn register_source(&self, name: SourceName, source: Arc<dyn ArtifactSource>) {
        self.write().insert(name, source);
    }

    pub fn source_for(&self, name: &SourceName) -> Option<Arc<dyn ArtifactSource>> {
        self.read().get(name).cloned()
    }

    /// Registered names, sorted
    pub fn names(&self) -> Vec<SourceName> {
        let mut names: Vec<SourceName> = self.read().keys().cloned().collect();
        names.sort();
        names
    }

    pub fn len(&self) -> usize {
        self.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.read().is_empty()
    }

    /// Plain name to source map, as trackers consume it
    pub fn as_map(&self) -> HashMap<String, Arc<dyn ArtifactSource>> {
        self.read()
            .iter()
            .map(|(name, source)| (name.0.clone(), source.clone()))
            .collect()
    }

    /// A new repository holding only `names`. Fails with the first name not registered here.
    pub fn subset(&self, names: &[String]) -> Result<SourceRepository, SourceName> {
        let sources = self.read();
        let mut subset = HashMap::new();
        for name in names {
            let name = SourceName::from(name.as_str());
            let source = sources.get(&name).cloned().ok_or_else(|| name.clone())?;
            subset.insert(name, source);
        }

        Ok(SourceRepository {
            sources: RwLock::new(subset),
        })
    }
}

impl fmt::Debug for SourceRepository {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SourceRepository")
            .field("names", &self.names())
            .finish()
    }
}

/// Writes below `prefix` of another destination
struct PrefixedDestination<'a> {
    prefix: &'a str,
    dest: &'a dyn ArtifactDestination,
}

#[async_trait]
impl ArtifactDestination for PrefixedDestination<'_> {
    async fn stream_in(&self, path: &str, archive: Vec<u8>) -> Result<(), ResourceError> {
        let path = match path.trim_matches('/') {
            "" | "." => self.prefix.to_string(),
            relative => format!("{}/{}", self.prefix, relative),
        };
        self.dest.stream_in(&path, archive).await
    }
}

/// Streams every source into a directory named after it
#[async_trait]
impl ArtifactSource for SourceRepository {
    async fn stream_to(&self, dest: &dyn ArtifactDestination) -> Result<(), ResourceError> {
        let mut sources: Vec<(SourceName, Arc<dyn ArtifactSource>)> = self
            .read()
            .iter()
            .map(|(name, source)| (name.clone(), source.clone()))
            .collect();
        sources.sort_by(|a, b| a.0.cmp(&b.0));

        for (name, source) in sources {
            let prefixed = PrefixedDestination {
                prefix: &name.0,
                dest,
            };
            source.stream_to(&prefixed).await?;
        }
        Ok(())
    }
}
