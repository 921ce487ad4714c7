// Local Provider
// Runs resource scripts directly on the host, one work directory per container

use super::tracker::{Container, ContainerProvider, ContainerSpec};
use super::{ResourceError, RESOURCE_SCRIPT_DIR};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;

/// Configuration for the local backend
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LocalConfig {
    /// Directory holding one work directory per container
    pub work_dir: PathBuf,
    /// Resource type name to a directory containing its `out` script
    pub resource_types: HashMap<String, PathBuf>,
    /// Tags this host satisfies
    pub tags: Vec<String>,
}

impl Default for LocalConfig {
    fn default() -> Self {
        let work_dir = dirs::cache_dir()
            .unwrap_or_else(std::env::temp_dir)
            .join("keel")
            .join("containers");

        let mut resource_types = HashMap::new();
        if let Some(home) = dirs::home_dir() {
            let types_dir = home.join(".keel").join("resource-types");
            if let Ok(entries) = std::fs::read_dir(&types_dir) {
                for entry in entries.flatten() {
                    if entry.path().is_dir() {
                        resource_types.insert(
                            entry.file_name().to_string_lossy().to_string(),
                            entry.path(),
                        );
                    }
                }
            }
        }

        Self {
            work_dir,
            resource_types,
            tags: Vec::new(),
        }
    }
}

/// Provider creating host-local "containers"
pub struct LocalProvider {
    config: LocalConfig,
}

impl LocalProvider {
    pub fn new() -> Self {
        Self {
            config: LocalConfig::default(),
        }
    }

    pub fn with_config(config: LocalConfig) -> Self {
        Self { config }
    }
}

impl Default for LocalProvider {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ContainerProvider for LocalProvider {
    fn tags(&self) -> &[String] {
        &self.config.tags
    }

    async fn create(&self, spec: &ContainerSpec) -> Result<Arc<dyn Container>, ResourceError> {
        let resource_dir = self
            .config
            .resource_types
            .get(&spec.resource_type)
            .ok_or_else(|| ResourceError::UnknownResourceType(spec.resource_type.clone()))?;

        let handle = format!("{}-{}", sanitize(&spec.handle), short_id());
        let container = LocalContainer {
            root: absolute(&self.config.work_dir)?.join(&handle),
            handle,
            resource_dir: absolute(resource_dir)?,
            env: spec.env.clone(),
        };

        tokio::fs::create_dir_all(&container.root).await?;
        for mount in &spec.mounts {
            let link = container.map_path(&mount.container_path);
            if let Some(parent) = link.parent() {
                tokio::fs::create_dir_all(parent).await?;
            }
            tokio::fs::symlink(&mount.host_path, &link).await?;
        }

        Ok(Arc::new(container))
    }
}

// scripts run with the container root as working directory
fn absolute(path: &Path) -> Result<PathBuf, ResourceError> {
    if path.is_absolute() {
        Ok(path.to_path_buf())
    } else {
        Ok(std::env::current_dir()?.join(path))
    }
}

/// Work directory standing in for a container filesystem
pub struct LocalContainer {
    handle: String,
    root: PathBuf,
    resource_dir: PathBuf,
    env: Vec<(String, String)>,
}

impl LocalContainer {
    /// Resolve a container path on the host
    fn map_path(&self, path: &str) -> PathBuf {
        match path.strip_prefix(RESOURCE_SCRIPT_DIR) {
            Some(rest) => self.resource_dir.join(rest.trim_start_matches('/')),
            None => self.root.join(path.trim_start_matches('/')),
        }
    }

    fn map_arg(&self, arg: &str) -> String {
        if arg.starts_with('/') {
            self.map_path(arg).to_string_lossy().to_string()
        } else {
            arg.to_string()
        }
    }
}

#[async_trait]
impl Container for LocalContainer {
    fn handle(&self) -> &str {
        &self.handle
    }

    fn command(&self, path: &str, args: &[String]) -> Command {
        let mut cmd = Command::new(self.map_path(path));
        cmd.args(args.iter().map(|arg| self.map_arg(arg)));
        cmd.current_dir(&self.root);
        cmd.envs(self.env.iter().map(|(k, v)| (k.as_str(), v.as_str())));
        cmd
    }

    async fn create_dir(&self, path: &str) -> Result<(), ResourceError> {
        tokio::fs::create_dir_all(self.map_path(path)).await?;
        Ok(())
    }

    async fn stream_in(&self, path: &str, archive: Vec<u8>) -> Result<(), ResourceError> {
        let dir = self.map_path(path);
        tokio::fs::create_dir_all(&dir).await?;
        extract(&dir, archive).await
    }

    async fn stream_out(&self, path: &str) -> Result<Vec<u8>, ResourceError> {
        let output = Command::new("tar")
            .arg("-cf")
            .arg("-")
            .arg("-C")
            .arg(self.map_path(path))
            .arg(".")
            .output()
            .await?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(ResourceError::Container(format!(
                "Failed to stream out {}: {}",
                path, stderr
            )));
        }

        Ok(output.stdout)
    }

    async fn destroy(&self) -> Result<(), ResourceError> {
        match tokio::fs::remove_dir_all(&self.root).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    fn host_path(&self, path: &str) -> Option<PathBuf> {
        Some(self.map_path(path))
    }
}

/// Unpack a tar archive into a directory
async fn extract(dir: &Path, archive: Vec<u8>) -> Result<(), ResourceError> {
    let mut child = Command::new("tar")
        .arg("-xf")
        .arg("-")
        .arg("-C")
        .arg(dir)
        .stdin(Stdio::piped())
        .stdout(Stdio::null())
        .stderr(Stdio::piped())
        .spawn()?;

    if let Some(mut stdin) = child.stdin.take() {
        stdin.write_all(&archive).await?;
    }

    let output = child.wait_with_output().await?;
    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        return Err(ResourceError::Container(format!(
            "Failed to stream in to {}: {}",
            dir.display(),
            stderr
        )));
    }

    Ok(())
}

fn sanitize(handle: &str) -> String {
    handle
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' { c } else { '-' })
        .collect()
}

fn short_id() -> String {
    uuid::Uuid::new_v4().simple().to_string()[..8].to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resource::Mount;
    use std::os::unix::fs::PermissionsExt;
    use tempfile::TempDir;

    fn provider(temp: &TempDir) -> LocalProvider {
        let types = temp.path().join("types").join("echo");
        std::fs::create_dir_all(&types).unwrap();
        let script = types.join("out");
        std::fs::write(&script, "#!/bin/sh\ncat >/dev/null\nls \"$1\" >&2\necho '{}'\n").unwrap();
        std::fs::set_permissions(&script, std::fs::Permissions::from_mode(0o755)).unwrap();

        LocalProvider::with_config(LocalConfig {
            work_dir: temp.path().join("work"),
            resource_types: HashMap::from([("echo".to_string(), types)]),
            tags: vec!["local".to_string()],
        })
    }

    #[test]
    fn test_sanitize_handle() {
        assert_eq!(sanitize("build-1-put-my/out"), "build-1-put-my-out");
    }

    #[tokio::test]
    async fn test_unknown_resource_type() {
        let temp = TempDir::new().unwrap();
        let result = provider(&temp)
            .create(&ContainerSpec {
                handle: "s".to_string(),
                resource_type: "missing".to_string(),
                ..Default::default()
            })
            .await;

        assert!(matches!(result, Err(ResourceError::UnknownResourceType(t)) if t == "missing"));
    }

    #[tokio::test]
    async fn test_paths_map_into_work_dir_and_resource_dir() {
        let temp = TempDir::new().unwrap();
        let container = provider(&temp)
            .create(&ContainerSpec {
                handle: "s".to_string(),
                resource_type: "echo".to_string(),
                ..Default::default()
            })
            .await
            .unwrap();

        let mapped = container.host_path("/tmp/build/put").unwrap();
        assert!(mapped.starts_with(temp.path().join("work")));
        assert!(mapped.ends_with("tmp/build/put"));

        let script = container.command("/opt/resource/out", &[]);
        assert_eq!(
            script.as_std().get_program(),
            temp.path().join("types").join("echo").join("out").as_os_str()
        );
    }

    #[tokio::test]
    async fn test_mounts_are_linked_and_streaming_roundtrips() {
        let temp = TempDir::new().unwrap();
        let input = temp.path().join("input");
        std::fs::create_dir_all(&input).unwrap();
        std::fs::write(input.join("file.txt"), "hello").unwrap();

        let provider = provider(&temp);
        let first = provider
            .create(&ContainerSpec {
                handle: "first".to_string(),
                resource_type: "echo".to_string(),
                mounts: vec![Mount {
                    host_path: input.clone(),
                    container_path: "/tmp/build/put/input".to_string(),
                }],
                ..Default::default()
            })
            .await
            .unwrap();

        let linked = first.host_path("/tmp/build/put/input/file.txt").unwrap();
        assert_eq!(std::fs::read_to_string(linked).unwrap(), "hello");

        let archive = first.stream_out("/tmp/build/put/input").await.unwrap();
        let second = provider
            .create(&ContainerSpec {
                handle: "second".to_string(),
                resource_type: "echo".to_string(),
                ..Default::default()
            })
            .await
            .unwrap();
        second.stream_in("/tmp/build/put/copy", archive).await.unwrap();

        let copied = second.host_path("/tmp/build/put/copy/file.txt").unwrap();
        assert_eq!(std::fs::read_to_string(copied).unwrap(), "hello");

        let root = second.host_path("/").unwrap();
        second.destroy().await.unwrap();
        assert!(!root.exists());
        second.destroy().await.unwrap();
    }
}
