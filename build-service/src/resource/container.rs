// Docker Provider
// Runs resource containers through the Docker CLI

use super::tracker::{Container, ContainerProvider, ContainerSpec};
use super::ResourceError;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::debug;

/// Configuration for the Docker backend
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DockerConfig {
    /// Docker executable; looked up on PATH when unset
    pub docker_binary: Option<PathBuf>,
    /// Whether to pull images before creating containers
    pub pull_policy: ImagePullPolicy,
    /// Resource type name to the image providing its scripts
    pub resource_types: HashMap<String, String>,
    /// Tags this backend satisfies
    pub tags: Vec<String>,
    /// Whether to remove containers when they are destroyed
    pub auto_remove: bool,
}

impl Default for DockerConfig {
    fn default() -> Self {
        Self {
            docker_binary: None,
            pull_policy: ImagePullPolicy::IfNotPresent,
            resource_types: HashMap::new(),
            tags: Vec::new(),
            auto_remove: true,
        }
    }
}

/// Image pull policy
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ImagePullPolicy {
    /// Always pull the image
    Always,
    /// Pull only if not present locally
    IfNotPresent,
    /// Never pull (must be present locally)
    Never,
}

/// Provider for Docker-based resource containers
pub struct DockerProvider {
    docker: PathBuf,
    config: DockerConfig,
}

impl DockerProvider {
    /// Locate the Docker CLI and create a provider
    pub fn with_config(config: DockerConfig) -> Result<Self, ResourceError> {
        let docker = match &config.docker_binary {
            Some(path) => path.clone(),
            None => which::which("docker")
                .map_err(|e| ResourceError::DockerNotAvailable(e.to_string()))?,
        };
        Ok(Self { docker, config })
    }

    /// Check if the Docker daemon answers
    pub async fn is_available(&self) -> bool {
        let output = Command::new(&self.docker)
            .arg("version")
            .arg("--format")
            .arg("{{.Server.Version}}")
            .output()
            .await;

        output.map(|o| o.status.success()).unwrap_or(false)
    }

    fn image_for(&self, resource_type: &str) -> Result<&str, ResourceError> {
        self.config
            .resource_types
            .get(resource_type)
            .map(String::as_str)
            .ok_or_else(|| ResourceError::UnknownResourceType(resource_type.to_string()))
    }

    /// Pull an image if needed based on pull policy
    async fn pull_image_if_needed(&self, image: &str) -> Result<(), ResourceError> {
        match self.config.pull_policy {
            ImagePullPolicy::Never => Ok(()),
            ImagePullPolicy::Always => self.pull_image(image).await,
            ImagePullPolicy::IfNotPresent => {
                let output = Command::new(&self.docker)
                    .args(["image", "inspect", image])
                    .output()
                    .await
                    .map_err(|e| ResourceError::DockerNotAvailable(e.to_string()))?;

                if !output.status.success() {
                    self.pull_image(image).await
                } else {
                    Ok(())
                }
            }
        }
    }

    async fn pull_image(&self, image: &str) -> Result<(), ResourceError> {
        debug!(image, "pulling image");
        let output = Command::new(&self.docker)
            .args(["pull", image])
            .output()
            .await
            .map_err(|e| ResourceError::DockerNotAvailable(e.to_string()))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(ResourceError::Container(format!(
                "Failed to pull {}: {}",
                image, stderr
            )));
        }

        Ok(())
    }

    fn create_args(&self, name: &str, image: &str, spec: &ContainerSpec) -> Vec<String> {
        let mut args = vec!["create".to_string(), "--name".to_string(), name.to_string()];

        for (key, value) in &spec.env {
            args.push("-e".to_string());
            args.push(format!("{}={}", key, value));
        }

        for mount in &spec.mounts {
            args.push("-v".to_string());
            args.push(format!("{}:{}", mount.host_path.display(), mount.container_path));
        }

        args.push(image.to_string());

        // Keep container running so scripts can be exec'd into it
        args.push("tail".to_string());
        args.push("-f".to_string());
        args.push("/dev/null".to_string());

        args
    }
}

#[async_trait]
impl ContainerProvider for DockerProvider {
    fn tags(&self) -> &[String] {
        &self.config.tags
    }

    async fn create(&self, spec: &ContainerSpec) -> Result<Arc<dyn Container>, ResourceError> {
        let image = self.image_for(&spec.resource_type)?;
        self.pull_image_if_needed(image).await?;

        let name = container_name(&spec.handle);
        let output = Command::new(&self.docker)
            .args(self.create_args(&name, image, spec))
            .output()
            .await
            .map_err(|e| ResourceError::DockerNotAvailable(e.to_string()))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(ResourceError::Container(format!(
                "Failed to create container: {}",
                stderr
            )));
        }

        let start_output = Command::new(&self.docker)
            .args(["start", &name])
            .output()
            .await
            .map_err(|e| ResourceError::DockerNotAvailable(e.to_string()))?;

        if !start_output.status.success() {
            let stderr = String::from_utf8_lossy(&start_output.stderr);
            return Err(ResourceError::Container(format!(
                "Failed to start container: {}",
                stderr
            )));
        }

        Ok(Arc::new(DockerContainer {
            docker: self.docker.clone(),
            id: String::from_utf8_lossy(&output.stdout).trim().to_string(),
            name,
            auto_remove: self.config.auto_remove,
        }))
    }
}

/// Handle to a running container
#[derive(Debug)]
pub struct DockerContainer {
    docker: PathBuf,
    /// Container ID
    pub id: String,
    /// Container name
    pub name: String,
    auto_remove: bool,
}

impl DockerContainer {
    async fn exec(&self, args: &[&str], input: Option<Vec<u8>>) -> Result<Vec<u8>, ResourceError> {
        let mut cmd = Command::new(&self.docker);
        cmd.arg("exec");
        if input.is_some() {
            cmd.arg("-i");
        }
        cmd.arg(&self.name).args(args);
        cmd.stdin(if input.is_some() { Stdio::piped() } else { Stdio::null() });
        cmd.stdout(Stdio::piped());
        cmd.stderr(Stdio::piped());

        let mut child = cmd
            .spawn()
            .map_err(|e| ResourceError::DockerNotAvailable(e.to_string()))?;

        if let (Some(input), Some(mut stdin)) = (input, child.stdin.take()) {
            stdin.write_all(&input).await?;
        }

        let output = child.wait_with_output().await?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(ResourceError::Container(format!(
                "Container execution failed: {}",
                stderr
            )));
        }

        Ok(output.stdout)
    }
}

#[async_trait]
impl Container for DockerContainer {
    fn handle(&self) -> &str {
        &self.name
    }

    fn command(&self, path: &str, args: &[String]) -> Command {
        let mut cmd = Command::new(&self.docker);
        cmd.args(["exec", "-i", &self.name, path]).args(args);
        cmd
    }

    async fn create_dir(&self, path: &str) -> Result<(), ResourceError> {
        self.exec(&["mkdir", "-p", path], None).await.map(|_| ())
    }

    async fn stream_in(&self, path: &str, archive: Vec<u8>) -> Result<(), ResourceError> {
        self.exec(
            &["sh", "-c", r#"mkdir -p "$1" && tar -xf - -C "$1""#, "sh", path],
            Some(archive),
        )
        .await
        .map(|_| ())
    }

    async fn stream_out(&self, path: &str) -> Result<Vec<u8>, ResourceError> {
        self.exec(&["tar", "-cf", "-", "-C", path, "."], None).await
    }

    async fn destroy(&self) -> Result<(), ResourceError> {
        let _ = Command::new(&self.docker)
            .args(["stop", &self.name])
            .output()
            .await;

        if self.auto_remove {
            let _ = Command::new(&self.docker)
                .args(["rm", "-f", &self.name])
                .output()
                .await;
        }

        Ok(())
    }
}

/// Docker-safe container name for a session handle
fn container_name(handle: &str) -> String {
    let handle: String = handle
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' || c == '.' { c } else { '-' })
        .collect();
    let suffix = uuid::Uuid::new_v4().simple().to_string();
    format!("keel-{}-{}", handle, &suffix[..8])
}
