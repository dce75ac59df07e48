// DockerCli: the container engine driven through the docker CLI.

use super::{ContainerEngine, ContainerSpec};
use anyhow::{Context, Result};
use async_trait::async_trait;
use coderun_sdk::{ProcessInvoker, ProcessOutput, TraceWriter};
use std::path::Path;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// Docker CLI trace writer.
struct DockerTraceWriter;

impl TraceWriter for DockerTraceWriter {
    fn info(&self, message: &str) {
        tracing::info!(target: "docker", "{}", message);
    }

    fn verbose(&self, message: &str) {
        tracing::debug!(target: "docker", "{}", message);
    }

    fn error(&self, message: &str) {
        tracing::error!(target: "docker", "{}", message);
    }
}

pub struct DockerCli {
    docker_path: String,
    invoker: ProcessInvoker,
}

impl DockerCli {
    pub fn new(docker_path: impl Into<String>) -> Self {
        Self {
            docker_path: docker_path.into(),
            invoker: ProcessInvoker::new(Arc::new(DockerTraceWriter)),
        }
    }

    pub fn docker_path(&self) -> &str {
        &self.docker_path
    }

    /// Run a docker command; a non-zero exit is an error carrying stderr.
    async fn run_docker_command(&self, arguments: &[String]) -> Result<ProcessOutput> {
        self.invoker
            .execute(
                None,
                &self.docker_path,
                arguments,
                None,
                true,
                CancellationToken::new(),
            )
            .await
            .with_context(|| {
                format!(
                    "Docker command failed: {} {}",
                    self.docker_path,
                    arguments.join(" ")
                )
            })
    }

    /// Run a docker command and only report whether it exited with zero.
    async fn probe(&self, arguments: &[String]) -> Result<bool> {
        let output = self
            .invoker
            .execute(
                None,
                &self.docker_path,
                arguments,
                None,
                false,
                CancellationToken::new(),
            )
            .await?;
        Ok(output.exit_code == 0)
    }
}

fn args(parts: &[&str]) -> Vec<String> {
    parts.iter().map(|p| p.to_string()).collect()
}

/// Parse `docker port` output such as `127.0.0.1:49153` or `[::1]:49153`.
pub(crate) fn parse_port_output(output: &str) -> Option<u16> {
    output
        .lines()
        .filter_map(|line| line.trim().rsplit_once(':'))
        .find_map(|(_, port)| port.trim().parse().ok())
}

#[async_trait]
impl ContainerEngine for DockerCli {
    async fn image_exists(&self, tag: &str) -> Result<bool> {
        self.probe(&args(&["image", "inspect", "--format", "{{.Id}}", tag]))
            .await
    }

    async fn build_image(&self, context_dir: &Path, tag: &str) -> Result<()> {
        let dockerfile = context_dir.join("Dockerfile");
        self.run_docker_command(&[
            "build".to_string(),
            "-t".to_string(),
            tag.to_string(),
            "-f".to_string(),
            dockerfile.to_string_lossy().to_string(),
            context_dir.to_string_lossy().to_string(),
        ])
        .await?;
        Ok(())
    }

    async fn ensure_network(&self, name: &str) -> Result<()> {
        if self.probe(&args(&["network", "inspect", name])).await? {
            return Ok(());
        }
        let created = self
            .run_docker_command(&args(&[
                "network",
                "create",
                "--driver",
                "bridge",
                "-o",
                "com.docker.network.bridge.enable_icc=false",
                name,
            ]))
            .await;
        let Err(err) = created else {
            return Ok(());
        };
        // Another host may have created it between inspect and create.
        if self.probe(&args(&["network", "inspect", name])).await? {
            tracing::debug!(target: "docker", "network {name} appeared concurrently: {err:#}");
            return Ok(());
        }
        Err(err)
    }

    async fn run_container(&self, spec: &ContainerSpec) -> Result<String> {
        let mut arguments = args(&["run", "--detach", "--name", &spec.name]);
        arguments.push("--network".to_string());
        arguments.push(spec.network.clone());
        arguments.extend(spec.build_host_args());
        arguments.extend(spec.build_env_args());
        arguments.extend(spec.build_port_args());
        arguments.push(spec.image.clone());

        let output = self.run_docker_command(&arguments).await?;
        let container_id = output.stdout_text().trim().to_string();
        anyhow::ensure!(
            !container_id.is_empty(),
            "docker run returned no container id for {}",
            spec.name
        );
        Ok(container_id)
    }

    async fn published_port(&self, container_id: &str, container_port: u16) -> Result<Option<u16>> {
        let output = self
            .invoker
            .execute(
                None,
                &self.docker_path,
                &args(&["port", container_id, &format!("{container_port}/tcp")]),
                None,
                false,
                CancellationToken::new(),
            )
            .await?;
        if output.exit_code != 0 {
            return Ok(None);
        }
        Ok(parse_port_output(&output.stdout_text()))
    }

    async fn stop_container(&self, container_id: &str) -> Result<()> {
        self.run_docker_command(&args(&["stop", container_id])).await?;
        Ok(())
    }

    async fn remove_container(&self, container_id: &str) -> Result<()> {
        self.run_docker_command(&args(&["rm", "--force", container_id]))
            .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn port_output_is_parsed() {
        assert_eq!(parse_port_output("127.0.0.1:49153\n"), Some(49153));
        assert_eq!(parse_port_output("[::1]:5000"), Some(5000));
        assert_eq!(parse_port_output(""), None);
        assert_eq!(parse_port_output("garbage"), None);
    }

    #[test]
    fn docker_cli_keeps_custom_path() {
        let cli = DockerCli::new("/usr/local/bin/docker");
        assert_eq!(cli.docker_path(), "/usr/local/bin/docker");
    }

    #[tokio::test]
    async fn missing_docker_binary_is_an_error() {
        let cli = DockerCli::new("/nonexistent/docker-xyz");
        assert!(cli.image_exists("coderun-runner:abc").await.is_err());
    }
}
