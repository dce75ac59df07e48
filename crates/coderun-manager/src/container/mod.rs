// Container backend: runners as containers built from content-addressed
// images, on an isolated network.

mod backend;
mod docker;

pub use backend::{image_tag, ContainerBackend};
pub use docker::DockerCli;

use anyhow::Result;
use async_trait::async_trait;
use std::collections::BTreeMap;
use std::path::Path;

/// Description of one runner container.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ContainerSpec {
    pub name: String,
    pub image: String,
    pub network: String,
    pub environment: BTreeMap<String, String>,
    /// Port inside the container, published to an ephemeral loopback port.
    pub container_port: u16,
    pub extra_hosts: Vec<String>,
}

impl ContainerSpec {
    pub fn build_env_args(&self) -> Vec<String> {
        let mut args = Vec::new();
        for (key, value) in &self.environment {
            args.push("-e".to_string());
            args.push(format!("{key}={value}"));
        }
        args
    }

    pub fn build_port_args(&self) -> Vec<String> {
        vec![
            "-p".to_string(),
            format!("127.0.0.1::{}", self.container_port),
        ]
    }

    pub fn build_host_args(&self) -> Vec<String> {
        let mut args = Vec::new();
        for host in &self.extra_hosts {
            args.push("--add-host".to_string());
            args.push(host.clone());
        }
        args
    }
}

/// The container operations the backend needs.
#[async_trait]
pub trait ContainerEngine: Send + Sync {
    async fn image_exists(&self, tag: &str) -> Result<bool>;

    /// Build `tag` from a context directory holding a `Dockerfile`.
    async fn build_image(&self, context_dir: &Path, tag: &str) -> Result<()>;

    /// Create the network with inter-container traffic disabled, unless it
    /// already exists.
    async fn ensure_network(&self, name: &str) -> Result<()>;

    /// Start a detached container and return its id.
    async fn run_container(&self, spec: &ContainerSpec) -> Result<String>;

    /// Host port published for `container_port`, if assigned yet.
    async fn published_port(&self, container_id: &str, container_port: u16) -> Result<Option<u16>>;

    async fn stop_container(&self, container_id: &str) -> Result<()>;

    async fn remove_container(&self, container_id: &str) -> Result<()>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn spec_args_publish_on_loopback() {
        let mut spec = ContainerSpec {
            name: "coderun-r1".into(),
            image: "coderun-runner:abc".into(),
            network: "coderun-runners".into(),
            container_port: 9293,
            extra_hosts: vec!["host.docker.internal:host-gateway".into()],
            ..Default::default()
        };
        spec.environment.insert("B".into(), "2".into());
        spec.environment.insert("A".into(), "1".into());

        assert_eq!(spec.build_port_args(), vec!["-p", "127.0.0.1::9293"]);
        assert_eq!(spec.build_env_args(), vec!["-e", "A=1", "-e", "B=2"]);
        assert_eq!(
            spec.build_host_args(),
            vec!["--add-host", "host.docker.internal:host-gateway"]
        );
    }
}
