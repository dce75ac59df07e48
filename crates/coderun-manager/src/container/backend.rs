// ContainerBackend: content-addressed runner images, one container per runner.

use super::{ContainerEngine, ContainerSpec};
use crate::manager::{RunnerBackend, StartRequest};
use anyhow::{Context, Result};
use async_trait::async_trait;
use coderun_common::constants::variables;
use coderun_common::error::{CleanupErrors, ProvisionError};
use coderun_common::settings::{BackendKind, ContainerSettings, LocalSettings, RuntimeSettings};
use coderun_common::tracing::Tracing;
use coderun_common::{BuildArtifact, HostContext, RunnerId};
use coderun_sdk::{IOUtil, TraceWriter};
use dashmap::DashMap;
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::OnceCell;

const RUNNER_ROOT: &str = "/opt/coderun";
const PORT_POLL_INTERVAL: Duration = Duration::from_millis(200);
const WORKER_HOST_ALIAS: &str = "host.docker.internal:host-gateway";

/// Deterministic image tag for an artifact: `<repository>:<32 hex chars>`.
pub fn image_tag(repository: &str, artifact: &BuildArtifact) -> String {
    let hash = artifact.content_hash();
    format!("{repository}:{}", &hash[..32])
}

fn render_dockerfile(base_image: &str, local: &LocalSettings, runner_port: u16) -> String {
    let interpreter = Path::new(&local.interpreter)
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_else(|| local.interpreter.clone());
    let var = &local.search_path_var;
    format!(
        "FROM {base_image}\n\
         COPY support/ {RUNNER_ROOT}/support/\n\
         COPY code/ {RUNNER_ROOT}/code/\n\
         WORKDIR {RUNNER_ROOT}/code\n\
         ENV {var}=\"${{{var}:+${{{var}}}:}}{RUNNER_ROOT}/code:{RUNNER_ROOT}/support\"\n\
         EXPOSE {runner_port}\n\
         ENTRYPOINT [\"{interpreter}\", \"{RUNNER_ROOT}/support/{entry}\", \"--port\", \"{runner_port}\", \"--bind\", \"0.0.0.0\"]\n",
        entry = local.runner_entry,
    )
}

/// Removes a started container unless disarmed.
struct ContainerGuard {
    engine: Arc<dyn ContainerEngine>,
    container_id: Option<String>,
}

impl ContainerGuard {
    fn disarm(mut self) -> String {
        self.container_id.take().unwrap_or_default()
    }

    async fn release(mut self) {
        if let Some(id) = self.container_id.take() {
            if let Err(err) = self.engine.remove_container(&id).await {
                tracing::warn!(target: "docker", "Failed to remove container {id}: {err:#}");
            }
        }
    }
}

impl Drop for ContainerGuard {
    fn drop(&mut self) {
        let Some(id) = self.container_id.take() else {
            return;
        };
        let engine = self.engine.clone();
        if let Ok(handle) = tokio::runtime::Handle::try_current() {
            handle.spawn(async move {
                if let Err(err) = engine.remove_container(&id).await {
                    tracing::warn!(target: "docker", "Failed to remove abandoned container {id}: {err:#}");
                }
            });
        }
    }
}

pub struct ContainerBackend {
    engine: Arc<dyn ContainerEngine>,
    settings: ContainerSettings,
    local: LocalSettings,
    known_tags: Mutex<HashSet<String>>,
    build_locks: DashMap<String, Arc<tokio::sync::Mutex<()>>>,
    network: OnceCell<()>,
    runners: Mutex<HashMap<RunnerId, String>>,
    trace: Tracing,
}

impl ContainerBackend {
    pub fn new(context: &HostContext, settings: &RuntimeSettings, engine: Arc<dyn ContainerEngine>) -> Self {
        Self {
            engine,
            settings: settings.container.clone(),
            local: settings.local.clone(),
            known_tags: Mutex::new(HashSet::new()),
            build_locks: DashMap::new(),
            network: OnceCell::new(),
            runners: Mutex::new(HashMap::new()),
            trace: context.get_trace("ContainerBackend"),
        }
    }

    pub fn container_id(&self, runner_id: &RunnerId) -> Option<String> {
        self.runners.lock().get(runner_id).cloned()
    }

    /// Build the artifact's image unless it is already known or present,
    /// and return its tag.
    pub async fn ensure_image(&self, artifact: &BuildArtifact) -> Result<String> {
        let tag = image_tag(&self.settings.image_repository, artifact);
        if self.known_tags.lock().contains(&tag) {
            return Ok(tag);
        }

        let lock = self.build_locks.entry(tag.clone()).or_default().clone();
        let _build = lock.lock().await;
        if self.known_tags.lock().contains(&tag) {
            return Ok(tag);
        }

        if self.engine.image_exists(&tag).await? {
            self.trace.verbose(&format!("Reusing existing image {tag}"));
        } else {
            self.trace.info(&format!("Building runner image {tag}"));
            let context_dir = self.prepare_build_context(artifact).await?;
            self.engine
                .build_image(context_dir.path(), &tag)
                .await
                .with_context(|| format!("failed to build image {tag}"))?;
        }
        self.known_tags.lock().insert(tag.clone());
        Ok(tag)
    }

    async fn prepare_build_context(&self, artifact: &BuildArtifact) -> Result<tempfile::TempDir> {
        let artifact = artifact.clone();
        let support_source = self.local.support_dir.clone();
        let dockerfile =
            render_dockerfile(&self.settings.base_image, &self.local, self.settings.runner_port);

        tokio::task::spawn_blocking(move || -> Result<tempfile::TempDir> {
            let dir = tempfile::Builder::new()
                .prefix("coderun-image-")
                .tempdir()
                .context("failed to create image build context")?;

            let code = dir.path().join("code");
            std::fs::create_dir_all(&code)?;
            artifact.extract_archive(&code)?;

            let support = dir.path().join("support");
            match support_source {
                Some(source) => {
                    IOUtil::copy_directory(&source, &support)?;
                }
                None => std::fs::create_dir_all(&support)?,
            }

            std::fs::write(dir.path().join("Dockerfile"), dockerfile)
                .context("failed to write Dockerfile")?;
            Ok(dir)
        })
        .await
        .context("image build context preparation was interrupted")?
    }

    async fn ensure_network(&self) -> Result<()> {
        self.network
            .get_or_try_init(|| self.engine.ensure_network(&self.settings.network))
            .await?;
        Ok(())
    }

    async fn discover_port(&self, container_id: &str) -> Result<u16> {
        let attempts = self.settings.port_discovery_attempts.max(1);
        for attempt in 1..=attempts {
            if let Some(port) = self
                .engine
                .published_port(container_id, self.settings.runner_port)
                .await?
            {
                return Ok(port);
            }
            if attempt < attempts {
                tokio::time::sleep(PORT_POLL_INTERVAL * attempt).await;
            }
        }
        anyhow::bail!(
            "container {container_id} published no port for {} after {attempts} attempts",
            self.settings.runner_port
        )
    }

    fn container_spec(&self, request: &StartRequest, image: String) -> ContainerSpec {
        let mut environment: std::collections::BTreeMap<String, String> = request
            .vars
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        let code_dir = PathBuf::from(RUNNER_ROOT).join("code");
        environment.insert(
            variables::runner::WORKER_ADDRESS.to_string(),
            request.worker_address.clone(),
        );
        environment.insert(
            variables::runner::SESSION_ID.to_string(),
            request.session_id.to_string(),
        );
        environment.insert(
            variables::runner::RUNNER_ID.to_string(),
            request.runner_id.to_string(),
        );
        environment.insert(
            variables::runner::CODE_DIR.to_string(),
            code_dir.to_string_lossy().to_string(),
        );
        environment.insert(
            variables::runner::PORT.to_string(),
            self.settings.runner_port.to_string(),
        );

        ContainerSpec {
            name: format!("coderun-{}", request.runner_id),
            image,
            network: self.settings.network.clone(),
            environment,
            container_port: self.settings.runner_port,
            extra_hosts: vec![WORKER_HOST_ALIAS.to_string()],
        }
    }
}

#[async_trait]
impl RunnerBackend for ContainerBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::Container
    }

    async fn start(&self, request: &StartRequest) -> Result<String, ProvisionError> {
        let image = self.ensure_image(&request.artifact).await?;
        self.ensure_network().await?;

        let spec = self.container_spec(request, image);
        let container_id = self.engine.run_container(&spec).await?;
        let guard = ContainerGuard {
            engine: self.engine.clone(),
            container_id: Some(container_id.clone()),
        };

        let port = match self.discover_port(&container_id).await {
            Ok(port) => port,
            Err(err) => {
                guard.release().await;
                return Err(err.into());
            }
        };

        let container_id = guard.disarm();
        self.trace.info(&format!(
            "Runner {} is container {} on port {port}",
            request.runner_id,
            &container_id[..container_id.len().min(12)]
        ));
        self.runners
            .lock()
            .insert(request.runner_id.clone(), container_id);
        Ok(format!("127.0.0.1:{port}"))
    }

    async fn stop(&self, runner_id: &RunnerId) -> Result<(), ProvisionError> {
        let Some(container_id) = self.runners.lock().remove(runner_id) else {
            return Ok(());
        };

        let mut errors = CleanupErrors::default();
        if let Err(err) = self.engine.stop_container(&container_id).await {
            errors.push("stop container", format!("{err:#}"));
        }
        if let Err(err) = self.engine.remove_container(&container_id).await {
            errors.push("remove container", format!("{err:#}"));
        }
        errors.into_result()
    }

    async fn health(&self) -> Result<(), ProvisionError> {
        self.ensure_network().await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use coderun_common::constants::artifact::ARCHIVE_BLOB;
    use coderun_common::SessionId;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Default)]
    struct FakeEngine {
        images: Mutex<HashSet<String>>,
        inspects: AtomicUsize,
        builds: AtomicUsize,
        networks: AtomicUsize,
        /// `published_port` answers `None` this many times first.
        port_delay: usize,
        port_calls: AtomicUsize,
        never_publish: bool,
        removed: Mutex<Vec<String>>,
        calls: Mutex<Vec<String>>,
        started: AtomicUsize,
    }

    #[async_trait]
    impl ContainerEngine for FakeEngine {
        async fn image_exists(&self, tag: &str) -> Result<bool> {
            self.inspects.fetch_add(1, Ordering::SeqCst);
            Ok(self.images.lock().contains(tag))
        }

        async fn build_image(&self, context_dir: &Path, tag: &str) -> Result<()> {
            assert!(context_dir.join("Dockerfile").is_file());
            assert!(context_dir.join("code/flow.py").is_file());
            tokio::time::sleep(Duration::from_millis(20)).await;
            self.builds.fetch_add(1, Ordering::SeqCst);
            self.images.lock().insert(tag.to_string());
            Ok(())
        }

        async fn ensure_network(&self, _name: &str) -> Result<()> {
            self.networks.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        async fn run_container(&self, spec: &ContainerSpec) -> Result<String> {
            let n = self.started.fetch_add(1, Ordering::SeqCst);
            assert!(spec.environment.contains_key("CODERUN_SESSION_ID"));
            Ok(format!("container{n}"))
        }

        async fn published_port(&self, _id: &str, _port: u16) -> Result<Option<u16>> {
            let call = self.port_calls.fetch_add(1, Ordering::SeqCst);
            if self.never_publish || call < self.port_delay {
                return Ok(None);
            }
            Ok(Some(40000 + call as u16))
        }

        async fn stop_container(&self, id: &str) -> Result<()> {
            self.calls.lock().push(format!("stop {id}"));
            Ok(())
        }

        async fn remove_container(&self, id: &str) -> Result<()> {
            self.calls.lock().push(format!("rm {id}"));
            self.removed.lock().push(id.to_string());
            Ok(())
        }
    }

    fn artifact() -> Arc<BuildArtifact> {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("flow.py"), "def main(event):\n    pass\n").unwrap();
        Arc::new(coderun_common::packager::build(dir.path()).unwrap())
    }

    fn backend(engine: Arc<FakeEngine>) -> ContainerBackend {
        let context = HostContext::new("Test", RuntimeSettings::default());
        let mut settings = RuntimeSettings::default();
        settings.backend = BackendKind::Container;
        ContainerBackend::new(&context, &settings, engine)
    }

    fn request(session: &str, artifact: Arc<BuildArtifact>) -> StartRequest {
        StartRequest {
            session_id: SessionId::from(session),
            runner_id: RunnerId::generate(),
            artifact,
            vars: HashMap::from([("GREETING".to_string(), "hi".to_string())]),
            worker_address: "host.docker.internal:7000".into(),
        }
    }

    #[test]
    fn tag_is_repository_and_hash_prefix() {
        let mut artifact = BuildArtifact::default();
        artifact.blobs.insert(ARCHIVE_BLOB.into(), b"abc".to_vec());
        assert_eq!(
            image_tag("coderun-runner", &artifact),
            "coderun-runner:ba7816bf8f01cfea414140de5dae2223"
        );
    }

    #[test]
    fn dockerfile_appends_search_path() {
        let text = render_dockerfile("python:3.11-slim", &LocalSettings::default(), 9293);
        assert!(text.starts_with("FROM python:3.11-slim\n"));
        assert!(text.contains(
            "ENV PYTHONPATH=\"${PYTHONPATH:+${PYTHONPATH}:}/opt/coderun/code:/opt/coderun/support\""
        ));
        assert!(text.contains("\"/opt/coderun/support/main.py\", \"--port\", \"9293\""));
    }

    #[tokio::test]
    async fn identical_artifacts_build_once() {
        let engine = Arc::new(FakeEngine::default());
        let backend = backend(engine.clone());
        let artifact = artifact();

        let first = backend.start(&request("s1", artifact.clone())).await.unwrap();
        let second = backend.start(&request("s2", artifact.clone())).await.unwrap();
        assert_ne!(first, second);
        assert_eq!(engine.builds.load(Ordering::SeqCst), 1);
        assert_eq!(engine.inspects.load(Ordering::SeqCst), 1);
        assert_eq!(engine.networks.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn concurrent_starts_share_one_build() {
        let engine = Arc::new(FakeEngine::default());
        let backend = backend(engine.clone());
        let artifact = artifact();

        let (first, second) = (request("s1", artifact.clone()), request("s2", artifact.clone()));
        let (a, b) = tokio::join!(backend.start(&first), backend.start(&second));
        a.unwrap();
        b.unwrap();
        assert_eq!(engine.builds.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn existing_image_is_not_rebuilt() {
        let engine = Arc::new(FakeEngine::default());
        let artifact = artifact();
        engine
            .images
            .lock()
            .insert(image_tag("coderun-runner", &artifact));
        let backend = backend(engine.clone());

        backend.start(&request("s1", artifact)).await.unwrap();
        assert_eq!(engine.builds.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn port_is_polled_until_published() {
        let engine = Arc::new(FakeEngine {
            port_delay: 2,
            ..Default::default()
        });
        let backend = backend(engine.clone());
        let endpoint = backend.start(&request("s1", artifact())).await.unwrap();
        assert_eq!(endpoint, "127.0.0.1:40002");
        assert_eq!(engine.port_calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn unpublished_port_fails_and_removes_container() {
        let engine = Arc::new(FakeEngine {
            never_publish: true,
            ..Default::default()
        });
        let backend = backend(engine.clone());
        let err = backend.start(&request("s1", artifact())).await.unwrap_err();
        assert!(err.to_string().contains("after 5 attempts"), "{err}");
        assert_eq!(engine.port_calls.load(Ordering::SeqCst), 5);
        assert_eq!(engine.removed.lock().as_slice(), ["container0".to_string()]);
    }

    #[tokio::test]
    async fn stop_stops_then_removes_and_is_idempotent() {
        let engine = Arc::new(FakeEngine::default());
        let backend = backend(engine.clone());
        let req = request("s1", artifact());
        backend.start(&req).await.unwrap();
        assert_eq!(backend.container_id(&req.runner_id).as_deref(), Some("container0"));

        backend.stop(&req.runner_id).await.unwrap();
        backend.stop(&req.runner_id).await.unwrap();
        assert_eq!(
            engine.calls.lock().as_slice(),
            ["stop container0".to_string(), "rm container0".to_string()]
        );
    }
}
