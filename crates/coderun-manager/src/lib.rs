// coderun-manager: provisions runners for code sessions.
//
// Architecture:
//   RunnerManager → RunnerBackend (LocalBackend | ContainerBackend | RemoteBackend)
//   RunnerManager → RunnerClient (host → runner calls)
//   RunnerPoolServer exposes a RunnerManager to RemoteBackends on other hosts.

pub mod client;
pub mod container;
pub mod local;
pub mod manager;
pub mod remote;

pub use client::RunnerClient;
pub use container::{ContainerBackend, ContainerEngine, DockerCli};
pub use local::LocalBackend;
pub use manager::{ManagerOptions, RunnerBackend, RunnerManager, StartRequest};
pub use remote::{PoolMessage, RemoteBackend, RunnerPoolServer};

use coderun_common::error::ProvisionError;
use coderun_common::settings::{BackendKind, RuntimeSettings};
use coderun_common::HostContext;
use std::sync::Arc;

/// Construct the backend selected by `settings.backend`.
pub async fn build_backend(
    context: &HostContext,
    settings: &RuntimeSettings,
) -> Result<Arc<dyn RunnerBackend>, ProvisionError> {
    let backend: Arc<dyn RunnerBackend> = match settings.backend {
        BackendKind::Local => Arc::new(LocalBackend::new(context, settings).await?),
        BackendKind::Container => {
            let engine = Arc::new(DockerCli::new(settings.container.docker_path.clone()));
            Arc::new(ContainerBackend::new(context, settings, engine))
        }
        BackendKind::Remote => Arc::new(RemoteBackend::new(
            context,
            settings.remote_endpoints.clone(),
        )?),
    };
    Ok(backend)
}
