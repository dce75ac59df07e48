// RunnerManager: owns the process-wide runner backend and the registry of
// live runners, and hides backend differences behind start/stop/health.

use crate::client::RunnerClient;
use async_trait::async_trait;
use coderun_common::constants::defaults;
use coderun_common::error::ProvisionError;
use coderun_common::settings::{BackendKind, RuntimeSettings};
use coderun_common::tracing::Tracing;
use coderun_common::{BuildArtifact, HostContext, RunnerId, SessionId};
use coderun_sdk::TraceWriter;
use futures::future::join_all;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;

/// Everything a backend needs to bring one runner up.
#[derive(Debug, Clone)]
pub struct StartRequest {
    pub session_id: SessionId,
    pub runner_id: RunnerId,
    pub artifact: Arc<BuildArtifact>,
    /// Session variables exported to the runner's environment.
    pub vars: HashMap<String, String>,
    /// Address the runner dials to reach the host's worker service.
    pub worker_address: String,
}

/// One way of provisioning runners: local processes, containers or a
/// remote pool. Exactly one is active per process.
#[async_trait]
pub trait RunnerBackend: Send + Sync {
    fn kind(&self) -> BackendKind;

    /// Provision a runner and return the endpoint its RPC server listens
    /// on. Dropping the future part-way releases everything acquired.
    async fn start(&self, request: &StartRequest) -> Result<String, ProvisionError>;

    /// Release every resource held for `runner_id`. Unknown ids are `Ok`.
    async fn stop(&self, runner_id: &RunnerId) -> Result<(), ProvisionError>;

    /// Probe one runner. Defaults to a direct health call on its client.
    async fn runner_health(
        &self,
        _runner_id: &RunnerId,
        client: &RunnerClient,
    ) -> Result<(), ProvisionError> {
        client.health().await.map_err(ProvisionError::from)
    }

    /// Whether the backend itself can provision runners.
    async fn health(&self) -> Result<(), ProvisionError>;
}

/// Deadlines applied by the manager around backend calls.
#[derive(Debug, Clone)]
pub struct ManagerOptions {
    /// Address runners are told to dial.
    pub worker_address: String,
    pub start_timeout: Duration,
    pub health_timeout: Duration,
    pub health_poll_interval: Duration,
}

impl ManagerOptions {
    pub fn from_settings(settings: &RuntimeSettings, worker_address: impl Into<String>) -> Self {
        Self {
            worker_address: worker_address.into(),
            start_timeout: settings.start_timeout,
            health_timeout: settings.health_timeout,
            health_poll_interval: defaults::HEALTH_POLL_INTERVAL,
        }
    }
}

struct RunnerEntry {
    session_id: SessionId,
    client: Arc<RunnerClient>,
}

/// Registry of live runners. Sessions are reserved before a runner is
/// provisioned so a second start for the same session fails immediately.
#[derive(Default)]
struct Registry {
    runners: HashMap<RunnerId, RunnerEntry>,
    sessions: HashMap<SessionId, RunnerId>,
}

pub struct RunnerManager {
    backend: Arc<dyn RunnerBackend>,
    options: ManagerOptions,
    registry: Arc<RwLock<Registry>>,
    trace: Tracing,
}

impl RunnerManager {
    pub fn new(context: &HostContext, backend: Arc<dyn RunnerBackend>, options: ManagerOptions) -> Self {
        Self {
            backend,
            options,
            registry: Arc::new(RwLock::new(Registry::default())),
            trace: context.get_trace("RunnerManager"),
        }
    }

    pub fn backend_kind(&self) -> BackendKind {
        self.backend.kind()
    }

    pub fn options(&self) -> &ManagerOptions {
        &self.options
    }

    /// Provision a runner for `session_id` and wait until it is healthy.
    pub async fn start(
        &self,
        session_id: &SessionId,
        artifact: Arc<BuildArtifact>,
        vars: HashMap<String, String>,
    ) -> Result<(RunnerId, Arc<RunnerClient>), ProvisionError> {
        let request = StartRequest {
            session_id: session_id.clone(),
            runner_id: RunnerId::generate(),
            artifact,
            vars,
            worker_address: self.options.worker_address.clone(),
        };
        let runner_id = request.runner_id.clone();
        let client = self.start_request(request).await?;
        Ok((runner_id, client))
    }

    /// Provision a runner under a caller-chosen id. Used by the pool server
    /// to honour ids assigned by a remote host.
    pub async fn start_request(&self, request: StartRequest) -> Result<Arc<RunnerClient>, ProvisionError> {
        let reservation = self.reserve(&request.session_id, &request.runner_id)?;
        let runner_id = request.runner_id.clone();
        self.trace.info(&format!(
            "Starting {} runner {} for session {}",
            self.backend.kind(),
            runner_id,
            request.session_id
        ));

        let mut guard = StartGuard::new(self.backend.clone(), runner_id.clone());
        let started = tokio::time::timeout(self.options.start_timeout, async {
            let endpoint = self.backend.start(&request).await?;
            guard.arm();
            let client = Arc::new(RunnerClient::new(runner_id.clone(), endpoint));
            self.wait_healthy(&client).await?;
            Ok::<_, ProvisionError>(client)
        })
        .await;

        let client = match started {
            Ok(Ok(client)) => client,
            Ok(Err(err)) => {
                self.trace
                    .error(&format!("Runner {runner_id} failed to start: {err}"));
                guard.release().await;
                return Err(err);
            }
            Err(_) => {
                self.trace.error(&format!(
                    "Runner {runner_id} did not start within {:?}",
                    self.options.start_timeout
                ));
                guard.release().await;
                return Err(ProvisionError::Timeout(self.options.start_timeout));
            }
        };

        guard.disarm();
        reservation.commit(client.clone());
        self.trace.info(&format!(
            "Runner {runner_id} is ready at {}",
            client.endpoint()
        ));
        Ok(client)
    }

    fn reserve(&self, session_id: &SessionId, runner_id: &RunnerId) -> Result<Reservation, ProvisionError> {
        let mut registry = self.registry.write();
        if registry.sessions.contains_key(session_id) {
            return Err(ProvisionError::AlreadyStarted(session_id.clone()));
        }
        registry
            .sessions
            .insert(session_id.clone(), runner_id.clone());
        Ok(Reservation {
            registry: self.registry.clone(),
            session_id: session_id.clone(),
            runner_id: runner_id.clone(),
            committed: false,
        })
    }

    /// Poll the runner's health until it answers or `health_timeout` passes.
    async fn wait_healthy(&self, client: &RunnerClient) -> Result<(), ProvisionError> {
        let deadline = Instant::now() + self.options.health_timeout;
        let mut last_error = String::from("no health probe completed");
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Err(ProvisionError::Unhealthy {
                    runner_id: client.runner_id().clone(),
                    timeout: self.options.health_timeout,
                    last_error,
                });
            }

            match tokio::time::timeout(remaining, client.health()).await {
                Ok(Ok(())) => return Ok(()),
                Ok(Err(err)) => last_error = err.to_string(),
                Err(_) => last_error = "health probe timed out".to_string(),
            }
            tokio::time::sleep(self.options.health_poll_interval.min(remaining)).await;
        }
    }

    /// Stop a runner and release its resources. Unknown or already stopped
    /// runners are a no-op.
    pub async fn stop(&self, runner_id: &RunnerId) -> Result<(), ProvisionError> {
        let entry = {
            let mut registry = self.registry.write();
            let entry = registry.runners.remove(runner_id);
            if let Some(entry) = &entry {
                registry.sessions.remove(&entry.session_id);
            }
            entry
        };

        let Some(entry) = entry else {
            self.trace
                .verbose(&format!("Runner {runner_id} is not registered, nothing to stop"));
            return Ok(());
        };

        self.trace.info(&format!(
            "Stopping runner {runner_id} of session {}",
            entry.session_id
        ));
        entry.client.disconnect().await;
        self.backend.stop(runner_id).await
    }

    /// Probe a registered runner. Fails fast with `NotFound` for unknown ids.
    pub async fn runner_health(&self, runner_id: &RunnerId) -> Result<(), ProvisionError> {
        let client = self
            .client(runner_id)
            .ok_or_else(|| ProvisionError::NotFound(runner_id.clone()))?;

        match tokio::time::timeout(
            self.options.health_timeout,
            self.backend.runner_health(runner_id, &client),
        )
        .await
        {
            Ok(result) => result,
            Err(_) => Err(ProvisionError::Unhealthy {
                runner_id: runner_id.clone(),
                timeout: self.options.health_timeout,
                last_error: "health probe timed out".to_string(),
            }),
        }
    }

    /// Health of the manager's backend.
    pub async fn health(&self) -> Result<(), ProvisionError> {
        self.backend.health().await
    }

    pub fn client(&self, runner_id: &RunnerId) -> Option<Arc<RunnerClient>> {
        self.registry
            .read()
            .runners
            .get(runner_id)
            .map(|entry| entry.client.clone())
    }

    pub fn runner_for_session(&self, session_id: &SessionId) -> Option<RunnerId> {
        let registry = self.registry.read();
        registry
            .sessions
            .get(session_id)
            .filter(|runner_id| registry.runners.contains_key(*runner_id))
            .cloned()
    }

    pub fn active_runners(&self) -> Vec<RunnerId> {
        self.registry.read().runners.keys().cloned().collect()
    }

    /// Stop every registered runner concurrently, collecting failures.
    pub async fn shutdown(&self) -> Result<(), ProvisionError> {
        let runners = self.active_runners();
        let results = join_all(runners.iter().map(|runner_id| self.stop(runner_id))).await;

        let mut errors = coderun_common::CleanupErrors::default();
        for (runner_id, result) in runners.iter().zip(results) {
            if let Err(err) = result {
                errors.push(&format!("stop runner {runner_id}"), err);
            }
        }
        errors.into_result()
    }
}

/// Holds a session's slot in the registry until the runner is committed.
struct Reservation {
    registry: Arc<RwLock<Registry>>,
    session_id: SessionId,
    runner_id: RunnerId,
    committed: bool,
}

impl Reservation {
    fn commit(mut self, client: Arc<RunnerClient>) {
        self.registry.write().runners.insert(
            self.runner_id.clone(),
            RunnerEntry {
                session_id: self.session_id.clone(),
                client,
            },
        );
        self.committed = true;
    }
}

impl Drop for Reservation {
    fn drop(&mut self) {
        if !self.committed {
            let mut registry = self.registry.write();
            if registry.sessions.get(&self.session_id) == Some(&self.runner_id) {
                registry.sessions.remove(&self.session_id);
            }
        }
    }
}

/// Stops a runner whose backend start completed but whose manager start
/// did not, including when the start future itself is dropped.
struct StartGuard {
    backend: Arc<dyn RunnerBackend>,
    runner_id: RunnerId,
    armed: bool,
}

impl StartGuard {
    fn new(backend: Arc<dyn RunnerBackend>, runner_id: RunnerId) -> Self {
        Self {
            backend,
            runner_id,
            armed: false,
        }
    }

    fn arm(&mut self) {
        self.armed = true;
    }

    fn disarm(&mut self) {
        self.armed = false;
    }

    /// Release synchronously from an async context.
    async fn release(&mut self) {
        if std::mem::take(&mut self.armed) {
            if let Err(err) = self.backend.stop(&self.runner_id).await {
                tracing::warn!(runner_id = %self.runner_id, "Failed to release runner: {err}");
            }
        }
    }
}

impl Drop for StartGuard {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        let backend = self.backend.clone();
        let runner_id = self.runner_id.clone();
        if let Ok(handle) = tokio::runtime::Handle::try_current() {
            handle.spawn(async move {
                if let Err(err) = backend.stop(&runner_id).await {
                    tracing::warn!(runner_id = %runner_id, "Failed to release abandoned runner: {err}");
                }
            });
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use coderun_common::protocol::{Ack, FramedConnection, Message, WireMessage};
    use parking_lot::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::net::TcpListener;

    /// Backend whose runners are in-process tasks answering health probes.
    #[derive(Default)]
    pub(crate) struct TaskBackend {
        pub healthy: bool,
        pub starts: AtomicUsize,
        pub stops: Mutex<Vec<RunnerId>>,
        tasks: Mutex<HashMap<RunnerId, tokio::task::JoinHandle<()>>>,
    }

    impl TaskBackend {
        pub fn healthy() -> Self {
            Self {
                healthy: true,
                ..Default::default()
            }
        }
    }

    #[async_trait]
    impl RunnerBackend for TaskBackend {
        fn kind(&self) -> BackendKind {
            BackendKind::Local
        }

        async fn start(&self, request: &StartRequest) -> Result<String, ProvisionError> {
            self.starts.fetch_add(1, Ordering::SeqCst);
            let listener = TcpListener::bind("127.0.0.1:0")
                .await
                .map_err(|e| ProvisionError::Backend(e.into()))?;
            let endpoint = listener
                .local_addr()
                .map_err(|e| ProvisionError::Backend(e.into()))?
                .to_string();
            let healthy = self.healthy;
            let task = tokio::spawn(async move {
                while let Ok((stream, _)) = listener.accept().await {
                    if !healthy {
                        drop(stream);
                        continue;
                    }
                    tokio::spawn(async move {
                        let mut conn = FramedConnection::new(stream);
                        while let Ok(envelope) = conn.receive().await {
                            if conn.send(envelope.id, &Message::Ack(Ack {})).await.is_err() {
                                break;
                            }
                            let _ = Message::decode(&envelope);
                        }
                    });
                }
            });
            self.tasks.lock().insert(request.runner_id.clone(), task);
            Ok(endpoint)
        }

        async fn stop(&self, runner_id: &RunnerId) -> Result<(), ProvisionError> {
            if let Some(task) = self.tasks.lock().remove(runner_id) {
                task.abort();
            }
            self.stops.lock().push(runner_id.clone());
            Ok(())
        }

        async fn health(&self) -> Result<(), ProvisionError> {
            Ok(())
        }
    }

    fn manager(backend: Arc<TaskBackend>, health_timeout: Duration) -> RunnerManager {
        let context = HostContext::new("Test", RuntimeSettings::default());
        RunnerManager::new(
            &context,
            backend,
            ManagerOptions {
                worker_address: "127.0.0.1:1".into(),
                start_timeout: Duration::from_secs(10),
                health_timeout,
                health_poll_interval: Duration::from_millis(20),
            },
        )
    }

    #[tokio::test]
    async fn start_registers_and_stop_is_idempotent() {
        let backend = Arc::new(TaskBackend::healthy());
        let manager = manager(backend.clone(), Duration::from_secs(2));
        let session = SessionId::from("ses_1");

        let (runner_id, client) = manager
            .start(&session, Arc::new(BuildArtifact::default()), HashMap::new())
            .await
            .unwrap();
        assert_eq!(client.runner_id(), &runner_id);
        assert_eq!(manager.runner_for_session(&session), Some(runner_id.clone()));
        manager.runner_health(&runner_id).await.unwrap();

        manager.stop(&runner_id).await.unwrap();
        manager.stop(&runner_id).await.unwrap();
        assert_eq!(backend.stops.lock().len(), 1);
        assert!(manager.active_runners().is_empty());
    }

    #[tokio::test]
    async fn second_start_for_session_is_rejected() {
        let backend = Arc::new(TaskBackend::healthy());
        let manager = manager(backend.clone(), Duration::from_secs(2));
        let session = SessionId::from("ses_1");
        let artifact = Arc::new(BuildArtifact::default());

        let (runner_id, _) = manager
            .start(&session, artifact.clone(), HashMap::new())
            .await
            .unwrap();
        let err = manager
            .start(&session, artifact.clone(), HashMap::new())
            .await
            .unwrap_err();
        assert!(matches!(err, ProvisionError::AlreadyStarted(_)));
        assert_eq!(backend.starts.load(Ordering::SeqCst), 1);

        manager.stop(&runner_id).await.unwrap();
        let (again, _) = manager.start(&session, artifact, HashMap::new()).await.unwrap();
        assert_ne!(again, runner_id);
    }

    #[tokio::test]
    async fn unknown_runner_health_fails_fast() {
        let manager = manager(Arc::new(TaskBackend::healthy()), Duration::from_secs(30));
        let started = std::time::Instant::now();
        let err = manager
            .runner_health(&RunnerId::from("rnr_missing"))
            .await
            .unwrap_err();
        assert!(err.is_not_found());
        assert!(started.elapsed() < Duration::from_secs(1));
    }

    #[tokio::test]
    async fn unhealthy_runner_fails_start_and_is_released() {
        let backend = Arc::new(TaskBackend::default());
        let manager = manager(backend.clone(), Duration::from_millis(300));
        let session = SessionId::from("ses_sick");

        let err = manager
            .start(&session, Arc::new(BuildArtifact::default()), HashMap::new())
            .await
            .unwrap_err();
        assert!(matches!(err, ProvisionError::Unhealthy { .. }), "{err}");
        assert_eq!(backend.stops.lock().len(), 1);
        assert!(manager.active_runners().is_empty());
        assert!(manager.runner_for_session(&session).is_none());

        // The session slot was released, so a retry is allowed.
        let retry = manager
            .start(&session, Arc::new(BuildArtifact::default()), HashMap::new())
            .await
            .unwrap_err();
        assert!(matches!(retry, ProvisionError::Unhealthy { .. }));
    }
}
