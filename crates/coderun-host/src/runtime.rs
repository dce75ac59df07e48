// Runtime: what the platform calls to build user code and run sessions.

use crate::coordinator::{CoordinatorOptions, SessionCoordinator, SessionState};
use crate::service::WorkerService;
use crate::sink::{SessionSink, TracingSink};
use coderun_common::error::RuntimeError;
use coderun_common::settings::{BackendKind, RuntimeSettings};
use coderun_common::tracing::Tracing;
use coderun_common::{
    packager, BuildArtifact, DurableEngine, Export, HostContext, RunId, RunnerId, SessionId, Value,
};
use coderun_manager::{ManagerOptions, RunnerBackend, RunnerManager};
use coderun_sdk::TraceWriter;
use std::collections::{BTreeMap, HashMap};
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::path::Path;
use std::sync::Arc;

pub struct Runtime {
    context: Arc<HostContext>,
    manager: Arc<RunnerManager>,
    service: Arc<WorkerService>,
    engine: Arc<dyn DurableEngine>,
    sink: Arc<dyn SessionSink>,
    options: CoordinatorOptions,
    trace: Tracing,
}

impl Runtime {
    /// Select the backend named in `settings` and start the worker service.
    pub async fn new(
        settings: RuntimeSettings,
        engine: Arc<dyn DurableEngine>,
    ) -> Result<Self, RuntimeError> {
        let context = HostContext::new("Host", settings);
        let backend = coderun_manager::build_backend(&context, context.settings()).await?;
        Self::with_backend(context, backend, engine).await
    }

    pub async fn with_backend(
        context: Arc<HostContext>,
        backend: Arc<dyn RunnerBackend>,
        engine: Arc<dyn DurableEngine>,
    ) -> Result<Self, RuntimeError> {
        let settings = context.settings().clone();
        let bind_address = worker_bind_address(&settings, backend.kind());
        let service = WorkerService::bind(&context, &bind_address).await?;
        let runner_address =
            resolve_runner_address(&settings, backend.kind(), service.local_addr());

        let trace = context.get_trace("Runtime");
        trace.info(&format!(
            "Runtime ready: {} backend, runners dial {runner_address}",
            backend.kind()
        ));

        let manager = Arc::new(RunnerManager::new(
            &context,
            backend,
            ManagerOptions::from_settings(&settings, runner_address),
        ));
        Ok(Self {
            manager,
            service,
            engine,
            sink: Arc::new(TracingSink::from_settings(&settings)),
            options: CoordinatorOptions::from_settings(&settings),
            context,
            trace,
        })
    }

    /// Send session output somewhere other than the process log.
    pub fn with_sink(mut self, sink: Arc<dyn SessionSink>) -> Self {
        self.sink = sink;
        self
    }

    pub fn manager(&self) -> &Arc<RunnerManager> {
        &self.manager
    }

    pub fn worker_addr(&self) -> SocketAddr {
        self.service.local_addr()
    }

    /// Address runners are told to dial.
    pub fn runner_worker_address(&self) -> &str {
        &self.manager.options().worker_address
    }

    pub fn build(&self, source: &Path) -> Result<BuildArtifact, RuntimeError> {
        Ok(packager::build(source)?)
    }

    /// Start a runner for `session_id` and wait until it reports its
    /// exports. `entry_point` is `file.py:function` and must be exported.
    pub async fn run(
        &self,
        session_id: SessionId,
        run_id: RunId,
        entry_point: &str,
        artifact: Arc<BuildArtifact>,
        vars: HashMap<String, String>,
    ) -> Result<SessionRun, RuntimeError> {
        if !artifact.has_entry_point(entry_point) {
            return Err(RuntimeError::UnknownEntryPoint(entry_point.to_string()));
        }

        let mailbox = self.service.register(&session_id)?;
        let mut coordinator = SessionCoordinator::new(
            &self.context,
            run_id,
            self.manager.clone(),
            self.engine.clone(),
            self.sink.clone(),
            mailbox,
            self.options.clone(),
        );
        coordinator.start(artifact, vars).await?;

        if !exports_entry_point(coordinator.exports(), entry_point) {
            self.trace.warning(&format!(
                "Runner for session {session_id} does not export {entry_point}"
            ));
            if let Err(err) = coordinator.stop().await {
                self.trace.error(&format!("Failed to stop runner: {err}"));
            }
            return Err(RuntimeError::UnknownEntryPoint(entry_point.to_string()));
        }

        Ok(SessionRun {
            coordinator,
            entry_point: entry_point.to_string(),
            finished: false,
            trace: self.context.get_trace("SessionRun"),
        })
    }

    /// Stop every runner and the worker service.
    pub async fn shutdown(&self) -> Result<(), RuntimeError> {
        self.service.shutdown();
        let result = self.manager.shutdown().await;
        self.context.shutdown();
        Ok(result?)
    }
}

/// One started session. The first `call` runs the entry point to completion.
pub struct SessionRun {
    coordinator: SessionCoordinator,
    entry_point: String,
    finished: bool,
    trace: Tracing,
}

impl SessionRun {
    pub fn session_id(&self) -> &SessionId {
        self.coordinator.session_id()
    }

    pub fn runner_id(&self) -> Option<&RunnerId> {
        self.coordinator.runner_id()
    }

    pub fn state(&self) -> SessionState {
        self.coordinator.state()
    }

    pub fn exports(&self) -> &[Export] {
        self.coordinator.exports()
    }

    /// Invoke `function` and drive the session until the runner is done.
    ///
    /// `function` is either a name defined in the entry point's file or a
    /// full `file.py:function`. The first positional argument is the
    /// triggering event; without one, `kwargs` become the event object.
    pub async fn call(
        &mut self,
        function: &str,
        args: Vec<Value>,
        kwargs: BTreeMap<String, Value>,
    ) -> Result<Value, RuntimeError> {
        if self.finished || self.coordinator.state().is_terminal() {
            return Err(RuntimeError::SessionClosed(self.session_id().clone()));
        }

        let target = qualify(&self.entry_point, function);
        if !exports_entry_point(self.coordinator.exports(), &target) {
            return Err(RuntimeError::UnknownEntryPoint(target));
        }
        if args.len() > 1 {
            self.trace.warning(&format!(
                "Ignoring {} extra positional arguments to {target}",
                args.len() - 1
            ));
        }
        let event = match args.first() {
            Some(event) => event.to_json(),
            None if kwargs.is_empty() => serde_json::Value::Null,
            None => serde_json::Value::Object(
                kwargs
                    .iter()
                    .map(|(name, value)| (name.clone(), value.to_json()))
                    .collect(),
            ),
        };

        self.finished = true;
        self.coordinator.run(&target, event).await
    }

    /// Stop the runner. Safe to call more than once.
    pub async fn close(&mut self) -> Result<(), RuntimeError> {
        self.finished = true;
        self.coordinator.stop().await
    }
}

fn exports_entry_point(exports: &[Export], entry_point: &str) -> bool {
    exports.iter().any(|e| e.entry_point() == entry_point)
}

/// `function` in the entry point's file unless it already names a file.
fn qualify(entry_point: &str, function: &str) -> String {
    if function.contains(':') {
        return function.to_string();
    }
    match entry_point.rsplit_once(':') {
        Some((file, _)) => format!("{file}:{function}"),
        None => function.to_string(),
    }
}

/// Where the worker service listens. Container runners arrive through the
/// bridge gateway, so a loopback bind is widened to every interface unless
/// runners were given an explicit address to dial.
fn worker_bind_address(settings: &RuntimeSettings, backend: BackendKind) -> String {
    let configured = settings.worker_address.trim();
    let explicit_dial = settings
        .runner_worker_address
        .as_deref()
        .is_some_and(|a| !a.trim().is_empty());
    if backend != BackendKind::Container || explicit_dial {
        return configured.to_string();
    }
    match configured.parse::<SocketAddr>() {
        Ok(addr) if addr.ip().is_loopback() => {
            let any: IpAddr = match addr {
                SocketAddr::V4(_) => Ipv4Addr::UNSPECIFIED.into(),
                SocketAddr::V6(_) => Ipv6Addr::UNSPECIFIED.into(),
            };
            SocketAddr::new(any, addr.port()).to_string()
        }
        _ => configured.to_string(),
    }
}

/// Where runners reach the worker service, given where it is bound.
fn resolve_runner_address(settings: &RuntimeSettings, backend: BackendKind, bound: SocketAddr) -> String {
    if let Some(address) = settings
        .runner_worker_address
        .as_deref()
        .map(str::trim)
        .filter(|a| !a.is_empty())
    {
        return address.to_string();
    }
    match backend {
        BackendKind::Container => format!("host.docker.internal:{}", bound.port()),
        _ if bound.ip().is_unspecified() => format!("127.0.0.1:{}", bound.port()),
        _ => bound.to_string(),
    }
}
