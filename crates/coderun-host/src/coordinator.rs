// SessionCoordinator: drives one session against one runner.
//
// Starting: start the runner with the session variables and wait for its exports.
// Running: send Run, then relay runner requests to the durable engine until
// Done. At most one activity or control request is outstanding at a time.

use crate::service::{SessionEvent, SessionMailbox};
use crate::sink::SessionSink;
use coderun_common::constants::syscalls;
use coderun_common::error::{ProtocolError, ProvisionError, RunnerCrash, RuntimeError};
use coderun_common::protocol::{Done, ErrorKind, Message, MessageTag, Response, Run};
use coderun_common::settings::RuntimeSettings;
use coderun_common::tracing::Tracing;
use coderun_common::{ActivityCall, BuildArtifact, DurableEngine, Export, HostContext, RunId, RunnerId, SessionId, Value};
use coderun_manager::{RunnerClient, RunnerManager};
use coderun_sdk::TraceWriter;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Starting,
    Running,
    WaitingOnReply,
    Done,
    Failed,
}

impl SessionState {
    pub fn is_terminal(self) -> bool {
        matches!(self, SessionState::Done | SessionState::Failed)
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SessionState::Starting => write!(f, "starting"),
            SessionState::Running => write!(f, "running"),
            SessionState::WaitingOnReply => write!(f, "waiting on reply"),
            SessionState::Done => write!(f, "done"),
            SessionState::Failed => write!(f, "failed"),
        }
    }
}

#[derive(Debug, Clone)]
pub struct CoordinatorOptions {
    pub handshake_timeout: Duration,
    pub health_interval: Duration,
}

impl CoordinatorOptions {
    pub fn from_settings(settings: &RuntimeSettings) -> Self {
        Self {
            handshake_timeout: settings.handshake_timeout,
            health_interval: settings.health_interval,
        }
    }
}

/// Where the result of an engine call goes.
enum Pending {
    /// Pushed to the runner as a `Response` carrying the call id.
    Activity(String),
    /// Returned on the worker connection that is waiting for it.
    Control(Option<oneshot::Sender<Message>>),
}

struct Completion {
    pending: Pending,
    response: Response,
}

struct InFlight {
    tag: MessageTag,
    task: JoinHandle<()>,
}

pub struct SessionCoordinator {
    session_id: SessionId,
    run_id: RunId,
    manager: Arc<RunnerManager>,
    engine: Arc<dyn DurableEngine>,
    sink: Arc<dyn SessionSink>,
    mailbox: SessionMailbox,
    options: CoordinatorOptions,
    state: SessionState,
    runner: Option<(RunnerId, Arc<RunnerClient>)>,
    exports: Vec<Export>,
    trace: Tracing,
}

impl SessionCoordinator {
    pub fn new(
        context: &HostContext,
        run_id: RunId,
        manager: Arc<RunnerManager>,
        engine: Arc<dyn DurableEngine>,
        sink: Arc<dyn SessionSink>,
        mailbox: SessionMailbox,
        options: CoordinatorOptions,
    ) -> Self {
        Self {
            session_id: mailbox.session_id().clone(),
            run_id,
            manager,
            engine,
            sink,
            mailbox,
            options,
            state: SessionState::Starting,
            runner: None,
            exports: Vec::new(),
            trace: context.get_trace("SessionCoordinator"),
        }
    }

    pub fn session_id(&self) -> &SessionId {
        &self.session_id
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    /// Entry points the runner reported during the handshake.
    pub fn exports(&self) -> &[Export] {
        &self.exports
    }

    pub fn runner_id(&self) -> Option<&RunnerId> {
        self.runner.as_ref().map(|(id, _)| id)
    }

    /// Start the session's runner and complete the export handshake.
    pub async fn start(
        &mut self,
        artifact: Arc<BuildArtifact>,
        vars: HashMap<String, String>,
    ) -> Result<(), RuntimeError> {
        if self.state != SessionState::Starting || self.runner.is_some() {
            return Err(RuntimeError::SessionClosed(self.session_id.clone()));
        }
        match self.try_start(artifact, vars).await {
            Ok(()) => {
                self.state = SessionState::Running;
                Ok(())
            }
            Err(err) => {
                self.trace
                    .error(&format!("Session {} failed to start: {err}", self.session_id));
                self.state = SessionState::Failed;
                self.teardown().await;
                Err(err)
            }
        }
    }

    async fn try_start(
        &mut self,
        artifact: Arc<BuildArtifact>,
        mut vars: HashMap<String, String>,
    ) -> Result<(), RuntimeError> {
        let stored = self
            .engine
            .load(&self.run_id, syscalls::ENV_NAMESPACE)
            .await?;
        vars.extend(stored.into_iter().map(|(k, v)| (k, env_string(v))));

        let (runner_id, client) = self
            .manager
            .start(&self.session_id, artifact, vars)
            .await?;
        self.runner = Some((runner_id.clone(), client));
        self.exports = self.handshake(&runner_id).await?;
        self.trace.info(&format!(
            "Session {} is running on {runner_id} with {} exports",
            self.session_id,
            self.exports.len()
        ));
        Ok(())
    }

    /// Wait for the runner's export report. Log and Print may come first.
    async fn handshake(&mut self, runner_id: &RunnerId) -> Result<Vec<Export>, RuntimeError> {
        let deadline = tokio::time::sleep(self.options.handshake_timeout);
        tokio::pin!(deadline);
        loop {
            let event = tokio::select! {
                _ = &mut deadline => {
                    return Err(ProvisionError::Unhealthy {
                        runner_id: runner_id.clone(),
                        timeout: self.options.handshake_timeout,
                        last_error: "runner did not report its exports".to_string(),
                    }
                    .into());
                }
                event = self.mailbox.recv() => event,
            };

            let (message, reply) = match event {
                None => return Err(crash(runner_id, "worker service stopped")),
                Some(SessionEvent::Disconnected { reason }) => return Err(crash(runner_id, reason)),
                Some(SessionEvent::Request { message, reply }) => (message, reply),
            };
            match message {
                Message::Module(module) => {
                    if module.runner_id != *runner_id {
                        self.trace.warning(&format!(
                            "Runner reported id {} but was started as {runner_id}",
                            module.runner_id
                        ));
                    }
                    return Ok(module.exports);
                }
                Message::Log(log) => self.sink.log(&log.session_id, log.level, &log.message),
                Message::Print(print) => self.sink.print(&print.session_id, &print.text),
                other => {
                    let err = ProtocolError::out_of_sequence(SessionState::Starting, other.kind());
                    reject(reply, &err);
                    return Err(err.into());
                }
            }
        }
    }

    /// Invoke `entry_point` with `event` and drive the session to its end.
    /// Returns the entry point's result; a user-code failure is
    /// [`RuntimeError::UserCode`].
    pub async fn run(&mut self, entry_point: &str, event: serde_json::Value) -> Result<Value, RuntimeError> {
        let (runner_id, client) = match (&self.runner, self.state) {
            (Some(runner), SessionState::Running) => runner.clone(),
            _ => return Err(RuntimeError::SessionClosed(self.session_id.clone())),
        };

        let outcome = self.drive(&runner_id, &client, entry_point, event).await;
        match outcome {
            Ok(done) => {
                self.state = SessionState::Done;
                self.teardown().await;
                match done.error {
                    Some(message) => Err(RuntimeError::UserCode {
                        message,
                        traceback: done.traceback,
                    }),
                    None => Ok(done.result.unwrap_or_default()),
                }
            }
            Err(err) => {
                self.trace
                    .error(&format!("Session {} failed: {err}", self.session_id));
                self.state = SessionState::Failed;
                self.teardown().await;
                Err(err)
            }
        }
    }

    async fn drive(
        &mut self,
        runner_id: &RunnerId,
        client: &RunnerClient,
        entry_point: &str,
        event: serde_json::Value,
    ) -> Result<Done, RuntimeError> {
        client
            .run(Run {
                entry_point: entry_point.to_string(),
                event,
            })
            .await
            .map_err(|err| transport_error(runner_id, err))?;

        let (completions_tx, mut completions) = mpsc::unbounded_channel::<Completion>();
        let mut in_flight: Option<InFlight> = None;
        let interval = self.options.health_interval.max(Duration::from_millis(10));
        let mut health = tokio::time::interval_at(Instant::now() + interval, interval);
        health.set_missed_tick_behavior(MissedTickBehavior::Delay);

        let result = loop {
            tokio::select! {
                event = self.mailbox.recv() => {
                    let step = match event {
                        None => Err(crash(runner_id, "worker service stopped")),
                        Some(SessionEvent::Disconnected { reason }) => Err(crash(runner_id, reason)),
                        Some(SessionEvent::Request { message, reply }) => {
                            self.handle_request(message, reply, &mut in_flight, &completions_tx)
                        }
                    };
                    match step {
                        Ok(Some(done)) => break Ok(done),
                        Ok(None) => {}
                        Err(err) => break Err(err),
                    }
                }
                Some(completion) = completions.recv() => {
                    in_flight = None;
                    self.state = SessionState::Running;
                    match completion.pending {
                        Pending::Activity(call_id) => {
                            let response = completion.response.with_call_id(call_id);
                            if let Err(err) = client.activity_reply(response).await {
                                break Err(transport_error(runner_id, err));
                            }
                        }
                        Pending::Control(Some(reply)) => {
                            let _ = reply.send(Message::Response(completion.response));
                        }
                        Pending::Control(None) => {}
                    }
                }
                _ = health.tick() => {
                    if let Err(err) = self.manager.runner_health(runner_id).await {
                        break Err(crash(runner_id, format!("health probe failed: {err}")));
                    }
                }
            }
        };

        if let Some(in_flight) = in_flight {
            in_flight.task.abort();
        }
        result
    }

    fn handle_request(
        &mut self,
        message: Message,
        reply: Option<oneshot::Sender<Message>>,
        in_flight: &mut Option<InFlight>,
        completions: &mpsc::UnboundedSender<Completion>,
    ) -> Result<Option<Done>, RuntimeError> {
        let tag = message.kind();
        let (call, pending) = match message {
            Message::Log(log) => {
                self.sink.log(&log.session_id, log.level, &log.message);
                return Ok(None);
            }
            Message::Print(print) => {
                self.sink.print(&print.session_id, &print.text);
                return Ok(None);
            }
            Message::Done(done) => return Ok(Some(done)),
            Message::Callback(callback) => (
                ActivityCall::activity(callback.function, callback.payload),
                Pending::Activity(callback.call_id),
            ),
            Message::Sleep(sleep) => (ActivityCall::sleep(sleep.duration_ms), Pending::Control(reply)),
            Message::Subscribe(subscribe) => (
                ActivityCall::subscribe(&subscribe.connection, &subscribe.filter),
                Pending::Control(reply),
            ),
            Message::NextEvent(next) => (
                ActivityCall::next_event(&next.subscription_ids, next.timeout_ms),
                Pending::Control(reply),
            ),
            Message::Unsubscribe(unsubscribe) => (
                ActivityCall::unsubscribe(&unsubscribe.subscription_id),
                Pending::Control(reply),
            ),
            other => {
                let err = ProtocolError::out_of_sequence(self.state, other.kind());
                reject(reply, &err);
                return Err(err.into());
            }
        };

        if let Some(current) = in_flight {
            let err = ProtocolError::out_of_sequence(
                format!("{} is outstanding", current.tag),
                tag,
            );
            if let Pending::Control(reply) = pending {
                reject(reply, &err);
            }
            return Err(err.into());
        }

        self.trace.verbose(&format!(
            "Session {} delegating {tag} '{}' to the engine",
            self.session_id, call.function
        ));
        let engine = self.engine.clone();
        let run_id = self.run_id.clone();
        let completions = completions.clone();
        let task = tokio::spawn(async move {
            let response = match engine.call(&run_id, call).await {
                Ok(value) => Response::ok(value),
                Err(err) => Response::failed(err.message),
            };
            let _ = completions.send(Completion { pending, response });
        });
        *in_flight = Some(InFlight { tag, task });
        self.state = SessionState::WaitingOnReply;
        Ok(None)
    }

    /// Stop the runner if one is still held. Idempotent.
    pub async fn stop(&mut self) -> Result<(), RuntimeError> {
        if !self.state.is_terminal() {
            self.state = SessionState::Failed;
        }
        let Some((runner_id, _)) = self.runner.take() else {
            return Ok(());
        };
        self.manager.stop(&runner_id).await?;
        Ok(())
    }

    async fn teardown(&mut self) {
        if let Some((runner_id, _)) = self.runner.take() {
            if let Err(err) = self.manager.stop(&runner_id).await {
                self.trace
                    .error(&format!("Failed to stop runner {runner_id}: {err}"));
            }
        }
    }
}

impl Drop for SessionCoordinator {
    fn drop(&mut self) {
        let Some((runner_id, _)) = self.runner.take() else {
            return;
        };
        let manager = self.manager.clone();
        if let Ok(handle) = tokio::runtime::Handle::try_current() {
            handle.spawn(async move {
                if let Err(err) = manager.stop(&runner_id).await {
                    tracing::warn!(runner_id = %runner_id, "Failed to stop abandoned runner: {err}");
                }
            });
        }
    }
}

/// Session variables reach the runner's environment as plain strings.
fn env_string(value: Value) -> String {
    match value {
        Value::Null => String::new(),
        Value::Json(serde_json::Value::String(text)) => text,
        Value::Json(other) => other.to_string(),
        Value::Bytes(bytes) => String::from_utf8_lossy(&bytes).into_owned(),
    }
}

fn crash(runner_id: &RunnerId, reason: impl Into<String>) -> RuntimeError {
    RunnerCrash {
        runner_id: runner_id.clone(),
        reason: reason.into(),
    }
    .into()
}

fn transport_error(runner_id: &RunnerId, err: ProtocolError) -> RuntimeError {
    if err.is_disconnect() {
        crash(runner_id, err.to_string())
    } else {
        err.into()
    }
}

fn reject(reply: Option<oneshot::Sender<Message>>, err: &ProtocolError) {
    if let Some(reply) = reply {
        let _ = reply.send(Message::error(ErrorKind::Protocol, err.to_string()));
    }
}
