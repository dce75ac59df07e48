// RunnerPoolServer: exposes a local RunnerManager to remote hosts.

use super::{PoolAck, PoolMessage, RunnerStarted, StartRunner};
use crate::manager::{RunnerManager, StartRequest};
use coderun_common::error::{ProtocolError, ProvisionError};
use coderun_common::protocol::{ErrorKind, FramedConnection, WireMessage};
use coderun_common::tracing::Tracing;
use coderun_common::HostContext;
use coderun_sdk::TraceWriter;
use std::sync::Arc;
use tokio::net::{TcpListener, TcpStream};
use tokio_util::sync::CancellationToken;

pub struct RunnerPoolServer {
    manager: Arc<RunnerManager>,
    trace: Tracing,
}

impl RunnerPoolServer {
    pub fn new(manager: Arc<RunnerManager>, context: &HostContext) -> Arc<Self> {
        Arc::new(Self {
            manager,
            trace: context.get_trace("RunnerPoolServer"),
        })
    }

    /// Accept host connections until `cancel` fires.
    pub async fn serve(self: Arc<Self>, listener: TcpListener, cancel: CancellationToken) -> anyhow::Result<()> {
        self.trace.info(&format!(
            "Runner pool listening on {} ({} backend)",
            listener.local_addr()?,
            self.manager.backend_kind()
        ));
        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    self.trace.info("Runner pool stopped accepting connections");
                    return Ok(());
                }
                accepted = listener.accept() => {
                    let (stream, peer) = match accepted {
                        Ok(accepted) => accepted,
                        Err(err) => {
                            self.trace.warning(&format!("Failed to accept pool connection: {err}"));
                            continue;
                        }
                    };
                    self.trace.verbose(&format!("Pool connection from {peer}"));
                    let server = self.clone();
                    let cancel = cancel.clone();
                    tokio::spawn(async move {
                        tokio::select! {
                            _ = cancel.cancelled() => {}
                            _ = server.handle_connection(stream) => {}
                        }
                    });
                }
            }
        }
    }

    async fn handle_connection(&self, stream: TcpStream) {
        if let Err(err) = stream.set_nodelay(true) {
            self.trace.verbose(&format!("set_nodelay failed: {err}"));
        }
        let mut connection = FramedConnection::new(stream);
        loop {
            let envelope = match connection.receive().await {
                Ok(envelope) => envelope,
                Err(ProtocolError::ConnectionClosed) => return,
                Err(err) => {
                    self.trace.warning(&format!("Dropping pool connection: {err}"));
                    return;
                }
            };

            let (reply, started) = match PoolMessage::decode(&envelope) {
                Ok(request) => self.dispatch(request).await,
                Err(err) => (PoolMessage::error(ErrorKind::Protocol, err.to_string()), None),
            };

            if let Err(err) = connection.send(envelope.id, &reply).await {
                self.trace.warning(&format!("Failed to reply to pool request: {err}"));
                // Nobody will learn about a runner started for this request.
                if let Some(runner_id) = started {
                    if let Err(err) = self.manager.stop(&runner_id).await {
                        self.trace
                            .error(&format!("Failed to stop orphaned runner {runner_id}: {err}"));
                    }
                }
                return;
            }
        }
    }

    /// Handle one request. Also returns the id of a runner it started, so
    /// the caller can release it if the reply can't be delivered.
    async fn dispatch(
        &self,
        request: PoolMessage,
    ) -> (PoolMessage, Option<coderun_common::RunnerId>) {
        match request {
            PoolMessage::StartRunner(start) => match self.start_runner(start).await {
                Ok(started) => {
                    let runner_id = started.runner_id.clone();
                    (PoolMessage::RunnerStarted(started), Some(runner_id))
                }
                Err(err) => (error_reply(&err), None),
            },
            PoolMessage::StopRunner(stop) => (
                ack_or_error(self.manager.stop(&stop.runner_id).await),
                None,
            ),
            PoolMessage::RunnerHealth(health) => (
                ack_or_error(self.manager.runner_health(&health.runner_id).await),
                None,
            ),
            PoolMessage::ManagerHealth(_) => (ack_or_error(self.manager.health().await), None),
            other => (
                PoolMessage::error(
                    ErrorKind::Protocol,
                    format!("{} is not a pool request", other.kind().name()),
                ),
                None,
            ),
        }
    }

    async fn start_runner(&self, start: StartRunner) -> Result<RunnerStarted, ProvisionError> {
        let runner_id = start.runner_id.clone();
        let client = self
            .manager
            .start_request(StartRequest {
                session_id: start.session_id,
                runner_id: start.runner_id,
                artifact: Arc::new(start.artifact),
                vars: start.vars,
                worker_address: start.worker_address,
            })
            .await?;
        Ok(RunnerStarted {
            runner_id,
            endpoint: client.endpoint().to_string(),
        })
    }
}

fn ack_or_error(result: Result<(), ProvisionError>) -> PoolMessage {
    match result {
        Ok(()) => PoolMessage::Ack(PoolAck {}),
        Err(err) => error_reply(&err),
    }
}

fn error_reply(err: &ProvisionError) -> PoolMessage {
    let kind = if err.is_not_found() {
        ErrorKind::NotFound
    } else {
        ErrorKind::Internal
    };
    PoolMessage::error(kind, err.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::manager::tests::TaskBackend;
    use crate::manager::{ManagerOptions, RunnerBackend};
    use crate::remote::backend::pool_request;
    use crate::remote::{ManagerHealth, PoolTag, RemoteBackend, RunnerHealth};
    use coderun_common::protocol::{write_envelope, Envelope};
    use coderun_common::settings::RuntimeSettings;
    use coderun_common::{BuildArtifact, RunnerId, SessionId};
    use std::collections::HashMap;
    use std::sync::atomic::Ordering;
    use std::time::Duration;

    fn options() -> ManagerOptions {
        ManagerOptions {
            worker_address: "127.0.0.1:1".into(),
            start_timeout: Duration::from_secs(10),
            health_timeout: Duration::from_secs(2),
            health_poll_interval: Duration::from_millis(20),
        }
    }

    struct Pool {
        endpoint: String,
        backend: Arc<TaskBackend>,
        manager: Arc<RunnerManager>,
        cancel: CancellationToken,
    }

    async fn spawn_pool() -> Pool {
        let context = HostContext::new("Manager", RuntimeSettings::default());
        let backend = Arc::new(TaskBackend::healthy());
        let manager = Arc::new(RunnerManager::new(&context, backend.clone(), options()));
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let endpoint = listener.local_addr().unwrap().to_string();
        let cancel = CancellationToken::new();
        let server = RunnerPoolServer::new(manager.clone(), &context);
        tokio::spawn(server.serve(listener, cancel.clone()));
        Pool {
            endpoint,
            backend,
            manager,
            cancel,
        }
    }

    fn host_manager(endpoints: Vec<String>) -> (RunnerManager, Arc<RemoteBackend>) {
        let context = HostContext::new("Host", RuntimeSettings::default());
        let remote = Arc::new(RemoteBackend::new(&context, endpoints).unwrap());
        let manager = RunnerManager::new(&context, remote.clone(), options());
        (manager, remote)
    }

    #[tokio::test]
    async fn remote_runner_lifecycle() {
        let pool = spawn_pool().await;
        let (manager, remote) = host_manager(vec![pool.endpoint.clone()]);
        let session = SessionId::from("ses_remote");

        let (runner_id, client) = manager
            .start(&session, Arc::new(BuildArtifact::default()), HashMap::new())
            .await
            .unwrap();
        assert_eq!(remote.owner(&runner_id), Some(pool.endpoint.clone()));
        // The pool registered the runner under the host's id.
        assert_eq!(pool.manager.runner_for_session(&session), Some(runner_id.clone()));
        client.health().await.unwrap();
        manager.runner_health(&runner_id).await.unwrap();

        manager.stop(&runner_id).await.unwrap();
        assert_eq!(pool.backend.stops.lock().as_slice(), &[runner_id.clone()]);
        assert!(pool.manager.active_runners().is_empty());
        manager.stop(&runner_id).await.unwrap();

        let err = manager.runner_health(&runner_id).await.unwrap_err();
        assert!(err.is_not_found());
        pool.cancel.cancel();
    }

    #[tokio::test]
    async fn pool_reports_unknown_runners_as_not_found() {
        let pool = spawn_pool().await;
        let reply = pool_request(
            &pool.endpoint,
            &PoolMessage::RunnerHealth(RunnerHealth {
                runner_id: RunnerId::from("rnr_ghost"),
            }),
        )
        .await
        .unwrap_err();
        assert!(ProvisionError::from(reply).is_not_found());

        // Stopping an unknown runner is not an error.
        let (_, remote) = host_manager(vec![pool.endpoint.clone()]);
        remote.stop(&RunnerId::from("rnr_ghost")).await.unwrap();
        pool.cancel.cancel();
    }

    #[tokio::test]
    async fn starts_rotate_across_pools() {
        let first = spawn_pool().await;
        let second = spawn_pool().await;
        let (manager, _) = host_manager(vec![first.endpoint.clone(), second.endpoint.clone()]);

        for n in 0..4 {
            manager
                .start(
                    &SessionId::from(format!("ses_{n}")),
                    Arc::new(BuildArtifact::default()),
                    HashMap::new(),
                )
                .await
                .unwrap();
        }
        assert_eq!(first.backend.starts.load(Ordering::SeqCst), 2);
        assert_eq!(second.backend.starts.load(Ordering::SeqCst), 2);

        manager.shutdown().await.unwrap();
        assert!(first.manager.active_runners().is_empty());
        assert!(second.manager.active_runners().is_empty());
    }

    #[tokio::test]
    async fn manager_health_needs_one_live_pool() {
        let pool = spawn_pool().await;
        let dead = {
            let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
            listener.local_addr().unwrap().to_string()
        };

        let (_, remote) = host_manager(vec![dead.clone(), pool.endpoint.clone()]);
        remote.health().await.unwrap();

        let (_, remote) = host_manager(vec![dead]);
        assert!(remote.health().await.is_err());
        pool.cancel.cancel();
    }

    #[tokio::test]
    async fn garbage_frames_get_protocol_errors_and_the_connection_survives() {
        let pool = spawn_pool().await;
        let stream = TcpStream::connect(&pool.endpoint).await.unwrap();
        let mut connection = FramedConnection::new(stream);

        connection
            .send(7, &coderun_common::Message::Health(Default::default()))
            .await
            .unwrap();
        let envelope = connection.receive().await.unwrap();
        assert_eq!(envelope.id, 7);
        match PoolMessage::decode(&envelope).unwrap() {
            PoolMessage::Error(error) => assert_eq!(error.kind, ErrorKind::Protocol),
            other => panic!("unexpected reply {other:?}"),
        }

        let malformed = Envelope {
            tag: PoolTag::StopRunner as i32,
            id: 8,
            payload: b"{not json".to_vec(),
        };
        let mut stream = connection.into_inner();
        write_envelope(&mut stream, &malformed).await.unwrap();
        let mut connection = FramedConnection::new(stream);
        let envelope = connection.receive().await.unwrap();
        assert_eq!(envelope.id, 8);
        assert!(matches!(
            PoolMessage::decode(&envelope).unwrap(),
            PoolMessage::Error(_)
        ));

        let reply = connection
            .request(&PoolMessage::ManagerHealth(ManagerHealth {}))
            .await
            .unwrap();
        assert!(matches!(reply, PoolMessage::Ack(_)));
        pool.cancel.cancel();
    }
}
