// RemoteBackend: forwards runner lifecycle calls to runner manager
// processes on other machines, round-robin across the configured pool.

use super::{ManagerHealth, PoolMessage, RunnerHealth, StartRunner, StopRunner};
use crate::client::RunnerClient;
use crate::manager::{RunnerBackend, StartRequest};
use async_trait::async_trait;
use coderun_common::error::{ProtocolError, ProvisionError};
use coderun_common::protocol::FramedConnection;
use coderun_common::settings::BackendKind;
use coderun_common::tracing::Tracing;
use coderun_common::{HostContext, RunnerId};
use coderun_sdk::TraceWriter;
use dashmap::DashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use tokio::net::TcpStream;

pub struct RemoteBackend {
    endpoints: Vec<String>,
    next: AtomicUsize,
    /// Pool endpoint that owns each runner started through this backend.
    owners: DashMap<RunnerId, String>,
    trace: Tracing,
}

impl RemoteBackend {
    pub fn new(context: &HostContext, endpoints: Vec<String>) -> Result<Self, ProvisionError> {
        let endpoints: Vec<String> = endpoints
            .into_iter()
            .map(|e| e.trim().to_string())
            .filter(|e| !e.is_empty())
            .collect();
        if endpoints.is_empty() {
            return Err(ProvisionError::NoEndpoints);
        }
        Ok(Self {
            endpoints,
            next: AtomicUsize::new(0),
            owners: DashMap::new(),
            trace: context.get_trace("RemoteBackend"),
        })
    }

    pub fn endpoints(&self) -> &[String] {
        &self.endpoints
    }

    /// Pool endpoint a runner was started on, if this backend started it.
    pub fn owner(&self, runner_id: &RunnerId) -> Option<String> {
        self.owners.get(runner_id).map(|e| e.value().clone())
    }

    fn next_endpoint(&self) -> &str {
        let index = self.next.fetch_add(1, Ordering::Relaxed) % self.endpoints.len();
        &self.endpoints[index]
    }
}

/// One request on a fresh connection to a pool endpoint.
pub(crate) async fn pool_request(
    endpoint: &str,
    message: &PoolMessage,
) -> Result<PoolMessage, ProtocolError> {
    let stream = TcpStream::connect(endpoint).await?;
    stream.set_nodelay(true)?;
    let mut connection = FramedConnection::new(stream);
    connection.request(message).await
}

fn expect_ack(request: &str, reply: PoolMessage) -> Result<(), ProvisionError> {
    match reply {
        PoolMessage::Ack(_) => Ok(()),
        other => Err(ProtocolError::out_of_sequence(
            format!("awaiting {request} acknowledgement"),
            other.kind().name(),
        )
        .into()),
    }
}

/// A pool reports runner endpoints as seen from its own machine. Loopback
/// and unspecified addresses are rewritten to the pool's host.
pub(crate) fn rebase_endpoint(pool_endpoint: &str, runner_endpoint: &str) -> String {
    let Ok(addr) = runner_endpoint.parse::<SocketAddr>() else {
        return runner_endpoint.to_string();
    };
    if !(addr.ip().is_loopback() || addr.ip().is_unspecified()) {
        return runner_endpoint.to_string();
    }
    match pool_endpoint.rsplit_once(':') {
        Some((host, _)) if !host.is_empty() => format!("{host}:{}", addr.port()),
        _ => runner_endpoint.to_string(),
    }
}

/// Asks the pool to stop a runner whose start was abandoned after the pool
/// may already have provisioned it.
struct PendingStart {
    endpoint: String,
    runner_id: RunnerId,
    armed: bool,
}

impl Drop for PendingStart {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        let endpoint = std::mem::take(&mut self.endpoint);
        let runner_id = self.runner_id.clone();
        if let Ok(handle) = tokio::runtime::Handle::try_current() {
            handle.spawn(async move {
                let stop = PoolMessage::StopRunner(StopRunner {
                    runner_id: runner_id.clone(),
                });
                if let Err(err) = pool_request(&endpoint, &stop).await {
                    tracing::warn!(runner_id = %runner_id, "Failed to stop abandoned remote runner: {err}");
                }
            });
        }
    }
}

#[async_trait]
impl RunnerBackend for RemoteBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::Remote
    }

    async fn start(&self, request: &StartRequest) -> Result<String, ProvisionError> {
        let endpoint = self.next_endpoint().to_string();
        self.trace.info(&format!(
            "Requesting runner {} from pool {endpoint}",
            request.runner_id
        ));

        let mut pending = PendingStart {
            endpoint: endpoint.clone(),
            runner_id: request.runner_id.clone(),
            armed: true,
        };
        let message = PoolMessage::StartRunner(StartRunner {
            session_id: request.session_id.clone(),
            runner_id: request.runner_id.clone(),
            artifact: (*request.artifact).clone(),
            vars: request.vars.clone(),
            worker_address: request.worker_address.clone(),
        });
        let reply = match pool_request(&endpoint, &message).await {
            Ok(reply) => reply,
            Err(err) => {
                // The pool releases runners whose start failed on its side.
                pending.armed = false;
                return Err(err.into());
            }
        };

        let started = match reply {
            PoolMessage::RunnerStarted(started) => started,
            other => {
                return Err(ProtocolError::out_of_sequence(
                    "awaiting RunnerStarted",
                    other.kind().name(),
                )
                .into())
            }
        };
        if started.runner_id != request.runner_id {
            // Release what the pool actually provisioned.
            pending.runner_id = started.runner_id.clone();
            return Err(anyhow::anyhow!(
                "pool {endpoint} started runner {} instead of {}",
                started.runner_id,
                request.runner_id
            )
            .into());
        }
        pending.armed = false;

        self.owners
            .insert(request.runner_id.clone(), endpoint.clone());
        Ok(rebase_endpoint(&endpoint, &started.endpoint))
    }

    async fn stop(&self, runner_id: &RunnerId) -> Result<(), ProvisionError> {
        let Some((_, endpoint)) = self.owners.remove(runner_id) else {
            return Ok(());
        };
        let message = PoolMessage::StopRunner(StopRunner {
            runner_id: runner_id.clone(),
        });
        match pool_request(&endpoint, &message).await {
            Ok(reply) => expect_ack("StopRunner", reply),
            Err(err) => {
                let err = ProvisionError::from(err);
                if err.is_not_found() {
                    self.trace
                        .verbose(&format!("Pool {endpoint} no longer knows runner {runner_id}"));
                    Ok(())
                } else {
                    Err(err)
                }
            }
        }
    }

    async fn runner_health(
        &self,
        runner_id: &RunnerId,
        _client: &RunnerClient,
    ) -> Result<(), ProvisionError> {
        let endpoint = self
            .owner(runner_id)
            .ok_or_else(|| ProvisionError::NotFound(runner_id.clone()))?;
        let message = PoolMessage::RunnerHealth(RunnerHealth {
            runner_id: runner_id.clone(),
        });
        let reply = pool_request(&endpoint, &message).await?;
        expect_ack("RunnerHealth", reply)
    }

    async fn health(&self) -> Result<(), ProvisionError> {
        let mut last_error = None;
        for endpoint in &self.endpoints {
            match pool_request(endpoint, &PoolMessage::ManagerHealth(ManagerHealth {})).await {
                Ok(PoolMessage::Ack(_)) => return Ok(()),
                Ok(other) => {
                    last_error = Some(ProvisionError::from(ProtocolError::out_of_sequence(
                        "awaiting ManagerHealth acknowledgement",
                        other.kind().name(),
                    )))
                }
                Err(err) => {
                    self.trace
                        .warning(&format!("Runner pool {endpoint} is unhealthy: {err}"));
                    last_error = Some(err.into());
                }
            }
        }
        Err(last_error.unwrap_or(ProvisionError::NoEndpoints))
    }
}
