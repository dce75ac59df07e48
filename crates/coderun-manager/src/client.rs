// RunnerClient: the host's side of host → runner calls (run, activity reply,
// health). One ordered connection per runner, re-dialled after a failure.

use coderun_common::error::ProtocolError;
use coderun_common::protocol::{FramedConnection, Health, Message, Response, Run};
use coderun_common::RunnerId;
use tokio::net::TcpStream;
use tokio::sync::Mutex;

pub struct RunnerClient {
    runner_id: RunnerId,
    endpoint: String,
    connection: Mutex<Option<FramedConnection<TcpStream>>>,
}

impl RunnerClient {
    /// A client for the runner listening on `endpoint`. Nothing is dialled
    /// until the first call.
    pub fn new(runner_id: RunnerId, endpoint: impl Into<String>) -> Self {
        Self {
            runner_id,
            endpoint: endpoint.into(),
            connection: Mutex::new(None),
        }
    }

    pub fn runner_id(&self) -> &RunnerId {
        &self.runner_id
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    /// Liveness probe. `Ok` once the runner answers with `Ack`.
    pub async fn health(&self) -> Result<(), ProtocolError> {
        self.call(Message::Health(Health::default())).await
    }

    /// Ask the runner to invoke `entry_point` with the triggering event.
    pub async fn run(&self, run: Run) -> Result<(), ProtocolError> {
        self.call(Message::Run(run)).await
    }

    /// Deliver the result of a previously acknowledged activity.
    pub async fn activity_reply(&self, response: Response) -> Result<(), ProtocolError> {
        self.call(Message::Response(response)).await
    }

    /// Drop the connection; the next call dials again.
    pub async fn disconnect(&self) {
        self.connection.lock().await.take();
    }

    async fn call(&self, message: Message) -> Result<(), ProtocolError> {
        let mut guard = self.connection.lock().await;
        if guard.is_none() {
            let stream = TcpStream::connect(&self.endpoint).await?;
            stream.set_nodelay(true)?;
            *guard = Some(FramedConnection::new(stream));
        }
        let Some(connection) = guard.as_mut() else {
            return Err(ProtocolError::ConnectionClosed);
        };

        match connection.request(&message).await {
            Ok(Message::Ack(_)) => Ok(()),
            Ok(other) => Err(ProtocolError::out_of_sequence(
                format!("awaiting {} acknowledgement", message.kind()),
                other.kind(),
            )),
            Err(err) => {
                // A broken or desynchronized stream can't be reused.
                if !matches!(err, ProtocolError::Remote { .. }) {
                    guard.take();
                }
                Err(err)
            }
        }
    }
}

impl std::fmt::Debug for RunnerClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RunnerClient")
            .field("runner_id", &self.runner_id)
            .field("endpoint", &self.endpoint)
            .finish()
    }
}
