// WorkerService: the endpoint runners call into. Requests are routed by
// session id to the owning coordinator's mailbox.
//
// Module, Log, Print, Callback and Done are acknowledged as soon as they are
// queued. Sleep, Subscribe, NextEvent and Unsubscribe wait for the
// coordinator's Response before the connection reads its next request.

use coderun_common::error::{ProtocolError, ProvisionError};
use coderun_common::protocol::{Ack, ErrorKind, FramedConnection, Message, MessageTag, WireMessage};
use coderun_common::tracing::Tracing;
use coderun_common::{HostContext, SessionId};
use coderun_sdk::TraceWriter;
use dashmap::DashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;

/// What a coordinator receives from its runner.
#[derive(Debug)]
pub enum SessionEvent {
    /// A runner request. `reply` is set for control requests, which must
    /// be answered with a `Response` or `Error`.
    Request {
        message: Message,
        reply: Option<oneshot::Sender<Message>>,
    },
    /// The connection the session was bound to closed.
    Disconnected { reason: String },
}

struct SessionSlot {
    tx: mpsc::UnboundedSender<SessionEvent>,
    connection: Option<u64>,
}

struct Routes {
    sessions: DashMap<SessionId, SessionSlot>,
    next_connection: AtomicU64,
    trace: Tracing,
}

pub struct WorkerService {
    local_addr: SocketAddr,
    routes: Arc<Routes>,
    cancel: CancellationToken,
}

impl WorkerService {
    /// Bind `address` and start accepting runner connections. The service
    /// stops when dropped or when the host shuts down.
    pub async fn bind(context: &HostContext, address: &str) -> anyhow::Result<Arc<Self>> {
        let listener = TcpListener::bind(address).await?;
        let local_addr = listener.local_addr()?;
        let routes = Arc::new(Routes {
            sessions: DashMap::new(),
            next_connection: AtomicU64::new(1),
            trace: context.get_trace("WorkerService"),
        });
        let cancel = context.shutdown_token();

        routes
            .trace
            .info(&format!("Worker service listening on {local_addr}"));
        tokio::spawn(accept_loop(listener, routes.clone(), cancel.clone()));

        Ok(Arc::new(Self {
            local_addr,
            routes,
            cancel,
        }))
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Open the mailbox for `session_id`. Requests for sessions without a
    /// mailbox are answered with `not_found`.
    pub fn register(&self, session_id: &SessionId) -> Result<SessionMailbox, ProvisionError> {
        let (tx, rx) = mpsc::unbounded_channel();
        match self.routes.sessions.entry(session_id.clone()) {
            dashmap::mapref::entry::Entry::Occupied(_) => {
                Err(ProvisionError::AlreadyStarted(session_id.clone()))
            }
            dashmap::mapref::entry::Entry::Vacant(entry) => {
                entry.insert(SessionSlot {
                    tx,
                    connection: None,
                });
                Ok(SessionMailbox {
                    session_id: session_id.clone(),
                    rx,
                    routes: self.routes.clone(),
                })
            }
        }
    }

    pub fn is_registered(&self, session_id: &SessionId) -> bool {
        self.routes.sessions.contains_key(session_id)
    }

    pub fn shutdown(&self) {
        self.cancel.cancel();
    }
}

impl Drop for WorkerService {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

/// A session's receiving end. Unregisters the session when dropped.
pub struct SessionMailbox {
    session_id: SessionId,
    rx: mpsc::UnboundedReceiver<SessionEvent>,
    routes: Arc<Routes>,
}

impl SessionMailbox {
    pub fn session_id(&self) -> &SessionId {
        &self.session_id
    }

    /// Next event, or `None` once the service is gone.
    pub async fn recv(&mut self) -> Option<SessionEvent> {
        self.rx.recv().await
    }
}

impl Drop for SessionMailbox {
    fn drop(&mut self) {
        self.routes.sessions.remove(&self.session_id);
    }
}

async fn accept_loop(listener: TcpListener, routes: Arc<Routes>, cancel: CancellationToken) {
    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                routes.trace.verbose("Worker service stopped accepting connections");
                return;
            }
            accepted = listener.accept() => {
                match accepted {
                    Ok((stream, peer)) => {
                        let routes = routes.clone();
                        let cancel = cancel.clone();
                        tokio::spawn(async move {
                            tokio::select! {
                                _ = cancel.cancelled() => {}
                                _ = serve_connection(stream, peer, routes) => {}
                            }
                        });
                    }
                    Err(err) => routes
                        .trace
                        .warning(&format!("Failed to accept runner connection: {err}")),
                }
            }
        }
    }
}

async fn serve_connection(stream: TcpStream, peer: SocketAddr, routes: Arc<Routes>) {
    let connection_id = routes.next_connection.fetch_add(1, Ordering::Relaxed);
    if let Err(err) = stream.set_nodelay(true) {
        routes.trace.verbose(&format!("set_nodelay failed: {err}"));
    }
    routes
        .trace
        .verbose(&format!("Runner connection {connection_id} from {peer}"));

    let mut connection = FramedConnection::new(stream);
    let reason = loop {
        let envelope = match connection.receive().await {
            Ok(envelope) => envelope,
            Err(ProtocolError::ConnectionClosed) => break "runner closed the connection".to_string(),
            Err(err) => break format!("runner connection failed: {err}"),
        };

        let reply = match Message::decode(&envelope) {
            Ok(message) => route(&routes, connection_id, message).await,
            Err(err) => {
                routes
                    .trace
                    .warning(&format!("Rejecting frame from connection {connection_id}: {err}"));
                Message::error(ErrorKind::Protocol, err.to_string())
            }
        };

        if let Err(err) = connection.send(envelope.id, &reply).await {
            break format!("failed to reply to runner: {err}");
        }
    };

    routes
        .trace
        .verbose(&format!("Runner connection {connection_id} ended: {reason}"));
    for slot in routes.sessions.iter() {
        if slot.connection == Some(connection_id) {
            let _ = slot.tx.send(SessionEvent::Disconnected {
                reason: reason.clone(),
            });
        }
    }
}

async fn route(routes: &Routes, connection_id: u64, message: Message) -> Message {
    let kind = message.kind();
    let Some(session_id) = message.session_id().cloned() else {
        return Message::error(
            ErrorKind::Protocol,
            format!("{kind} without a session id is not a worker request"),
        );
    };

    let tx = match routes.sessions.get_mut(&session_id) {
        Some(mut slot) => {
            slot.connection.get_or_insert(connection_id);
            slot.tx.clone()
        }
        None => {
            return Message::error(
                ErrorKind::NotFound,
                format!("session {session_id} is not registered"),
            )
        }
    };

    match kind {
        MessageTag::Health => Message::Ack(Ack {}),
        MessageTag::Sleep | MessageTag::Subscribe | MessageTag::NextEvent | MessageTag::Unsubscribe => {
            let (reply_tx, reply_rx) = oneshot::channel();
            let queued = tx.send(SessionEvent::Request {
                message,
                reply: Some(reply_tx),
            });
            if queued.is_err() {
                return session_gone(&session_id);
            }
            reply_rx.await.unwrap_or_else(|_| {
                Message::error(
                    ErrorKind::Internal,
                    format!("session {session_id} ended before answering {kind}"),
                )
            })
        }
        _ => match tx.send(SessionEvent::Request {
            message,
            reply: None,
        }) {
            Ok(()) => Message::Ack(Ack {}),
            Err(_) => session_gone(&session_id),
        },
    }
}

fn session_gone(session_id: &SessionId) -> Message {
    Message::error(
        ErrorKind::NotFound,
        format!("session {session_id} is no longer running"),
    )
}
