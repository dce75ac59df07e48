// A minimal runner that speaks the session protocol without running user
// code. Used to exercise backends end to end and as a reference peer.
//
// The Run event drives what it does:
//   {"print": "text", "log": "text", "sleep_ms": 5,
//    "calls": [{"function": "fetch", "payload": "bytes or json"}],
//    "fail": "message"}

use anyhow::{Context, Result};
use clap::Parser;
use coderun_common::constants::variables::runner as env_keys;
use coderun_common::protocol::{
    Ack, Callback, Done, ErrorKind, FramedConnection, Log, LogLevel, Message, Module, Print,
    Response, Run, Sleep, WireMessage,
};
use coderun_common::{packager, ProtocolError, RunnerId, SessionId, Value};
use dashmap::DashMap;
use serde::Deserialize;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{oneshot, Mutex};

#[derive(Parser, Debug)]
#[command(name = "coderun-echo-runner", version, about = "Protocol-only coderun runner")]
struct Args {
    /// Entry script. Accepted for interpreter compatibility and ignored.
    entry: Option<PathBuf>,

    /// Port for the runner RPC server. Defaults to $CODERUN_PORT.
    #[arg(long)]
    port: Option<u16>,

    #[arg(long, default_value = "127.0.0.1")]
    bind: String,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct Script {
    print: Option<String>,
    log: Option<String>,
    sleep_ms: Option<u64>,
    calls: Vec<ScriptCall>,
    fail: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ScriptCall {
    function: String,
    #[serde(default)]
    payload: serde_json::Value,
}

struct EchoRunner {
    session_id: SessionId,
    runner_id: RunnerId,
    worker: Option<Mutex<FramedConnection<TcpStream>>>,
    pending: DashMap<String, oneshot::Sender<Response>>,
    next_call: AtomicU64,
}

fn main() {
    let args = Args::parse();

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .expect("Failed to build Tokio runtime");

    let exit_code = runtime.block_on(async move {
        match run(args).await {
            Ok(()) => 0,
            Err(e) => {
                tracing::error!("Echo runner failed: {:#}", e);
                1
            }
        }
    });

    std::process::exit(exit_code);
}

async fn run(args: Args) -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(tracing::Level::INFO.into()),
        )
        .with_writer(std::io::stderr)
        .init();

    let port = match args.port {
        Some(port) => port,
        None => std::env::var(env_keys::PORT)
            .context("no --port given and CODERUN_PORT is unset")?
            .parse()
            .context("CODERUN_PORT is not a port number")?,
    };
    let session_id = SessionId::new(std::env::var(env_keys::SESSION_ID).unwrap_or_default());
    let runner_id = RunnerId::new(std::env::var(env_keys::RUNNER_ID).unwrap_or_default());

    let listener = TcpListener::bind((args.bind.as_str(), port))
        .await
        .with_context(|| format!("failed to bind {}:{port}", args.bind))?;
    tracing::info!("Echo runner {runner_id} listening on {}", listener.local_addr()?);

    let worker = match std::env::var(env_keys::WORKER_ADDRESS) {
        Ok(address) => match connect_worker(&address, &session_id, &runner_id).await {
            Ok(connection) => Some(Mutex::new(connection)),
            Err(err) => {
                tracing::warn!("Worker at {address} is unreachable: {err:#}");
                None
            }
        },
        Err(_) => None,
    };

    let runner = Arc::new(EchoRunner {
        session_id,
        runner_id,
        worker,
        pending: DashMap::new(),
        next_call: AtomicU64::new(1),
    });

    loop {
        let (stream, _) = listener.accept().await?;
        let runner = runner.clone();
        tokio::spawn(async move {
            if let Err(err) = runner.serve(stream).await {
                tracing::warn!("Host connection ended: {err}");
            }
        });
    }
}

/// Dial the worker and announce the exports found in the code directory.
async fn connect_worker(
    address: &str,
    session_id: &SessionId,
    runner_id: &RunnerId,
) -> Result<FramedConnection<TcpStream>> {
    let exports = std::env::var_os(env_keys::CODE_DIR)
        .and_then(|dir| packager::build(&PathBuf::from(dir)).ok())
        .map(|artifact| artifact.exports)
        .unwrap_or_default();

    let stream = TcpStream::connect(address).await?;
    stream.set_nodelay(true)?;
    let mut connection = FramedConnection::new(stream);
    let reply = connection
        .request(&Message::Module(Module {
            session_id: session_id.clone(),
            runner_id: runner_id.clone(),
            exports,
        }))
        .await?;
    anyhow::ensure!(
        matches!(reply, Message::Ack(_)),
        "worker answered Module with {}",
        reply.kind()
    );
    Ok(connection)
}

impl EchoRunner {
    async fn serve(self: Arc<Self>, stream: TcpStream) -> Result<(), ProtocolError> {
        let mut connection = FramedConnection::new(stream);
        loop {
            let envelope = match connection.receive().await {
                Ok(envelope) => envelope,
                Err(ProtocolError::ConnectionClosed) => return Ok(()),
                Err(err) => return Err(err),
            };
            let reply = match Message::decode(&envelope) {
                Ok(Message::Health(_)) => Message::Ack(Ack {}),
                Ok(Message::Run(run)) => {
                    let runner = self.clone();
                    tokio::spawn(async move { runner.execute(run).await });
                    Message::Ack(Ack {})
                }
                Ok(Message::Response(response)) => self.deliver(response),
                Ok(other) => Message::error(
                    ErrorKind::Protocol,
                    format!("runner does not accept {}", other.kind()),
                ),
                Err(err) => Message::error(ErrorKind::Protocol, err.to_string()),
            };
            connection.send(envelope.id, &reply).await?;
        }
    }

    fn deliver(&self, response: Response) -> Message {
        let waiter = response
            .call_id
            .as_ref()
            .and_then(|id| self.pending.remove(id))
            .map(|(_, tx)| tx);
        match waiter {
            Some(tx) => {
                let _ = tx.send(response);
                Message::Ack(Ack {})
            }
            None => Message::error(ErrorKind::NotFound, "no activity is waiting for this response"),
        }
    }

    async fn execute(&self, run: Run) {
        tracing::info!("Runner {} invoking {}", self.runner_id, run.entry_point);
        let script: Script = serde_json::from_value(run.event.clone()).unwrap_or_default();
        let outcome = self.perform(&script).await;
        let (result, error) = match outcome {
            Ok(results) => match &script.fail {
                Some(message) => (None, Some(message.clone())),
                None => (
                    Some(Value::from(serde_json::json!({
                        "entry_point": run.entry_point.clone(),
                        "event": run.event.clone(),
                        "results": results,
                    }))),
                    None,
                ),
            },
            Err(err) => (None, Some(format!("{err:#}"))),
        };
        let traceback = error
            .as_ref()
            .map(|_| vec![format!("File \"{}\", in echo", run.entry_point)])
            .unwrap_or_default();

        let done = Message::Done(Done {
            session_id: self.session_id.clone(),
            result,
            error,
            traceback,
        });
        if let Err(err) = self.send_to_worker(&done).await {
            tracing::error!("Failed to report completion: {err:#}");
        }
    }

    async fn perform(&self, script: &Script) -> Result<Vec<serde_json::Value>> {
        if let Some(text) = &script.print {
            self.send_to_worker(&Message::Print(Print {
                session_id: self.session_id.clone(),
                text: text.clone(),
            }))
            .await?;
        }
        if let Some(message) = &script.log {
            self.send_to_worker(&Message::Log(Log {
                session_id: self.session_id.clone(),
                level: LogLevel::Info,
                message: message.clone(),
            }))
            .await?;
        }
        if let Some(duration_ms) = script.sleep_ms {
            let reply = self
                .send_to_worker(&Message::Sleep(Sleep {
                    session_id: self.session_id.clone(),
                    duration_ms,
                }))
                .await?;
            if let Message::Response(Response { error: Some(err), .. }) = reply {
                anyhow::bail!("sleep failed: {err}");
            }
        }

        let mut results = Vec::new();
        for call in &script.calls {
            let response = self.activity(call).await?;
            results.push(match (response.result, response.error) {
                (_, Some(error)) => serde_json::json!({ "error": error }),
                (Some(value), None) => value.to_json(),
                (None, None) => serde_json::Value::Null,
            });
        }
        Ok(results)
    }

    async fn activity(&self, call: &ScriptCall) -> Result<Response> {
        let call_id = format!("call-{}", self.next_call.fetch_add(1, Ordering::Relaxed));
        let payload = match &call.payload {
            serde_json::Value::String(text) => text.clone().into_bytes(),
            other => serde_json::to_vec(other)?,
        };

        let (tx, rx) = oneshot::channel();
        self.pending.insert(call_id.clone(), tx);
        let ack = self
            .send_to_worker(&Message::Callback(Callback {
                session_id: self.session_id.clone(),
                call_id: call_id.clone(),
                function: call.function.clone(),
                payload,
            }))
            .await;
        if let Err(err) = ack {
            self.pending.remove(&call_id);
            return Err(err);
        }
        rx.await
            .with_context(|| format!("activity {call_id} was abandoned"))
    }

    async fn send_to_worker(&self, message: &Message) -> Result<Message> {
        let worker = self
            .worker
            .as_ref()
            .context("runner has no worker connection")?;
        let reply = worker.lock().await.request(message).await?;
        Ok(reply)
    }
}
