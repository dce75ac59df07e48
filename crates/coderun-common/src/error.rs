// Error taxonomy for building, provisioning and driving runner sessions.
//
// Typed errors live at the seams between components; internal plumbing uses
// `anyhow` with context and converts into one of these at the boundary.

use crate::ids::{RunnerId, SessionId};
use crate::protocol::ErrorKind;
use std::fmt;
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

/// Packaging or static-analysis failure. Fatal before any runner starts.
#[derive(Debug, Error)]
pub enum BuildError {
    #[error("source tree '{}' does not exist or is not a directory", .0.display())]
    MissingSource(PathBuf),

    #[error("source tree '{}' contains no files to package", .0.display())]
    EmptySource(PathBuf),

    #[error("failed to walk source tree: {0}")]
    Walk(#[from] walkdir::Error),

    #[error("failed to read '{}': {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to write archive: {0}")]
    Archive(#[source] std::io::Error),
}

/// Malformed, unexpected or out-of-sequence traffic on a runner connection.
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("unknown message tag {0}")]
    UnknownTag(i32),

    #[error("type mismatch: expected {expected} message, got {actual}")]
    TypeMismatch { expected: String, actual: String },

    #[error("malformed {tag} payload: {source}")]
    Malformed {
        tag: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("frame of {size} bytes exceeds the {limit} byte limit")]
    FrameTooLarge { size: usize, limit: usize },

    #[error("unexpected {message} message while {state}")]
    OutOfSequence { state: String, message: String },

    #[error("reply correlation mismatch: sent request {expected}, got reply to {actual}")]
    UnexpectedReply { expected: u64, actual: u64 },

    #[error("peer rejected request ({kind}): {message}")]
    Remote { kind: ErrorKind, message: String },

    #[error("connection closed by peer")]
    ConnectionClosed,

    #[error("connection i/o failed: {0}")]
    Io(#[from] std::io::Error),
}

impl ProtocolError {
    /// Whether the error means the peer is gone rather than misbehaving.
    pub fn is_disconnect(&self) -> bool {
        matches!(self, ProtocolError::ConnectionClosed | ProtocolError::Io(_))
    }

    pub fn out_of_sequence(state: impl fmt::Display, message: impl fmt::Display) -> Self {
        ProtocolError::OutOfSequence {
            state: state.to_string(),
            message: message.to_string(),
        }
    }
}

/// The delegated durable call failed. Handed back to the runner as an
/// error-carrying response; never fatal to the session.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{message}")]
pub struct ActivityError {
    pub message: String,
}

impl ActivityError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

/// Individual failures collected while releasing a runner's resources.
#[derive(Debug, Default)]
pub struct CleanupErrors(pub Vec<String>);

impl CleanupErrors {
    pub fn push(&mut self, what: &str, err: impl fmt::Display) {
        self.0.push(format!("{what}: {err}"));
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// `Ok` when nothing failed, otherwise the combined error.
    pub fn into_result(self) -> Result<(), ProvisionError> {
        if self.is_empty() {
            Ok(())
        } else {
            Err(ProvisionError::Cleanup(self))
        }
    }
}

impl fmt::Display for CleanupErrors {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.join("; "))
    }
}

/// The runner manager could not start, reach or release a runner.
/// Retryable by the caller; never retried internally.
#[derive(Debug, Error)]
pub enum ProvisionError {
    #[error("remote backend requires at least one runner manager endpoint")]
    NoEndpoints,

    #[error("session {0} already has an active runner")]
    AlreadyStarted(SessionId),

    #[error("runner {0} not found")]
    NotFound(RunnerId),

    #[error("runner {runner_id} did not become healthy within {timeout:?}: {last_error}")]
    Unhealthy {
        runner_id: RunnerId,
        timeout: Duration,
        last_error: String,
    },

    #[error("runner start exceeded its {0:?} deadline")]
    Timeout(Duration),

    #[error("failed to release runner resources: {0}")]
    Cleanup(CleanupErrors),

    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    #[error(transparent)]
    Backend(#[from] anyhow::Error),
}

impl ProvisionError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, ProvisionError::NotFound(_))
            || matches!(
                self,
                ProvisionError::Protocol(ProtocolError::Remote {
                    kind: ErrorKind::NotFound,
                    ..
                })
            )
    }
}

/// The runner's connection was lost before it reported completion.
#[derive(Debug, Clone, Error)]
#[error("runner {runner_id} crashed: {reason}")]
pub struct RunnerCrash {
    pub runner_id: RunnerId,
    pub reason: String,
}

/// Everything a platform caller can get back from building or running code.
#[derive(Debug, Error)]
pub enum RuntimeError {
    #[error(transparent)]
    Build(#[from] BuildError),

    #[error(transparent)]
    Provision(#[from] ProvisionError),

    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    #[error(transparent)]
    Activity(#[from] ActivityError),

    #[error(transparent)]
    RunnerCrash(#[from] RunnerCrash),

    #[error("entry point '{0}' is not exported by the build")]
    UnknownEntryPoint(String),

    #[error("session {0} is no longer running")]
    SessionClosed(SessionId),

    #[error("user code failed: {message}")]
    UserCode {
        message: String,
        traceback: Vec<String>,
    },

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}
