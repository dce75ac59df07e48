// coderun-common: contracts shared by the host, the runner manager and runners.
// Identifiers, the message protocol, the error taxonomy, the durable-engine
// interface, code packaging, settings and component tracing.

pub mod artifact;
pub mod constants;
pub mod durable;
pub mod error;
pub mod host_context;
pub mod ids;
pub mod packager;
pub mod protocol;
pub mod settings;
pub mod tracing;

// ---------------------------------------------------------------------------
// Re-exports for convenient access
// ---------------------------------------------------------------------------

pub use artifact::{BuildArtifact, Export};
pub use durable::{ActivityCall, DurableEngine, Value};
pub use error::{
    ActivityError, BuildError, CleanupErrors, ProtocolError, ProvisionError, RunnerCrash,
    RuntimeError,
};
pub use host_context::HostContext;
pub use ids::{RunId, RunnerId, SessionId};
pub use protocol::{Envelope, FramedConnection, Message, MessageTag, WireMessage};
pub use settings::{BackendKind, ContainerSettings, LocalSettings, RuntimeSettings};
pub use tracing::{TraceEventType, TraceManager, TraceSetting, Tracing};
