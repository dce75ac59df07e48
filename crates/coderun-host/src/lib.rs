// coderun-host: the host side of a code session.
//
// Architecture:
//   Runtime::run → SessionCoordinator::start → RunnerManager::start
//   SessionRun::call → SessionCoordinator::run → DurableEngine::call per request
//   Runners dial WorkerService, which routes each request to its session's mailbox.

pub mod coordinator;
pub mod runtime;
pub mod service;
pub mod sink;

pub use coordinator::{CoordinatorOptions, SessionCoordinator, SessionState};
pub use runtime::{Runtime, SessionRun};
pub use service::{SessionEvent, SessionMailbox, WorkerService};
pub use sink::{MemorySink, SessionSink, SinkEntry, TracingSink};
