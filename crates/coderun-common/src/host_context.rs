// HostContext: process-wide settings, trace sources and shutdown coordination
// shared by every coderun component.

use crate::settings::RuntimeSettings;
use crate::tracing::{TraceManager, Tracing};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// The application context handed to long-lived components.
pub struct HostContext {
    /// The host type string (e.g. "Host", "Manager", "Runner").
    host_type: String,

    settings: RuntimeSettings,

    /// Trace manager for creating per-component trace sources.
    trace_manager: TraceManager,

    /// Cancelled once the host begins shutting down.
    shutdown_token: CancellationToken,
}

impl HostContext {
    pub fn new(host_type: impl Into<String>, settings: RuntimeSettings) -> Arc<Self> {
        Arc::new(Self {
            host_type: host_type.into(),
            settings,
            trace_manager: TraceManager::new(),
            shutdown_token: CancellationToken::new(),
        })
    }

    pub fn host_type(&self) -> &str {
        &self.host_type
    }

    pub fn settings(&self) -> &RuntimeSettings {
        &self.settings
    }

    /// Get a named trace source for a component.
    pub fn get_trace(&self, name: &str) -> Tracing {
        self.trace_manager.get(name)
    }

    /// A child token cancelled when the host shuts down.
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown_token.child_token()
    }

    pub fn is_shutting_down(&self) -> bool {
        self.shutdown_token.is_cancelled()
    }

    /// Begin an orderly shutdown of every component holding a token.
    pub fn shutdown(&self) {
        if !self.shutdown_token.is_cancelled() {
            ::tracing::info!(host = %self.host_type, "Shutting down");
            self.shutdown_token.cancel();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn shutdown_cancels_child_tokens() {
        let context = HostContext::new("Host", RuntimeSettings::default());
        let token = context.shutdown_token();
        assert!(!token.is_cancelled());
        context.shutdown();
        assert!(token.is_cancelled());
        assert!(context.is_shutting_down());
        context.shutdown();
    }

    #[test]
    fn traces_are_named_per_component() {
        let context = HostContext::new("Host", RuntimeSettings::default());
        assert_eq!(context.get_trace("WorkerService").name(), "WorkerService");
        assert_eq!(context.host_type(), "Host");
    }
}
