// Per-component trace sources on top of the `tracing` crate.

use coderun_sdk::TraceWriter;
use std::fmt;

/// Trace event severity level.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum TraceEventType {
    Verbose,
    Information,
    Warning,
    Error,
}

impl fmt::Display for TraceEventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TraceEventType::Verbose => write!(f, "VERB"),
            TraceEventType::Information => write!(f, "INFO"),
            TraceEventType::Warning => write!(f, "WARN"),
            TraceEventType::Error => write!(f, "ERR "),
        }
    }
}

/// Configuration for trace output.
#[derive(Debug, Clone)]
pub struct TraceSetting {
    /// Minimum severity level to emit.
    pub level: TraceEventType,
}

impl Default for TraceSetting {
    fn default() -> Self {
        Self {
            level: TraceEventType::Verbose,
        }
    }
}

/// A named trace source. Every line carries the component name as a
/// structured field so subscribers can filter on it.
#[derive(Debug, Clone)]
pub struct Tracing {
    name: String,
    setting: TraceSetting,
}

impl Tracing {
    pub fn new(name: impl Into<String>, setting: TraceSetting) -> Self {
        Self {
            name: name.into(),
            setting,
        }
    }

    fn trace(&self, event_type: TraceEventType, message: &str) {
        if event_type < self.setting.level {
            return;
        }

        let component = self.name.as_str();
        match event_type {
            TraceEventType::Error => tracing::error!(component, "{}", message),
            TraceEventType::Warning => tracing::warn!(component, "{}", message),
            TraceEventType::Information => tracing::info!(component, "{}", message),
            TraceEventType::Verbose => tracing::debug!(component, "{}", message),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Log an error and its whole source chain.
    pub fn error_err(&self, err: &dyn std::error::Error) {
        self.error(&err.to_string());
        let mut source = err.source();
        while let Some(cause) = source {
            self.error(&format!("caused by: {cause}"));
            source = cause.source();
        }
    }
}

impl TraceWriter for Tracing {
    fn info(&self, message: &str) {
        self.trace(TraceEventType::Information, message);
    }

    fn verbose(&self, message: &str) {
        self.trace(TraceEventType::Verbose, message);
    }

    fn warning(&self, message: &str) {
        self.trace(TraceEventType::Warning, message);
    }

    fn error(&self, message: &str) {
        self.trace(TraceEventType::Error, message);
    }
}

/// Hands out named trace sources sharing one setting.
#[derive(Debug, Clone, Default)]
pub struct TraceManager {
    default_setting: TraceSetting,
}

impl TraceManager {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_setting(setting: TraceSetting) -> Self {
        Self {
            default_setting: setting,
        }
    }

    /// Get (create) a named trace source.
    pub fn get(&self, name: &str) -> Tracing {
        Tracing::new(name, self.default_setting.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sources_carry_their_name() {
        let manager = TraceManager::new();
        let trace = manager.get("SessionCoordinator");
        assert_eq!(trace.name(), "SessionCoordinator");
        trace.info("hello");
        trace.verbose("details");
    }

    #[test]
    fn levels_are_ordered() {
        assert!(TraceEventType::Verbose < TraceEventType::Information);
        assert!(TraceEventType::Warning < TraceEventType::Error);
        let quiet = Tracing::new(
            "x",
            TraceSetting {
                level: TraceEventType::Error,
            },
        );
        quiet.info("suppressed");
    }
}
