/// Lightweight diagnostic output abstraction.
///
/// Components that emit progress lines (process invocations, container
/// commands, runner output forwarding) take an `Arc<dyn TraceWriter>` so that
/// tests can capture what they print instead of going through `tracing`.
pub trait TraceWriter: Send + Sync {
    /// Log an informational message.
    fn info(&self, message: &str);

    /// Log a verbose / debug message.
    fn verbose(&self, message: &str);

    /// Log a warning message.
    fn warning(&self, message: &str) {
        self.info(&format!("[warning] {message}"));
    }

    /// Log an error message.
    fn error(&self, message: &str) {
        self.info(&format!("[error] {message}"));
    }
}

/// Prefixes every line with a fixed label before handing it to `tracing`.
///
/// Used for child-process output where a single runner's lines must stay
/// attributable once interleaved with other sessions.
#[derive(Debug, Clone)]
pub struct PrefixedTraceWriter {
    prefix: String,
}

impl PrefixedTraceWriter {
    pub fn new(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
        }
    }
}

impl TraceWriter for PrefixedTraceWriter {
    fn info(&self, message: &str) {
        tracing::info!("[{}] {}", self.prefix, message);
    }

    fn verbose(&self, message: &str) {
        tracing::debug!("[{}] {}", self.prefix, message);
    }

    fn warning(&self, message: &str) {
        tracing::warn!("[{}] {}", self.prefix, message);
    }

    fn error(&self, message: &str) {
        tracing::error!("[{}] {}", self.prefix, message);
    }
}

/// Discards all messages.
#[cfg(test)]
#[derive(Debug, Clone)]
pub struct NullTraceWriter;

#[cfg(test)]
impl TraceWriter for NullTraceWriter {
    fn info(&self, _message: &str) {}
    fn verbose(&self, _message: &str) {}
    fn warning(&self, _message: &str) {}
    fn error(&self, _message: &str) {}
}

/// The level of a collected trace message.
#[cfg(test)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TraceLevel {
    Info,
    Verbose,
    Warning,
    Error,
}

/// Keeps every message in memory.
#[cfg(test)]
#[derive(Debug, Default)]
pub struct CollectingTraceWriter {
    messages: parking_lot::Mutex<Vec<(TraceLevel, String)>>,
}

#[cfg(test)]
impl CollectingTraceWriter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Return all collected messages.
    pub fn messages(&self) -> Vec<(TraceLevel, String)> {
        self.messages.lock().clone()
    }

    /// Whether any collected message contains `needle`.
    pub fn contains(&self, needle: &str) -> bool {
        self.messages.lock().iter().any(|(_, m)| m.contains(needle))
    }

    fn push(&self, level: TraceLevel, message: &str) {
        self.messages.lock().push((level, message.to_string()));
    }
}

#[cfg(test)]
impl TraceWriter for CollectingTraceWriter {
    fn info(&self, message: &str) {
        self.push(TraceLevel::Info, message);
    }

    fn verbose(&self, message: &str) {
        self.push(TraceLevel::Verbose, message);
    }

    fn warning(&self, message: &str) {
        self.push(TraceLevel::Warning, message);
    }

    fn error(&self, message: &str) {
        self.push(TraceLevel::Error, message);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn collecting_writer_keeps_order_and_levels() {
        let writer = CollectingTraceWriter::new();
        writer.info("hello");
        writer.warning("warn");
        writer.error("err");
        writer.verbose("verb");
        let msgs = writer.messages();
        assert_eq!(msgs.len(), 4);
        assert_eq!(msgs[0], (TraceLevel::Info, "hello".into()));
        assert_eq!(msgs[1], (TraceLevel::Warning, "warn".into()));
        assert_eq!(msgs[3], (TraceLevel::Verbose, "verb".into()));
        assert!(writer.contains("er"));
        assert!(!writer.contains("missing"));
    }

    #[test]
    fn default_warning_routes_through_info() {
        struct OnlyInfo(CollectingTraceWriter);
        impl TraceWriter for OnlyInfo {
            fn info(&self, message: &str) {
                self.0.info(message);
            }
            fn verbose(&self, _message: &str) {}
        }

        let writer = OnlyInfo(CollectingTraceWriter::new());
        writer.warning("disk low");
        assert!(writer.0.contains("[warning] disk low"));
    }
}
