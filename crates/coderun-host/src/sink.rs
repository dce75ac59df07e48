// Session log sinks: where runner Log and Print output ends up.

use coderun_common::protocol::LogLevel;
use coderun_common::settings::RuntimeSettings;
use coderun_common::SessionId;
use parking_lot::Mutex;

/// Receives the output a session's user code produces.
pub trait SessionSink: Send + Sync {
    fn log(&self, session_id: &SessionId, level: LogLevel, message: &str);

    fn print(&self, session_id: &SessionId, text: &str);
}

/// Relays runner output through `tracing` under the `runner_code` and
/// `runner_print` targets.
#[derive(Debug, Clone)]
pub struct TracingSink {
    log_runner_code: bool,
    log_print: bool,
}

impl TracingSink {
    pub fn new(log_runner_code: bool, log_print: bool) -> Self {
        Self {
            log_runner_code,
            log_print,
        }
    }

    pub fn from_settings(settings: &RuntimeSettings) -> Self {
        Self::new(settings.log_runner_code, settings.log_print)
    }
}

impl SessionSink for TracingSink {
    fn log(&self, session_id: &SessionId, level: LogLevel, message: &str) {
        if !self.log_runner_code {
            return;
        }
        match level {
            LogLevel::Debug => tracing::debug!(target: "runner_code", session_id = %session_id, "{}", message),
            LogLevel::Info => tracing::info!(target: "runner_code", session_id = %session_id, "{}", message),
            LogLevel::Warn => tracing::warn!(target: "runner_code", session_id = %session_id, "{}", message),
            LogLevel::Error => tracing::error!(target: "runner_code", session_id = %session_id, "{}", message),
        }
    }

    fn print(&self, session_id: &SessionId, text: &str) {
        if self.log_print {
            tracing::info!(target: "runner_print", session_id = %session_id, "{}", text.trim_end());
        }
    }
}

/// One captured line of session output.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SinkEntry {
    Log {
        session_id: SessionId,
        level: LogLevel,
        message: String,
    },
    Print {
        session_id: SessionId,
        text: String,
    },
}

/// Keeps session output in memory, for callers that want to return it.
#[derive(Debug, Default)]
pub struct MemorySink {
    entries: Mutex<Vec<SinkEntry>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn entries(&self) -> Vec<SinkEntry> {
        self.entries.lock().clone()
    }

    /// Printed text of one session, in order.
    pub fn prints(&self, session_id: &SessionId) -> Vec<String> {
        self.entries
            .lock()
            .iter()
            .filter_map(|entry| match entry {
                SinkEntry::Print { session_id: s, text } if s == session_id => Some(text.clone()),
                _ => None,
            })
            .collect()
    }
}

impl SessionSink for MemorySink {
    fn log(&self, session_id: &SessionId, level: LogLevel, message: &str) {
        self.entries.lock().push(SinkEntry::Log {
            session_id: session_id.clone(),
            level,
            message: message.to_string(),
        });
    }

    fn print(&self, session_id: &SessionId, text: &str) {
        self.entries.lock().push(SinkEntry::Print {
            session_id: session_id.clone(),
            text: text.to_string(),
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn memory_sink_keeps_order_per_session() {
        let sink = MemorySink::new();
        let a = SessionId::from("a");
        let b = SessionId::from("b");
        sink.print(&a, "one");
        sink.log(&a, LogLevel::Warn, "careful");
        sink.print(&b, "other");
        sink.print(&a, "two");

        assert_eq!(sink.prints(&a), vec!["one", "two"]);
        assert_eq!(sink.entries().len(), 4);
        assert!(sink.entries().contains(&SinkEntry::Log {
            session_id: a,
            level: LogLevel::Warn,
            message: "careful".into(),
        }));
    }

    #[test]
    fn tracing_sink_follows_settings() {
        let mut settings = RuntimeSettings::default();
        settings.log_print = false;
        let sink = TracingSink::from_settings(&settings);
        assert!(sink.log_runner_code);
        assert!(!sink.log_print);
        // Disabled channels are silently dropped.
        sink.print(&SessionId::from("s"), "hidden");
    }
}
