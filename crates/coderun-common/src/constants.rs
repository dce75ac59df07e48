// Constants shared by the host, the runner manager and the runners themselves.
// Grouped the same way the settings and wire contracts are consumed.

use std::time::Duration;

/// Environment variables understood by coderun processes.
pub mod variables {
    /// Variables the host sets on every runner it launches.
    pub mod runner {
        pub const WORKER_ADDRESS: &str = "CODERUN_WORKER_ADDRESS";
        pub const SESSION_ID: &str = "CODERUN_SESSION_ID";
        pub const RUNNER_ID: &str = "CODERUN_RUNNER_ID";
        pub const CODE_DIR: &str = "CODERUN_CODE_DIR";
        pub const PORT: &str = "CODERUN_PORT";
    }

    /// Overrides applied on top of the settings file.
    pub mod settings {
        pub const SETTINGS_FILE: &str = "CODERUN_SETTINGS";
        pub const BACKEND: &str = "CODERUN_BACKEND";
        pub const WORKER_ADDRESS: &str = "CODERUN_WORKER_BIND";
        pub const RUNNER_WORKER_ADDRESS: &str = "CODERUN_RUNNER_WORKER_ADDRESS";
        pub const LAZY_ENVIRONMENT: &str = "CODERUN_LAZY_ENVIRONMENT";
        pub const LOG_RUNNER_CODE: &str = "CODERUN_LOG_RUNNER_CODE";
        pub const LOG_PRINT: &str = "CODERUN_LOG_PRINT";
        pub const REMOTE_ENDPOINTS: &str = "CODERUN_REMOTE_ENDPOINTS";
        pub const MIN_INTERPRETER_VERSION: &str = "CODERUN_MIN_INTERPRETER_VERSION";
        pub const INTERPRETER: &str = "CODERUN_INTERPRETER";
        pub const SUPPORT_DIR: &str = "CODERUN_SUPPORT_DIR";
    }
}

/// Default values for `RuntimeSettings`.
pub mod defaults {
    use super::Duration;

    pub const WORKER_ADDRESS: &str = "127.0.0.1:0";
    pub const INTERPRETER: &str = "python3";
    pub const RUNNER_ENTRY: &str = "main.py";
    pub const SEARCH_PATH_VAR: &str = "PYTHONPATH";
    pub const MIN_INTERPRETER_VERSION: &str = "3.11";

    pub const DOCKER_PATH: &str = "docker";
    pub const BASE_IMAGE: &str = "python:3.11-slim";
    pub const IMAGE_REPOSITORY: &str = "coderun-runner";
    pub const NETWORK: &str = "coderun-runners";
    pub const RUNNER_PORT: u16 = 9293;
    pub const PORT_DISCOVERY_ATTEMPTS: u32 = 5;

    pub const START_TIMEOUT: Duration = Duration::from_secs(60);
    pub const HEALTH_TIMEOUT: Duration = Duration::from_secs(10);
    pub const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);
    pub const HEALTH_INTERVAL: Duration = Duration::from_secs(5);
    pub const HEALTH_POLL_INTERVAL: Duration = Duration::from_millis(100);
    pub const STOP_GRACE: Duration = Duration::from_secs(3);
}

/// Build artifact layout.
pub mod artifact {
    /// Name of the blob holding the packed source tree.
    pub const ARCHIVE_BLOB: &str = "archive";
    /// Directories that never make it into an archive.
    pub const EXCLUDED_DIRS: &[&str] = &[
        "__pycache__",
        ".pytest_cache",
        ".mypy_cache",
        ".ruff_cache",
        ".git",
    ];
    /// File extensions that never make it into an archive.
    pub const EXCLUDED_EXTENSIONS: &[&str] = &["pyc", "pyo"];
    /// Extensions scanned for exported entry points.
    pub const SOURCE_EXTENSION: &str = "py";
}

/// Names of the durable-engine functions backing runner control primitives.
pub mod syscalls {
    pub const SLEEP: &str = "sleep";
    pub const SUBSCRIBE: &str = "subscribe";
    pub const NEXT_EVENT: &str = "next_event";
    pub const UNSUBSCRIBE: &str = "unsubscribe";
    /// Namespace loaded from the engine before a session starts.
    pub const ENV_NAMESPACE: &str = "env";
}

/// Upper bound for one frame's payload.
pub const MAX_FRAME_SIZE: usize = 64 * 1024 * 1024;
