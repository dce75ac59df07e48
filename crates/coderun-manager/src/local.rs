// Local process backend: each runner is a child process with its own code
// and support directories and a reserved loopback port.

use crate::manager::{RunnerBackend, StartRequest};
use anyhow::{Context, Result};
use async_trait::async_trait;
use coderun_common::constants::{defaults, variables};
use coderun_common::error::{CleanupErrors, ProvisionError};
use coderun_common::settings::{BackendKind, LocalSettings, RuntimeSettings};
use coderun_common::tracing::Tracing;
use coderun_common::{HostContext, RunnerId};
use coderun_sdk::process_invoker::{forward_lines, terminate};
use coderun_sdk::trace::PrefixedTraceWriter;
use coderun_sdk::{IOUtil, ProcessInvoker, TraceWriter, WhichUtil};
use once_cell::sync::Lazy;
use parking_lot::Mutex;
use regex::Regex;
use std::collections::{HashMap, HashSet};
use std::ffi::OsString;
use std::net::TcpListener;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use tempfile::TempDir;
use tokio::process::{Child, Command};
use tokio::sync::OnceCell;
use tokio_util::sync::CancellationToken;

static VERSION_REGEX: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(\d+)\.(\d+)(?:\.(\d+))?").expect("Invalid version regex"));

/// Parse the first `major.minor[.patch]` found in `text`.
pub fn parse_version(text: &str) -> Option<(u32, u32, u32)> {
    let caps = VERSION_REGEX.captures(text)?;
    let part = |i: usize| caps.get(i).map_or(Some(0), |m| m.as_str().parse().ok());
    Some((part(1)?, part(2)?, part(3)?))
}

/// A resolved interpreter that passed the minimum version check.
#[derive(Debug, Clone)]
pub struct Interpreter {
    pub path: PathBuf,
    pub version: (u32, u32, u32),
}

/// Loopback ports handed out to runners that have not released them yet.
#[derive(Debug, Clone, Default)]
pub struct PortAllocator {
    reserved: Arc<Mutex<HashSet<u16>>>,
}

impl PortAllocator {
    /// Find a free loopback port not already reserved by another runner.
    pub fn reserve(&self) -> std::io::Result<PortReservation> {
        for _ in 0..16 {
            let port = TcpListener::bind("127.0.0.1:0")?.local_addr()?.port();
            if self.reserved.lock().insert(port) {
                return Ok(PortReservation {
                    port,
                    reserved: self.reserved.clone(),
                });
            }
        }
        Err(std::io::Error::new(
            std::io::ErrorKind::AddrInUse,
            "no unreserved loopback port available",
        ))
    }

    pub fn is_reserved(&self, port: u16) -> bool {
        self.reserved.lock().contains(&port)
    }
}

/// Returns the port to the allocator when dropped.
#[derive(Debug)]
pub struct PortReservation {
    port: u16,
    reserved: Arc<Mutex<HashSet<u16>>>,
}

impl PortReservation {
    pub fn port(&self) -> u16 {
        self.port
    }
}

impl Drop for PortReservation {
    fn drop(&mut self) {
        self.reserved.lock().remove(&self.port);
    }
}

struct LocalRunner {
    child: Child,
    code_dir: TempDir,
    support_dir: TempDir,
    port: PortReservation,
}

/// Where a local runner lives on disk and which process backs it.
#[derive(Debug, Clone)]
pub struct LocalRunnerInfo {
    pub pid: Option<u32>,
    pub code_dir: PathBuf,
    pub support_dir: PathBuf,
    pub port: u16,
}

pub struct LocalBackend {
    settings: LocalSettings,
    min_interpreter_version: String,
    environment: OnceCell<Interpreter>,
    ports: PortAllocator,
    runners: Mutex<HashMap<RunnerId, LocalRunner>>,
    trace: Tracing,
}

impl LocalBackend {
    /// Create the backend. Unless `lazy_environment` is set the interpreter
    /// is resolved and version-checked right away.
    pub async fn new(context: &HostContext, settings: &RuntimeSettings) -> Result<Self, ProvisionError> {
        let backend = Self {
            settings: settings.local.clone(),
            min_interpreter_version: settings.min_interpreter_version.clone(),
            environment: OnceCell::new(),
            ports: PortAllocator::default(),
            runners: Mutex::new(HashMap::new()),
            trace: context.get_trace("LocalBackend"),
        };
        if !settings.lazy_environment {
            backend.environment().await?;
        }
        Ok(backend)
    }

    /// The memoized interpreter, discovered on first use.
    pub async fn environment(&self) -> Result<&Interpreter, ProvisionError> {
        self.environment
            .get_or_try_init(|| self.discover_interpreter())
            .await
            .map_err(ProvisionError::Backend)
    }

    async fn discover_interpreter(&self) -> Result<Interpreter> {
        let path = WhichUtil::which(&self.settings.interpreter, true)?
            .with_context(|| format!("interpreter '{}' not found", self.settings.interpreter))?;

        let invoker = ProcessInvoker::new(Arc::new(self.trace.clone()));
        let output = invoker
            .execute(
                None,
                &path.to_string_lossy(),
                &["--version".to_string()],
                None,
                true,
                CancellationToken::new(),
            )
            .await
            .with_context(|| format!("failed to query version of {}", path.display()))?;

        let text = format!("{}\n{}", output.stdout_text(), output.stderr.join("\n"));
        let version = parse_version(&text)
            .with_context(|| format!("could not read a version from '{}'", text.trim()))?;
        let minimum = parse_version(&self.min_interpreter_version).with_context(|| {
            format!(
                "invalid minimum interpreter version '{}'",
                self.min_interpreter_version
            )
        })?;
        anyhow::ensure!(
            version >= minimum,
            "interpreter {} is version {}.{}.{}, at least {} is required",
            path.display(),
            version.0,
            version.1,
            version.2,
            self.min_interpreter_version
        );

        self.trace.info(&format!(
            "Using interpreter {} ({}.{}.{})",
            path.display(),
            version.0,
            version.1,
            version.2
        ));
        Ok(Interpreter { path, version })
    }

    pub fn runner_info(&self, runner_id: &RunnerId) -> Option<LocalRunnerInfo> {
        self.runners.lock().get(runner_id).map(|runner| LocalRunnerInfo {
            pid: runner.child.id(),
            code_dir: runner.code_dir.path().to_path_buf(),
            support_dir: runner.support_dir.path().to_path_buf(),
            port: runner.port.port(),
        })
    }

    fn support_source(&self) -> Result<&Path> {
        let dir = self
            .settings
            .support_dir
            .as_deref()
            .context("no runner support directory configured")?;
        anyhow::ensure!(
            dir.is_dir(),
            "runner support directory {} does not exist",
            dir.display()
        );
        Ok(dir)
    }

    /// The session's own search path (or the host's when the session sets
    /// none) followed by the runner's code and support directories.
    fn search_path(
        &self,
        vars: &HashMap<String, String>,
        code_dir: &Path,
        support_dir: &Path,
    ) -> Result<OsString> {
        let existing = match vars.get(&self.settings.search_path_var) {
            Some(value) => OsString::from(value),
            None => std::env::var_os(&self.settings.search_path_var).unwrap_or_default(),
        };
        let paths = std::env::split_paths(&existing)
            .filter(|p| !p.as_os_str().is_empty())
            .chain([code_dir.to_path_buf(), support_dir.to_path_buf()]);
        std::env::join_paths(paths).context("runner directories cannot be joined into a search path")
    }

    async fn launch(&self, request: &StartRequest) -> Result<LocalRunner> {
        let interpreter = self.environment().await?.path.clone();
        let support_source = self.support_source()?;

        let code_dir = tempfile::Builder::new()
            .prefix("coderun-code-")
            .tempdir()
            .context("failed to create code directory")?;
        let support_dir = tempfile::Builder::new()
            .prefix("coderun-support-")
            .tempdir()
            .context("failed to create support directory")?;

        let artifact = request.artifact.clone();
        let support_source = support_source.to_path_buf();
        let code_path = code_dir.path().to_path_buf();
        let support_path = support_dir.path().to_path_buf();
        tokio::task::spawn_blocking(move || -> Result<()> {
            artifact.extract_archive(&code_path)?;
            IOUtil::copy_directory(&support_source, &support_path)?;
            Ok(())
        })
        .await
        .context("runner file preparation was interrupted")??;

        let port = self.ports.reserve().context("failed to reserve runner port")?;
        let entry = support_dir.path().join(&self.settings.runner_entry);

        let mut cmd = Command::new(&interpreter);
        cmd.arg(&entry)
            .arg("--port")
            .arg(port.port().to_string())
            .current_dir(code_dir.path())
            .envs(&request.vars)
            .env(
                &self.settings.search_path_var,
                self.search_path(&request.vars, code_dir.path(), support_dir.path())?,
            )
            .env(variables::runner::WORKER_ADDRESS, &request.worker_address)
            .env(variables::runner::SESSION_ID, request.session_id.as_str())
            .env(variables::runner::RUNNER_ID, request.runner_id.as_str())
            .env(variables::runner::CODE_DIR, code_dir.path())
            .env(variables::runner::PORT, port.port().to_string())
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let mut child = cmd
            .spawn()
            .with_context(|| format!("failed to launch runner {}", interpreter.display()))?;

        let output: Arc<dyn TraceWriter> =
            Arc::new(PrefixedTraceWriter::new(format!("runner {}", request.runner_id)));
        if let Some(stdout) = child.stdout.take() {
            forward_lines(stdout, output.clone(), false);
        }
        if let Some(stderr) = child.stderr.take() {
            forward_lines(stderr, output, true);
        }

        self.trace.info(&format!(
            "Launched runner {} (pid {}) on port {}",
            request.runner_id,
            child.id().unwrap_or(0),
            port.port()
        ));

        Ok(LocalRunner {
            child,
            code_dir,
            support_dir,
            port,
        })
    }
}

#[async_trait]
impl RunnerBackend for LocalBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::Local
    }

    async fn start(&self, request: &StartRequest) -> Result<String, ProvisionError> {
        let runner = self.launch(request).await?;
        let endpoint = format!("127.0.0.1:{}", runner.port.port());
        self.runners
            .lock()
            .insert(request.runner_id.clone(), runner);
        Ok(endpoint)
    }

    async fn stop(&self, runner_id: &RunnerId) -> Result<(), ProvisionError> {
        let Some(mut runner) = self.runners.lock().remove(runner_id) else {
            return Ok(());
        };

        let exit_code = terminate(&mut runner.child, &self.trace, defaults::STOP_GRACE).await;
        self.trace
            .verbose(&format!("Runner {runner_id} exited with code {exit_code}"));

        let mut errors = CleanupErrors::default();
        for (what, dir) in [
            ("remove code directory", &runner.code_dir),
            ("remove support directory", &runner.support_dir),
        ] {
            if let Err(err) = IOUtil::delete_directory(dir.path()) {
                errors.push(what, format!("{err:#}"));
            }
        }
        drop(runner);
        errors.into_result()
    }

    async fn health(&self) -> Result<(), ProvisionError> {
        self.environment().await?;
        self.support_source().map_err(ProvisionError::Backend)?;
        Ok(())
    }
}
