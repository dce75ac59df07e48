use crate::trace::TraceWriter;
use anyhow::{Context, Result};
use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::{Child, Command};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// The duration to wait after sending SIGINT before escalating to SIGTERM.
const SIGINT_TIMEOUT: Duration = Duration::from_millis(7500);
/// The duration to wait after sending SIGTERM before escalating to SIGKILL.
const SIGTERM_TIMEOUT: Duration = Duration::from_millis(2500);

/// Error type for non-zero process exit codes.
#[derive(Debug, thiserror::Error)]
#[error("Exit code {exit_code} returned from process: file name '{file_name}', arguments '{arguments}'. {stderr}")]
pub struct ProcessExitCodeError {
    pub exit_code: i32,
    pub file_name: String,
    pub arguments: String,
    pub stderr: String,
}

/// Captured result of a finished process.
#[derive(Debug, Clone, Default)]
pub struct ProcessOutput {
    pub exit_code: i32,
    pub stdout: Vec<String>,
    pub stderr: Vec<String>,
}

impl ProcessOutput {
    /// Stdout joined back into a single string.
    pub fn stdout_text(&self) -> String {
        self.stdout.join("\n")
    }
}

/// Runs short-lived helper processes (container CLI calls, interpreter
/// version probes) to completion, capturing their output line by line and
/// supporting graceful cancellation (SIGINT → SIGTERM → SIGKILL).
pub struct ProcessInvoker {
    trace: Arc<dyn TraceWriter>,
}

impl ProcessInvoker {
    pub fn new(trace: Arc<dyn TraceWriter>) -> Self {
        Self { trace }
    }

    /// Execute `file_name` with `arguments` and wait for it to exit.
    ///
    /// When `require_exit_code_zero` is set a non-zero exit is returned as a
    /// [`ProcessExitCodeError`] carrying the captured stderr.
    pub async fn execute(
        &self,
        working_directory: Option<&Path>,
        file_name: &str,
        arguments: &[String],
        environment: Option<&HashMap<String, String>>,
        require_exit_code_zero: bool,
        cancellation_token: CancellationToken,
    ) -> Result<ProcessOutput> {
        anyhow::ensure!(!file_name.is_empty(), "file_name must not be empty");

        let joined = arguments.join(" ");
        self.trace
            .verbose(&format!("Starting process: '{file_name}' '{joined}'"));

        let mut cmd = Command::new(file_name);
        cmd.args(arguments);
        if let Some(dir) = working_directory.filter(|d| d.is_dir()) {
            cmd.current_dir(dir);
        }
        if let Some(env) = environment {
            cmd.envs(env);
        }
        cmd.stdout(std::process::Stdio::piped());
        cmd.stderr(std::process::Stdio::piped());
        cmd.stdin(std::process::Stdio::null());
        cmd.kill_on_drop(true);

        let start = std::time::Instant::now();
        let mut child = cmd.spawn().with_context(|| {
            format!("Failed to start process '{file_name}' with arguments '{joined}'")
        })?;
        let pid = child.id().unwrap_or(0);

        let stdout_task = collect_lines(child.stdout.take());
        let stderr_task = collect_lines(child.stderr.take());

        let exit_code: i32;
        let was_cancelled;

        tokio::select! {
            status = child.wait() => {
                was_cancelled = false;
                exit_code = status.context("Failed to wait for process")?.code().unwrap_or(-1);
            }
            _ = cancellation_token.cancelled() => {
                was_cancelled = true;
                self.trace.info("Cancellation requested.");
                exit_code = self.cancel_and_kill_process(&mut child).await;
            }
        }

        let stdout = stdout_task.await.unwrap_or_default();
        let stderr = stderr_task.await.unwrap_or_default();

        self.trace.verbose(&format!(
            "Finished process {pid} with exit code {exit_code}, and elapsed time {:.2?}.",
            start.elapsed()
        ));

        if was_cancelled {
            anyhow::bail!("Process '{file_name}' was cancelled");
        }

        if exit_code != 0 && require_exit_code_zero {
            return Err(ProcessExitCodeError {
                exit_code,
                file_name: file_name.to_string(),
                arguments: joined,
                stderr: stderr.join("\n"),
            }
            .into());
        }

        Ok(ProcessOutput {
            exit_code,
            stdout,
            stderr,
        })
    }

    async fn cancel_and_kill_process(&self, child: &mut Child) -> i32 {
        if send_signal_and_wait(child, Signal::Int, SIGINT_TIMEOUT, self.trace.as_ref()).await {
            self.trace.info("Process cancelled successfully through SIGINT.");
            return exit_code_of(child).await;
        }
        terminate(child, self.trace.as_ref(), SIGTERM_TIMEOUT).await
    }
}

/// Terminate a long-running child: SIGTERM, then SIGKILL once `grace` passes.
///
/// Returns the exit code, or -1 when it cannot be determined. A child that
/// already exited is reaped without signalling.
pub async fn terminate(child: &mut Child, trace: &dyn TraceWriter, grace: Duration) -> i32 {
    if let Ok(Some(status)) = child.try_wait() {
        return status.code().unwrap_or(-1);
    }

    if send_signal_and_wait(child, Signal::Term, grace, trace).await {
        trace.verbose("Process terminated through SIGTERM.");
        return exit_code_of(child).await;
    }

    trace.info("Process ignored termination signals, killing it.");
    let _ = child.kill().await;
    exit_code_of(child).await
}

/// Forward every line read from `reader` to `trace` until EOF.
pub fn forward_lines<R>(reader: R, trace: Arc<dyn TraceWriter>, is_error: bool) -> JoinHandle<()>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut lines = BufReader::new(reader).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            if is_error {
                trace.warning(&line);
            } else {
                trace.info(&line);
            }
        }
    })
}

fn collect_lines<R>(reader: Option<R>) -> JoinHandle<Vec<String>>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut collected = Vec::new();
        if let Some(reader) = reader {
            let mut lines = BufReader::new(reader).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                collected.push(line);
            }
        }
        collected
    })
}

async fn exit_code_of(child: &mut Child) -> i32 {
    child
        .wait()
        .await
        .map(|s| s.code().unwrap_or(-1))
        .unwrap_or(-1)
}

#[derive(Debug, Clone, Copy)]
enum Signal {
    Int,
    Term,
}

/// Send a signal to the child and wait up to `timeout` for it to exit.
/// Returns `true` if the process exited within the timeout.
#[cfg(unix)]
async fn send_signal_and_wait(
    child: &mut Child,
    signal: Signal,
    timeout: Duration,
    trace: &dyn TraceWriter,
) -> bool {
    let pid = match child.id() {
        Some(id) => id,
        None => return true,
    };

    let sig = match signal {
        Signal::Int => nix::sys::signal::Signal::SIGINT,
        Signal::Term => nix::sys::signal::Signal::SIGTERM,
    };

    trace.verbose(&format!("Sending {sig:?} to process {pid}."));
    if nix::sys::signal::kill(nix::unistd::Pid::from_raw(pid as i32), sig).is_err() {
        trace.info(&format!("{sig:?} signal failed to send to process {pid}."));
        return false;
    }

    tokio::select! {
        result = child.wait() => result.is_ok(),
        _ = tokio::time::sleep(timeout) => {
            trace.info(&format!(
                "Process {pid} did not honor {sig:?} within {:.1}s.",
                timeout.as_secs_f64()
            ));
            false
        }
    }
}

#[cfg(not(unix))]
async fn send_signal_and_wait(
    child: &mut Child,
    _signal: Signal,
    timeout: Duration,
    _trace: &dyn TraceWriter,
) -> bool {
    tokio::select! {
        result = child.wait() => result.is_ok(),
        _ = tokio::time::sleep(timeout) => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::trace::{CollectingTraceWriter, NullTraceWriter};

    fn make_invoker() -> ProcessInvoker {
        ProcessInvoker::new(Arc::new(NullTraceWriter))
    }

    fn args(items: &[&str]) -> Vec<String> {
        items.iter().map(|s| s.to_string()).collect()
    }

    #[tokio::test]
    async fn execute_captures_stdout() {
        let output = make_invoker()
            .execute(None, "echo", &args(&["hello"]), None, true, CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(output.exit_code, 0);
        assert_eq!(output.stdout_text(), "hello");
    }

    #[tokio::test]
    async fn execute_nonexistent() {
        let result = make_invoker()
            .execute(None, "nonexistent_command_xyz_123", &[], None, false, CancellationToken::new())
            .await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn execute_require_exit_code_zero() {
        let result = make_invoker()
            .execute(None, "false", &[], None, true, CancellationToken::new())
            .await;
        let err = result.unwrap_err();
        assert!(err.downcast_ref::<ProcessExitCodeError>().is_some());
        assert!(format!("{err}").contains("Exit code"));
    }

    #[tokio::test]
    async fn execute_nonzero_allowed() {
        let output = make_invoker()
            .execute(None, "false", &[], None, false, CancellationToken::new())
            .await
            .unwrap();
        assert_ne!(output.exit_code, 0);
    }

    #[tokio::test]
    async fn execute_with_env() {
        let mut env = HashMap::new();
        env.insert("MY_TEST_VAR".to_string(), "test_value_123".to_string());
        let output = make_invoker()
            .execute(
                None,
                "sh",
                &args(&["-c", "echo $MY_TEST_VAR"]),
                Some(&env),
                true,
                CancellationToken::new(),
            )
            .await
            .unwrap();
        assert_eq!(output.stdout, vec!["test_value_123".to_string()]);
    }

    #[tokio::test]
    async fn execute_cancelled() {
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(100)).await;
            trigger.cancel();
        });
        let result = make_invoker()
            .execute(None, "sleep", &args(&["30"]), None, false, cancel)
            .await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn terminate_stops_long_running_child() {
        let mut child = Command::new("sleep")
            .arg("30")
            .kill_on_drop(true)
            .spawn()
            .unwrap();
        let trace = CollectingTraceWriter::new();
        terminate(&mut child, &trace, Duration::from_secs(2)).await;
        assert!(child.try_wait().unwrap().is_some());
    }

    #[tokio::test]
    async fn forward_lines_reaches_trace() {
        let trace = Arc::new(CollectingTraceWriter::new());
        let data: &[u8] = b"first\nsecond\n";
        forward_lines(data, trace.clone(), false).await.unwrap();
        assert!(trace.contains("first"));
        assert!(trace.contains("second"));
    }
}
