//! Resource-constrained execution of screened Python code.
//!
//! Each call owns exactly one child process: the code is persisted to a
//! script inside the workspace, wrapped by the isolation provider, spawned
//! with the workspace as working directory, and raced against the profile
//! timeout. Stdout and stderr are captured fully; a non-zero exit with
//! captured stderr is a normal `Completed` outcome that the model is
//! expected to see and react to, not a failure.

use crate::artifacts::Image;
use crate::errors::{AnalystError, Result};
use crate::isolation::{IsolationPolicy, IsolationProvider};
use crate::profile::SecurityProfile;
use crate::workspace::Workspace;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::{Child, Command};
use tracing::{info, warn};

/// Name of the script file persisted into the workspace.
pub const SCRIPT_FILE: &str = "script.py";

/// Discriminated outcome of one execution request.
#[derive(Debug)]
pub enum ExecutionResult {
    /// The validator refused the code before any process was spawned.
    Rejected { reason: String },
    /// The child ran to completion. Non-zero exits land here too, with
    /// stderr carried as data. `images` is filled in by the artifact
    /// collector after execution.
    Completed {
        logs: String,
        stderr: Option<String>,
        images: Vec<Image>,
    },
    /// Spawn failure or timeout. On timeout, stdout captured up to the kill
    /// is preserved in `logs`.
    Failed { error: String, logs: String },
}

/// Spawns, times out, and reaps one isolated child process per call.
pub struct PythonExecutor {
    python_path: PathBuf,
    isolation: Arc<dyn IsolationProvider>,
}

impl PythonExecutor {
    /// Create an executor, locating Python in PATH.
    pub fn new(isolation: Arc<dyn IsolationProvider>) -> Result<Self> {
        let python_path = which::which("python3")
            .or_else(|_| which::which("python"))
            .map_err(|_| AnalystError::PythonNotFound)?;
        Ok(Self {
            python_path,
            isolation,
        })
    }

    /// Create with an explicit interpreter path (for bundled Python).
    pub fn with_python_path(
        python_path: PathBuf,
        isolation: Arc<dyn IsolationProvider>,
    ) -> Result<Self> {
        if !python_path.exists() {
            return Err(AnalystError::PythonNotFound);
        }
        Ok(Self {
            python_path,
            isolation,
        })
    }

    pub fn python_path(&self) -> &PathBuf {
        &self.python_path
    }

    /// Execute `code` inside `ws` under the constraints of `profile`.
    pub async fn execute(
        &self,
        ws: &Workspace,
        code: &str,
        profile: &SecurityProfile,
    ) -> ExecutionResult {
        // Force the interpreter's working directory to the workspace so
        // relative writes (generated charts) land there for collection,
        // regardless of what cwd the wrapper hands down.
        let wrapped_code = format!(
            "import os\nos.chdir('{}')\n{}\n",
            ws.path().display(),
            code
        );

        let script_path = ws.path().join(SCRIPT_FILE);
        if let Err(e) = std::fs::write(&script_path, wrapped_code) {
            return ExecutionResult::Failed {
                error: format!("Failed to execute code: {e}"),
                logs: String::new(),
            };
        }

        let policy = IsolationPolicy::for_workspace(ws.path(), profile);
        let raw_command = format!("{} \"{}\"", self.python_path.display(), script_path.display());
        let sandboxed = match self.isolation.wrap(&policy, &raw_command) {
            Ok(cmd) => cmd,
            Err(e) => {
                return ExecutionResult::Failed {
                    error: format!("Failed to execute code: {e}"),
                    logs: String::new(),
                }
            }
        };

        let mut cmd = Command::new("sh");
        cmd.arg("-c")
            .arg(&sandboxed)
            .current_dir(ws.path())
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .env("PYTHONIOENCODING", "utf-8")
            .kill_on_drop(true);

        // Own process group so the timeout kill reaps grandchildren too.
        #[cfg(unix)]
        unsafe {
            cmd.pre_exec(|| {
                libc::setpgid(0, 0);
                Ok(())
            });
        }

        let mut child = match cmd.spawn() {
            Ok(child) => child,
            Err(e) => {
                return ExecutionResult::Failed {
                    error: format!("Execution error: {e}"),
                    logs: String::new(),
                }
            }
        };

        let stdout_task = child.stdout.take().map(|r| tokio::spawn(drain(r)));
        let stderr_task = child.stderr.take().map(|r| tokio::spawn(drain(r)));

        // Race the child against the profile timer; first to complete wins
        // and the loser is cancelled.
        let timeout = Duration::from_millis(profile.timeout_ms);
        let wait_result = tokio::time::timeout(timeout, child.wait()).await;
        match wait_result {
            Ok(Ok(status)) => {
                let logs = join_capture(stdout_task).await;
                let stderr = join_capture(stderr_task).await;
                info!("execution finished with {status} in workspace {}", ws.id());
                ExecutionResult::Completed {
                    logs,
                    stderr: if stderr.is_empty() { None } else { Some(stderr) },
                    images: Vec::new(),
                }
            }
            Ok(Err(e)) => {
                let logs = join_capture(stdout_task).await;
                ExecutionResult::Failed {
                    error: format!("Execution error: {e}"),
                    logs,
                }
            }
            Err(_elapsed) => {
                warn!(
                    "execution exceeded {}ms in workspace {}, killing child",
                    profile.timeout_ms,
                    ws.id()
                );
                kill_hard(&mut child).await;
                let logs = join_capture(stdout_task).await;
                ExecutionResult::Failed {
                    error: format!(
                        "Execution timed out after {} seconds",
                        profile.timeout_secs()
                    ),
                    logs,
                }
            }
        }
    }
}

/// Read a captured pipe to EOF, tolerating partial output.
async fn drain<R: AsyncRead + Unpin>(mut reader: R) -> String {
    let mut buf = Vec::new();
    let _ = reader.read_to_end(&mut buf).await;
    String::from_utf8_lossy(&buf).into_owned()
}

async fn join_capture(task: Option<tokio::task::JoinHandle<String>>) -> String {
    match task {
        Some(task) => task.await.unwrap_or_default(),
        None => String::new(),
    }
}

/// Non-catchable kill of the child and its process group, then reap.
async fn kill_hard(child: &mut Child) {
    #[cfg(unix)]
    if let Some(pid) = child.id() {
        unsafe {
            libc::kill(-(pid as i32), libc::SIGKILL);
        }
    }
    if let Err(e) = child.kill().await {
        warn!("failed to kill timed-out child: {e}");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Instant;

    /// Test double: ignores the incoming command and substitutes a fixed
    /// shell command, counting wrap calls.
    struct StubIsolation {
        command: String,
        calls: AtomicUsize,
    }

    impl StubIsolation {
        fn new(command: &str) -> Arc<Self> {
            Arc::new(Self {
                command: command.to_string(),
                calls: AtomicUsize::new(0),
            })
        }
    }

    impl IsolationProvider for StubIsolation {
        fn wrap(&self, _policy: &IsolationPolicy, _command: &str) -> Result<String> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(self.command.clone())
        }
    }

    struct FailingIsolation;

    impl IsolationProvider for FailingIsolation {
        fn wrap(&self, _policy: &IsolationPolicy, _command: &str) -> Result<String> {
            Err(AnalystError::Isolation("wrapper unavailable".to_string()))
        }
    }

    fn executor_with(stub: Arc<dyn IsolationProvider>) -> PythonExecutor {
        // The stub discards the interpreter invocation, so any existing
        // path satisfies the constructor.
        PythonExecutor::with_python_path(PathBuf::from("/bin/sh"), stub).unwrap()
    }

    fn workspace() -> (tempfile::TempDir, Workspace) {
        let base = tempfile::tempdir().unwrap();
        let ws = Workspace::create(base.path()).unwrap();
        (base, ws)
    }

    #[tokio::test]
    async fn nonzero_exit_with_stderr_is_completed() {
        let stub = StubIsolation::new("echo out; echo err >&2; exit 3");
        let exec = executor_with(stub.clone());
        let (_base, ws) = workspace();

        let result = exec
            .execute(&ws, "print('hi')", &SecurityProfile::restricted())
            .await;

        match result {
            ExecutionResult::Completed { logs, stderr, images } => {
                assert_eq!(logs, "out\n");
                assert_eq!(stderr.as_deref(), Some("err\n"));
                assert!(images.is_empty());
            }
            other => panic!("expected Completed, got {other:?}"),
        }
        assert_eq!(stub.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn empty_stderr_is_none() {
        let stub = StubIsolation::new("echo only-stdout");
        let exec = executor_with(stub);
        let (_base, ws) = workspace();

        match exec
            .execute(&ws, "print('hi')", &SecurityProfile::restricted())
            .await
        {
            ExecutionResult::Completed { logs, stderr, .. } => {
                assert_eq!(logs, "only-stdout\n");
                assert!(stderr.is_none());
            }
            other => panic!("expected Completed, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn timeout_kills_child_and_preserves_partial_stdout() {
        let stub = StubIsolation::new("echo early; sleep 30");
        let exec = executor_with(stub);
        let (_base, ws) = workspace();
        let profile = SecurityProfile {
            timeout_ms: 300,
            ..SecurityProfile::restricted()
        };

        let started = Instant::now();
        let result = exec.execute(&ws, "print('hi')", &profile).await;
        let elapsed = started.elapsed();

        match result {
            ExecutionResult::Failed { error, logs } => {
                assert_eq!(error, "Execution timed out after 0 seconds");
                assert_eq!(logs, "early\n");
            }
            other => panic!("expected Failed, got {other:?}"),
        }
        // Bounded scheduling slack: well under the 30s the child wanted.
        assert!(elapsed < Duration::from_secs(5), "took {elapsed:?}");
    }

    #[tokio::test]
    async fn wrapper_failure_is_failed_with_no_logs() {
        let exec = executor_with(Arc::new(FailingIsolation));
        let (_base, ws) = workspace();

        match exec
            .execute(&ws, "print('hi')", &SecurityProfile::restricted())
            .await
        {
            ExecutionResult::Failed { error, logs } => {
                assert!(error.contains("wrapper unavailable"));
                assert!(logs.is_empty());
            }
            other => panic!("expected Failed, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn script_is_persisted_with_workspace_chdir_prefix() {
        let stub = StubIsolation::new("true");
        let exec = executor_with(stub);
        let (_base, ws) = workspace();

        exec.execute(&ws, "print('hi')", &SecurityProfile::restricted())
            .await;

        let script = std::fs::read_to_string(ws.path().join(SCRIPT_FILE)).unwrap();
        assert!(script.starts_with("import os\nos.chdir('"));
        assert!(script.contains(&ws.path().display().to_string()));
        assert!(script.contains("print('hi')"));
    }

    #[tokio::test]
    async fn relative_writes_land_in_workspace() {
        // The stub command writes where the spawner's cwd points, proving
        // the working-directory contract the chdir prefix backs up.
        let stub = StubIsolation::new("echo x > produced.txt");
        let exec = executor_with(stub);
        let (_base, ws) = workspace();

        exec.execute(&ws, "print('hi')", &SecurityProfile::restricted())
            .await;

        assert!(ws.path().join("produced.txt").exists());
    }
}
