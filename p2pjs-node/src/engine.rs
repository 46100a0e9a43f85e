//! Script execution: run a job's source with an external interpreter.
//!
//! The source is written to a temporary file and run as
//! `<interpreter> <file> <arg>`. The last non-empty stdout line is the result.

use std::future::Future;
use std::path::Path;
use std::pin::Pin;
use std::process::Stdio;
use std::time::Duration;

use p2pjs_core::{Cookie, ExecutionRequest, JobStatus};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::Command;

/// Status and numeric result of one execution.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ExecutionOutcome {
    pub status: JobStatus,
    pub result: f64,
}

impl ExecutionOutcome {
    fn failed(status: JobStatus) -> Self {
        Self {
            status,
            result: 0.0,
        }
    }
}

pub type ExecutionFuture = Pin<Box<dyn Future<Output = ExecutionOutcome> + Send>>;

/// Runs job scripts. The dispatcher calls at most one at a time.
pub trait ScriptEngine: Send + Sync {
    fn execute(&self, req: ExecutionRequest) -> ExecutionFuture;
}

/// Runs scripts in a child process.
#[derive(Debug, Clone)]
pub struct ProcessEngine {
    pub interpreter: String,
    /// Arguments for a syntax-only pass; empty skips it.
    pub syntax_check: Vec<String>,
    pub timeout: Duration,
}

impl ProcessEngine {
    pub fn new(interpreter: impl Into<String>, syntax_check: Vec<String>, timeout: Duration) -> Self {
        Self {
            interpreter: interpreter.into(),
            syntax_check,
            timeout,
        }
    }

    pub async fn run(&self, req: ExecutionRequest) -> ExecutionOutcome {
        let file = match write_source(&req.source).await {
            Ok(f) => f,
            Err(e) => {
                tracing::warn!(cookie = %req.cookie.short(), error = %e, "cannot stage script");
                return ExecutionOutcome::failed(JobStatus::RuntimeError);
            }
        };
        if !self.syntax_ok(req.cookie, file.path()).await {
            return ExecutionOutcome::failed(JobStatus::CompileError);
        }
        self.run_script(req.cookie, file.path(), req.arg).await
    }

    async fn syntax_ok(&self, cookie: Cookie, path: &Path) -> bool {
        if self.syntax_check.is_empty() {
            return true;
        }
        let mut cmd = Command::new(&self.interpreter);
        cmd.args(&self.syntax_check)
            .arg(path)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        match tokio::time::timeout(self.timeout, cmd.output()).await {
            Ok(Ok(out)) if out.status.success() => true,
            Ok(Ok(out)) => {
                let stderr = String::from_utf8_lossy(&out.stderr);
                tracing::info!(cookie = %cookie.short(), stderr = %stderr.trim(), "script failed to compile");
                false
            }
            Ok(Err(e)) => {
                tracing::warn!(cookie = %cookie.short(), interpreter = %self.interpreter, error = %e, "cannot launch interpreter");
                false
            }
            Err(_) => {
                tracing::warn!(cookie = %cookie.short(), "syntax check timed out");
                false
            }
        }
    }

    async fn run_script(&self, cookie: Cookie, path: &Path, arg: f64) -> ExecutionOutcome {
        let mut child = match Command::new(&self.interpreter)
            .arg(path)
            .arg(arg.to_string())
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
        {
            Ok(c) => c,
            Err(e) => {
                tracing::warn!(cookie = %cookie.short(), interpreter = %self.interpreter, error = %e, "cannot launch interpreter");
                return ExecutionOutcome::failed(JobStatus::CompileError);
            }
        };

        let (Some(stdout), Some(stderr)) = (child.stdout.take(), child.stderr.take()) else {
            return ExecutionOutcome::failed(JobStatus::RuntimeError);
        };
        let short = cookie.short();
        let stderr_task = tokio::spawn(async move {
            let mut reader = BufReader::new(stderr).lines();
            while let Ok(Some(line)) = reader.next_line().await {
                tracing::debug!(cookie = %short, "stderr: {line}");
            }
        });

        let read_output = async {
            let mut last: Option<String> = None;
            let mut reader = BufReader::new(stdout).lines();
            while let Ok(Some(line)) = reader.next_line().await {
                if line.trim().is_empty() {
                    continue;
                }
                if let Some(prev) = last.replace(line) {
                    tracing::info!(cookie = %cookie.short(), "script: {prev}");
                }
            }
            let status = child.wait().await;
            (last, status)
        };

        let (last, status) = match tokio::time::timeout(self.timeout, read_output).await {
            Ok(r) => r,
            Err(_) => {
                tracing::warn!(cookie = %cookie.short(), "job timed out, killing");
                stderr_task.abort();
                return ExecutionOutcome::failed(JobStatus::RuntimeError);
            }
        };
        let _ = stderr_task.await;

        match status {
            Ok(s) if s.success() => {}
            Ok(s) => {
                tracing::info!(cookie = %cookie.short(), status = %s, "script exited with failure");
                return ExecutionOutcome::failed(JobStatus::RuntimeError);
            }
            Err(e) => {
                tracing::warn!(cookie = %cookie.short(), error = %e, "cannot wait for script");
                return ExecutionOutcome::failed(JobStatus::RuntimeError);
            }
        }
        match last.as_deref().map(str::trim).map(str::parse::<f64>) {
            Some(Ok(result)) => ExecutionOutcome {
                status: JobStatus::Success,
                result,
            },
            _ => {
                tracing::info!(cookie = %cookie.short(), output = ?last, "script produced no numeric result");
                ExecutionOutcome::failed(JobStatus::RuntimeError)
            }
        }
    }
}

impl ScriptEngine for ProcessEngine {
    fn execute(&self, req: ExecutionRequest) -> ExecutionFuture {
        let engine = self.clone();
        Box::pin(async move { engine.run(req).await })
    }
}

async fn write_source(source: &str) -> std::io::Result<tempfile::NamedTempFile> {
    let file = tempfile::Builder::new()
        .prefix("p2pjs-job-")
        .suffix(".script")
        .tempfile()?;
    let mut f = tokio::fs::File::from_std(file.reopen()?);
    f.write_all(source.as_bytes()).await?;
    f.flush().await?;
    Ok(file)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn engine() -> ProcessEngine {
        ProcessEngine::new("sh", vec!["-n".to_owned()], Duration::from_secs(10))
    }

    fn request(source: &str, arg: f64) -> ExecutionRequest {
        ExecutionRequest {
            cookie: Cookie::from_nonce(1),
            arg,
            source: source.to_owned(),
        }
    }

    #[tokio::test]
    async fn last_line_is_the_result() {
        let out = engine()
            .run(request("echo working\necho \"$1\" | awk '{print $1 * 2}'\n", 21.0))
            .await;
        assert_eq!(
            out,
            ExecutionOutcome {
                status: JobStatus::Success,
                result: 42.0
            }
        );
    }

    #[tokio::test]
    async fn syntax_error_is_compile_error() {
        let out = engine().run(request("if then fi (\n", 0.0)).await;
        assert_eq!(out.status, JobStatus::CompileError);
    }

    #[tokio::test]
    async fn non_zero_exit_is_runtime_error() {
        let out = engine().run(request("echo 3\nexit 2\n", 0.0)).await;
        assert_eq!(out.status, JobStatus::RuntimeError);
    }

    #[tokio::test]
    async fn non_numeric_output_is_runtime_error() {
        let out = engine().run(request("echo hello\n", 0.0)).await;
        assert_eq!(out.status, JobStatus::RuntimeError);
    }

    #[tokio::test]
    async fn missing_interpreter_is_compile_error() {
        let e = ProcessEngine::new("/nonexistent/p2pjs-interp", Vec::new(), Duration::from_secs(5));
        let out = e.run(request("echo 1\n", 0.0)).await;
        assert_eq!(out.status, JobStatus::CompileError);
    }

    #[tokio::test]
    async fn timeout_is_runtime_error() {
        let e = ProcessEngine::new("sh", Vec::new(), Duration::from_millis(200));
        let out = e.run(request("sleep 5\necho 1\n", 0.0)).await;
        assert_eq!(out.status, JobStatus::RuntimeError);
    }

    #[tokio::test]
    async fn trait_object_runs() {
        let e: Box<dyn ScriptEngine> = Box::new(engine());
        let out = e.execute(request("echo 7.5\n", 0.0)).await;
        assert_eq!(out.result, 7.5);
    }
}
