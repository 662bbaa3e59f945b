// ========================================================================================
//
//                      Deadline-bound external tool invocation
//
// ========================================================================================
//
// Every plink call goes through `ToolRunner::run`. The child is spawned on the shared
// Tokio runtime with `kill_on_drop`, so losing the race against the deadline or the
// cancel token terminates the process instead of leaking it.

use crate::shared::files::get_shared_runtime;
use itertools::Itertools;
use log::{debug, warn};
use std::ffi::{OsStr, OsString};
use std::io;
use std::pin::pin;
use std::process::Stdio;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::process::Command;
use tokio::sync::Notify;

#[derive(Error, Debug)]
pub enum ToolError {
    #[error("Failed to launch '{tool}': {source}")]
    Spawn {
        tool: String,
        #[source]
        source: io::Error,
    },
    #[error("'{tool}' exited with {status}. Captured stderr:\n{stderr}")]
    Execution {
        tool: String,
        status: String,
        stderr: String,
    },
    #[error("'{tool}' did not finish within {timeout:?} and was killed")]
    Timeout { tool: String, timeout: Duration },
    #[error("'{tool}' was cancelled before it finished")]
    Cancelled { tool: String },
    #[error("Failed to start the tool runtime: {0}")]
    Runtime(#[source] io::Error),
}

/// A cooperative cancellation flag shared between the caller and running tools.
#[derive(Debug, Clone, Default)]
pub struct CancelToken {
    inner: Arc<CancelInner>,
}

#[derive(Debug, Default)]
struct CancelInner {
    cancelled: AtomicBool,
    notify: Notify,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.inner.cancelled.store(true, Ordering::SeqCst);
        self.inner.notify.notify_waiters();
    }

    pub fn is_cancelled(&self) -> bool {
        self.inner.cancelled.load(Ordering::SeqCst)
    }

    /// Resolves once `cancel` has been called.
    pub async fn cancelled(&self) {
        loop {
            // The waiter must be registered before the flag is checked, otherwise a
            // `cancel` landing between the two is never observed.
            let mut notified = pin!(self.inner.notify.notified());
            notified.as_mut().enable();
            if self.is_cancelled() {
                return;
            }
            notified.await;
        }
    }
}

/// A program and its argument list.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ToolInvocation {
    program: String,
    args: Vec<OsString>,
}

impl ToolInvocation {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
        }
    }

    pub fn arg(mut self, arg: impl AsRef<OsStr>) -> Self {
        self.args.push(arg.as_ref().to_os_string());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<OsStr>,
    {
        self.args
            .extend(args.into_iter().map(|a| a.as_ref().to_os_string()));
        self
    }

    pub fn program(&self) -> &str {
        &self.program
    }

    pub fn arguments(&self) -> &[OsString] {
        &self.args
    }

    /// The command line as a single printable string, for logs.
    pub fn describe(&self) -> String {
        std::iter::once(self.program.clone())
            .chain(self.args.iter().map(|a| a.to_string_lossy().into_owned()))
            .join(" ")
    }
}

#[derive(Debug, Clone)]
pub struct ToolOutput {
    pub stdout: String,
    pub stderr: String,
    pub elapsed: Duration,
}

#[derive(Debug, Clone)]
pub struct ToolRunner {
    timeout: Duration,
}

impl ToolRunner {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Runs `invocation` to completion, blocking the calling thread.
    ///
    /// A non-zero exit becomes `ToolError::Execution` with the captured stderr attached.
    /// Must not be called from inside an async context.
    pub fn run(
        &self,
        invocation: &ToolInvocation,
        cancel: &CancelToken,
    ) -> Result<ToolOutput, ToolError> {
        let tool = invocation.program().to_string();
        if cancel.is_cancelled() {
            return Err(ToolError::Cancelled { tool });
        }

        let runtime = get_shared_runtime().map_err(ToolError::Runtime)?;
        debug!("Running: {}", invocation.describe());
        let started = Instant::now();

        let output = runtime.block_on(async {
            let child = Command::new(invocation.program())
                .args(invocation.arguments())
                .stdin(Stdio::null())
                .stdout(Stdio::piped())
                .stderr(Stdio::piped())
                .kill_on_drop(true)
                .spawn()
                .map_err(|source| ToolError::Spawn {
                    tool: tool.clone(),
                    source,
                })?;

            tokio::select! {
                result = child.wait_with_output() => result.map_err(|source| ToolError::Spawn {
                    tool: tool.clone(),
                    source,
                }),
                _ = tokio::time::sleep(self.timeout) => Err(ToolError::Timeout {
                    tool: tool.clone(),
                    timeout: self.timeout,
                }),
                _ = cancel.cancelled() => Err(ToolError::Cancelled { tool: tool.clone() }),
            }
        })?;

        let stdout = String::from_utf8_lossy(&output.stdout).into_owned();
        let stderr = String::from_utf8_lossy(&output.stderr).into_owned();
        let elapsed = started.elapsed();

        if !stderr.trim().is_empty() {
            debug!("{tool} stderr:\n{}", stderr.trim_end());
        }

        if !output.status.success() {
            warn!("{tool} failed after {elapsed:.2?} with {}", output.status);
            return Err(ToolError::Execution {
                tool,
                status: output.status.to_string(),
                stderr,
            });
        }

        debug!("{tool} finished in {elapsed:.2?}");
        Ok(ToolOutput {
            stdout,
            stderr,
            elapsed,
        })
    }
}
