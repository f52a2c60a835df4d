use super::AdapterError;
use async_trait::async_trait;
use std::process::Stdio;
use std::time::Duration;
use tokio::process::Command;
use tokio_util::sync::CancellationToken;

/// One external process call, fully resolved.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Invocation {
    pub tool: String,
    pub program: String,
    pub args: Vec<String>,
    pub timeout: Duration,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProcessOutput {
    pub stdout: String,
    pub stderr: String,
    pub exit_code: Option<i32>,
}

impl ProcessOutput {
    pub fn success(&self) -> bool {
        self.exit_code == Some(0)
    }
}

/// Runs external processes. The executor only talks to tools through this
/// seam, so tests substitute canned output.
#[async_trait]
pub trait ProcessRunner: Send + Sync {
    async fn run(
        &self,
        cancel: &CancellationToken,
        invocation: &Invocation,
    ) -> Result<ProcessOutput, AdapterError>;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct TokioProcessRunner;

#[async_trait]
impl ProcessRunner for TokioProcessRunner {
    async fn run(
        &self,
        cancel: &CancellationToken,
        invocation: &Invocation,
    ) -> Result<ProcessOutput, AdapterError> {
        let mut cmd = Command::new(&invocation.program);
        cmd.args(&invocation.args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let child = cmd.spawn().map_err(|source| AdapterError::Spawn {
            tool: invocation.tool.clone(),
            program: invocation.program.clone(),
            source,
        })?;

        // Dropping the wait future kills the child (kill_on_drop).
        let output = tokio::select! {
            _ = cancel.cancelled() => {
                return Err(AdapterError::Cancelled { tool: invocation.tool.clone() });
            }
            waited = tokio::time::timeout(invocation.timeout, child.wait_with_output()) => {
                match waited {
                    Err(_) => {
                        return Err(AdapterError::Timeout {
                            tool: invocation.tool.clone(),
                            timeout: invocation.timeout,
                        });
                    }
                    Ok(Err(source)) => {
                        return Err(AdapterError::Io {
                            tool: invocation.tool.clone(),
                            source,
                        });
                    }
                    Ok(Ok(output)) => output,
                }
            }
        };

        Ok(ProcessOutput {
            stdout: String::from_utf8_lossy(&output.stdout).to_string(),
            stderr: String::from_utf8_lossy(&output.stderr).to_string(),
            exit_code: output.status.code(),
        })
    }
}
