//! Process runner for the external pipeline validator.
//!
//! Spawns the command with `tokio::process`, drains stdout and stderr
//! concurrently (capped), and enforces the invocation timeout.

use std::{path::Path, process::Stdio};

use async_trait::async_trait;

use pvb_core::{
    errors::Error,
    validator::{CliInvocation, ProcessOutput, ProcessRunner},
    Result,
};

use tokio::{
    io::{AsyncRead, AsyncReadExt},
    process::Command,
    task::JoinHandle,
};

const DEFAULT_MAX_CAPTURE_BYTES: usize = 256 * 1024;
const READ_CHUNK: usize = 8 * 1024;

#[derive(Clone, Debug)]
pub struct TokioProcessRunner {
    max_capture_bytes: usize,
}

impl Default for TokioProcessRunner {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_CAPTURE_BYTES)
    }
}

impl TokioProcessRunner {
    /// `max_capture_bytes` bounds what is kept per stream; the rest is read and dropped.
    pub fn new(max_capture_bytes: usize) -> Self {
        Self { max_capture_bytes }
    }
}

#[async_trait]
impl ProcessRunner for TokioProcessRunner {
    async fn run(&self, inv: &CliInvocation) -> Result<ProcessOutput> {
        let mut cmd = Command::new(&inv.program);
        cmd.args(&inv.args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        for (k, v) in &inv.env {
            cmd.env(k, v);
        }

        let mut child = cmd.spawn().map_err(|e| spawn_error(&inv.program, e))?;

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| Error::External("validator stdout was not captured".to_string()))?;
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| Error::External("validator stderr was not captured".to_string()))?;

        // Drain both pipes in the background to avoid blocking on a full pipe.
        let limit = self.max_capture_bytes;
        let stdout_task = tokio::spawn(capture(stdout, limit, "stdout"));
        let stderr_task = tokio::spawn(capture(stderr, limit, "stderr"));

        let status = match tokio::time::timeout(inv.timeout, child.wait()).await {
            Ok(status) => status?,
            Err(_) => {
                if let Err(e) = child.kill().await {
                    tracing::warn!(error = %e, "failed to kill timed-out validator");
                }
                stdout_task.abort();
                stderr_task.abort();
                return Err(Error::Validator(format!(
                    "validator timed out after {} ms",
                    inv.timeout.as_millis()
                )));
            }
        };

        let stdout = join_capture(stdout_task).await?;
        let stderr = join_capture(stderr_task).await?;

        tracing::debug!(status = %status, "validator exited");

        Ok(ProcessOutput {
            stdout,
            stderr,
            exit_code: status.code(),
        })
    }
}

fn spawn_error(program: &Path, e: std::io::Error) -> Error {
    if e.kind() == std::io::ErrorKind::NotFound {
        return Error::Validator(format!("validator not found: {}", program.display()));
    }
    Error::Validator(format!("failed to start {}: {e}", program.display()))
}

async fn capture<R>(mut reader: R, limit: usize, stream: &'static str) -> std::io::Result<String>
where
    R: AsyncRead + Unpin,
{
    let mut kept: Vec<u8> = Vec::new();
    let mut dropped = 0usize;
    let mut chunk = vec![0u8; READ_CHUNK];

    loop {
        let n = reader.read(&mut chunk).await?;
        if n == 0 {
            break;
        }
        let room = limit.saturating_sub(kept.len());
        let take = n.min(room);
        kept.extend_from_slice(&chunk[..take]);
        dropped += n - take;
    }

    if dropped > 0 {
        tracing::warn!(stream, dropped, "validator output exceeded capture limit");
    }
    Ok(String::from_utf8_lossy(&kept).into_owned())
}

async fn join_capture(task: JoinHandle<std::io::Result<String>>) -> Result<String> {
    let captured = task
        .await
        .map_err(|e| Error::External(format!("validator output reader failed: {e}")))?;
    Ok(captured?)
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use std::{path::PathBuf, time::Duration};

    fn sh(script: &str, timeout: Duration) -> CliInvocation {
        CliInvocation {
            program: PathBuf::from("/bin/sh"),
            args: vec!["-c".to_string(), script.to_string()],
            env: vec![("PVB_TEST".to_string(), "1".to_string())],
            timeout,
        }
    }

    #[tokio::test]
    async fn captures_both_streams_and_exit_code() {
        let runner = TokioProcessRunner::default();
        let out = runner
            .run(&sh(
                "echo 'WARN: w'; echo \"ERROR: e $PVB_TEST\" >&2; exit 3",
                Duration::from_secs(10),
            ))
            .await
            .unwrap();
        assert_eq!(out.stdout, "WARN: w\n");
        assert_eq!(out.stderr, "ERROR: e 1\n");
        assert_eq!(out.exit_code, Some(3));
    }

    #[tokio::test]
    async fn caps_captured_output() {
        let runner = TokioProcessRunner::new(100);
        let out = runner
            .run(&sh("yes | head -n 10000", Duration::from_secs(10)))
            .await
            .unwrap();
        assert_eq!(out.stdout.len(), 100);
        assert_eq!(out.exit_code, Some(0));
    }

    #[tokio::test]
    async fn times_out_and_kills() {
        let runner = TokioProcessRunner::default();
        let err = runner
            .run(&sh("sleep 5", Duration::from_millis(100)))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("timed out"), "{err}");
    }

    #[tokio::test]
    async fn missing_binary_is_an_error() {
        let runner = TokioProcessRunner::default();
        let inv = CliInvocation {
            program: PathBuf::from("/nonexistent/pipeline-validator"),
            args: vec![],
            env: vec![],
            timeout: Duration::from_secs(1),
        };
        let err = runner.run(&inv).await.unwrap_err();
        assert!(err.to_string().contains("not found"), "{err}");
    }
}
