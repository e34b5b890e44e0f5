//! Local shell runner - `sh -c <command>` via tokio::process.
//!
//! Used by the receiver for its own working directory and hooks, and by tests
//! as a stand-in for the remote shell.

use super::{CommandRunner, RemoteSession, StreamingExec};
use crate::error::TransportError;
use async_trait::async_trait;
use std::path::PathBuf;
use std::process::Stdio;
use tokio::process::Command;

#[derive(Debug, Clone)]
pub struct LocalRunner {
    shell: PathBuf,
}

impl Default for LocalRunner {
    fn default() -> Self {
        Self::new()
    }
}

impl LocalRunner {
    pub fn new() -> Self {
        Self {
            shell: PathBuf::from("sh"),
        }
    }

    fn command(&self, command: &str) -> Command {
        let mut cmd = Command::new(&self.shell);
        cmd.arg("-c").arg(command);
        cmd.kill_on_drop(true);
        cmd
    }
}

#[async_trait]
impl CommandRunner for LocalRunner {
    async fn run(&self, command: &str) -> Result<String, TransportError> {
        let output = self
            .command(command)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .output()
            .await?;

        if !output.status.success() {
            return Err(TransportError::CommandFailed {
                command: command.to_string(),
                status: output.status.code().unwrap_or(-1),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }

        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }
}

#[async_trait]
impl RemoteSession for LocalRunner {
    async fn connect(&self) -> Result<(), TransportError> {
        Ok(())
    }

    async fn probe(&self) -> Result<(), TransportError> {
        Ok(())
    }

    async fn exec_streaming(&self, command: &str) -> Result<StreamingExec, TransportError> {
        let mut child = self
            .command(command)
            .stdin(Stdio::piped())
            .stdout(Stdio::null())
            .stderr(Stdio::inherit())
            .spawn()?;

        let stdin = child.stdin.take().ok_or_else(|| {
            TransportError::Io(std::io::Error::new(
                std::io::ErrorKind::BrokenPipe,
                "failed to open stdin",
            ))
        })?;

        let exit = tokio::spawn(async move {
            let status = child.wait().await?;
            Ok(status.code().unwrap_or(-1))
        });

        Ok(StreamingExec {
            stdin: Box::new(stdin),
            exit,
        })
    }

    fn endpoint(&self) -> String {
        "localhost".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncWriteExt;

    #[tokio::test]
    async fn test_run_captures_stdout() {
        let out = LocalRunner::new().run("echo hello").await.unwrap();
        assert_eq!(out.trim(), "hello");
    }

    #[tokio::test]
    async fn test_run_failure_carries_status() {
        let err = LocalRunner::new()
            .run("echo oops >&2; exit 3")
            .await
            .unwrap_err();
        match err {
            TransportError::CommandFailed { status, stderr, .. } => {
                assert_eq!(status, 3);
                assert_eq!(stderr, "oops");
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_exec_streaming_feeds_stdin() {
        let dir = tempfile::tempdir().unwrap();
        let target = dir.path().join("out.txt");
        let runner = LocalRunner::new();

        let exec = runner
            .exec_streaming(&format!("cat > {}", super::super::shell_quote(&target.to_string_lossy())))
            .await
            .unwrap();
        let mut stdin = exec.stdin;
        stdin.write_all(b"streamed bytes").await.unwrap();
        stdin.shutdown().await.unwrap();
        drop(stdin);

        let status = exec.exit.await.unwrap().unwrap();
        assert_eq!(status, 0);
        assert_eq!(std::fs::read_to_string(&target).unwrap(), "streamed bytes");
    }
}
