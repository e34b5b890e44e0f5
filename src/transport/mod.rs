//! Shell transports.
//!
//! The registry and the streaming push never touch files directly; they issue
//! shell commands through a [`CommandRunner`]. The receiver runs them locally,
//! the sender runs them over an SSH session.
//!
//! ```text
//!   LockedRegistry ──> CommandRunner ──┬──> LocalRunner (sh -c)
//!   StreamingPush  ──> RemoteSession ──┴──> SshSession  (ssh2 channel)
//! ```

pub mod local;
#[cfg(feature = "ssh")]
pub mod ssh;

pub use local::LocalRunner;
#[cfg(feature = "ssh")]
pub use ssh::{SshConfig, SshSession};

use crate::error::TransportError;
use crate::retry::RetryPolicy;
use async_trait::async_trait;
use tokio::io::AsyncWrite;
use tokio::task::JoinHandle;

/// Run one shell command and collect its stdout.
#[async_trait]
pub trait CommandRunner: Send + Sync {
    /// Non-zero exit is an error carrying the status and stderr.
    async fn run(&self, command: &str) -> Result<String, TransportError>;
}

/// A command whose stdin is fed by the caller while it runs.
pub struct StreamingExec {
    /// Closing (or dropping) this signals EOF to the command.
    pub stdin: Box<dyn AsyncWrite + Send + Unpin>,
    /// Resolves to the exit status once the command is gone.
    pub exit: JoinHandle<Result<i32, TransportError>>,
}

/// A long-lived session to the host holding the working directory.
#[async_trait]
pub trait RemoteSession: CommandRunner {
    /// Establish (or replace) the session.
    async fn connect(&self) -> Result<(), TransportError>;

    /// Cheap liveness check on the current session.
    async fn probe(&self) -> Result<(), TransportError>;

    /// Start `command` with a writable stdin.
    async fn exec_streaming(&self, command: &str) -> Result<StreamingExec, TransportError>;

    /// Human readable endpoint for logs.
    fn endpoint(&self) -> String;
}

/// Reconnect with a bounded number of attempts. Returns the attempt that
/// succeeded.
pub async fn reconnect<S>(session: &S, policy: RetryPolicy) -> Result<u32, TransportError>
where
    S: RemoteSession + ?Sized,
{
    for attempt in 1..=policy.attempts {
        tracing::warn!(
            "[{}/{}] attempting to re-connect with {}",
            attempt,
            policy.attempts,
            session.endpoint()
        );
        match session.connect().await {
            Ok(()) => {
                tracing::info!("Re-established connection with {}", session.endpoint());
                return Ok(attempt);
            }
            Err(e) => tracing::error!("Failed to re-establish connection: {}", e),
        }
        if attempt < policy.attempts {
            tokio::time::sleep(policy.backoff).await;
        }
    }

    Err(TransportError::ReconnectExhausted {
        attempts: policy.attempts,
    })
}

/// Quote `s` for a POSIX shell.
pub fn shell_quote(s: &str) -> String {
    format!("'{}'", s.replace('\'', r"'\''"))
}

/// Quote and join an argv into one shell command line.
pub fn shell_join<S: AsRef<str>>(argv: &[S]) -> String {
    argv.iter()
        .map(|arg| shell_quote(arg.as_ref()))
        .collect::<Vec<_>>()
        .join(" ")
}
