//! Termination signals.

use std::fmt;

/// Why a loop stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Termination {
    /// SIGINT, usually an operator at a terminal.
    Interrupted,
    /// SIGTERM, usually the service manager.
    Killed,
}

impl Termination {
    /// Conventional shell exit status, 128 + signal number.
    pub fn exit_code(self) -> i32 {
        match self {
            Termination::Interrupted => 130,
            Termination::Killed => 143,
        }
    }
}

impl fmt::Display for Termination {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Termination::Interrupted => f.write_str("interrupted by operator"),
            Termination::Killed => f.write_str("terminated by supervisor"),
        }
    }
}

/// Resolve on the first SIGINT or SIGTERM.
#[cfg(unix)]
pub async fn wait_for_termination() -> std::io::Result<Termination> {
    use tokio::signal::unix::{signal, SignalKind};

    let mut interrupt = signal(SignalKind::interrupt())?;
    let mut terminate = signal(SignalKind::terminate())?;
    tokio::select! {
        _ = interrupt.recv() => Ok(Termination::Interrupted),
        _ = terminate.recv() => Ok(Termination::Killed),
    }
}

#[cfg(not(unix))]
pub async fn wait_for_termination() -> std::io::Result<Termination> {
    tokio::signal::ctrl_c().await?;
    Ok(Termination::Interrupted)
}

/// Like [`wait_for_termination`], for loops that cannot handle an error.
/// If the handlers cannot be installed this never resolves.
pub async fn termination() -> Termination {
    match wait_for_termination().await {
        Ok(term) => term,
        Err(e) => {
            tracing::error!("Failed to install signal handlers: {}", e);
            std::future::pending().await
        }
    }
}
