//! Error types for tto.
//!
//! Each subsystem returns its own error enum. [`Error`] aggregates them for the
//! two event loops and the binary, and [`Error::kind`] tells a loop whether to
//! retry, skip the current cycle, or stop.

use std::fmt;
use std::io;
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

/// How a loop should react to a failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Misconfiguration. Fatal, no retry.
    Config,
    /// Network or process hiccup. Retried or skipped until the next trigger.
    Transient,
    /// A lock file was held for the whole poll window.
    Contention,
    /// A protocol invariant was violated. The operation is aborted untouched.
    Invariant,
    /// A multi-step sequence stopped halfway. Needs an operator.
    Partial,
}

/// Malformed dump identifier token.
#[derive(Debug, Error)]
pub enum IdentifierError {
    #[error("dump name {0:?} does not end in `.sql`")]
    MissingExtension(String),

    #[error("dump name {0:?} has no `-` between database name and timestamp")]
    MissingSeparator(String),

    #[error("dump name {0:?} has an empty database name")]
    EmptyDatabase(String),

    #[error("dump name {name:?} has an invalid timestamp {timestamp:?}")]
    Timestamp { name: String, timestamp: String },
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("failed to parse config file {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },

    #[error("unsupported database kind {0:?} (supported: mysql)")]
    UnsupportedDatabase(String),

    #[error("role {role} needs a [{section}] section")]
    MissingSection {
        role: &'static str,
        section: &'static str,
    },

    #[error("invalid {field}: {reason}")]
    Invalid { field: &'static str, reason: String },

    #[error("invalid cron expression {expr:?}: {reason}")]
    Schedule { expr: String, reason: String },
}

/// Failures talking to the shell on either side of the link.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("failed to connect to {addr}: {source}")]
    Connect {
        addr: String,
        #[source]
        source: io::Error,
    },

    #[cfg(feature = "ssh")]
    #[error("ssh: {0}")]
    Ssh(#[from] ssh2::Error),

    #[error("authentication as {user} rejected by {addr}")]
    Auth { user: String, addr: String },

    #[error("no session with remote, connect first")]
    NotConnected,

    #[error("{addr} did not answer within {timeout:?}")]
    Timeout { addr: String, timeout: Duration },

    #[error("command `{command}` exited with status {status}: {stderr}")]
    CommandFailed {
        command: String,
        status: i32,
        stderr: String,
    },

    #[error("reconnection with remote failed after {attempts} attempts")]
    ReconnectExhausted { attempts: u32 },

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("background task failed: {0}")]
    Join(#[from] tokio::task::JoinError),
}

/// Failures of the declared-size streaming transfer.
#[derive(Debug, Error)]
pub enum PushError {
    #[error("transfer of {filename} did not finish within {timeout:?}")]
    Timeout { filename: String, timeout: Duration },

    #[error("failed to stream {filename} into remote copy: {source}")]
    Io {
        filename: String,
        #[source]
        source: io::Error,
    },

    #[error(transparent)]
    Transport(#[from] TransportError),
}

/// Steps of the publish sequence, in order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PublishStep {
    LockDump,
    Transfer,
    UnlockDump,
    LockMarker,
    WriteMarker,
    UnlockMarker,
}

impl fmt::Display for PublishStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            PublishStep::LockDump => "lock dump",
            PublishStep::Transfer => "transfer",
            PublishStep::UnlockDump => "unlock dump",
            PublishStep::LockMarker => "lock marker",
            PublishStep::WriteMarker => "write marker",
            PublishStep::UnlockMarker => "unlock marker",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error(
        "locked: {lock} still present after {attempts} attempts. Another process is using it, \
         or the lock file is stuck; remove it manually if so"
    )]
    Busy { lock: String, attempts: u32 },

    #[error("dump {dump} was taken from database {found:?} but this receiver restores {expected:?}")]
    DatabaseMismatch {
        dump: String,
        found: String,
        expected: String,
    },

    #[error("marker {marker} is empty")]
    EmptyMarker { marker: &'static str },

    #[error(
        "publish of {dump} stopped at step '{step}': {source}. \
         Lock files left behind must be removed manually"
    )]
    Publish {
        dump: String,
        step: PublishStep,
        #[source]
        source: Box<Error>,
    },

    #[error("restore of {dump} failed: {source}")]
    Restore {
        dump: String,
        #[source]
        source: DatabaseError,
    },

    #[error(transparent)]
    Identifier(#[from] IdentifierError),

    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

/// Failures of the dump utility or the restore client.
#[derive(Debug, Error)]
pub enum DatabaseError {
    #[error("failed to start {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: io::Error,
    },

    #[error("{program} exited with status {status}: {stderr}")]
    Exited {
        program: String,
        status: i32,
        stderr: String,
    },

    #[error("database unreachable after {attempts} attempts: {reason}")]
    Unreachable { attempts: u32, reason: String },

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

#[derive(Debug, Error)]
pub enum Error {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Identifier(#[from] IdentifierError),

    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error(transparent)]
    Push(#[from] PushError),

    #[error(transparent)]
    Registry(#[from] RegistryError),

    #[error(transparent)]
    Database(#[from] DatabaseError),

    #[error("file watcher: {0}")]
    Watch(#[from] notify::Error),

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

impl Error {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::Config(_) => ErrorKind::Config,
            Error::Identifier(_) => ErrorKind::Invariant,
            Error::Registry(e) => e.kind(),
            Error::Transport(_)
            | Error::Push(_)
            | Error::Database(_)
            | Error::Watch(_)
            | Error::Io(_) => ErrorKind::Transient,
        }
    }

    /// Fatal errors end the process; everything else only ends the current cycle.
    pub fn is_fatal(&self) -> bool {
        matches!(self.kind(), ErrorKind::Config | ErrorKind::Invariant)
    }
}

impl RegistryError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            RegistryError::Busy { .. } => ErrorKind::Contention,
            RegistryError::DatabaseMismatch { .. } => ErrorKind::Invariant,
            RegistryError::Publish { .. } => ErrorKind::Partial,
            RegistryError::EmptyMarker { .. }
            | RegistryError::Restore { .. }
            | RegistryError::Transport(_)
            | RegistryError::Io(_) => ErrorKind::Transient,
            // A corrupt token in a marker file will not fix itself.
            RegistryError::Identifier(_) => ErrorKind::Invariant,
        }
    }
}
