//! Database collaborators: producing dumps on the sender, applying them on
//! the receiver.
//!
//! Both sides shell out to the vendor's client tools rather than speaking the
//! wire protocol, so the only thing crossing this seam is a byte stream.

pub mod mysql;
pub mod statements;

pub use mysql::{MysqlConnection, MysqlDumper, MysqlRestorer};
pub use statements::StatementReader;

use crate::dump::DumpIdentifier;
use crate::error::{ConfigError, DatabaseError};
use async_trait::async_trait;
use std::fmt;
use std::str::FromStr;
use tokio::io::{AsyncBufRead, AsyncRead, AsyncReadExt};
use tokio::process::Child;
use tokio::task::JoinHandle;

/// Buffered byte stream of one dump, as handed to a [`Restorer`].
pub type DumpReader = Box<dyn AsyncBufRead + Send + Unpin>;

/// Supported database engines.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DatabaseKind {
    Mysql,
}

impl FromStr for DatabaseKind {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "mysql" => Ok(DatabaseKind::Mysql),
            _ => Err(ConfigError::UnsupportedDatabase(s.to_string())),
        }
    }
}

impl fmt::Display for DatabaseKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DatabaseKind::Mysql => f.write_str("mysql"),
        }
    }
}

/// A dump in progress: its identifier, its stdout, and the process producing it.
pub struct DumpStream {
    pub identifier: DumpIdentifier,
    pub reader: Box<dyn AsyncRead + Send + Unpin>,
    /// `None` for dumps that do not come from a child process.
    pub process: Option<DumpProcess>,
}

/// Handle on a running database utility, either the dumper or the client
/// a restore is fed into.
pub struct DumpProcess {
    program: String,
    child: Child,
    stderr: Option<JoinHandle<String>>,
}

impl DumpProcess {
    /// Take ownership of `child`, draining its stderr in the background so a
    /// chatty utility never blocks on a full pipe.
    pub fn new(program: impl Into<String>, mut child: Child) -> Self {
        let stderr = child.stderr.take().map(|mut pipe| {
            tokio::spawn(async move {
                let mut buf = String::new();
                let _ = pipe.read_to_string(&mut buf).await;
                buf
            })
        });
        Self {
            program: program.into(),
            child,
            stderr,
        }
    }

    /// Wait for the utility to exit. For a dump, a non-zero status means the
    /// stream that was already consumed is incomplete.
    pub async fn wait(mut self) -> Result<(), DatabaseError> {
        let status = self.child.wait().await?;
        let stderr = match self.stderr.take() {
            Some(handle) => handle.await.unwrap_or_default(),
            None => String::new(),
        };

        if !status.success() {
            return Err(DatabaseError::Exited {
                program: self.program,
                status: status.code().unwrap_or(-1),
                stderr: stderr.trim().to_string(),
            });
        }
        if !stderr.trim().is_empty() {
            tracing::debug!("{}: {}", self.program, stderr.trim());
        }
        Ok(())
    }
}

/// Produces point-in-time dumps of one database.
#[async_trait]
pub trait Dumper: Send + Sync {
    /// Database the dumps are taken from and named after.
    fn database(&self) -> &str;

    /// Start a dump. The returned reader yields the payload as it is produced.
    async fn dump(&self) -> Result<DumpStream, DatabaseError>;
}

/// Applies a dump to one database.
#[async_trait]
pub trait Restorer: Send + Sync {
    /// The only database whose dumps this restorer accepts.
    fn database(&self) -> &str;

    /// Check the database can be reached before the first restore.
    async fn ready(&self) -> Result<(), DatabaseError> {
        Ok(())
    }

    async fn restore(&self, dump: DumpReader) -> Result<(), DatabaseError>;
}
