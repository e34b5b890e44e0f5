//! Push a byte stream of unknown length into a remote directory.
//!
//! Two tasks run side by side:
//!
//! ```text
//! +-----------------+   stdin    +--------------------+
//! |   writer task   | ---------> |  scp -qt <dir>     |
//! | header, payload |            |  (remote session)  |
//! | filler, NUL     |            +--------------------+
//! +-----------------+                      |
//!                                     exit status
//! ```
//!
//! Both are joined under one deadline. Because the declared size is never
//! reached, the sink does not exit cleanly on its own; a non-zero exit after
//! the writer finished is expected and only logged.

use crate::error::PushError;
use crate::streaming::protocol::{
    file_header, filler_block, DECLARED_SIZE, FILLER_LEN, TERMINATOR,
};
use crate::transport::{shell_quote, RemoteSession, StreamingExec};
use bytes::Bytes;
use std::time::{Duration, Instant};
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};

/// Default bound on one transfer.
pub const DEFAULT_PUSH_TIMEOUT: Duration = Duration::from_secs(1000);

/// Streaming push configuration
#[derive(Debug, Clone)]
pub struct PushConfig {
    /// Remote copy program, invoked as `<program> -qt <dir>`
    pub copy_program: String,
    /// Size announced in the control line
    pub declared_size: u64,
    /// Length of the trailing filler block
    pub filler_len: usize,
    /// Deadline for writer and remote command together
    pub timeout: Duration,
}

impl Default for PushConfig {
    fn default() -> Self {
        Self {
            copy_program: "scp".to_string(),
            declared_size: DECLARED_SIZE,
            filler_len: FILLER_LEN,
            timeout: DEFAULT_PUSH_TIMEOUT,
        }
    }
}

/// Outcome of one push.
#[derive(Debug, Clone, Default)]
pub struct PushStats {
    /// Bytes of the real payload
    pub payload_bytes: u64,
    /// Everything written to the sink, control line and filler included
    pub wire_bytes: u64,
    /// Exit status of the remote copy command, if it reported one
    pub remote_status: Option<i32>,
    pub duration: Duration,
}

pub struct StreamingPush {
    config: PushConfig,
}

impl StreamingPush {
    pub fn new(config: PushConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &PushConfig {
        &self.config
    }

    /// Stream `payload` into `dir/filename` on the far side of `session`.
    pub async fn push<S, R>(
        &self,
        session: &S,
        payload: R,
        dir: &str,
        filename: &str,
        mode: u32,
    ) -> Result<PushStats, PushError>
    where
        S: RemoteSession + ?Sized,
        R: AsyncRead + Send + Unpin + 'static,
    {
        let started = Instant::now();
        let command = format!("{} -qt {}", self.config.copy_program, shell_quote(dir));
        let StreamingExec { stdin, exit } = session.exec_streaming(&command).await?;

        let header = file_header(mode, self.config.declared_size, filename);
        let filler = filler_block(self.config.filler_len);
        let overhead = (header.len() + filler.len() + 1) as u64;

        let mut writer = tokio::spawn(write_stream(stdin, header, payload, filler));
        let mut exit = exit;

        let joined = tokio::time::timeout(self.config.timeout, async {
            tokio::join!(&mut writer, &mut exit)
        })
        .await;

        let (written, status) = match joined {
            Ok(pair) => pair,
            Err(_) => {
                writer.abort();
                exit.abort();
                return Err(PushError::Timeout {
                    filename: filename.to_string(),
                    timeout: self.config.timeout,
                });
            }
        };

        let payload_bytes = written
            .map_err(|e| PushError::Transport(e.into()))?
            .map_err(|source| PushError::Io {
                filename: filename.to_string(),
                source,
            })?;

        let remote_status = match status {
            Ok(Ok(code)) => {
                if code != 0 {
                    tracing::debug!(
                        "Remote copy of {} exited with status {} after forced close",
                        filename,
                        code
                    );
                }
                Some(code)
            }
            Ok(Err(e)) => {
                tracing::debug!("Remote copy of {} ended abnormally: {}", filename, e);
                None
            }
            Err(e) => {
                tracing::warn!("Remote copy task for {} failed: {}", filename, e);
                None
            }
        };

        let stats = PushStats {
            payload_bytes,
            wire_bytes: payload_bytes + overhead,
            remote_status,
            duration: started.elapsed(),
        };
        tracing::debug!(
            "Pushed {} ({} bytes payload, {} on the wire) in {:?}",
            filename,
            stats.payload_bytes,
            stats.wire_bytes,
            stats.duration
        );

        Ok(stats)
    }
}

async fn write_stream<W, R>(
    mut stdin: W,
    header: String,
    mut payload: R,
    filler: Bytes,
) -> std::io::Result<u64>
where
    W: AsyncWrite + Unpin,
    R: AsyncRead + Unpin,
{
    stdin.write_all(header.as_bytes()).await?;
    let payload_bytes = tokio::io::copy(&mut payload, &mut stdin).await?;
    stdin.write_all(&filler).await?;
    stdin.write_all(&[TERMINATOR]).await?;
    stdin.flush().await?;
    stdin.shutdown().await?;
    Ok(payload_bytes)
}
