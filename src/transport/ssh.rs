//! SSH session to the receiver host, built on libssh2.
//!
//! libssh2 is blocking, so every operation runs on the blocking pool. The
//! session itself is shared (`ssh2::Session` is reference counted and
//! internally locked); each command gets its own channel.
//!
//! Every blocking libssh2 call is bounded by `command_timeout`. A link that
//! stops answering without resetting surfaces as [`TransportError::Timeout`]
//! instead of pinning a blocking thread and the caller forever.

use super::{CommandRunner, RemoteSession, StreamingExec};
use crate::error::TransportError;
use async_trait::async_trait;
use ssh2::{ErrorCode, Session};
use std::io::{Read, Write};
use std::net::{TcpStream, ToSocketAddrs};
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::AsyncReadExt;

/// Buffer between the async writer and the blocking channel pump.
const STREAM_BUFFER: usize = 64 * 1024;

/// `LIBSSH2_ERROR_TIMEOUT`: a blocking call hit the session timeout.
const LIBSSH2_ERROR_TIMEOUT: i32 = -9;

/// Keepalive interval in seconds.
const KEEPALIVE_INTERVAL: u32 = 30;

/// Connection parameters for the receiver host.
#[derive(Debug, Clone)]
pub struct SshConfig {
    pub hostname: String,
    pub port: u16,
    pub user: String,
    pub identity_file: PathBuf,
    /// Passphrase of the identity file, if it has one.
    pub passphrase: Option<String>,
    pub connect_timeout: Duration,
    /// Upper bound on any single blocking call on an established session.
    pub command_timeout: Duration,
}

impl SshConfig {
    fn addr(&self) -> String {
        format!("{}:{}", self.hostname, self.port)
    }

    /// Translate a libssh2 or socket timeout into [`TransportError::Timeout`].
    fn deadline(&self, err: TransportError) -> TransportError {
        let timed_out = match &err {
            TransportError::Ssh(e) => e.code() == ErrorCode::Session(LIBSSH2_ERROR_TIMEOUT),
            TransportError::Io(e) => e.kind() == std::io::ErrorKind::TimedOut,
            _ => false,
        };
        if timed_out {
            TransportError::Timeout {
                addr: self.addr(),
                timeout: self.command_timeout,
            }
        } else {
            err
        }
    }
}

/// libssh2 takes milliseconds, and zero means wait forever.
fn timeout_ms(timeout: Duration) -> u32 {
    timeout.as_millis().clamp(1, u32::MAX as u128) as u32
}

pub struct SshSession {
    config: Arc<SshConfig>,
    session: Mutex<Option<Session>>,
}

impl SshSession {
    /// Create an unconnected session; call [`RemoteSession::connect`] before use.
    pub fn new(config: SshConfig) -> Self {
        Self {
            config: Arc::new(config),
            session: Mutex::new(None),
        }
    }

    fn current(&self) -> Result<Session, TransportError> {
        self.session
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
            .ok_or(TransportError::NotConnected)
    }

    fn replace(&self, session: Option<Session>) {
        *self
            .session
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = session;
    }
}

fn open(config: &SshConfig) -> Result<Session, TransportError> {
    let addr = config.addr();
    let connect_err = |source| TransportError::Connect {
        addr: addr.clone(),
        source,
    };

    let sockaddr = addr
        .to_socket_addrs()
        .map_err(connect_err)?
        .next()
        .ok_or_else(|| {
            connect_err(std::io::Error::new(
                std::io::ErrorKind::NotFound,
                "host did not resolve",
            ))
        })?;
    let tcp = TcpStream::connect_timeout(&sockaddr, config.connect_timeout).map_err(connect_err)?;

    let mut session = Session::new()?;
    session.set_tcp_stream(tcp);
    session.set_timeout(timeout_ms(config.command_timeout));
    session.handshake()?;
    session.userauth_pubkey_file(
        &config.user,
        None,
        &config.identity_file,
        config.passphrase.as_deref(),
    )?;
    if !session.authenticated() {
        return Err(TransportError::Auth {
            user: config.user.clone(),
            addr,
        });
    }
    session.set_keepalive(true, KEEPALIVE_INTERVAL);

    Ok(session)
}

fn run_blocking(session: &Session, command: &str) -> Result<String, TransportError> {
    let mut channel = session.channel_session()?;
    channel.exec(command)?;

    let mut stdout = String::new();
    channel.read_to_string(&mut stdout)?;
    let mut stderr = String::new();
    channel.stderr().read_to_string(&mut stderr)?;

    channel.wait_close()?;
    let status = channel.exit_status()?;
    if status != 0 {
        return Err(TransportError::CommandFailed {
            command: command.to_string(),
            status,
            stderr: stderr.trim().to_string(),
        });
    }

    Ok(stdout)
}

#[async_trait]
impl CommandRunner for SshSession {
    async fn run(&self, command: &str) -> Result<String, TransportError> {
        let session = self.current()?;
        let command = command.to_string();
        tokio::task::spawn_blocking(move || run_blocking(&session, &command))
            .await?
            .map_err(|e| self.config.deadline(e))
    }
}

#[async_trait]
impl RemoteSession for SshSession {
    async fn connect(&self) -> Result<(), TransportError> {
        let config = Arc::clone(&self.config);
        let session = tokio::task::spawn_blocking(move || open(&config))
            .await?
            .map_err(|e| self.config.deadline(e))?;
        self.replace(Some(session));
        tracing::debug!("Connected to {}", self.endpoint());
        Ok(())
    }

    async fn probe(&self) -> Result<(), TransportError> {
        let session = self.current()?;
        tokio::task::spawn_blocking(move || -> Result<(), TransportError> {
            session.keepalive_send()?;
            let mut channel = session.channel_session()?;
            channel.close()?;
            channel.wait_close()?;
            Ok(())
        })
        .await?
        .map_err(|e| self.config.deadline(e))
    }

    async fn exec_streaming(&self, command: &str) -> Result<StreamingExec, TransportError> {
        let session = self.current()?;
        let config = Arc::clone(&self.config);
        let command = command.to_string();
        let (writer, mut reader) = tokio::io::duplex(STREAM_BUFFER);

        // Pump the duplex into the channel on the blocking pool until the
        // caller closes (or drops) its end, then wait for the command to
        // exit. A remote that stops reading fails the pending write once the
        // session timeout expires, so the pump always ends.
        let pump = tokio::task::spawn_blocking(move || -> Result<i32, TransportError> {
            let mut channel = session.channel_session()?;
            channel.exec(&command)?;

            let mut buf = vec![0u8; STREAM_BUFFER];
            loop {
                let n = futures::executor::block_on(reader.read(&mut buf))?;
                if n == 0 {
                    break;
                }
                channel.write_all(&buf[..n])?;
            }
            channel.flush()?;
            channel.send_eof()?;

            // Drain acknowledgements so the remote side can finish.
            let mut sink = Vec::new();
            let _ = channel.read_to_end(&mut sink);

            channel.wait_close()?;
            Ok(channel.exit_status()?)
        });
        let exit = tokio::spawn(async move { pump.await?.map_err(|e| config.deadline(e)) });

        Ok(StreamingExec {
            stdin: Box::new(writer),
            exit,
        })
    }

    fn endpoint(&self) -> String {
        format!("{}@{}", self.config.user, self.config.addr())
    }
}
