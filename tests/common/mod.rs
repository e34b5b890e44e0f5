//! Test doubles shared by the integration tests.

#![allow(dead_code)]

use async_trait::async_trait;
use chrono::{Duration as ChronoDuration, TimeZone, Utc};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tto::database::{DumpReader, DumpStream, Dumper, Restorer, StatementReader};
use tto::error::{DatabaseError, TransportError};
use tto::streaming::protocol::parse_file_header;
use tto::transport::{CommandRunner, LocalRunner, RemoteSession, StreamingExec};
use tto::DumpIdentifier;

/// Identifier of `database` at 2024-01-01 plus `hours`.
pub fn dump_at(database: &str, hours: i64) -> DumpIdentifier {
    let base = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
    DumpIdentifier::new(database, base + ChronoDuration::hours(hours))
}

/// Stands in for an SSH session to a host whose filesystem is local.
///
/// Shell commands run through `sh -c`. A streaming `scp -qt <dir>` is
/// emulated: the control line is parsed and everything after it is written
/// to `<dir>/<name>`, like the real sink does until the declared size is
/// reached. The sink then exits 1 because the stream ended early.
pub struct ScpSinkSession {
    local: LocalRunner,
    pub up: AtomicBool,
    /// The copy command cannot be started.
    pub fail_push: AtomicBool,
    /// The copy command starts but never reads its input.
    pub stall_push: AtomicBool,
    pub connects: AtomicU32,
    pub probes: AtomicU32,
    pub pushes: Mutex<Vec<String>>,
}

impl ScpSinkSession {
    pub fn new() -> Self {
        Self {
            local: LocalRunner::new(),
            up: AtomicBool::new(true),
            fail_push: AtomicBool::new(false),
            stall_push: AtomicBool::new(false),
            connects: AtomicU32::new(0),
            probes: AtomicU32::new(0),
            pushes: Mutex::new(Vec::new()),
        }
    }

    pub fn set_up(&self, up: bool) {
        self.up.store(up, Ordering::SeqCst);
    }

    fn check(&self) -> Result<(), TransportError> {
        if self.up.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(TransportError::Connect {
                addr: "sink:22".to_string(),
                source: std::io::Error::new(std::io::ErrorKind::ConnectionRefused, "refused"),
            })
        }
    }
}

#[async_trait]
impl CommandRunner for ScpSinkSession {
    async fn run(&self, command: &str) -> Result<String, TransportError> {
        self.check()?;
        self.local.run(command).await
    }
}

#[async_trait]
impl RemoteSession for ScpSinkSession {
    async fn connect(&self) -> Result<(), TransportError> {
        self.connects.fetch_add(1, Ordering::SeqCst);
        self.check()
    }

    async fn probe(&self) -> Result<(), TransportError> {
        self.probes.fetch_add(1, Ordering::SeqCst);
        self.check()
    }

    async fn exec_streaming(&self, command: &str) -> Result<StreamingExec, TransportError> {
        self.check()?;
        if self.fail_push.load(Ordering::SeqCst) {
            return Err(TransportError::CommandFailed {
                command: command.to_string(),
                status: 1,
                stderr: "scp: /nonexistent: No such file or directory".to_string(),
            });
        }
        let dir = command
            .strip_prefix("scp -qt ")
            .map(|quoted| quoted.trim_matches('\'').to_string())
            .ok_or_else(|| TransportError::CommandFailed {
                command: command.to_string(),
                status: 127,
                stderr: "unexpected streaming command".to_string(),
            })?;
        self.pushes.lock().unwrap().push(dir.clone());

        let (writer, reader) = tokio::io::duplex(64 * 1024);
        if self.stall_push.load(Ordering::SeqCst) {
            let exit = tokio::spawn(async move {
                let _held = reader;
                std::future::pending::<()>().await;
                Ok(1)
            });
            return Ok(StreamingExec {
                stdin: Box::new(writer),
                exit,
            });
        }
        let exit = tokio::spawn(async move {
            let mut reader = BufReader::new(reader);
            let mut header = String::new();
            reader.read_line(&mut header).await?;
            let Some((_, _, name)) = parse_file_header(&header) else {
                return Ok(1);
            };

            let mut file = tokio::fs::File::create(Path::new(&dir).join(name)).await?;
            tokio::io::copy(&mut reader, &mut file).await?;
            file.flush().await?;
            Ok(1)
        });

        Ok(StreamingExec {
            stdin: Box::new(writer),
            exit,
        })
    }

    fn endpoint(&self) -> String {
        "sink:22".to_string()
    }
}

/// Dumper producing fixed payloads with increasing timestamps.
pub struct FakeDumper {
    database: String,
    payload: Vec<u8>,
    next_hour: AtomicUsize,
    pub fail: AtomicBool,
}

impl FakeDumper {
    pub fn new(database: &str, payload: &[u8], first_hour: usize) -> Self {
        Self {
            database: database.to_string(),
            payload: payload.to_vec(),
            next_hour: AtomicUsize::new(first_hour),
            fail: AtomicBool::new(false),
        }
    }

    /// Make the next dump carry the timestamp of `hour`.
    pub fn set_hour(&self, hour: usize) {
        self.next_hour.store(hour, Ordering::SeqCst);
    }
}

#[async_trait]
impl Dumper for FakeDumper {
    fn database(&self) -> &str {
        &self.database
    }

    async fn dump(&self) -> Result<DumpStream, DatabaseError> {
        if self.fail.load(Ordering::SeqCst) {
            return Err(DatabaseError::Exited {
                program: "mysqldump".to_string(),
                status: 2,
                stderr: "Access denied".to_string(),
            });
        }
        let hour = self.next_hour.fetch_add(1, Ordering::SeqCst);
        Ok(DumpStream {
            identifier: dump_at(&self.database, hour as i64),
            reader: Box::new(std::io::Cursor::new(self.payload.clone())),
            process: None,
        })
    }
}

/// Restorer that records the statements it was given. Accepts dumps of
/// `orders` unless built with [`RecordingRestorer::for_database`].
#[derive(Default)]
pub struct RecordingRestorer {
    pub database: Option<String>,
    pub calls: AtomicUsize,
    pub statements: Mutex<Vec<String>>,
    /// When set, each restore waits for one permit.
    pub gate: Option<Arc<tokio::sync::Semaphore>>,
    pub started: tokio::sync::Notify,
}

impl RecordingRestorer {
    pub fn gated(gate: Arc<tokio::sync::Semaphore>) -> Self {
        Self {
            gate: Some(gate),
            ..Self::default()
        }
    }

    pub fn for_database(database: &str) -> Self {
        Self {
            database: Some(database.to_string()),
            ..Self::default()
        }
    }
}

#[async_trait]
impl Restorer for RecordingRestorer {
    fn database(&self) -> &str {
        self.database.as_deref().unwrap_or("orders")
    }

    async fn restore(&self, dump: DumpReader) -> Result<(), DatabaseError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.started.notify_one();
        if let Some(gate) = &self.gate {
            gate.acquire().await.expect("gate closed").forget();
        }

        let mut reader = StatementReader::new(dump);
        while let Some(statement) = reader.next_statement().await? {
            self.statements
                .lock()
                .unwrap()
                .push(String::from_utf8_lossy(&statement).into_owned());
        }
        Ok(())
    }
}

pub fn read(path: impl AsRef<Path>) -> String {
    std::fs::read_to_string(path).unwrap_or_default()
}

pub fn dir_string(path: &Path) -> String {
    path.to_string_lossy().into_owned()
}

pub fn write_marker(dir: &Path, marker: &str, token: &str) {
    std::fs::write(dir.join(marker), format!("{token}\n")).unwrap();
}

pub fn touch(dir: &Path, name: &str) -> PathBuf {
    let path = dir.join(name);
    std::fs::write(&path, b"").unwrap();
    path
}

pub async fn read_all(mut reader: impl tokio::io::AsyncRead + Unpin) -> Vec<u8> {
    let mut buf = Vec::new();
    reader.read_to_end(&mut buf).await.unwrap();
    buf
}
