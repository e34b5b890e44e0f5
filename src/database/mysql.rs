//! MySQL via the `mysqldump` and `mysql` client tools.
//!
//! The password is passed in `MYSQL_PWD` so it never shows up in the process
//! table.

use super::{DumpProcess, DumpReader, DumpStream, Dumper, Restorer, StatementReader};
use crate::dump::DumpIdentifier;
use crate::error::DatabaseError;
use crate::retry::RetryPolicy;
use async_trait::async_trait;
use std::process::Stdio;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;

/// Where and as whom to reach one database.
#[derive(Debug, Clone)]
pub struct MysqlConnection {
    pub host: String,
    pub port: u16,
    pub user: String,
    pub password: String,
    pub database: String,
}

impl MysqlConnection {
    fn command(&self, program: &str) -> Command {
        let mut cmd = Command::new(program);
        cmd.arg(format!("--host={}", self.host));
        cmd.arg(format!("--port={}", self.port));
        cmd.arg(format!("--user={}", self.user));
        if !self.password.is_empty() {
            cmd.env("MYSQL_PWD", &self.password);
        }
        cmd.kill_on_drop(true);
        cmd
    }
}

pub struct MysqlDumper {
    connection: MysqlConnection,
    program: String,
}

impl MysqlDumper {
    pub fn new(connection: MysqlConnection) -> Self {
        Self {
            connection,
            program: "mysqldump".to_string(),
        }
    }

    /// Use a different dump binary.
    pub fn with_program(mut self, program: impl Into<String>) -> Self {
        self.program = program.into();
        self
    }
}

#[async_trait]
impl Dumper for MysqlDumper {
    fn database(&self) -> &str {
        &self.connection.database
    }

    async fn dump(&self) -> Result<DumpStream, DatabaseError> {
        let mut cmd = self.connection.command(&self.program);
        cmd.arg("--single-transaction");
        cmd.arg("--skip-lock-tables");
        cmd.arg("--routines");
        cmd.arg("--triggers");
        cmd.arg(&self.connection.database);

        cmd.stdin(Stdio::null());
        cmd.stdout(Stdio::piped());
        cmd.stderr(Stdio::piped());

        let mut child = cmd.spawn().map_err(|source| DatabaseError::Spawn {
            program: self.program.clone(),
            source,
        })?;
        let stdout = child.stdout.take().ok_or_else(|| {
            DatabaseError::Io(std::io::Error::new(
                std::io::ErrorKind::BrokenPipe,
                "failed to open stdout",
            ))
        })?;

        let identifier = DumpIdentifier::now(self.connection.database.as_str());
        tracing::debug!("Started {} for {}", self.program, identifier);

        Ok(DumpStream {
            identifier,
            reader: Box::new(stdout),
            process: Some(DumpProcess::new(self.program.clone(), child)),
        })
    }
}

pub struct MysqlRestorer {
    connection: MysqlConnection,
    program: String,
    retry: RetryPolicy,
}

impl MysqlRestorer {
    pub fn new(connection: MysqlConnection) -> Self {
        Self {
            connection,
            program: "mysql".to_string(),
            retry: RetryPolicy::database(),
        }
    }

    /// Use a different client binary.
    pub fn with_program(mut self, program: impl Into<String>) -> Self {
        self.program = program.into();
        self
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    fn client(&self) -> Command {
        let mut cmd = self.connection.command(&self.program);
        cmd.arg("--batch");
        cmd.arg(&self.connection.database);
        cmd
    }

    async fn ping(&self) -> Result<(), DatabaseError> {
        let mut cmd = self.client();
        cmd.arg("--execute=SELECT 1");
        cmd.stdin(Stdio::null());

        let output = cmd.output().await.map_err(|source| DatabaseError::Spawn {
            program: self.program.clone(),
            source,
        })?;
        if !output.status.success() {
            return Err(DatabaseError::Exited {
                program: self.program.clone(),
                status: output.status.code().unwrap_or(-1),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }
        Ok(())
    }
}

#[async_trait]
impl Restorer for MysqlRestorer {
    fn database(&self) -> &str {
        &self.connection.database
    }

    async fn ready(&self) -> Result<(), DatabaseError> {
        let mut last = String::new();
        for attempt in 1..=self.retry.attempts {
            match self.ping().await {
                Ok(()) => return Ok(()),
                Err(e) => {
                    tracing::warn!(
                        "[{}/{}] database {} not reachable: {}",
                        attempt,
                        self.retry.attempts,
                        self.connection.database,
                        e
                    );
                    last = e.to_string();
                }
            }
            if attempt < self.retry.attempts {
                tokio::time::sleep(self.retry.backoff).await;
            }
        }

        Err(DatabaseError::Unreachable {
            attempts: self.retry.attempts,
            reason: last,
        })
    }

    async fn restore(&self, dump: DumpReader) -> Result<(), DatabaseError> {
        let mut cmd = self.client();
        cmd.stdin(Stdio::piped());
        cmd.stdout(Stdio::null());
        cmd.stderr(Stdio::piped());

        let mut child = cmd.spawn().map_err(|source| DatabaseError::Spawn {
            program: self.program.clone(),
            source,
        })?;
        let mut stdin = child.stdin.take().ok_or_else(|| {
            DatabaseError::Io(std::io::Error::new(
                std::io::ErrorKind::BrokenPipe,
                "failed to open stdin",
            ))
        })?;

        // stderr is drained on its own task while stdin is fed.
        let process = DumpProcess::new(self.program.clone(), child);

        let mut statements = StatementReader::new(dump);
        let fed: std::io::Result<()> = async {
            while let Some(statement) = statements.next_statement().await? {
                stdin.write_all(&statement).await?;
                stdin.write_all(b"\n").await?;
            }
            stdin.shutdown().await
        }
        .await;
        drop(stdin);

        // The client exits on the first failing statement, which shows up here
        // as a broken pipe. Its exit status and stderr are the better error.
        process.wait().await?;
        fed?;

        tracing::debug!(
            "Applied {} statements to {}",
            statements.statements(),
            self.connection.database
        );
        Ok(())
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use std::os::unix::fs::PermissionsExt;
    use std::path::Path;
    use std::time::Duration;
    use tempfile::TempDir;
    use tokio::io::AsyncReadExt;

    fn script(dir: &Path, name: &str, body: &str) -> String {
        let path = dir.join(name);
        std::fs::write(&path, format!("#!/bin/sh\n{body}\n")).unwrap();
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
        path.to_string_lossy().into_owned()
    }

    fn connection() -> MysqlConnection {
        MysqlConnection {
            host: "127.0.0.1".to_string(),
            port: 3306,
            user: "tto".to_string(),
            password: "secret".to_string(),
            database: "orders".to_string(),
        }
    }

    #[tokio::test]
    async fn test_dump_streams_stdout_and_passes_password_by_env() {
        let tmp = TempDir::new().unwrap();
        let program = script(
            tmp.path(),
            "mysqldump",
            r#"echo "-- args: $*"; echo "-- pwd: $MYSQL_PWD"; echo "SELECT 1;""#,
        );
        let dumper = MysqlDumper::new(connection()).with_program(program);

        let mut stream = dumper.dump().await.unwrap();
        assert_eq!(stream.identifier.database(), "orders");

        let mut out = String::new();
        stream.reader.read_to_string(&mut out).await.unwrap();
        stream.process.take().unwrap().wait().await.unwrap();

        let args = out.lines().next().unwrap();
        assert!(args.contains("--host=127.0.0.1 --port=3306 --user=tto"));
        assert!(args.ends_with("--single-transaction --skip-lock-tables --routines --triggers orders"));
        assert!(!args.contains("secret"));
        assert!(out.contains("-- pwd: secret"));
    }

    #[tokio::test]
    async fn test_restore_feeds_statements_without_filler() {
        let tmp = TempDir::new().unwrap();
        let sink = tmp.path().join("applied.sql");
        let program = script(
            tmp.path(),
            "mysql",
            &format!("cat > '{}'", sink.display()),
        );
        let restorer = MysqlRestorer::new(connection()).with_program(program);

        let dump = b"CREATE TABLE t (id INT);\nINSERT INTO t VALUES (1);\n\n-- zzzz\n\0".to_vec();
        restorer
            .restore(Box::new(std::io::Cursor::new(dump)))
            .await
            .unwrap();

        assert_eq!(
            std::fs::read_to_string(&sink).unwrap(),
            "CREATE TABLE t (id INT);\nINSERT INTO t VALUES (1);\n"
        );
    }

    #[tokio::test]
    async fn test_restore_surfaces_client_failure() {
        let tmp = TempDir::new().unwrap();
        let program = script(
            tmp.path(),
            "mysql",
            "cat > /dev/null; echo 'ERROR 1064 (42000)' >&2; exit 1",
        );
        let restorer = MysqlRestorer::new(connection()).with_program(program);

        let err = restorer
            .restore(Box::new(std::io::Cursor::new(b"BROKEN;\n".to_vec())))
            .await
            .unwrap_err();
        match err {
            DatabaseError::Exited { status, stderr, .. } => {
                assert_eq!(status, 1);
                assert!(stderr.contains("1064"));
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_restore_with_noisy_client_completes() {
        let tmp = TempDir::new().unwrap();
        let sink = tmp.path().join("applied.sql");
        // Fills the stderr pipe before reading any input.
        let program = script(
            tmp.path(),
            "mysql",
            &format!(
                "head -c 262144 /dev/zero | tr '\\0' w >&2; cat > '{}'",
                sink.display()
            ),
        );
        let restorer = MysqlRestorer::new(connection()).with_program(program);

        let mut dump = Vec::new();
        for i in 0..10_000 {
            dump.extend_from_slice(format!("INSERT INTO t VALUES ({i});\n").as_bytes());
        }
        tokio::time::timeout(
            Duration::from_secs(10),
            restorer.restore(Box::new(std::io::Cursor::new(dump))),
        )
        .await
        .expect("restore stalled on a full stderr pipe")
        .unwrap();

        let applied = std::fs::read_to_string(&sink).unwrap();
        assert_eq!(applied.lines().count(), 10_000);
    }

    #[tokio::test]
    async fn test_ready_gives_up_after_retries() {
        let tmp = TempDir::new().unwrap();
        let counter = tmp.path().join("pings");
        let program = script(
            tmp.path(),
            "mysql",
            &format!("echo ping >> '{}'; exit 1", counter.display()),
        );
        let restorer = MysqlRestorer::new(connection())
            .with_program(program)
            .with_retry(RetryPolicy::new(3, Duration::from_millis(5)));

        let err = restorer.ready().await.unwrap_err();
        assert!(matches!(err, DatabaseError::Unreachable { attempts: 3, .. }));
        assert_eq!(std::fs::read_to_string(&counter).unwrap().lines().count(), 3);
    }

    #[tokio::test]
    async fn test_ready_succeeds() {
        let tmp = TempDir::new().unwrap();
        let program = script(tmp.path(), "mysql", "exit 0");
        let restorer = MysqlRestorer::new(connection()).with_program(program);
        restorer.ready().await.unwrap();
    }
}
