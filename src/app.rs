//! Build the collaborators for the configured role and run its loop.

use crate::config::{Config, DatabaseSection, Role};
use crate::database::{DatabaseKind, MysqlConnection, MysqlRestorer, Restorer};
use crate::error::Result;
use crate::receiver::{ReceiverConfig, ReceiverLoop};
use crate::registry::{LockedRegistry, LATEST_DUMP};
use crate::signal::{termination, Termination};
use crate::transport::LocalRunner;
use crate::watch::FileWatcher;
use chrono::Utc;
use std::fmt::Write as _;
use std::sync::Arc;

fn mysql_connection(db: &DatabaseSection) -> MysqlConnection {
    MysqlConnection {
        host: db.db_ip.clone(),
        port: db.db_port,
        user: db.db_user.clone(),
        password: db.db_pass.clone(),
        database: db.db_name.clone(),
    }
}

fn restorer(db: &DatabaseSection) -> Result<Arc<dyn Restorer>> {
    match db.kind()? {
        DatabaseKind::Mysql => Ok(Arc::new(MysqlRestorer::new(mysql_connection(db)))),
    }
}

/// Run the configured role until a termination signal or a fatal error.
pub async fn run(config: &Config) -> Result<Termination> {
    match config.role() {
        Role::Sender => run_sender(config).await,
        Role::Receiver => run_receiver(config).await,
    }
}

#[cfg(feature = "ssh")]
async fn run_sender(config: &Config) -> Result<Termination> {
    use crate::database::{Dumper, MysqlDumper};
    use crate::sender::{SenderConfig, SenderLoop};
    use crate::transport::{SshConfig, SshSession};
    use std::time::Duration;

    let section = config.sender()?;
    let session = Arc::new(SshSession::new(SshConfig {
        hostname: section.dest.clone(),
        port: section.port,
        user: config
            .system
            .user
            .clone()
            .unwrap_or_else(whoami::username),
        identity_file: config.ssh_key(),
        passphrase: config.system.pass.clone(),
        connect_timeout: Duration::from_secs(10),
        command_timeout: section.command_timeout(),
    }));
    let dumper: Arc<dyn Dumper> = match section.db.kind()? {
        DatabaseKind::Mysql => Arc::new(MysqlDumper::new(mysql_connection(&section.db))),
    };

    let mut sender_config = SenderConfig::new(config.remote_working_dir(), section.retention()?);
    sender_config.health_interval = section.health_interval();
    sender_config.push.timeout = section.push_timeout();

    let sender = SenderLoop::startup(session, dumper, sender_config).await?;
    let (mut ticks, schedule) = section.schedule()?.spawn();
    let result = sender.run(&mut ticks, termination()).await;
    schedule.abort();
    result
}

#[cfg(not(feature = "ssh"))]
async fn run_sender(_config: &Config) -> Result<Termination> {
    Err(crate::error::ConfigError::Invalid {
        field: "system.role",
        reason: "the sender needs a build with the `ssh` feature".to_string(),
    }
    .into())
}

async fn run_receiver(config: &Config) -> Result<Termination> {
    let section = config.receiver()?;
    let dir = config.local_working_dir();

    let registry = LockedRegistry::new(Arc::new(LocalRunner::new()), dir.to_string_lossy());
    let receiver = ReceiverLoop::new(
        registry,
        restorer(&section.db)?,
        ReceiverConfig {
            exec_before: section.exec_before.clone(),
            exec_after: section.exec_after.clone(),
        },
    );
    receiver.startup().await?;

    let (_watcher, mut events) = FileWatcher::spawn(&dir, LATEST_DUMP)?;
    receiver.run(&mut events, termination()).await
}

/// Human readable summary of a validated configuration.
pub fn summary(config: &Config) -> Result<String> {
    let mut out = String::new();
    let _ = writeln!(out, "role:        {}", config.role().as_str());

    match config.role() {
        Role::Sender => {
            let section = config.sender()?;
            let schedule = section.schedule()?;
            let _ = writeln!(out, "working dir: {}:{}", section.dest, config.remote_working_dir());
            let _ = writeln!(out, "remote:      {}:{}", section.dest, section.port);
            let _ = writeln!(
                out,
                "database:    {} {} at {}:{}",
                section.db.database, section.db.db_name, section.db.db_ip, section.db.db_port
            );
            let _ = writeln!(out, "schedule:    {}", schedule.expr());
            if let Some(next) = schedule.next_after(Utc::now()) {
                let _ = writeln!(out, "next dump:   {}", next.format("%Y-%m-%d %H:%M:%S UTC"));
            }
            let _ = writeln!(out, "retention:   {}", section.retention()?.min(crate::retention::MAX_RETENTION));
        }
        Role::Receiver => {
            let section = config.receiver()?;
            let _ = writeln!(out, "working dir: {}", config.local_working_dir().display());
            let _ = writeln!(
                out,
                "database:    {} {} at {}:{}",
                section.db.database, section.db.db_name, section.db.db_ip, section.db.db_port
            );
            if let Some(argv) = &section.exec_before {
                let _ = writeln!(out, "exec before: {}", argv.join(" "));
            }
            if let Some(argv) = &section.exec_after {
                let _ = writeln!(out, "exec after:  {}", argv.join(" "));
            }
        }
    }

    Ok(out)
}
