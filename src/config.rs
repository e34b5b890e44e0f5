//! Configuration file.
//!
//! ```toml
//! [system]
//! role = "sender"
//! working_dir = "/opt/tto"
//! user = "tto"
//! ssh_key = "~/.ssh/id_rsa"
//!
//! [sender]
//! dest = "10.0.0.2"
//! db_name = "orders"
//! cron = "0 */30 * * * *"
//! max_backups = 5
//!
//! [receiver]
//! db_name = "orders"
//! exec_before = ["systemctl", "stop", "app"]
//! exec_after = ["systemctl", "start", "app"]
//! ```
//!
//! Only the section for the selected role has to be present.

use crate::database::DatabaseKind;
use crate::error::ConfigError;
use crate::schedule::Schedule;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

pub const DEFAULT_CONFIG_PATH: &str = "/etc/tto/conf.toml";

const DEFAULT_WORKING_DIR: &str = "/opt/tto";
const DEFAULT_SSH_KEY: &str = "~/.ssh/id_rsa";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Sender,
    Receiver,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::Sender => "sender",
            Role::Receiver => "receiver",
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    pub system: SystemSection,
    pub sender: Option<SenderSection>,
    pub receiver: Option<ReceiverSection>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SystemSection {
    pub role: Role,
    #[serde(default = "default_working_dir")]
    pub working_dir: String,
    /// Remote login on the receiver host. Defaults to the current user.
    pub user: Option<String>,
    /// Passphrase of the SSH key.
    pub pass: Option<String>,
    pub ssh_key: Option<PathBuf>,
}

/// Connection details shared by both roles.
#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseSection {
    #[serde(default = "default_database")]
    pub database: String,
    #[serde(default = "default_db_ip")]
    pub db_ip: String,
    #[serde(default = "default_db_port")]
    pub db_port: u16,
    #[serde(default)]
    pub db_user: String,
    #[serde(default)]
    pub db_pass: String,
    #[serde(default)]
    pub db_name: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SenderSection {
    pub dest: String,
    #[serde(default = "default_ssh_port")]
    pub port: u16,
    #[serde(flatten)]
    pub db: DatabaseSection,
    pub cron: String,
    #[serde(default = "default_max_backups")]
    pub max_backups: i64,
    #[serde(default = "default_health_interval_secs")]
    pub health_interval_secs: u64,
    #[serde(default = "default_push_timeout_secs")]
    pub push_timeout_secs: u64,
    /// Bound on any single SSH call, so a silent link is noticed.
    #[serde(default = "default_command_timeout_secs")]
    pub command_timeout_secs: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ReceiverSection {
    #[serde(flatten)]
    pub db: DatabaseSection,
    /// Command run before each restore. A failure skips the restore.
    pub exec_before: Option<Vec<String>>,
    /// Command run after each restore attempt.
    pub exec_after: Option<Vec<String>>,
}

fn default_working_dir() -> String {
    DEFAULT_WORKING_DIR.to_string()
}

fn default_database() -> String {
    "mysql".to_string()
}

fn default_db_ip() -> String {
    "127.0.0.1".to_string()
}

fn default_db_port() -> u16 {
    3306
}

fn default_ssh_port() -> u16 {
    22
}

fn default_max_backups() -> i64 {
    5
}

fn default_health_interval_secs() -> u64 {
    60
}

fn default_push_timeout_secs() -> u64 {
    1000
}

fn default_command_timeout_secs() -> u64 {
    60
}

/// Expand a leading `~` to the home directory.
pub fn expand_tilde(path: &Path) -> PathBuf {
    let path_str = path.to_string_lossy();

    if path_str == "~" {
        dirs::home_dir().unwrap_or_else(|| PathBuf::from("."))
    } else if let Some(rest) = path_str.strip_prefix("~/") {
        if let Some(home) = dirs::home_dir() {
            home.join(rest)
        } else {
            path.to_path_buf()
        }
    } else {
        path.to_path_buf()
    }
}

impl Config {
    /// Read, parse and validate a config file.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let config: Config = toml::from_str(&text).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Run as `role` regardless of what the file says.
    pub fn with_role(mut self, role: Role) -> Result<Self, ConfigError> {
        self.system.role = role;
        self.validate()?;
        Ok(self)
    }

    pub fn role(&self) -> Role {
        self.system.role
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.system.working_dir.trim().is_empty() {
            return Err(ConfigError::Invalid {
                field: "system.working_dir",
                reason: "must not be empty".to_string(),
            });
        }

        match self.system.role {
            Role::Sender => self.sender()?.validate(),
            Role::Receiver => self.receiver()?.validate(),
        }
    }

    pub fn sender(&self) -> Result<&SenderSection, ConfigError> {
        self.sender.as_ref().ok_or(ConfigError::MissingSection {
            role: Role::Sender.as_str(),
            section: "sender",
        })
    }

    pub fn receiver(&self) -> Result<&ReceiverSection, ConfigError> {
        self.receiver.as_ref().ok_or(ConfigError::MissingSection {
            role: Role::Receiver.as_str(),
            section: "receiver",
        })
    }

    /// Working directory on this host.
    pub fn local_working_dir(&self) -> PathBuf {
        expand_tilde(Path::new(&self.system.working_dir))
    }

    /// Working directory as seen by the remote shell. `~/` becomes a path
    /// relative to the login directory.
    pub fn remote_working_dir(&self) -> String {
        let dir = self.system.working_dir.trim();
        match dir {
            "~" => ".".to_string(),
            _ => dir.strip_prefix("~/").unwrap_or(dir).to_string(),
        }
    }

    pub fn ssh_key(&self) -> PathBuf {
        let key = self
            .system
            .ssh_key
            .clone()
            .unwrap_or_else(|| PathBuf::from(DEFAULT_SSH_KEY));
        expand_tilde(&key)
    }
}

impl DatabaseSection {
    pub fn kind(&self) -> Result<DatabaseKind, ConfigError> {
        self.database.parse()
    }

    fn validate(&self) -> Result<(), ConfigError> {
        self.kind()?;
        if self.db_name.trim().is_empty() {
            return Err(ConfigError::Invalid {
                field: "db_name",
                reason: "must not be empty".to_string(),
            });
        }
        Ok(())
    }
}

impl SenderSection {
    fn validate(&self) -> Result<(), ConfigError> {
        if self.dest.trim().is_empty() {
            return Err(ConfigError::Invalid {
                field: "sender.dest",
                reason: "must not be empty".to_string(),
            });
        }
        self.db.validate()?;
        self.schedule()?;
        self.retention()?;

        if self.health_interval_secs == 0 {
            return Err(ConfigError::Invalid {
                field: "sender.health_interval_secs",
                reason: "must be greater than zero".to_string(),
            });
        }
        if self.push_timeout_secs == 0 {
            return Err(ConfigError::Invalid {
                field: "sender.push_timeout_secs",
                reason: "must be greater than zero".to_string(),
            });
        }
        if self.command_timeout_secs == 0 {
            return Err(ConfigError::Invalid {
                field: "sender.command_timeout_secs",
                reason: "must be greater than zero".to_string(),
            });
        }
        Ok(())
    }

    pub fn schedule(&self) -> Result<Schedule, ConfigError> {
        Schedule::parse(&self.cron)
    }

    /// Requested retention. Zero or less is an error; values above
    /// [`crate::retention::MAX_RETENTION`] are clamped by the ring itself.
    pub fn retention(&self) -> Result<usize, ConfigError> {
        if self.max_backups <= 0 {
            return Err(ConfigError::Invalid {
                field: "sender.max_backups",
                reason: format!("must be at least 1, got {}", self.max_backups),
            });
        }
        Ok(usize::try_from(self.max_backups).unwrap_or(usize::MAX))
    }

    pub fn health_interval(&self) -> Duration {
        Duration::from_secs(self.health_interval_secs)
    }

    pub fn push_timeout(&self) -> Duration {
        Duration::from_secs(self.push_timeout_secs)
    }

    pub fn command_timeout(&self) -> Duration {
        Duration::from_secs(self.command_timeout_secs)
    }
}

impl ReceiverSection {
    fn validate(&self) -> Result<(), ConfigError> {
        self.db.validate()?;
        for (field, hook) in [
            ("receiver.exec_before", &self.exec_before),
            ("receiver.exec_after", &self.exec_after),
        ] {
            if let Some(argv) = hook {
                if argv.first().map_or(true, |program| program.trim().is_empty()) {
                    return Err(ConfigError::Invalid {
                        field,
                        reason: "needs at least a program name".to_string(),
                    });
                }
            }
        }
        Ok(())
    }
}
