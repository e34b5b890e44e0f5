//! Dump identifiers and remote listing helpers.
//!
//! A dump is named `<database>-<yyyyMMddHHmmss>.sql`, timestamp in UTC. The
//! name is the only metadata that survives on disk, so everything the sender
//! knows about existing dumps after a restart is parsed back out of it.

use crate::error::IdentifierError;
use chrono::{DateTime, NaiveDateTime, SubsecRound, TimeZone, Utc};
use std::cmp::Ordering;
use std::fmt;
use std::str::FromStr;

/// Separator between database name and timestamp.
pub const SEPARATOR: char = '-';

/// Extension of every dump payload.
pub const EXTENSION: &str = ".sql";

const TIMESTAMP_FORMAT: &str = "%Y%m%d%H%M%S";
const TIMESTAMP_LEN: usize = 14;

/// A single point-in-time export of one database.
///
/// Immutable once created. Two identifiers only compare when they name the
/// same database; `partial_cmp` returns `None` otherwise.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct DumpIdentifier {
    database: String,
    timestamp: DateTime<Utc>,
}

impl DumpIdentifier {
    /// Sub-second precision is dropped so the identifier survives a round
    /// trip through its file name.
    pub fn new(database: impl Into<String>, timestamp: DateTime<Utc>) -> Self {
        Self {
            database: database.into(),
            timestamp: timestamp.trunc_subsecs(0),
        }
    }

    pub fn now(database: impl Into<String>) -> Self {
        Self::new(database, Utc::now())
    }

    pub fn database(&self) -> &str {
        &self.database
    }

    pub fn timestamp(&self) -> DateTime<Utc> {
        self.timestamp
    }

    /// File name of the dump payload in the working directory.
    pub fn file_name(&self) -> String {
        self.to_string()
    }
}

impl fmt::Display for DumpIdentifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}{}{}{}",
            self.database,
            SEPARATOR,
            self.timestamp.format(TIMESTAMP_FORMAT),
            EXTENSION
        )
    }
}

impl FromStr for DumpIdentifier {
    type Err = IdentifierError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let stem = s
            .strip_suffix(EXTENSION)
            .ok_or_else(|| IdentifierError::MissingExtension(s.to_string()))?;

        // The timestamp never contains the separator, so split on the last one
        // and database names may contain dashes.
        let (database, timestamp) = stem
            .rsplit_once(SEPARATOR)
            .ok_or_else(|| IdentifierError::MissingSeparator(s.to_string()))?;

        if database.is_empty() {
            return Err(IdentifierError::EmptyDatabase(s.to_string()));
        }

        let invalid = || IdentifierError::Timestamp {
            name: s.to_string(),
            timestamp: timestamp.to_string(),
        };
        if timestamp.len() != TIMESTAMP_LEN || !timestamp.bytes().all(|b| b.is_ascii_digit()) {
            return Err(invalid());
        }
        let naive = NaiveDateTime::parse_from_str(timestamp, TIMESTAMP_FORMAT).map_err(|_| invalid())?;

        Ok(Self {
            database: database.to_string(),
            timestamp: Utc.from_utc_datetime(&naive),
        })
    }
}

impl PartialOrd for DumpIdentifier {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        if self.database != other.database {
            return None;
        }
        Some(self.timestamp.cmp(&other.timestamp))
    }
}

/// Parse a multi-line remote listing (one path per line) into the dumps of
/// `database`, oldest first.
///
/// Paths are stripped to their file name. Lines that are not dump names, or
/// belong to another database whose name shares our prefix, are skipped.
pub fn parse_listing(listing: &str, database: &str) -> Vec<DumpIdentifier> {
    let mut dumps: Vec<DumpIdentifier> = listing
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .filter_map(|line| {
            let name = line.rsplit('/').next().unwrap_or(line);
            match name.parse::<DumpIdentifier>() {
                Ok(id) if id.database() == database => Some(id),
                Ok(id) => {
                    tracing::debug!("Skipping dump {} of database {}", name, id.database());
                    None
                }
                Err(e) => {
                    tracing::warn!("Skipping unrecognised file in working directory: {}", e);
                    None
                }
            }
        })
        .collect();

    sort_oldest_first(&mut dumps);
    dumps.dedup();
    dumps
}

/// Sort identifiers of one database by timestamp, oldest first.
pub fn sort_oldest_first(dumps: &mut [DumpIdentifier]) {
    dumps.sort_by_key(|id| id.timestamp());
}
