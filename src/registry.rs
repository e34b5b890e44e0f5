//! Lock-file handshake over the shared working directory.
//!
//! The sender publishes dumps into the directory over its remote session, the
//! receiver consumes them locally. There is no native file locking across
//! that boundary, so both sides agree on a presence convention:
//!
//! ```text
//! <dir>/
//!   latest-dump            newest published token   (sender writes)
//!   latest-restore         newest applied token     (receiver writes)
//!   ~latest-dump.lock      held while latest-dump is read or written
//!   ~<db>-<ts>.sql.lock    held while a payload is being transferred
//!   <db>-<ts>.sql          payloads
//! ```
//!
//! Every file operation is a shell command issued through a [`CommandRunner`],
//! so the same registry runs on either side of the link. Neither sequence is
//! transactional. A failed publish leaves its lock files behind; they are
//! reported on startup and must be removed by an operator.

use crate::database::{DumpReader, Restorer};
use crate::dump::{parse_listing, DumpIdentifier, EXTENSION, SEPARATOR};
use crate::error::{PublishStep, RegistryError, TransportError};
use crate::retry::RetryPolicy;
use crate::transport::{shell_quote, CommandRunner};
use std::future::Future;
use std::path::Path;
use std::sync::Arc;
use tokio::io::BufReader;

/// Marker holding the most recently published dump.
pub const LATEST_DUMP: &str = "latest-dump";

/// Marker holding the most recently restored dump.
pub const LATEST_RESTORE: &str = "latest-restore";

const LOCK_PREFIX: &str = "~";
const LOCK_SUFFIX: &str = ".lock";

/// Lock file name guarding `resource`.
pub fn lock_name(resource: &str) -> String {
    format!("{LOCK_PREFIX}{resource}{LOCK_SUFFIX}")
}

/// Result of one consume attempt that did not fail.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConsumeOutcome {
    /// The dump was applied and `latest-restore` now names it.
    Restored(DumpIdentifier),
    /// `latest-dump` already equals `latest-restore`.
    NothingToRestore(DumpIdentifier),
}

pub struct LockedRegistry<R: CommandRunner + ?Sized> {
    runner: Arc<R>,
    dir: String,
    lock_policy: RetryPolicy,
}

impl<R: CommandRunner + ?Sized> Clone for LockedRegistry<R> {
    fn clone(&self) -> Self {
        Self {
            runner: Arc::clone(&self.runner),
            dir: self.dir.clone(),
            lock_policy: self.lock_policy,
        }
    }
}

impl<R: CommandRunner + ?Sized> LockedRegistry<R> {
    pub fn new(runner: Arc<R>, dir: impl Into<String>) -> Self {
        Self {
            runner,
            dir: dir.into(),
            lock_policy: RetryPolicy::lock_poll(),
        }
    }

    /// Override how long a consumer waits for `~latest-dump.lock` to clear.
    pub fn with_lock_policy(mut self, policy: RetryPolicy) -> Self {
        self.lock_policy = policy;
        self
    }

    pub fn dir(&self) -> &str {
        &self.dir
    }

    pub fn runner(&self) -> &Arc<R> {
        &self.runner
    }

    fn path(&self, name: &str) -> String {
        format!("{}/{}", self.dir.trim_end_matches('/'), name)
    }

    fn quoted(&self, name: &str) -> String {
        shell_quote(&self.path(name))
    }

    async fn lock(&self, resource: &str) -> Result<(), TransportError> {
        let lock = lock_name(resource);
        self.runner.run(&format!("touch {}", self.quoted(&lock))).await?;
        tracing::trace!("Acquired {}", lock);
        Ok(())
    }

    async fn unlock(&self, resource: &str) -> Result<(), TransportError> {
        let lock = lock_name(resource);
        self.runner.run(&format!("rm -f {}", self.quoted(&lock))).await?;
        tracing::trace!("Released {}", lock);
        Ok(())
    }

    /// Whether the lock file for `resource` currently exists.
    pub async fn is_locked(&self, resource: &str) -> Result<bool, TransportError> {
        let out = self
            .runner
            .run(&format!(
                "if [ -e {} ]; then echo locked; fi",
                self.quoted(&lock_name(resource))
            ))
            .await?;
        Ok(out.trim() == "locked")
    }

    /// Read the first line of a marker. A missing or empty marker is `None`.
    async fn read_marker(&self, marker: &str) -> Result<Option<DumpIdentifier>, RegistryError> {
        let path = self.quoted(marker);
        let out = self
            .runner
            .run(&format!("if [ -f {path} ]; then head -n 1 {path}; fi"))
            .await?;
        let token = out.trim();
        if token.is_empty() {
            return Ok(None);
        }
        Ok(Some(token.parse()?))
    }

    async fn write_marker(&self, marker: &str, id: &DumpIdentifier) -> Result<(), TransportError> {
        self.runner
            .run(&format!(
                "printf '%s\\n' {} > {}",
                shell_quote(&id.to_string()),
                self.quoted(marker)
            ))
            .await?;
        Ok(())
    }

    /// Create the working directory and both markers if missing, tighten
    /// permissions, and return any lock files already present.
    pub async fn ensure_layout(&self) -> Result<Vec<String>, RegistryError> {
        let dir = shell_quote(&self.dir);
        let dump = self.quoted(LATEST_DUMP);
        let restore = self.quoted(LATEST_RESTORE);
        self.runner
            .run(&format!(
                "mkdir -p {dir} && chmod 700 {dir} && touch {dump} {restore} && chmod 600 {dump} {restore}"
            ))
            .await?;

        let stale = self.stale_locks().await?;
        for lock in &stale {
            tracing::warn!(
                "Lock file {} present in {}. If no other process is using it, remove it manually",
                lock,
                self.dir
            );
        }
        Ok(stale)
    }

    /// Lock files currently in the working directory, sorted by name.
    pub async fn stale_locks(&self) -> Result<Vec<String>, RegistryError> {
        let pattern = format!("{LOCK_PREFIX}*{LOCK_SUFFIX}");
        let out = self
            .runner
            .run(&format!(
                "find {} -maxdepth 1 -name {}",
                shell_quote(&self.dir),
                shell_quote(&pattern)
            ))
            .await?;

        let mut locks: Vec<String> = out
            .lines()
            .map(str::trim)
            .filter(|line| !line.is_empty())
            .map(|line| line.rsplit('/').next().unwrap_or(line).to_string())
            .collect();
        locks.sort();
        Ok(locks)
    }

    /// Dumps of `database` present in the working directory, oldest first.
    pub async fn list_dumps(&self, database: &str) -> Result<Vec<DumpIdentifier>, RegistryError> {
        let pattern = format!("{database}{SEPARATOR}*{EXTENSION}");
        let out = self
            .runner
            .run(&format!(
                "find {} -maxdepth 1 -type f -name {}",
                shell_quote(&self.dir),
                shell_quote(&pattern)
            ))
            .await?;
        Ok(parse_listing(&out, database))
    }

    /// Delete one payload. Missing files are not an error.
    pub async fn remove_dump(&self, id: &DumpIdentifier) -> Result<(), RegistryError> {
        self.runner
            .run(&format!("rm -f {}", self.quoted(&id.file_name())))
            .await?;
        Ok(())
    }

    /// Current `latest-dump`, read without taking its lock.
    pub async fn latest_dump(&self) -> Result<Option<DumpIdentifier>, RegistryError> {
        self.read_marker(LATEST_DUMP).await
    }

    /// Current `latest-restore`. Single writer, never locked.
    pub async fn latest_restore(&self) -> Result<Option<DumpIdentifier>, RegistryError> {
        self.read_marker(LATEST_RESTORE).await
    }

    /// Publish `id` as the current dump.
    ///
    /// `transfer` streams the payload into the directory while the dump's own
    /// lock is held. Each step runs only if the previous one succeeded; on
    /// failure the error names the step and nothing is rolled back.
    pub async fn publish<T, Fut>(&self, id: &DumpIdentifier, transfer: Fut) -> Result<T, RegistryError>
    where
        Fut: Future<Output = crate::Result<T>>,
    {
        let name = id.file_name();
        let failed = |step: PublishStep, source: crate::Error| RegistryError::Publish {
            dump: name.clone(),
            step,
            source: Box::new(source),
        };

        self.lock(&name)
            .await
            .map_err(|e| failed(PublishStep::LockDump, e.into()))?;
        let value = transfer
            .await
            .map_err(|e| failed(PublishStep::Transfer, e))?;
        self.unlock(&name)
            .await
            .map_err(|e| failed(PublishStep::UnlockDump, e.into()))?;

        self.lock(LATEST_DUMP)
            .await
            .map_err(|e| failed(PublishStep::LockMarker, e.into()))?;
        self.write_marker(LATEST_DUMP, id)
            .await
            .map_err(|e| failed(PublishStep::WriteMarker, e.into()))?;
        self.unlock(LATEST_DUMP)
            .await
            .map_err(|e| failed(PublishStep::UnlockMarker, e.into()))?;

        tracing::debug!("Published {} as {}", name, LATEST_DUMP);
        Ok(value)
    }

    /// Poll until `resource` is unlocked. Each look that finds the lock is
    /// followed by one backoff; after the last one the registry is busy.
    pub async fn wait_unlocked(&self, resource: &str) -> Result<(), RegistryError> {
        let policy = self.lock_policy;
        for attempt in 1..=policy.attempts {
            if !self.is_locked(resource).await? {
                return Ok(());
            }
            tracing::debug!(
                "[{}/{}] {} is locked, retrying in {:?}",
                attempt,
                policy.attempts,
                lock_name(resource),
                policy.backoff
            );
            tokio::time::sleep(policy.backoff).await;
        }

        Err(RegistryError::Busy {
            lock: lock_name(resource),
            attempts: policy.attempts,
        })
    }

    /// Read `latest-dump` under its lock. The lock is released even when the
    /// read fails.
    async fn read_latest_dump_locked(&self) -> Result<Option<DumpIdentifier>, RegistryError> {
        self.wait_unlocked(LATEST_DUMP).await?;
        self.lock(LATEST_DUMP).await?;
        let read = self.read_marker(LATEST_DUMP).await;
        let released = self.unlock(LATEST_DUMP).await;
        let id = read?;
        released?;
        Ok(id)
    }

    /// Apply the current dump through `restorer` unless it has been applied
    /// already. Only dumps of the restorer's own database are accepted.
    ///
    /// The payload is read from the local filesystem, so this only runs on
    /// the host that owns the working directory. `latest-restore` is written
    /// only after the restorer succeeded.
    pub async fn consume<D>(&self, restorer: &D) -> Result<ConsumeOutcome, RegistryError>
    where
        D: Restorer + ?Sized,
    {
        let database = restorer.database();
        let dump = self
            .read_latest_dump_locked()
            .await?
            .ok_or(RegistryError::EmptyMarker { marker: LATEST_DUMP })?;

        if dump.database() != database {
            return Err(RegistryError::DatabaseMismatch {
                dump: dump.to_string(),
                found: dump.database().to_string(),
                expected: database.to_string(),
            });
        }

        if self.latest_restore().await?.as_ref() == Some(&dump) {
            return Ok(ConsumeOutcome::NothingToRestore(dump));
        }

        let name = dump.file_name();
        let file = tokio::fs::File::open(Path::new(&self.dir).join(&name)).await?;
        let reader: DumpReader = Box::new(BufReader::new(file));

        tracing::info!("Restoring {} into {}", name, database);
        restorer
            .restore(reader)
            .await
            .map_err(|source| RegistryError::Restore {
                dump: name.clone(),
                source,
            })?;

        self.write_marker(LATEST_RESTORE, &dump).await?;
        Ok(ConsumeOutcome::Restored(dump))
    }
}
