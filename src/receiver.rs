//! Receiver event loop.
//!
//! Waits for writes to `latest-dump` and applies the dump it names. At most
//! one restore is in flight; it runs on its own task and reports back over a
//! completion channel, so the loop keeps draining (and dropping) watcher
//! events while the database is busy.
//!
//! ```text
//!            write event             completion
//!   Idle ─────────────────> Restoring ──────────> Idle
//!    │  pre-hook fails: stay Idle     post-hook runs here
//! ```

use crate::database::Restorer;
use crate::error::{Error, ErrorKind, RegistryError, Result};
use crate::registry::{ConsumeOutcome, LockedRegistry};
use crate::signal::Termination;
use crate::transport::{shell_join, CommandRunner, LocalRunner};
use crate::watch::WatchEvent;
use std::future::Future;
use std::sync::Arc;
use tokio::sync::mpsc;

/// Hooks around each restore. The accepted database is the restorer's.
#[derive(Debug, Clone, Default)]
pub struct ReceiverConfig {
    pub exec_before: Option<Vec<String>>,
    pub exec_after: Option<Vec<String>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RestoreState {
    Idle,
    Restoring,
}

type Completion = std::result::Result<ConsumeOutcome, RegistryError>;

pub struct ReceiverLoop<D: Restorer + ?Sized> {
    registry: LockedRegistry<LocalRunner>,
    restorer: Arc<D>,
    state: RestoreState,
    config: ReceiverConfig,
}

impl<D> ReceiverLoop<D>
where
    D: Restorer + ?Sized + 'static,
{
    pub fn new(registry: LockedRegistry<LocalRunner>, restorer: Arc<D>, config: ReceiverConfig) -> Self {
        Self {
            registry,
            restorer,
            state: RestoreState::Idle,
            config,
        }
    }

    pub fn state(&self) -> RestoreState {
        self.state
    }

    /// Prepare the working directory and wait for the database to answer.
    pub async fn startup(&self) -> Result<()> {
        self.registry.ensure_layout().await?;
        self.restorer.ready().await?;
        tracing::info!(
            "Watching {} for dumps of {}",
            self.registry.dir(),
            self.restorer.database()
        );
        Ok(())
    }

    async fn run_hook(&self, name: &str, argv: &[String]) -> Result<()> {
        let command = shell_join(argv);
        tracing::info!("Running {} hook: {}", name, command);
        let output = self.registry.runner().run(&command).await?;
        for line in output.lines().filter(|l| !l.trim().is_empty()) {
            tracing::info!("[{}] {}", name, line);
        }
        Ok(())
    }

    /// React to a marker write. Returns whether a restore was dispatched.
    async fn on_marker_written(&mut self, done: &mpsc::Sender<Completion>) -> bool {
        if self.state == RestoreState::Restoring {
            tracing::debug!("Restore already in progress, dropping change event");
            return false;
        }

        if let Some(argv) = &self.config.exec_before {
            if let Err(e) = self.run_hook("pre-restore", argv).await {
                tracing::error!("Pre-restore hook failed, skipping restore: {}", e);
                return false;
            }
        }

        self.state = RestoreState::Restoring;
        let registry = self.registry.clone();
        let restorer = Arc::clone(&self.restorer);
        let done = done.clone();
        tokio::spawn(async move {
            let result = registry.consume(&*restorer).await;
            let _ = done.send(result).await;
        });
        true
    }

    /// Clear the in-flight state, report, and run the post-hook. Fatal errors
    /// are handed back to stop the loop.
    async fn on_restore_done(&mut self, result: Completion) -> Result<()> {
        self.state = RestoreState::Idle;

        let failure = match result {
            Ok(ConsumeOutcome::Restored(id)) => {
                tracing::info!("Restored {}", id);
                None
            }
            Ok(ConsumeOutcome::NothingToRestore(id)) => {
                tracing::info!("{} already restored, nothing to do", id);
                None
            }
            Err(e) => {
                let e = Error::from(e);
                match e.kind() {
                    ErrorKind::Contention => tracing::warn!("{}", e),
                    _ => tracing::error!("Restore failed: {}", e),
                }
                Some(e)
            }
        };

        if let Some(argv) = &self.config.exec_after {
            if let Err(e) = self.run_hook("post-restore", argv).await {
                tracing::error!("Post-restore hook failed: {}", e);
            }
        }

        match failure {
            Some(e) if e.is_fatal() => Err(e),
            _ => Ok(()),
        }
    }

    /// Dispatch watcher events and restore completions until `shutdown`
    /// resolves or a fatal error occurs.
    pub async fn run<F>(
        mut self,
        events: &mut mpsc::UnboundedReceiver<WatchEvent>,
        shutdown: F,
    ) -> Result<Termination>
    where
        F: Future<Output = Termination>,
    {
        let (done_tx, mut done_rx) = mpsc::channel::<Completion>(1);
        tokio::pin!(shutdown);

        loop {
            tokio::select! {
                biased;

                term = &mut shutdown => {
                    if self.state == RestoreState::Restoring {
                        tracing::warn!("Stopping with a restore still in flight");
                    }
                    tracing::info!("Receiver stopping: {}", term);
                    return Ok(term);
                }

                Some(result) = done_rx.recv() => {
                    self.on_restore_done(result).await?;
                }

                event = events.recv() => match event {
                    Some(WatchEvent::Written) => {
                        self.on_marker_written(&done_tx).await;
                    }
                    Some(WatchEvent::Replaced) => {}
                    None => {
                        return Err(Error::Io(std::io::Error::new(
                            std::io::ErrorKind::BrokenPipe,
                            "file watcher stopped",
                        )));
                    }
                },
            }
        }
    }
}
