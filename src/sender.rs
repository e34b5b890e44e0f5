//! Sender event loop.
//!
//! One task owns the retention ring and the link state and reacts to one
//! event at a time:
//!
//! ```text
//!            ┌──────────── select! ────────────┐
//!  schedule ─┤ tick    -> dump, publish, evict │
//!  interval ─┤ health  -> probe / reconnect    │
//!  signal   ─┤ stop    -> return Termination   │
//!            └─────────────────────────────────┘
//! ```
//!
//! A cycle runs to completion inside the select arm, so health checks and
//! termination are only observed between operations.

use crate::database::{DumpStream, Dumper};
use crate::dump::DumpIdentifier;
use crate::error::{Error, Result};
use crate::registry::LockedRegistry;
use crate::retention::RetentionBuffer;
use crate::retry::RetryPolicy;
use crate::signal::Termination;
use crate::streaming::{PushConfig, PushStats, StreamingPush};
use crate::transport::{reconnect, RemoteSession};
use chrono::{DateTime, Utc};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::MissedTickBehavior;

/// Permissions of pushed dump files.
pub const DUMP_FILE_MODE: u32 = 0o600;

#[derive(Debug, Clone)]
pub struct SenderConfig {
    /// Working directory on the receiver host.
    pub working_dir: String,
    /// Requested retention, clamped by the ring.
    pub retention: usize,
    pub health_interval: Duration,
    pub reconnect: RetryPolicy,
    pub push: PushConfig,
}

impl SenderConfig {
    pub fn new(working_dir: impl Into<String>, retention: usize) -> Self {
        Self {
            working_dir: working_dir.into(),
            retention,
            health_interval: Duration::from_secs(60),
            reconnect: RetryPolicy::reconnect(),
            push: PushConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkState {
    Up,
    Down,
}

/// What one scheduled tick did.
#[derive(Debug, Clone)]
pub enum CycleOutcome {
    Pushed {
        identifier: DumpIdentifier,
        evicted: Option<DumpIdentifier>,
        stats: PushStats,
    },
    /// The link was down; no dump was taken.
    SkippedLinkDown,
}

pub struct SenderLoop<S: RemoteSession + ?Sized, D: Dumper + ?Sized> {
    session: Arc<S>,
    dumper: Arc<D>,
    registry: LockedRegistry<S>,
    push: StreamingPush,
    retention: RetentionBuffer,
    link: LinkState,
    config: SenderConfig,
}

impl<S, D> SenderLoop<S, D>
where
    S: RemoteSession + ?Sized,
    D: Dumper + ?Sized,
{
    /// Connect, prepare the remote working directory and seed the retention
    /// ring from the dumps already there. Dumps the ring rejects are deleted.
    ///
    /// Failing to reach the remote at all is returned as an error; there is
    /// nothing to seed from.
    pub async fn startup(session: Arc<S>, dumper: Arc<D>, config: SenderConfig) -> Result<Self> {
        if let Err(e) = session.connect().await {
            tracing::warn!("Failed to connect to {}: {}", session.endpoint(), e);
            reconnect(&*session, config.reconnect).await?;
        }
        tracing::info!("Connected to {}", session.endpoint());

        let registry = LockedRegistry::new(Arc::clone(&session), config.working_dir.clone());
        registry.ensure_layout().await?;

        let existing = registry.list_dumps(dumper.database()).await?;
        let found = existing.len();
        let (retention, overflow) = RetentionBuffer::initialize(config.retention, existing)?;
        if retention.capacity() < config.retention {
            tracing::warn!(
                "Retention of {} requested, keeping at most {}",
                config.retention,
                retention.capacity()
            );
        }

        let sender = Self {
            session,
            dumper,
            registry,
            push: StreamingPush::new(config.push.clone()),
            retention,
            link: LinkState::Up,
            config,
        };

        tracing::info!(
            "Found {} existing dumps of {}, keeping {}",
            found,
            sender.dumper.database(),
            sender.retention.len()
        );
        if let Some(newest) = sender.retention.newest() {
            tracing::info!("Newest retained dump is {}", newest);
        }
        for id in overflow {
            sender.evict(&id).await;
        }

        Ok(sender)
    }

    pub fn link(&self) -> LinkState {
        self.link
    }

    pub fn retention(&self) -> &RetentionBuffer {
        &self.retention
    }

    pub fn registry(&self) -> &LockedRegistry<S> {
        &self.registry
    }

    async fn evict(&self, id: &DumpIdentifier) {
        match self.registry.remove_dump(id).await {
            Ok(()) => tracing::info!("Removed old dump {}", id),
            Err(e) => tracing::error!("Failed to remove old dump {}: {}", id, e),
        }
    }

    /// Dump, push and publish one snapshot, then evict whatever the ring
    /// pushed out. Any failure ends the cycle with state unchanged.
    pub async fn run_cycle(&mut self) -> Result<CycleOutcome> {
        if self.link == LinkState::Down {
            tracing::warn!(
                "Remote {} is down, skipping dump of {}",
                self.session.endpoint(),
                self.dumper.database()
            );
            return Ok(CycleOutcome::SkippedLinkDown);
        }

        let DumpStream {
            identifier,
            reader,
            process,
        } = self.dumper.dump().await?;
        let name = identifier.file_name();
        tracing::info!("Dumping {} to {}", self.dumper.database(), name);

        let session = &*self.session;
        let push = &self.push;
        let dir = self.config.working_dir.as_str();
        let stats = self
            .registry
            .publish(&identifier, async {
                let stats = push.push(session, reader, dir, &name, DUMP_FILE_MODE).await?;
                if let Some(process) = process {
                    process.wait().await?;
                }
                Ok::<_, Error>(stats)
            })
            .await?;
        tracing::info!(
            "Pushed {} ({} bytes) in {:.1}s",
            name,
            stats.payload_bytes,
            stats.duration.as_secs_f64()
        );

        // Two dumps in the same second share a name; the push overwrote the
        // file in place, so the ring already accounts for it.
        let evicted = if self.retention.contains(&identifier) {
            tracing::warn!("{} was already retained, overwritten in place", name);
            None
        } else {
            self.retention.insert(identifier.clone())
        };
        if let Some(old) = &evicted {
            self.evict(old).await;
        }

        Ok(CycleOutcome::Pushed {
            identifier,
            evicted,
            stats,
        })
    }

    /// Probe the link; on failure mark it down and try to reconnect.
    pub async fn health_check(&mut self) -> LinkState {
        match self.session.probe().await {
            Ok(()) => {
                if self.link == LinkState::Down {
                    tracing::info!("Remote {} is reachable again", self.session.endpoint());
                }
                self.link = LinkState::Up;
            }
            Err(e) => {
                tracing::warn!("Health check of {} failed: {}", self.session.endpoint(), e);
                self.link = LinkState::Down;
                match reconnect(&*self.session, self.config.reconnect).await {
                    Ok(_) => self.link = LinkState::Up,
                    Err(e) => tracing::error!(
                        "{}. Remote marked down until the next health check",
                        e
                    ),
                }
            }
        }
        self.link
    }

    /// Dispatch schedule ticks and health checks until `shutdown` resolves or
    /// a fatal error occurs.
    pub async fn run<F>(
        mut self,
        ticks: &mut mpsc::Receiver<DateTime<Utc>>,
        shutdown: F,
    ) -> Result<Termination>
    where
        F: Future<Output = Termination>,
    {
        let mut health = tokio::time::interval(self.config.health_interval);
        health.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // The first tick fires immediately; startup just proved the link.
        health.tick().await;

        tokio::pin!(shutdown);
        let mut schedule_open = true;

        loop {
            tokio::select! {
                biased;

                term = &mut shutdown => {
                    tracing::info!("Sender stopping: {}", term);
                    return Ok(term);
                }

                _ = health.tick() => {
                    self.health_check().await;
                }

                tick = ticks.recv(), if schedule_open => {
                    let Some(at) = tick else {
                        tracing::warn!("Schedule closed, no further dumps will be taken");
                        schedule_open = false;
                        continue;
                    };
                    tracing::debug!("Schedule fired for {}", at);

                    match self.run_cycle().await {
                        Ok(_) => {}
                        Err(e) if e.is_fatal() => return Err(e),
                        Err(e) => tracing::error!("Dump cycle failed: {}", e),
                    }
                }
            }
        }
    }
}
