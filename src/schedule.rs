//! Cron schedule driving the sender's dump cycles.
//!
//! Expressions use the `cron` crate's syntax, seconds field first. A classic
//! five-field expression is accepted and runs at second zero.

use crate::error::ConfigError;
use chrono::{DateTime, Utc};
use std::str::FromStr;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

#[derive(Debug, Clone)]
pub struct Schedule {
    expr: String,
    inner: cron::Schedule,
}

impl Schedule {
    pub fn parse(expr: &str) -> Result<Self, ConfigError> {
        let trimmed = expr.trim();
        let normalized = if trimmed.split_whitespace().count() == 5 {
            format!("0 {trimmed}")
        } else {
            trimmed.to_string()
        };

        let inner = cron::Schedule::from_str(&normalized).map_err(|e| ConfigError::Schedule {
            expr: expr.to_string(),
            reason: e.to_string(),
        })?;
        if inner.upcoming(Utc).next().is_none() {
            return Err(ConfigError::Schedule {
                expr: expr.to_string(),
                reason: "never fires".to_string(),
            });
        }

        Ok(Self {
            expr: expr.to_string(),
            inner,
        })
    }

    pub fn expr(&self) -> &str {
        &self.expr
    }

    /// First fire time strictly after `after`.
    pub fn next_after(&self, after: DateTime<Utc>) -> Option<DateTime<Utc>> {
        self.inner.after(&after).next()
    }

    /// Deliver ticks on a channel until the receiver is dropped.
    ///
    /// The channel holds one tick. While the consumer is busy the scheduler
    /// waits, and fire times that pass in the meantime are skipped.
    pub fn spawn(self) -> (mpsc::Receiver<DateTime<Utc>>, JoinHandle<()>) {
        let (tx, rx) = mpsc::channel(1);
        let handle = tokio::spawn(async move {
            loop {
                let now = Utc::now();
                let Some(next) = self.next_after(now) else {
                    tracing::warn!("Schedule {:?} has no further fire times", self.expr);
                    break;
                };
                let wait = (next - now).to_std().unwrap_or(Duration::ZERO);
                tokio::time::sleep(wait).await;

                if tx.send(next).await.is_err() {
                    break;
                }
            }
        });
        (rx, handle)
    }
}

impl FromStr for Schedule {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}
