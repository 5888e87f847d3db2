//! Periodic garbage collection chore

use crate::error::Result;
use crate::gc::{DeleteExpiredObjects, DeleteZombieObjects, GcReport, MetabaseGc};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

/// Garbage collection configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GcConfig {
    /// Seconds between runs
    pub interval_secs: u64,
    /// Objects per page (clamped to 1..=1000, 0 means 1000)
    pub batch_size: usize,
    /// Read pages this many seconds in the past; 0 disables snapshot reads
    pub as_of_system_interval_secs: u64,
    pub delete_expired: bool,
    pub delete_zombies: bool,
}

impl Default for GcConfig {
    fn default() -> Self {
        Self {
            interval_secs: 3600,
            batch_size: 1000,
            as_of_system_interval_secs: 5,
            delete_expired: true,
            delete_zombies: true,
        }
    }
}

impl GcConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }

    pub fn as_of_system_interval(&self) -> Duration {
        Duration::from_secs(self.as_of_system_interval_secs)
    }
}

/// Reports from one chore run
#[derive(Debug, Default)]
pub struct ChoreRun {
    pub expired: Option<GcReport>,
    pub zombie: Option<GcReport>,
}

/// Runs both GC passes on a fixed interval
pub struct GcChore {
    gc: MetabaseGc,
    config: GcConfig,
}

impl GcChore {
    pub fn new(gc: MetabaseGc, config: GcConfig) -> Self {
        Self { gc, config }
    }

    /// Run each enabled pass once
    pub async fn run_once(&self) -> Result<ChoreRun> {
        let now = Utc::now();
        let as_of = match self.config.as_of_system_interval() {
            interval if interval.is_zero() => None,
            interval => chrono::Duration::from_std(interval)
                .ok()
                .map(|interval| now - interval),
        };

        let mut run = ChoreRun::default();
        if self.config.delete_expired {
            run.expired = Some(
                self.gc
                    .delete_expired_objects(DeleteExpiredObjects {
                        expired_before: now,
                        as_of_system_time: as_of,
                        batch_size: self.config.batch_size,
                    })
                    .await?,
            );
        }
        if self.config.delete_zombies {
            run.zombie = Some(
                self.gc
                    .delete_zombie_objects(DeleteZombieObjects {
                        deadline_before: now,
                        as_of_system_time: as_of,
                        batch_size: self.config.batch_size,
                    })
                    .await?,
            );
        }
        Ok(run)
    }

    /// Run until `cancel` fires or the store becomes unavailable
    pub async fn run(self, cancel: CancellationToken) -> Result<()> {
        info!(interval_secs = self.config.interval_secs, "GC chore started");

        let mut ticker = tokio::time::interval(self.config.interval());
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    info!("GC chore stopped");
                    return Ok(());
                }
                _ = ticker.tick() => {}
            }

            match self.run_once().await {
                Ok(_) => {}
                Err(e) if e.is_fatal() => {
                    error!(error = %e, "GC chore stopping: metabase unavailable");
                    return Err(e);
                }
                Err(e) => warn!(error = %e, "GC run failed, retrying next interval"),
            }
        }
    }
}
