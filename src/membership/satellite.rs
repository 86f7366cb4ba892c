//! Satellite resync
//!
//! Satellites never register themselves. If any core stops answering the
//! cluster health checks, the satellite throws away the topology it learned
//! and reloads the seed list from its config file.

use crate::admin::statements;
use crate::control::{ControlPlane, Execution};
use crate::error::{AgentError, Result};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

const RESYNC_COMMANDS: [&str; 3] = [
    statements::CLEAR_SERVERS,
    statements::LOAD_SERVERS_FROM_CONFIG,
    statements::LOAD_SERVERS_TO_RUNTIME_TERMINATED,
];

pub struct SatelliteResync {
    control: Arc<ControlPlane>,
    interval: Duration,
    heartbeat_threshold: Duration,
}

impl SatelliteResync {
    pub fn new(control: Arc<ControlPlane>, interval: Duration, heartbeat_threshold: Duration) -> Self {
        SatelliteResync {
            control,
            interval,
            heartbeat_threshold,
        }
    }

    /// One check. Returns true if a resync ran to completion.
    pub async fn resync_once(&self) -> Result<bool> {
        let Some(conn) = self.control.acquire() else {
            debug!("shutting down, skipping satellite resync");
            return Ok(false);
        };

        let query = statements::count_missing_cores(threshold_ms(self.heartbeat_threshold));
        let missing = conn
            .query_scalar(&query)
            .await
            .map_err(|e| AgentError::command(query.as_str(), e))?
            .unwrap_or(0);
        drop(conn);

        if missing == 0 {
            return Ok(false);
        }

        warn!(missing, "cores missing heartbeats, resyncing from config");

        for command in RESYNC_COMMANDS {
            match self.control.execute(command).await {
                Ok(Execution::Applied(_)) => {}
                Ok(Execution::Skipped) => return Ok(false),
                Err(e) => {
                    error!(command, error = %e, "command failed");
                    return Err(AgentError::command(command, e));
                }
            }
        }

        info!("satellite resync complete");
        Ok(true)
    }

    /// Check every interval until `cancel` fires or shutdown begins. Failed
    /// checks are logged and retried next tick.
    pub async fn run(&self, cancel: CancellationToken) {
        info!(interval = ?self.interval, "satellite loop started");
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {}
            }
            if self.control.is_shutting_down() {
                break;
            }
            if let Err(e) = self.resync_once().await {
                error!(error = %e, "satellite resync failed");
            }
        }
        info!("satellite loop stopped");
    }
}

/// Threshold in whole milliseconds, saturating at `u64::MAX`
fn threshold_ms(threshold: Duration) -> u64 {
    u64::try_from(threshold.as_millis()).unwrap_or(u64::MAX)
}
