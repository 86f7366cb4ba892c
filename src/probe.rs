//! Health Probe Aggregator
//!
//! Point-in-time health summary built from the runtime backend table, the
//! client connection stats and the draining sentinel file. Read-only: never
//! touches the phase or the connection lifecycle.

use crate::admin::statements;
use crate::control::ControlPlane;
use crate::error::{AgentError, Result};
use serde::Serialize;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ProbeStatus {
    Ok,
    Unhealthy,
    Draining,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ProbeKind {
    Startup,
    Readiness,
    Liveness,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct BackendCounts {
    pub total: i64,
    pub online: i64,
    pub shunned: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ProbeResult {
    pub backends: BackendCounts,
    /// `None` when the stats table has no sample yet
    pub clients: Option<i64>,
    pub draining: bool,
    pub status: ProbeStatus,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub probe: Option<ProbeKind>,
}

impl ProbeResult {
    /// Result reported once shutdown has begun; no queries behind it
    pub fn shutting_down() -> Self {
        ProbeResult {
            backends: BackendCounts::default(),
            clients: Some(0),
            draining: true,
            status: ProbeStatus::Draining,
            message: "shutting down".to_string(),
            probe: None,
        }
    }

    fn with_probe(mut self, kind: ProbeKind) -> Self {
        self.probe = Some(kind);
        self
    }
}

/// Classify backend counts. First match wins.
pub fn classify(backends: BackendCounts, draining: bool) -> (ProbeStatus, &'static str) {
    if backends.online == backends.total {
        (ProbeStatus::Ok, "all backends online")
    } else if backends.online == 0 {
        (ProbeStatus::Unhealthy, "all backends offline")
    } else if draining {
        (ProbeStatus::Draining, "draining traffic")
    } else {
        (ProbeStatus::Ok, "some backends offline")
    }
}

/// A probe result plus whether the probe flavour passes
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProbeVerdict {
    pub passing: bool,
    pub result: ProbeResult,
}

pub struct HealthProbes {
    control: Arc<ControlPlane>,
    draining_file: PathBuf,
    log_results: bool,
}

impl HealthProbes {
    pub fn new(control: Arc<ControlPlane>, draining_file: impl Into<PathBuf>) -> Self {
        HealthProbes {
            control,
            draining_file: draining_file.into(),
            log_results: false,
        }
    }

    /// Log every probe result at debug level
    pub fn with_logging(mut self, enabled: bool) -> Self {
        self.log_results = enabled;
        self
    }

    pub fn is_shutting_down(&self) -> bool {
        self.control.is_shutting_down()
    }

    /// Connectivity check. Succeeds without a round trip once shutdown has
    /// begun.
    pub async fn ping(&self) -> Result<()> {
        match self.control.acquire() {
            Some(conn) => conn.ping().await.map_err(AgentError::Connection),
            None => Ok(()),
        }
    }

    pub async fn run_probes(&self) -> Result<ProbeResult> {
        let Some(conn) = self.control.acquire() else {
            return Ok(ProbeResult::shutting_down());
        };

        let mut counts = [0i64; 3];
        let queries = [
            statements::COUNT_BACKENDS,
            statements::COUNT_ONLINE_BACKENDS,
            statements::COUNT_SHUNNED_BACKENDS,
        ];
        for (slot, query) in counts.iter_mut().zip(queries) {
            *slot = conn
                .query_scalar(query)
                .await
                .map_err(|e| AgentError::probe(query, e))?
                .unwrap_or(0);
        }
        let backends = BackendCounts {
            total: counts[0],
            online: counts[1],
            shunned: counts[2],
        };

        let clients = conn
            .query_scalar(statements::CONNECTED_CLIENTS)
            .await
            .map_err(|e| AgentError::probe(statements::CONNECTED_CLIENTS, e))?;

        let draining = self.draining_file.exists();
        let (status, message) = classify(backends, draining);

        Ok(ProbeResult {
            backends,
            clients,
            draining,
            status,
            message: message.to_string(),
            probe: None,
        })
    }

    pub async fn startup(&self) -> Result<ProbeVerdict> {
        self.ping().await?;
        let result = ProbeResult {
            backends: BackendCounts::default(),
            clients: None,
            draining: self.is_shutting_down(),
            status: ProbeStatus::Ok,
            message: "ok".to_string(),
            probe: Some(ProbeKind::Startup),
        };
        Ok(ProbeVerdict {
            passing: true,
            result,
        })
    }

    /// Passes only on `ok`
    pub async fn readiness(&self) -> Result<ProbeVerdict> {
        let result = self.run_probes().await?.with_probe(ProbeKind::Readiness);
        self.log(&result);
        Ok(ProbeVerdict {
            passing: result.status == ProbeStatus::Ok,
            result,
        })
    }

    /// Passes on `ok` and `draining`, so a draining member is not killed
    /// with queries in flight
    pub async fn liveness(&self) -> Result<ProbeVerdict> {
        let result = self.run_probes().await?.with_probe(ProbeKind::Liveness);
        self.log(&result);
        Ok(ProbeVerdict {
            passing: matches!(result.status, ProbeStatus::Ok | ProbeStatus::Draining),
            result,
        })
    }

    fn log(&self, result: &ProbeResult) {
        if self.log_results {
            debug!(
                probe = ?result.probe,
                status = ?result.status,
                total = result.backends.total,
                online = result.backends.online,
                shunned = result.backends.shunned,
                clients = ?result.clients,
                draining = result.draining,
                "status check"
            );
        }
    }
}
