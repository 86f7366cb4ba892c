//! Shutdown Orchestrator
//!
//! Drain-and-stop sequence, run exactly once no matter how many triggers
//! fire (signal, `/shutdown`, run-loop cancellation):
//!
//! ```text
//! Running ──► Draining ──► (drain wait) ──► Stopping ──► (transport stop) ──► Stopped
//!             sentinel file                 SHUTDOWN SLOW
//!             PROXYSQL PAUSE                close connection
//! ```
//!
//! A failing step is logged and the sequence continues; the first failure
//! is what every caller gets back.

use crate::admin::statements;
use crate::config::ShutdownConfig;
use crate::control::{ControlPlane, ShutdownPhase};
use parking_lot::Mutex;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use tokio::sync::OnceCell;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Something that serves probes and must stop last
pub trait TransportHandle: Send + Sync + 'static {
    fn stop(&self) -> Pin<Box<dyn Future<Output = Result<(), String>> + Send + '_>>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownStep {
    Draining,
    DrainWait,
    Stopping,
    Transport,
}

impl std::fmt::Display for ShutdownStep {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            ShutdownStep::Draining => "draining",
            ShutdownStep::DrainWait => "drain wait",
            ShutdownStep::Stopping => "stopping",
            ShutdownStep::Transport => "transport stop",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShutdownError {
    pub step: ShutdownStep,
    pub message: String,
}

impl ShutdownError {
    fn new(step: ShutdownStep, message: impl Into<String>) -> Self {
        ShutdownError {
            step,
            message: message.into(),
        }
    }
}

impl std::fmt::Display for ShutdownError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "shutdown step '{}' failed: {}", self.step, self.message)
    }
}

impl std::error::Error for ShutdownError {}

pub struct ShutdownOrchestrator {
    control: Arc<ControlPlane>,
    settings: ShutdownConfig,
    transport: Mutex<Option<Arc<dyn TransportHandle>>>,
    outcome: OnceCell<Result<(), ShutdownError>>,
}

impl ShutdownOrchestrator {
    pub fn new(control: Arc<ControlPlane>, settings: ShutdownConfig) -> Self {
        ShutdownOrchestrator {
            control,
            settings,
            transport: Mutex::new(None),
            outcome: OnceCell::new(),
        }
    }

    pub fn register_transport(&self, handle: Arc<dyn TransportHandle>) {
        *self.transport.lock() = Some(handle);
    }

    pub fn is_shutting_down(&self) -> bool {
        self.control.is_shutting_down()
    }

    /// Run the shutdown sequence, or wait for the run already in progress,
    /// and return its result. `cancel` cuts the drain wait short.
    pub async fn begin_shutdown(&self, cancel: &CancellationToken) -> Result<(), ShutdownError> {
        self.outcome
            .get_or_init(|| self.run_sequence(cancel))
            .await
            .clone()
    }

    async fn run_sequence(&self, cancel: &CancellationToken) -> Result<(), ShutdownError> {
        let deadline = Instant::now() + self.settings.shutdown_timeout;
        let mut errors = Vec::new();

        info!("starting graceful shutdown");

        errors.extend(self.start_draining().await);
        if let Err(e) = self.wait_for_drain(deadline, cancel).await {
            errors.push(e);
        }
        errors.extend(self.stop_proxy().await);
        if let Err(e) = self.stop_transport().await {
            errors.push(e);
        }

        self.control.advance(ShutdownPhase::Stopped);

        for e in &errors {
            error!(step = %e.step, error = %e.message, "shutdown step failed");
        }
        match errors.into_iter().next() {
            Some(e) => Err(e),
            None => {
                info!("shutdown complete");
                Ok(())
            }
        }
    }

    async fn start_draining(&self) -> Vec<ShutdownError> {
        let mut errors = Vec::new();
        self.control.advance(ShutdownPhase::Draining);

        let path = &self.settings.draining_file;
        match std::fs::File::create(path) {
            Ok(_) => debug!(file = %path.display(), "created draining file"),
            Err(e) => errors.push(ShutdownError::new(
                ShutdownStep::Draining,
                format!("failed to create draining file {}: {}", path.display(), e),
            )),
        }

        match self.control.acquire_for_shutdown() {
            Some(conn) => {
                if let Err(e) = conn.execute(statements::PAUSE).await {
                    errors.push(ShutdownError::new(
                        ShutdownStep::Draining,
                        format!("failed to execute command '{}': {}", statements::PAUSE, e),
                    ));
                }
            }
            None => errors.push(ShutdownError::new(
                ShutdownStep::Draining,
                "admin connection unavailable",
            )),
        }

        errors
    }

    /// Poll the connected-client count until it reaches zero, the drain
    /// timeout or overall deadline passes, or `cancel` fires. Never aborts a
    /// poll already sent.
    async fn wait_for_drain(
        &self,
        deadline: Instant,
        cancel: &CancellationToken,
    ) -> Result<(), ShutdownError> {
        let Some(conn) = self.control.acquire_for_shutdown() else {
            return Err(ShutdownError::new(
                ShutdownStep::DrainWait,
                "admin connection unavailable",
            ));
        };

        let wait_until = (Instant::now() + self.settings.drain_timeout).min(deadline);
        let mut last_error;

        loop {
            match conn.query_scalar(statements::CONNECTED_CLIENTS).await {
                Ok(None) | Ok(Some(0)) => {
                    info!("all client connections drained");
                    return Ok(());
                }
                Ok(Some(clients)) => {
                    debug!(clients, "waiting for clients to drain");
                    last_error = None;
                }
                Err(e) => {
                    warn!(error = %e, "failed to read client connections");
                    last_error = Some(e);
                }
            }

            if Instant::now() >= wait_until {
                warn!(timeout = ?self.settings.drain_timeout, "drain timeout expired, proceeding with shutdown");
                break;
            }

            let next_poll = (Instant::now() + self.settings.drain_poll_interval).min(wait_until);
            tokio::select! {
                _ = cancel.cancelled() => {
                    warn!("drain wait cancelled, proceeding with shutdown");
                    break;
                }
                _ = tokio::time::sleep_until(next_poll) => {}
            }
        }

        match last_error {
            Some(e) => Err(ShutdownError::new(
                ShutdownStep::DrainWait,
                format!("failed to read client connections: {}", e),
            )),
            None => Ok(()),
        }
    }

    async fn stop_proxy(&self) -> Vec<ShutdownError> {
        let mut errors = Vec::new();
        self.control.advance(ShutdownPhase::Stopping);

        let Some(conn) = self.control.invalidate() else {
            errors.push(ShutdownError::new(
                ShutdownStep::Stopping,
                "admin connection unavailable",
            ));
            return errors;
        };

        if let Err(e) = conn.execute(statements::SHUTDOWN_SLOW).await {
            errors.push(ShutdownError::new(
                ShutdownStep::Stopping,
                format!("failed to execute command '{}': {}", statements::SHUTDOWN_SLOW, e),
            ));
        }
        if let Err(e) = conn.close().await {
            errors.push(ShutdownError::new(
                ShutdownStep::Stopping,
                format!("failed to close admin connection: {}", e),
            ));
        }

        errors
    }

    async fn stop_transport(&self) -> Result<(), ShutdownError> {
        let handle = self.transport.lock().clone();
        let Some(handle) = handle else {
            return Ok(());
        };

        match tokio::time::timeout(self.settings.transport_timeout, handle.stop()).await {
            Ok(Ok(())) => {
                info!("transport stopped");
                Ok(())
            }
            Ok(Err(msg)) => Err(ShutdownError::new(ShutdownStep::Transport, msg)),
            Err(_) => Err(ShutdownError::new(
                ShutdownStep::Transport,
                format!("timed out after {:?}", self.settings.transport_timeout),
            )),
        }
    }
}

/// Wait for SIGTERM or SIGINT, then cancel `cancel`
#[cfg(unix)]
pub async fn listen_for_signals(cancel: CancellationToken) -> std::io::Result<()> {
    use tokio::signal::unix::{signal, SignalKind};

    let mut sigterm = signal(SignalKind::terminate())?;
    let mut sigint = signal(SignalKind::interrupt())?;

    tokio::select! {
        _ = sigterm.recv() => info!("SIGTERM received, shutting down"),
        _ = sigint.recv() => info!("SIGINT received, shutting down"),
        _ = cancel.cancelled() => return Ok(()),
    }

    cancel.cancel();
    Ok(())
}

#[cfg(not(unix))]
pub async fn listen_for_signals(cancel: CancellationToken) -> std::io::Result<()> {
    tokio::select! {
        result = tokio::signal::ctrl_c() => {
            result?;
            info!("Ctrl+C received, shutting down");
        }
        _ = cancel.cancelled() => return Ok(()),
    }

    cancel.cancel();
    Ok(())
}
