//! Agent wiring and run loops
//!
//! The run loop for the configured mode ends on cancellation (signal) or
//! once shutdown has begun elsewhere (`/shutdown`); either way it then
//! enters the shutdown sequence. Startup failures return without touching
//! the proxy.

use crate::admin::AdminExecutor;
use crate::config::{AgentConfig, CoreMode, RunMode};
use crate::control::ControlPlane;
use crate::error::{AgentError, Result};
use crate::membership::{
    EventDispatcher, FeedError, FeedEvent, FeedStream, MemberSource, Reconciler, SatelliteResync,
    WatermarkLoop, WatermarkStore,
};
use crate::probe::HealthProbes;
use crate::shutdown::ShutdownOrchestrator;
use futures::StreamExt;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

pub struct Agent {
    config: AgentConfig,
    cluster_port: u16,
    control: Arc<ControlPlane>,
    orchestrator: Arc<ShutdownOrchestrator>,
    probes: Arc<HealthProbes>,
}

impl Agent {
    pub fn new(config: AgentConfig, conn: Arc<dyn AdminExecutor>) -> Result<Self> {
        let cluster_port = config.proxysql.cluster_port()?;
        let control = Arc::new(ControlPlane::new(conn));
        let orchestrator = Arc::new(ShutdownOrchestrator::new(
            control.clone(),
            config.shutdown.clone(),
        ));
        let probes = Arc::new(
            HealthProbes::new(control.clone(), config.shutdown.draining_file.clone())
                .with_logging(config.log.probes),
        );

        Ok(Agent {
            config,
            cluster_port,
            control,
            orchestrator,
            probes,
        })
    }

    pub fn control(&self) -> Arc<ControlPlane> {
        self.control.clone()
    }

    pub fn orchestrator(&self) -> Arc<ShutdownOrchestrator> {
        self.orchestrator.clone()
    }

    pub fn probes(&self) -> Arc<HealthProbes> {
        self.probes.clone()
    }

    /// Run `mode` until `cancel` fires or shutdown begins, then shut down
    pub async fn run(
        &self,
        mode: RunMode,
        source: Option<Arc<dyn MemberSource>>,
        cancel: CancellationToken,
    ) -> Result<()> {
        match mode {
            RunMode::Core => {
                let source = source.ok_or_else(|| {
                    AgentError::Feed(FeedError::Unavailable(
                        "core mode needs a membership source".to_string(),
                    ))
                })?;
                self.run_core(source, &cancel).await?;
            }
            RunMode::Satellite => self.run_satellite(&cancel).await,
        }

        // The caller's token is already cancelled here; a fresh one keeps
        // the drain wait from being cut short.
        self.orchestrator
            .begin_shutdown(&CancellationToken::new())
            .await?;
        Ok(())
    }

    pub async fn run_core(
        &self,
        source: Arc<dyn MemberSource>,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let core = &self.config.core;
        match core.mode {
            CoreMode::Poll => {
                let watermark = WatermarkLoop::new(
                    self.control.clone(),
                    source,
                    core.podselector.clone(),
                    WatermarkStore::new(core.watermark_file.clone()),
                    self.cluster_port,
                    core.interval,
                );
                watermark.run(cancel.clone()).await;
                Ok(())
            }
            CoreMode::Watch => {
                let identity = self.config.identity().ok_or_else(|| {
                    AgentError::Config(crate::config::ConfigError::Invalid(
                        "could not determine member identity; set identity or HOSTNAME"
                            .to_string(),
                    ))
                })?;
                info!(%identity, "core mode initialized, watching members");

                let reconciler = Arc::new(Reconciler::new(
                    self.control.clone(),
                    identity,
                    self.cluster_port,
                ));
                let dispatcher = EventDispatcher::spawn(reconciler);
                let mut feed = source.watch(&core.podselector);

                let result = match self.sync_feed(&mut feed, &dispatcher).await {
                    Ok(()) => self.forward_feed(&mut feed, &dispatcher, cancel).await,
                    Err(e) => Err(e),
                };
                dispatcher.shutdown().await;
                result
            }
        }
    }

    /// Forward events until the initial listing is complete, bounded by
    /// `core.sync_timeout`
    async fn sync_feed(&self, feed: &mut FeedStream, dispatcher: &EventDispatcher) -> Result<()> {
        let timeout = self.config.core.sync_timeout;
        let synced = tokio::time::timeout(timeout, async {
            while let Some(item) = feed.next().await {
                match item {
                    Ok(FeedEvent::Synced) => return Ok(()),
                    Ok(event) => {
                        dispatcher.dispatch(event);
                    }
                    Err(e) => warn!(error = %e, "membership feed error during sync"),
                }
            }
            Err(FeedError::Closed)
        })
        .await;

        match synced {
            Ok(Ok(())) => {
                info!("membership feed synced");
                Ok(())
            }
            Ok(Err(e)) => Err(e.into()),
            Err(_) => Err(AgentError::FeedDesync { timeout }),
        }
    }

    async fn forward_feed(
        &self,
        feed: &mut FeedStream,
        dispatcher: &EventDispatcher,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let mut phases = self.control.subscribe();
        if self.control.is_shutting_down() {
            return Ok(());
        }

        loop {
            tokio::select! {
                _ = cancel.cancelled() => return Ok(()),
                _ = phases.recv() => {
                    debug!("shutdown began, stopping membership feed");
                    return Ok(());
                }
                item = feed.next() => match item {
                    Some(Ok(FeedEvent::Synced)) => debug!("membership feed resynced"),
                    Some(Ok(event)) => {
                        dispatcher.dispatch(event);
                    }
                    Some(Err(e)) => warn!(error = %e, "membership feed error"),
                    None => return Err(FeedError::Closed.into()),
                }
            }
        }
    }

    pub async fn run_satellite(&self, cancel: &CancellationToken) {
        let satellite = &self.config.satellite;
        let resync = SatelliteResync::new(
            self.control.clone(),
            satellite.interval,
            satellite.heartbeat_threshold,
        );
        resync.run(cancel.clone()).await;
    }
}
