//! ProxySQL cluster agent
//!
//! ## Environment Variables
//!
//! | Variable | Default | Description |
//! |----------|---------|-------------|
//! | AGENT_CONFIG_FILE | /etc/proxysql-agent/config.toml | Config file path |
//! | AGENT_RUN_MODE | (none) | `core` or `satellite` |
//! | AGENT_PROXYSQL_ADDRESS | 127.0.0.1:6032 | Admin interface |
//! | AGENT_API_PORT | 8080 | Probe endpoint port |
//! | AGENT_LOG_LEVEL | INFO | DEBUG, INFO, WARN or ERROR |
//!
//! Every config key has an `AGENT_*` override; see `config.rs`.

use proxysql_agent::admin::MysqlAdmin;
use proxysql_agent::api::ApiServer;
use proxysql_agent::config::{AgentConfig, RunMode};
use proxysql_agent::membership::MemberSource;
use proxysql_agent::observability::init_logging;
use proxysql_agent::shutdown::listen_for_signals;
use proxysql_agent::Agent;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let config = AgentConfig::load()?;
    init_logging(&config.log);

    let Some(mode) = config.run_mode else {
        info!("no run mode specified, exiting");
        return Ok(());
    };

    if config.start_delay > 0 {
        info!(seconds = config.start_delay, "delaying start");
        tokio::time::sleep(Duration::from_secs(config.start_delay)).await;
    }

    let admin = MysqlAdmin::connect(&config.proxysql).await?;
    let agent = Agent::new(config.clone(), Arc::new(admin))?;

    let api = ApiServer::new(
        agent.probes(),
        agent.orchestrator(),
        config.shutdown.transport_timeout,
    )
    .start(&format!("0.0.0.0:{}", config.api.port))
    .await?;
    agent.orchestrator().register_transport(api.clone());

    let cancel = CancellationToken::new();
    {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            if let Err(e) = listen_for_signals(cancel).await {
                error!(error = %e, "failed to install signal handlers");
            }
        });
    }

    let source = membership_source(mode).await?;
    let result = agent.run(mode, source, cancel).await;

    // Let a pending /shutdown caller receive its response
    api.wait_for_connections(Duration::from_secs(1)).await;

    match result {
        Ok(()) => {
            info!("agent stopped");
            Ok(())
        }
        Err(e) => {
            error!(error = %e, "agent failed");
            Err(e.into())
        }
    }
}

#[cfg(feature = "kubernetes")]
async fn membership_source(
    mode: RunMode,
) -> Result<Option<Arc<dyn MemberSource>>, Box<dyn std::error::Error>> {
    use proxysql_agent::membership::kube::KubeSource;

    match mode {
        RunMode::Core => Ok(Some(Arc::new(KubeSource::try_default().await?))),
        RunMode::Satellite => Ok(None),
    }
}

#[cfg(not(feature = "kubernetes"))]
async fn membership_source(
    mode: RunMode,
) -> Result<Option<Arc<dyn MemberSource>>, Box<dyn std::error::Error>> {
    if mode == RunMode::Core {
        error!("core mode needs the kubernetes feature");
    }
    Ok(None)
}
