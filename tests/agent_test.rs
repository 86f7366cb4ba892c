//! End-to-end agent run loop tests with a channel-backed membership feed.

use proxysql_agent::admin::{statements, SimulatedAdmin, TopologyRow};
use proxysql_agent::config::{AgentConfig, CoreMode, RunMode};
use proxysql_agent::control::ShutdownPhase;
use proxysql_agent::error::AgentError;
use proxysql_agent::membership::{ChannelSource, FeedEvent, Member, MemberPhase, MemberRole};
use proxysql_agent::Agent;
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use tokio_util::sync::CancellationToken;

fn config(dir: &TempDir) -> AgentConfig {
    let mut config = AgentConfig {
        identity: Some("m1".to_string()),
        ..AgentConfig::default()
    };
    config.shutdown.draining_file = dir.path().join("draining");
    config.core.watermark_file = dir.path().join("pods-cs.txt");
    config
}

fn core(name: &str, address: &str, phase: MemberPhase) -> Member {
    Member {
        address: address.to_string(),
        name: name.to_string(),
        uid: format!("uid-{}", name),
        role: MemberRole::Primary,
        phase,
    }
}

async fn wait_for(mut check: impl FnMut() -> bool) {
    for _ in 0..200 {
        if check() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("condition not reached");
}

#[tokio::test]
async fn test_watch_mode_registers_then_shuts_down_on_cancel() {
    let dir = tempfile::tempdir().unwrap();
    let admin = SimulatedAdmin::with_placeholder(6032);
    let agent = Arc::new(Agent::new(config(&dir), Arc::new(admin.clone())).unwrap());
    let source = Arc::new(ChannelSource::new());

    source.send(FeedEvent::Observed(core("m1", "10.0.0.5", MemberPhase::Running)));
    source.send(FeedEvent::Synced);

    let cancel = CancellationToken::new();
    let run = {
        let agent = agent.clone();
        let source = source.clone();
        let cancel = cancel.clone();
        tokio::spawn(async move { agent.run(RunMode::Core, Some(source), cancel).await })
    };

    wait_for(|| admin.core_rows().len() == 1).await;
    assert!(!admin.has_placeholder());

    source.send(FeedEvent::Transitioned {
        old: core("m2", "10.0.0.6", MemberPhase::Pending),
        new: core("m2", "10.0.0.6", MemberPhase::Running),
    });
    wait_for(|| admin.core_rows().len() == 2).await;

    cancel.cancel();
    run.await.unwrap().unwrap();

    assert_eq!(agent.control().phase(), ShutdownPhase::Stopped);
    assert!(admin.is_paused());
    assert!(admin.is_shut_down());
    assert!(dir.path().join("draining").exists());
}

#[tokio::test(start_paused = true)]
async fn test_missing_sync_is_a_startup_failure() {
    let dir = tempfile::tempdir().unwrap();
    let admin = SimulatedAdmin::with_placeholder(6032);
    let mut config = config(&dir);
    config.core.sync_timeout = Duration::from_secs(5);
    let agent = Agent::new(config, Arc::new(admin.clone())).unwrap();

    let source = Arc::new(ChannelSource::new());
    source.send(FeedEvent::Observed(core("m1", "10.0.0.5", MemberPhase::Running)));

    let err = agent
        .run(RunMode::Core, Some(source), CancellationToken::new())
        .await
        .unwrap_err();

    assert!(matches!(err, AgentError::FeedDesync { timeout } if timeout == Duration::from_secs(5)));
    assert_eq!(agent.control().phase(), ShutdownPhase::Running);
    assert!(!admin.is_shut_down());
}

#[tokio::test]
async fn test_shutdown_elsewhere_ends_watch_loop() {
    let dir = tempfile::tempdir().unwrap();
    let admin = SimulatedAdmin::with_placeholder(6032);
    let agent = Arc::new(Agent::new(config(&dir), Arc::new(admin.clone())).unwrap());
    let source = Arc::new(ChannelSource::new());
    source.send(FeedEvent::Synced);

    let run = {
        let agent = agent.clone();
        let source = source.clone();
        tokio::spawn(async move {
            agent
                .run(RunMode::Core, Some(source), CancellationToken::new())
                .await
        })
    };

    agent
        .orchestrator()
        .begin_shutdown(&CancellationToken::new())
        .await
        .unwrap();
    run.await.unwrap().unwrap();

    assert_eq!(admin.statement_count(statements::SHUTDOWN_SLOW), 1);
    assert_eq!(agent.control().phase(), ShutdownPhase::Stopped);
}

#[tokio::test]
async fn test_poll_mode_rebuilds_from_listing() {
    let dir = tempfile::tempdir().unwrap();
    let admin = SimulatedAdmin::with_placeholder(6032);
    let mut config = config(&dir);
    config.core.mode = CoreMode::Poll;
    let agent = Arc::new(Agent::new(config, Arc::new(admin.clone())).unwrap());

    let source = Arc::new(ChannelSource::new());
    source.set_members(vec![core("m1", "10.0.0.5", MemberPhase::Running)]);

    let cancel = CancellationToken::new();
    let run = {
        let agent = agent.clone();
        let cancel = cancel.clone();
        tokio::spawn(async move { agent.run(RunMode::Core, Some(source), cancel).await })
    };

    wait_for(|| {
        admin.runtime_rows()
            == vec![TopologyRow {
                hostname: "10.0.0.5".to_string(),
                port: 6032,
                weight: 0,
                comment: "m1".to_string(),
            }]
    })
    .await;

    cancel.cancel();
    run.await.unwrap().unwrap();
    assert!(admin.is_shut_down());
}

#[tokio::test]
async fn test_satellite_mode_shuts_down_on_cancel() {
    let dir = tempfile::tempdir().unwrap();
    let admin = SimulatedAdmin::with_placeholder(6032);
    admin.set_missing_cores(1);
    let agent = Arc::new(Agent::new(config(&dir), Arc::new(admin.clone())).unwrap());

    let cancel = CancellationToken::new();
    let run = {
        let agent = agent.clone();
        let cancel = cancel.clone();
        tokio::spawn(async move { agent.run(RunMode::Satellite, None, cancel).await })
    };

    // The first tick fires immediately
    wait_for(|| admin.statement_count(statements::LOAD_SERVERS_FROM_CONFIG) == 1).await;

    cancel.cancel();
    run.await.unwrap().unwrap();
    assert_eq!(agent.control().phase(), ShutdownPhase::Stopped);
}

#[tokio::test]
async fn test_core_mode_without_source_fails() {
    let dir = tempfile::tempdir().unwrap();
    let admin = SimulatedAdmin::with_placeholder(6032);
    let agent = Agent::new(config(&dir), Arc::new(admin.clone())).unwrap();

    let err = agent
        .run(RunMode::Core, None, CancellationToken::new())
        .await
        .unwrap_err();
    assert!(matches!(err, AgentError::Feed(_)));
    assert!(!admin.is_shut_down());
}
