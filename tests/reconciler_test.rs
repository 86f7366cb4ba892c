//! Membership reconciler integration tests against the simulated admin
//! interface.

use proxysql_agent::admin::{statements, AdminFault, SimulatedAdmin, TopologyRow};
use proxysql_agent::control::{ControlPlane, ShutdownPhase};
use proxysql_agent::error::AgentError;
use proxysql_agent::membership::{
    ChannelSource, EventDispatcher, FeedEvent, Member, MemberPhase, MemberRole, MemberSelector,
    Reconciler, WatermarkLoop, WatermarkStore,
};
use proxysql_agent::membership::watermark::WatermarkOutcome;
use std::sync::Arc;
use std::time::Duration;

const PORT: u16 = 6032;

fn setup(identity: &str) -> (SimulatedAdmin, Arc<ControlPlane>, Reconciler) {
    let admin = SimulatedAdmin::with_placeholder(PORT);
    let control = Arc::new(ControlPlane::new(Arc::new(admin.clone())));
    let reconciler = Reconciler::new(control.clone(), identity, PORT);
    (admin, control, reconciler)
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

fn row(address: &str, name: &str) -> TopologyRow {
    TopologyRow {
        hostname: address.to_string(),
        port: PORT,
        weight: 0,
        comment: name.to_string(),
    }
}

fn expected_join(address: &str, name: &str) -> Vec<String> {
    let mut expected = vec![
        statements::delete_placeholder(),
        statements::replace_server(address, PORT, 0, name),
    ];
    expected.extend(statements::RUNTIME_LOADS.iter().map(|s| s.to_string()));
    expected
}

#[tokio::test]
async fn test_pending_to_running_registers_member() {
    let (admin, _, reconciler) = setup("m1");

    reconciler
        .on_member_transition(
            &core("m1", "10.0.0.5", MemberPhase::Pending),
            &core("m1", "10.0.0.5", MemberPhase::Running),
        )
        .await
        .unwrap();

    assert_eq!(admin.statements(), expected_join("10.0.0.5", "m1"));
    assert_eq!(admin.rows(), vec![row("10.0.0.5", "m1")]);
    assert!(!admin.has_placeholder());
    assert_eq!(admin.runtime_rows(), vec![row("10.0.0.5", "m1")]);
}

#[tokio::test]
async fn test_join_is_idempotent() {
    let (admin, _, reconciler) = setup("m1");
    let m1 = core("m1", "10.0.0.5", MemberPhase::Running);

    reconciler.join(&m1).await.unwrap();
    let once = admin.rows();
    reconciler.join(&m1).await.unwrap();

    assert_eq!(admin.rows(), once);
    assert_eq!(admin.rows().len(), 1);
}

#[tokio::test]
async fn test_join_commutes() {
    let a = core("m1", "10.0.0.5", MemberPhase::Running);
    let b = core("m2", "10.0.0.6", MemberPhase::Running);

    let (first, _, reconciler) = setup("m1");
    reconciler.join(&a).await.unwrap();
    reconciler.join(&b).await.unwrap();

    let (second, _, reconciler) = setup("m1");
    reconciler.join(&b).await.unwrap();
    reconciler.join(&a).await.unwrap();

    assert_eq!(first.rows(), second.rows());
    assert_eq!(first.runtime_rows(), second.runtime_rows());
}

#[tokio::test]
async fn test_placeholder_tracks_core_count() {
    let (admin, _, reconciler) = setup("m1");
    let a = core("m1", "10.0.0.5", MemberPhase::Running);
    let b = core("m2", "10.0.0.6", MemberPhase::Running);
    let failed = |m: &Member| Member {
        phase: MemberPhase::Failed,
        ..m.clone()
    };

    assert!(admin.has_placeholder());
    reconciler.join(&a).await.unwrap();
    reconciler.join(&b).await.unwrap();
    assert!(!admin.has_placeholder());

    reconciler.on_member_transition(&a, &failed(&a)).await.unwrap();
    assert!(!admin.has_placeholder());
    assert_eq!(admin.core_rows(), vec![row("10.0.0.6", "m2")]);

    reconciler.on_member_transition(&b, &failed(&b)).await.unwrap();
    assert!(admin.has_placeholder());
    assert!(admin.core_rows().is_empty());
}

#[tokio::test]
async fn test_irrelevant_transitions_ignored() {
    let (admin, _, reconciler) = setup("m1");
    let pairs = [
        (MemberPhase::Running, MemberPhase::Running),
        (MemberPhase::Pending, MemberPhase::Failed),
        (MemberPhase::Running, MemberPhase::Succeeded),
        (MemberPhase::Unknown, MemberPhase::Running),
    ];
    for (old, new) in pairs {
        reconciler
            .on_member_transition(&core("m1", "10.0.0.5", old), &core("m1", "10.0.0.5", new))
            .await
            .unwrap();
    }
    assert!(admin.statements().is_empty());
}

#[tokio::test]
async fn test_failed_command_aborts_and_names_command() {
    let (admin, _, reconciler) = setup("m1");
    admin.inject(AdminFault::FailStatement(
        "LOAD MYSQL VARIABLES TO RUNTIME".to_string(),
    ));

    let err = reconciler
        .join(&core("m1", "10.0.0.5", MemberPhase::Running))
        .await
        .unwrap_err();

    match &err {
        AgentError::Command { command, .. } => {
            assert_eq!(command, "LOAD MYSQL VARIABLES TO RUNTIME")
        }
        other => panic!("unexpected error: {:?}", other),
    }
    assert!(err
        .to_string()
        .starts_with("failed to execute command 'LOAD MYSQL VARIABLES TO RUNTIME': "));
    // Steps after the failure never ran
    assert_eq!(admin.statement_count("LOAD MYSQL SERVERS TO RUNTIME"), 0);
    assert_eq!(admin.statements().len(), 4);
}

#[tokio::test]
async fn test_observed_only_registers_self() {
    let (admin, _, reconciler) = setup("m1");

    reconciler
        .on_member_observed(&core("m2", "10.0.0.6", MemberPhase::Running))
        .await
        .unwrap();
    assert!(admin.queries().is_empty());

    reconciler
        .on_member_observed(&core("m1", "10.0.0.5", MemberPhase::Running))
        .await
        .unwrap();
    assert_eq!(admin.rows(), vec![row("10.0.0.5", "m1")]);
}

#[tokio::test]
async fn test_observed_without_address_is_deferred() {
    let (admin, _, reconciler) = setup("m1");
    reconciler
        .on_member_observed(&core("m1", "", MemberPhase::Pending))
        .await
        .unwrap();
    assert!(admin.queries().is_empty());
    assert!(admin.has_placeholder());
}

#[tokio::test(start_paused = true)]
async fn test_join_abandoned_when_draining_starts() {
    let (admin, control, reconciler) = setup("m1");
    admin.set_latency(Duration::from_millis(100));

    let drain = {
        let control = control.clone();
        tokio::spawn(async move {
            // Lands between the second and third command
            tokio::time::sleep(Duration::from_millis(150)).await;
            control.advance(ShutdownPhase::Draining);
        })
    };

    reconciler
        .join(&core("m1", "10.0.0.5", MemberPhase::Running))
        .await
        .unwrap();
    drain.await.unwrap();

    assert_eq!(
        admin.statements(),
        vec![
            statements::delete_placeholder(),
            statements::replace_server("10.0.0.5", PORT, 0, "m1"),
        ]
    );
}

#[tokio::test]
async fn test_dispatcher_serializes_feed_events() {
    let (admin, _, reconciler) = setup("m1");
    let dispatcher = EventDispatcher::spawn(Arc::new(reconciler));

    let m1 = core("m1", "10.0.0.5", MemberPhase::Running);
    dispatcher.dispatch(FeedEvent::Observed(m1.clone()));
    dispatcher.dispatch(FeedEvent::Synced);
    dispatcher.dispatch(FeedEvent::Transitioned {
        old: m1.clone(),
        new: Member {
            phase: MemberPhase::Failed,
            ..m1.clone()
        },
    });
    dispatcher.flush().await;

    assert!(admin.has_placeholder());
    assert!(admin.core_rows().is_empty());
    dispatcher.shutdown().await;
}

#[tokio::test]
async fn test_watermark_loop_rebuilds_then_skips() {
    let dir = tempfile::tempdir().unwrap();
    let admin = SimulatedAdmin::with_placeholder(PORT);
    let control = Arc::new(ControlPlane::new(Arc::new(admin.clone())));
    let source = Arc::new(ChannelSource::new());
    source.set_members(vec![
        core("m2", "10.0.0.6", MemberPhase::Running),
        core("m1", "10.0.0.5", MemberPhase::Running),
    ]);

    let watermark = WatermarkLoop::new(
        control,
        source.clone(),
        MemberSelector::default(),
        WatermarkStore::new(dir.path().join("pods-cs.txt")),
        PORT,
        Duration::from_secs(10),
    );

    watermark.reconcile_once().await.unwrap();
    let mut expected = vec![
        statements::CLEAR_SERVERS.to_string(),
        statements::replace_server("10.0.0.5", PORT, 0, "m1"),
        statements::replace_server("10.0.0.6", PORT, 0, "m2"),
    ];
    expected.extend(statements::RUNTIME_LOADS.iter().map(|s| s.to_string()));
    assert_eq!(admin.statements(), expected);
    assert!(dir.path().join("pods-cs.txt").exists());

    admin.clear_log();
    watermark.reconcile_once().await.unwrap();
    assert_eq!(admin.statements(), vec![statements::LOAD_SERVERS_TO_RUNTIME.to_string()]);

    admin.clear_log();
    source.set_members(Vec::new());
    watermark.reconcile_once().await.unwrap();
    assert!(admin.statements().is_empty());
}

#[tokio::test]
async fn test_watermark_loop_follows_phase_at_stable_address() {
    let dir = tempfile::tempdir().unwrap();
    let admin = SimulatedAdmin::with_placeholder(PORT);
    let control = Arc::new(ControlPlane::new(Arc::new(admin.clone())));
    let source = Arc::new(ChannelSource::new());

    let watermark = WatermarkLoop::new(
        control,
        source.clone(),
        MemberSelector::default(),
        WatermarkStore::new(dir.path().join("pods-cs.txt")),
        PORT,
        Duration::from_secs(10),
    );

    source.set_members(vec![core("m1", "10.0.0.5", MemberPhase::Pending)]);
    assert_eq!(watermark.reconcile_once().await.unwrap(), WatermarkOutcome::Rebuilt(0));
    assert!(admin.has_placeholder());
    assert!(admin.core_rows().is_empty());

    source.set_members(vec![core("m1", "10.0.0.5", MemberPhase::Running)]);
    assert_eq!(watermark.reconcile_once().await.unwrap(), WatermarkOutcome::Rebuilt(1));
    assert_eq!(admin.core_rows(), vec![row("10.0.0.5", "m1")]);
    assert!(!admin.has_placeholder());
    assert_eq!(admin.runtime_rows(), vec![row("10.0.0.5", "m1")]);

    assert_eq!(watermark.reconcile_once().await.unwrap(), WatermarkOutcome::Unchanged);

    source.set_members(vec![core("m1", "10.0.0.5", MemberPhase::Failed)]);
    assert_eq!(watermark.reconcile_once().await.unwrap(), WatermarkOutcome::Rebuilt(0));
    assert!(admin.core_rows().is_empty());
    assert!(admin.has_placeholder());
}
