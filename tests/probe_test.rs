//! Health probe integration tests.

use proxysql_agent::admin::{statements, AdminFault, SimulatedAdmin};
use proxysql_agent::control::{ControlPlane, ShutdownPhase};
use proxysql_agent::error::AgentError;
use proxysql_agent::probe::{HealthProbes, ProbeKind, ProbeStatus};
use std::sync::Arc;
use tempfile::TempDir;

struct Fixture {
    admin: SimulatedAdmin,
    control: Arc<ControlPlane>,
    probes: HealthProbes,
    dir: TempDir,
}

fn fixture() -> Fixture {
    let dir = tempfile::tempdir().unwrap();
    let admin = SimulatedAdmin::with_placeholder(6032);
    let control = Arc::new(ControlPlane::new(Arc::new(admin.clone())));
    let probes = HealthProbes::new(control.clone(), dir.path().join("draining"));
    Fixture {
        admin,
        control,
        probes,
        dir,
    }
}

impl Fixture {
    fn set_draining(&self, draining: bool) {
        let path = self.dir.path().join("draining");
        if draining {
            std::fs::write(path, b"").unwrap();
        } else {
            let _ = std::fs::remove_file(path);
        }
    }
}

#[tokio::test]
async fn test_classification_table() {
    let cases = [
        ((3, 3), false, ProbeStatus::Ok, "all backends online"),
        ((3, 3), true, ProbeStatus::Ok, "all backends online"),
        ((3, 0), false, ProbeStatus::Unhealthy, "all backends offline"),
        ((3, 0), true, ProbeStatus::Unhealthy, "all backends offline"),
        ((3, 2), false, ProbeStatus::Ok, "some backends offline"),
        ((3, 2), true, ProbeStatus::Draining, "draining traffic"),
    ];

    let f = fixture();
    for ((total, online), draining, status, message) in cases {
        f.admin.set_backends(total, online, total - online);
        f.set_draining(draining);

        let result = f.probes.run_probes().await.unwrap();
        assert_eq!(result.status, status, "{}/{} draining={}", online, total, draining);
        assert_eq!(result.message, message);
        assert_eq!(result.draining, draining);
        assert_eq!(result.backends.total, total);
        assert_eq!(result.backends.shunned, total - online);
    }
}

#[tokio::test]
async fn test_readiness_and_liveness_verdicts() {
    let f = fixture();

    f.admin.set_backends(3, 3, 0);
    assert!(f.probes.readiness().await.unwrap().passing);
    assert!(f.probes.liveness().await.unwrap().passing);

    f.admin.set_backends(3, 2, 0);
    f.set_draining(true);
    let ready = f.probes.readiness().await.unwrap();
    let live = f.probes.liveness().await.unwrap();
    assert!(!ready.passing);
    assert!(live.passing);
    assert_eq!(ready.result.probe, Some(ProbeKind::Readiness));
    assert_eq!(live.result.probe, Some(ProbeKind::Liveness));

    f.admin.set_backends(3, 0, 3);
    assert!(!f.probes.readiness().await.unwrap().passing);
    assert!(!f.probes.liveness().await.unwrap().passing);
}

#[tokio::test]
async fn test_not_running_issues_no_queries() {
    let f = fixture();
    f.admin.set_backends(3, 3, 0);
    f.control.advance(ShutdownPhase::Draining);

    let result = f.probes.run_probes().await.unwrap();
    assert_eq!(result.status, ProbeStatus::Draining);
    assert_eq!(result.message, "shutting down");
    assert!(result.draining);
    assert_eq!(result.backends.total, 0);
    assert!(f.admin.queries().is_empty());

    assert!(!f.probes.readiness().await.unwrap().passing);
    assert!(f.probes.liveness().await.unwrap().passing);
    assert!(f.probes.ping().await.is_ok());
}

#[tokio::test]
async fn test_query_failure_is_an_error_not_unhealthy() {
    let f = fixture();
    f.admin.set_backends(3, 3, 0);
    f.admin.inject(AdminFault::FailQuery(
        statements::COUNT_ONLINE_BACKENDS.to_string(),
    ));

    let err = f.probes.run_probes().await.unwrap_err();
    match err {
        AgentError::Probe { query, .. } => assert_eq!(query, statements::COUNT_ONLINE_BACKENDS),
        other => panic!("unexpected error: {:?}", other),
    }
    assert!(f.probes.readiness().await.is_err());
}

#[tokio::test]
async fn test_startup_ping() {
    let f = fixture();
    let verdict = f.probes.startup().await.unwrap();
    assert!(verdict.passing);
    assert_eq!(verdict.result.probe, Some(ProbeKind::Startup));

    f.admin.inject(AdminFault::FailPing);
    assert!(matches!(
        f.probes.startup().await,
        Err(AgentError::Connection(_))
    ));
}

#[tokio::test]
async fn test_clients_reported() {
    let f = fixture();
    f.admin.set_backends(1, 1, 0);
    f.admin.set_clients(Some(7));
    assert_eq!(f.probes.run_probes().await.unwrap().clients, Some(7));

    f.admin.set_clients(None);
    assert_eq!(f.probes.run_probes().await.unwrap().clients, None);
}
