//! End-to-end supervision scenarios over the in-memory host.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use corral_broker::{BrokerConfig, BrokerError, DescriptorStore};
use corral_enforce::{
    EnforcementConfig, EnforcementEngine, Fault, HostError, RecordingHostControl, SchedState,
};
use corral_supervisor::{Supervisor, SupervisorConfig, SupervisorError};
use corral_types::{
    AssignmentStatus, HostTopology, ProcessId, ResourceKind, ResourceRequirement, UnitId,
};

const TOPOLOGY: &str = r#"
cpus: [0, 1, 2, 3]
priority_bands:
  - name: HIGH
    priority: 80
    capacity: 1
memory_lock:
  block_mb: 64
  blocks: 1
"#;

struct Harness {
    host: Arc<RecordingHostControl>,
    supervisor: Supervisor,
}

fn harness() -> Harness {
    let topology = HostTopology::from_yaml_str(TOPOLOGY).unwrap();
    let store = Arc::new(DescriptorStore::initialize(&topology).unwrap());
    let host = Arc::new(RecordingHostControl::new(0..4));
    let engine = Arc::new(EnforcementEngine::new(
        host.clone(),
        EnforcementConfig::default(),
    ));
    let supervisor = Supervisor::assemble(
        SupervisorConfig {
            liveness_timeout: Duration::from_secs(3),
            sweep_interval: Duration::from_millis(100),
        },
        BrokerConfig::default(),
        store,
        engine,
        host.clone(),
    );
    Harness { host, supervisor }
}

fn units(ids: &[UnitId]) -> BTreeSet<UnitId> {
    ids.iter().copied().collect()
}

#[tokio::test]
async fn subscriber_and_handler_share_the_host() {
    let Harness { host, supervisor } = harness();
    let (a, b, c) = (ProcessId::new(100), ProcessId::new(200), ProcessId::new(300));
    for pid in [a, b, c] {
        host.spawn(pid);
    }

    let first = supervisor
        .register(a, ResourceRequirement::new().cpus(2).priority_in_band("HIGH", 1))
        .await
        .unwrap();
    assert_eq!(
        first.assignment.units,
        units(&[UnitId::cpu(0), UnitId::cpu(1), UnitId::priority(0)])
    );
    let a_state = host.state(a).unwrap();
    assert_eq!(a_state.affinity, BTreeSet::from([0, 1]));
    assert_eq!(a_state.sched, SchedState::fifo(80));

    let second = supervisor
        .register(b, ResourceRequirement::new().cpus(2))
        .await
        .unwrap();
    assert_eq!(
        second.assignment.units,
        units(&[UnitId::cpu(2), UnitId::cpu(3)])
    );

    let err = supervisor
        .register(c, ResourceRequirement::new().cpus(1))
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        SupervisorError::Broker(BrokerError::InsufficientResources {
            kind: ResourceKind::Cpu,
            requested: 1,
            available: 0,
        })
    ));

    let summary = supervisor.deregister(a).await.unwrap();
    assert_eq!(summary.revoked.len(), 1);
    assert_eq!(host.state(a).unwrap().sched, SchedState::normal());

    let third = supervisor
        .register(c, ResourceRequirement::new().cpus(1))
        .await
        .unwrap();
    assert_eq!(third.assignment.units, units(&[UnitId::cpu(0)]));
}

#[tokio::test]
async fn missed_heartbeats_reclaim_units() {
    let Harness { host, supervisor } = harness();
    let (a, b) = (ProcessId::new(100), ProcessId::new(200));
    host.spawn(a);
    host.spawn(b);

    let start = Utc::now();
    let held = supervisor
        .register(a, ResourceRequirement::new().cpus(4).memory_blocks(1))
        .await
        .unwrap()
        .assignment;
    supervisor.heartbeat_at(a, start).unwrap();

    let report = supervisor
        .sweep_at(start + chrono::Duration::seconds(4))
        .await;
    assert_eq!(report.lost, vec![a]);

    let revoked = supervisor.broker().assignment(held.id).await.unwrap();
    assert_eq!(revoked.status, AssignmentStatus::Revoked);
    assert!(supervisor.registration(a).is_none());

    let next = supervisor
        .register(b, ResourceRequirement::new().cpus(4))
        .await
        .unwrap();
    assert_eq!(next.assignment.units.len(), 4);
}

#[tokio::test]
async fn failed_enforcement_rolls_back_and_units_are_reclaimable() {
    let Harness { host, supervisor } = harness();
    let (a, b) = (ProcessId::new(100), ProcessId::new(200));
    host.spawn(a);
    host.spawn(b);
    host.inject(a, Fault::FailScheduling(HostError::Other("EINVAL".into())));

    let err = supervisor
        .register(a, ResourceRequirement::new().cpus(2).priority_slots(1))
        .await
        .unwrap_err();
    assert!(matches!(err, SupervisorError::Broker(BrokerError::Enforcement(_))));
    assert!(supervisor.registration(a).is_none());

    let history = supervisor.broker().assignments().await;
    assert_eq!(history.len(), 1);
    assert_eq!(history[0].status, AssignmentStatus::Released);

    let b_claim = supervisor
        .register(b, ResourceRequirement::new().cpus(2).priority_slots(1))
        .await
        .unwrap();
    assert_eq!(
        b_claim.assignment.units,
        units(&[UnitId::cpu(0), UnitId::cpu(1), UnitId::priority(0)])
    );
}

#[tokio::test]
async fn crashed_process_is_reclaimed_before_timeout() {
    let Harness { host, supervisor } = harness();
    let a = ProcessId::new(100);
    host.spawn(a);

    supervisor
        .register(a, ResourceRequirement::new().cpus(1))
        .await
        .unwrap();
    host.exit(a);

    let report = supervisor.sweep().await;
    assert_eq!(report.lost, vec![a]);
    assert!(supervisor.broker().assignments_for(a).await.is_empty());
}
