//! Broker failure chaos tests.
//!
//! Tests that the harness sees the expected outage and recovery when broker
//! processes are killed, terminated or frozen:
//! - Leader kill with an extended restart delay
//! - Graceful leader restart
//! - Leader freeze and thaw
//! - Whole-cluster crash and restart

use std::time::Duration;
use tokio::time::sleep;

use kafka_ha_core::{
    BackoffPolicy, ConsistencyChecker, ContinuousWriteSession, ReplicaId, Scenario, SignalKind,
    Step, TolerancePolicy,
};

use super::{
    assert_passed, assert_stalled_at, components, harness_config, simulated, wedged_after_fault,
    TOPIC,
};

#[tokio::test(start_paused = true)]
async fn chaos_kill_leader_scenario_passes() {
    let (orchestrator, _cluster) = simulated(&harness_config());
    let report = orchestrator.run(Scenario::KillLeader).await;
    assert_passed(&report);

    let baseline = report.baseline.as_ref().unwrap();
    assert_eq!(baseline.leader, Some(ReplicaId(100)));
    assert!(report.steps.iter().any(|s| s.step == Step::OutageCheck && s.passed));
    assert!(report.steps.iter().any(|s| s.step == Step::Release && s.passed));

    // The outage produced failed sends, but none silently
    let writes = report.write_report.as_ref().unwrap();
    assert!(writes.counted_send_errors() > 0);
    assert!(writes.counted_send_errors() <= 100);
}

#[tokio::test(start_paused = true)]
async fn chaos_restart_leader_scenario_passes() {
    let (orchestrator, _cluster) = simulated(&harness_config());
    let report = orchestrator.run(Scenario::RestartLeader).await;
    assert_passed(&report);
    assert!(report.steps.iter().any(|s| s.step == Step::ProgressCheck));
}

#[tokio::test(start_paused = true)]
async fn chaos_freeze_leader_scenario_passes() {
    let (orchestrator, cluster) = simulated(&harness_config());
    let report = orchestrator.run(Scenario::FreezeLeader).await;
    assert_passed(&report);

    let revert = report.steps.iter().find(|s| s.step == Step::Revert).unwrap();
    assert!(revert.detail.as_deref().unwrap_or_default().contains("SIGSTOP"));
    assert!(cluster.is_healthy(ReplicaId(100)));
}

#[tokio::test(start_paused = true)]
async fn chaos_full_cluster_crash_scenario_passes() {
    let (orchestrator, _cluster) = simulated(&harness_config());
    let report = orchestrator.run(Scenario::FullClusterCrash).await;
    assert_passed(&report);

    let writes = report.write_report.as_ref().unwrap();
    let mut acked = writes.acked_sequences.clone();
    acked.dedup();
    assert_eq!(acked.len(), writes.acked_sequences.len());
}

#[tokio::test(start_paused = true)]
async fn chaos_full_cluster_restart_scenario_passes() {
    let (orchestrator, _cluster) = simulated(&harness_config());
    let report = orchestrator.run(Scenario::FullClusterRestart).await;
    assert_passed(&report);
}

/// Baseline ISR {100,101,102} with leader 100; SIGKILL to 100. After the
/// reelection window the ISR is {101,102} and the leader one of them; after
/// the recovery window the ISR is whole and the last partition has grown.
#[tokio::test(start_paused = true)]
async fn chaos_kill_leader_isr_shrinks_then_recovers() {
    let config = harness_config();
    let (cluster, observer, injector) = components(&config);

    let mut writes = ContinuousWriteSession::new(TOPIC, config.writes.clone(), cluster.clone());
    writes.start().unwrap();
    sleep(Duration::from_secs(5)).await;

    let baseline = observer.describe_topic(TOPIC, None).await.unwrap();
    assert_eq!(baseline.in_sync_replicas, ReplicaId::set([100, 101, 102]));
    assert_eq!(baseline.leader, Some(ReplicaId(100)));
    let initial = observer.read_offsets(TOPIC, None).await.unwrap();

    let mut backoff = injector.set_restart_backoff(BackoffPolicy::Extend).await.unwrap();
    let leader = injector.unit_for(ReplicaId(100)).await.unwrap();
    let _kill = injector.send_signal(&leader, SignalKind::Kill).await.unwrap();

    sleep(config.timings.reelection()).await;
    let outage = observer.describe_topic(TOPIC, None).await.unwrap();
    assert_eq!(outage.in_sync_replicas, ReplicaId::set([101, 102]));
    assert!(matches!(outage.leader, Some(ReplicaId(101)) | Some(ReplicaId(102))));

    sleep(config.timings.restart_delay() * 2).await;
    let recovered = observer.describe_topic(TOPIC, None).await.unwrap();
    assert_eq!(recovered.in_sync_replicas, ReplicaId::set([100, 101, 102]));
    assert!(recovered.leader.is_some());

    let next = observer.read_offsets(TOPIC, None).await.unwrap();
    assert!(next.last() > initial.last());

    let report = writes.stop().await.unwrap();
    kafka_ha_core::fault::release_all(&mut backoff).await;
    let result = ConsistencyChecker::default().check(&report, &initial, &next);
    assert!(result.passed, "{:?}", result.violations);
}

/// SIGKILL to all three brokers at once. After the restart window the ISR
/// is whole, offsets resume and no acked sequence repeats.
#[tokio::test(start_paused = true)]
async fn chaos_full_cluster_kill_recovers_without_repeats() {
    let config = harness_config();
    let (cluster, observer, injector) = components(&config);

    let mut writes = ContinuousWriteSession::new(TOPIC, config.writes.clone(), cluster.clone());
    writes.start().unwrap();
    sleep(Duration::from_secs(10)).await;
    let initial = observer.read_offsets(TOPIC, None).await.unwrap();

    let mut backoff = injector.set_restart_backoff(BackoffPolicy::Extend).await.unwrap();
    let units = injector.units().await.unwrap();
    let handles = injector
        .send_signal_all(&units, SignalKind::Kill, config.timings.dispatch_timeout())
        .await
        .unwrap();
    assert_eq!(handles.len(), 3);

    // Nobody is left to answer until the supervisor restarts the brokers
    sleep(Duration::from_secs(20)).await;
    assert!(observer.read_offsets(TOPIC, None).await.is_err());

    sleep(config.timings.restart_delay() * 2).await;
    let recovered = observer.describe_topic(TOPIC, None).await.unwrap();
    assert_eq!(recovered.in_sync_replicas, ReplicaId::set([100, 101, 102]));

    sleep(config.timings.client_timeout()).await;
    let next = observer.read_offsets(TOPIC, None).await.unwrap();
    assert!(next.last() > initial.last());

    let report = writes.stop().await.unwrap();
    kafka_ha_core::fault::release_all(&mut backoff).await;
    let result = ConsistencyChecker::default().check(&report, &initial, &next);
    assert!(result.passed, "{:?}", result.violations);
    assert!(!result
        .violations
        .iter()
        .any(|v| v.invariant() == "duplicate_ack"));
}

#[tokio::test(start_paused = true)]
async fn chaos_strict_tolerance_fails_kill_leader_at_consistency() {
    let mut config = harness_config();
    config.checker = TolerancePolicy::strict();
    let (orchestrator, _cluster) = simulated(&config);

    let report = orchestrator.run(Scenario::KillLeader).await;
    assert!(!report.passed);
    assert_eq!(report.failed_step, Some(Step::Consistency));
    let consistency = report.consistency.as_ref().unwrap();
    assert!(consistency
        .violations
        .iter()
        .any(|v| v.invariant() == "send_errors_exceeded"));
    // The write report survives for postmortem
    assert!(report.write_report.is_some());
}

#[tokio::test(start_paused = true)]
async fn chaos_failed_freeze_still_thaws_the_leader() {
    let mut config = harness_config();
    // Brokers never notice the frozen leader within the reelection window
    config.simulation.failure_detection_ms = 600_000;
    let (orchestrator, cluster) = simulated(&config);

    let report = orchestrator.run(Scenario::FreezeLeader).await;
    assert!(!report.passed);
    assert_eq!(report.failed_step, Some(Step::OutageCheck));
    assert!(report.error.as_deref().unwrap().contains("isr_mismatch"));

    let last = report.last_description.as_ref().unwrap();
    assert_eq!(last.in_sync_replicas, ReplicaId::set([100, 101, 102]));

    // SIGCONT was delivered on the way out
    assert!(cluster.is_healthy(ReplicaId(100)));
    assert!(report.steps.iter().any(|s| s.step == Step::Release && s.passed));
}

#[tokio::test(start_paused = true)]
async fn chaos_signal_to_dead_process_fails_the_step() {
    let config = harness_config();
    let (_cluster, _observer, injector) = components(&config);
    let unit = injector.unit_for(ReplicaId(101)).await.unwrap();

    injector.send_signal(&unit, SignalKind::Kill).await.unwrap();
    let err = injector
        .send_signal(&unit, SignalKind::Kill)
        .await
        .unwrap_err();
    assert!(matches!(err, kafka_ha_core::Error::DeliveryFailed { .. }));
}

/// Records acked between the baseline and the fault must not pass for
/// writes resuming afterwards.
#[tokio::test(start_paused = true)]
async fn chaos_writes_that_never_resume_fail_the_scenario() {
    let cases = [
        (Scenario::KillLeader, Step::RecoveryCheck),
        (Scenario::RestartLeader, Step::ProgressCheck),
        (Scenario::FreezeLeader, Step::ProgressCheck),
        (Scenario::FullClusterCrash, Step::ProgressCheck),
        (Scenario::FullClusterRestart, Step::ProgressCheck),
    ];
    for (scenario, step) in cases {
        let orchestrator = wedged_after_fault(&harness_config());
        let report = orchestrator.run(scenario).await;
        assert_stalled_at(&report, step);
    }
}
