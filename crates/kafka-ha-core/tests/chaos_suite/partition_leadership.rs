//! Partition leadership chaos tests.
//!
//! Tests for leadership movement and the write stream across it:
//! - Pod reschedule moves leadership and the unit gets a new address
//! - The full catalogue runs back to back on one cluster
//! - The write stream stays gap-accounted through injected ack failures

use std::time::Duration;
use tokio::time::sleep;

use kafka_ha_core::{
    ConsistencyChecker, ContinuousWriteSession, ReplicaId, Scenario, Step, TolerancePolicy,
    UnitRef,
};

use super::{
    assert_passed, assert_stalled_at, components, harness_config, simulated, wedged_after_fault,
    TOPIC,
};

#[tokio::test(start_paused = true)]
async fn chaos_pod_reschedule_scenario_passes() {
    let (orchestrator, _cluster) = simulated(&harness_config());
    let report = orchestrator.run(Scenario::PodReschedule).await;
    assert_passed(&report);

    let baseline = report.baseline.as_ref().unwrap().leader;
    let last = report.last_description.as_ref().unwrap().leader;
    assert_ne!(baseline, last);

    // Names are refreshed before the progress window
    let revert = report.steps.iter().position(|s| s.step == Step::Revert).unwrap();
    let progress = report
        .steps
        .iter()
        .position(|s| s.step == Step::ProgressCheck)
        .unwrap();
    assert!(revert < progress);
}

#[tokio::test(start_paused = true)]
async fn chaos_deleted_unit_comes_back_with_new_address() {
    let config = harness_config();
    let (cluster, observer, injector) = components(&config);
    let unit = UnitRef::new("kafka-k8s", 0);

    let before = injector
        .directory()
        .addresses(cluster.as_ref())
        .await
        .unwrap();
    assert!(injector.directory().is_cached());

    let mut handle = injector.delete_unit(&unit).await.unwrap();
    assert!(!injector.directory().is_cached());

    let moved = observer.describe_topic(TOPIC, None).await.unwrap();
    assert_eq!(moved.leader, Some(ReplicaId(101)));

    sleep(config.timings.reschedule()).await;
    handle.release().await.unwrap();

    let after = injector
        .directory()
        .addresses(cluster.as_ref())
        .await
        .unwrap();
    assert_ne!(before.get(&unit), after.get(&unit));
    assert_eq!(
        before.get(&UnitRef::new("kafka-k8s", 1)),
        after.get(&UnitRef::new("kafka-k8s", 1))
    );
}

#[tokio::test(start_paused = true)]
async fn chaos_full_catalogue_runs_back_to_back() {
    let (orchestrator, _cluster) = simulated(&harness_config());
    let reports = orchestrator.run_all(&Scenario::ALL).await;

    assert_eq!(reports.len(), Scenario::ALL.len());
    for report in &reports {
        assert_passed(report);
    }
}

#[tokio::test(start_paused = true)]
async fn chaos_retried_acks_leave_duplicates_in_log() {
    let config = harness_config();
    let (cluster, observer, _injector) = components(&config);
    cluster.inject_publish_failures(2);

    let initial = observer.read_offsets(TOPIC, None).await.unwrap();
    let mut writes = ContinuousWriteSession::new(TOPIC, config.writes.clone(), cluster.clone());
    writes.start().unwrap();
    sleep(Duration::from_secs(2)).await;
    let report = writes.stop().await.unwrap();

    // Sequence 0 was appended on every attempt but acked only once
    assert_eq!(report.first_acked_sequence, Some(0));
    assert!(report.ack_errors.is_empty());

    let post = observer.read_offsets(TOPIC, None).await.unwrap();
    let log = observer.read_records(TOPIC).await.unwrap();
    assert_eq!(log.iter().filter(|s| **s == 0).count(), 3);

    let lenient = ConsistencyChecker::default();
    assert!(lenient
        .check_with_read_back(&report, &initial, &post, &log)
        .passed);

    let strict = ConsistencyChecker::new(TolerancePolicy::strict());
    let result = strict.check_with_read_back(&report, &initial, &post, &log);
    assert_eq!(result.violations.len(), 1);
    assert_eq!(result.violations[0].invariant(), "duplicate_in_log");
}

#[tokio::test(start_paused = true)]
async fn chaos_read_back_audit_passes_for_scenario() {
    let (orchestrator, _cluster) = simulated(&harness_config());
    let orchestrator = orchestrator.with_read_back(true);
    let report = orchestrator.run(Scenario::RestartLeader).await;
    assert_passed(&report);
}

#[tokio::test(start_paused = true)]
async fn chaos_pod_reschedule_without_resumed_writes_fails() {
    let orchestrator = wedged_after_fault(&harness_config());
    let report = orchestrator.run(Scenario::PodReschedule).await;
    assert_stalled_at(&report, Step::ProgressCheck);

    // Offsets for the progress check are taken after the names were refreshed
    let resumed_at = report
        .steps
        .iter()
        .position(|s| s.step == Step::ResumeOffsets)
        .unwrap();
    let revert_at = report.steps.iter().position(|s| s.step == Step::Revert).unwrap();
    assert!(revert_at < resumed_at);
}
