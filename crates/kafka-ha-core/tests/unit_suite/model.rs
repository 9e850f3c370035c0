//! Data model tests.
//!
//! Tests for the serialized shape of reports and perturbations, which the
//! CLI emits as JSON and YAML.

use kafka_ha_core::{
    BackoffPolicy, ConsistencyResult, ErrorKind, Perturbation, Scenario, SignalKind, UnitRef,
    Violation,
};

use super::helpers::{failure, session_report};

#[test]
fn test_write_failure_serializes_kind_tag() {
    let json = serde_json::to_value(failure(7, ErrorKind::Broker { code: 7 })).unwrap();
    assert_eq!(json["sequence"], 7);
    assert_eq!(json["kind"]["kind"], "broker");
    assert_eq!(json["kind"]["code"], 7);
}

#[test]
fn test_report_json_round_trip_keeps_accounting() {
    let report = session_report(5, &[0, 1, 2, 4], &[3]);
    let json = serde_json::to_string(&report).unwrap();
    let parsed: kafka_ha_core::WriteSessionReport = serde_json::from_str(&json).unwrap();

    assert_eq!(parsed.records_sent(), 6);
    assert_eq!(parsed.records_acked(), 4);
    assert_eq!(parsed.counted_send_errors(), 1);
    assert_eq!(parsed.counted_ack_errors(), 1);
}

#[test]
fn test_perturbation_is_tagged_by_type() {
    let perturbation = Perturbation::Signal {
        target: UnitRef::new("kafka-k8s", 0),
        kind: SignalKind::Stop,
    };
    let yaml = serde_yaml::to_string(&perturbation).unwrap();
    assert!(yaml.contains("type: signal"), "{}", yaml);
    assert!(yaml.contains("kind: stop"), "{}", yaml);
    assert_eq!(perturbation.to_string(), "SIGSTOP -> kafka-k8s/0");

    let backoff = Perturbation::RestartDelayPolicy {
        target: UnitRef::new("kafka-k8s", 2),
        policy: BackoffPolicy::Extend,
    };
    assert_eq!(backoff.target().index, 2);
}

#[test]
fn test_violation_serializes_invariant_name() {
    let result = ConsistencyResult::from_violations(vec![Violation::OffsetRegressed {
        partition: 0,
        pre: 10,
        post: 8,
    }]);
    let json = serde_json::to_value(&result).unwrap();
    assert_eq!(json["passed"], false);
    assert_eq!(json["violations"][0]["invariant"], "offset_regressed");
    assert_eq!(json["violations"][0]["partition"], 0);
}

#[test]
fn test_scenario_names_are_stable() {
    let names: Vec<&str> = Scenario::ALL.iter().map(|s| s.name()).collect();
    assert_eq!(
        names,
        vec![
            "kill-leader",
            "restart-leader",
            "freeze-leader",
            "full-cluster-crash",
            "full-cluster-restart",
            "pod-reschedule",
            "network-cut",
        ]
    );
}
